/**
 * CONFIG - Configuration du service depuis l'environnement
 *
 * RÔLE : Lecture typée des variables d'environnement (après dotenvy) :
 * identifiants broker obligatoires, TLS optionnel, paramètres du test
 * TCP et de la boucle de monitoring.
 *
 * Les identifiants broker manquants ou vides sont fatals au démarrage ;
 * tout le reste a une valeur par défaut.
 */

use crate::models::ProbeTarget;
use rumqttc::QoS;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {value:?} ({reason})")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub target: ProbeTarget,
    pub probe_interval: Duration,
    pub probe: ProbeSettings,
    pub mqtt: MqttSettings,
    pub http_bind: SocketAddr,
}

/// Réglages du client check-host.
#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub base_url: String,
    pub max_nodes: u32,
    /// Latence maximale (secondes) pour qu'un nœud compte comme succès.
    pub success_latency: f64,
    pub result_timeout: Duration,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            base_url: "https://check-host.net".into(),
            max_nodes: 3,
            success_latency: 3.0,
            result_timeout: Duration::from_secs(20),
            poll_interval: Duration::from_secs(2),
            request_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub client_id: String,
    pub keep_alive: Duration,
    pub topic: String,
    pub qos: QoS,
    pub retain: bool,
    pub tls: Option<TlsSettings>,
    /// Attente max d'une connexion établie avant d'abandonner un publish.
    pub connect_wait: Duration,
    /// Attente max de l'accusé de livraison du broker.
    pub ack_timeout: Duration,
}

// le mot de passe ne doit jamais finir dans les logs
impl fmt::Debug for MqttSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .field("client_id", &self.client_id)
            .field("keep_alive", &self.keep_alive)
            .field("topic", &self.topic)
            .field("qos", &self.qos)
            .field("retain", &self.retain)
            .field("tls", &self.tls)
            .field("connect_wait", &self.connect_wait)
            .field("ack_timeout", &self.ack_timeout)
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct TlsSettings {
    pub ca_cert: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    /// Désactive la vérification du certificat et du hostname.
    pub insecure: bool,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let mqtt = MqttSettings {
            host: env.required("MQTT_BROKER_HOST")?,
            port: parse_value("MQTT_BROKER_PORT", &env.required("MQTT_BROKER_PORT")?)?,
            username: env.required("MQTT_BROKER_USERNAME")?,
            password: env.required("MQTT_BROKER_PASSWORD")?,
            client_id: env.string_or("MQTT_ROUTER_CLIENT_ID", "router-telef-service"),
            keep_alive: Duration::from_secs(env.parsed_or("MQTT_BROKER_KEEPALIVE", 60u64)?),
            topic: env.string_or("MQTT_TOPIC_MODEM_CONEXION", "exemys/estado/conexion_modem"),
            qos: parse_qos(env.parsed_or("MQTT_PUBLISH_QOS_STATE", 1u8)?)?,
            retain: env.flag_or("MQTT_PUBLISH_RETAIN_STATE", true),
            tls: env.flag_or("MQTT_BROKER_USE_TLS", false).then(|| TlsSettings {
                ca_cert: env.optional("MQTT_BROKER_CA_CERT").map(PathBuf::from),
                client_cert: env.optional("MQTT_CLIENT_CERTFILE").map(PathBuf::from),
                client_key: env.optional("MQTT_CLIENT_KEYFILE").map(PathBuf::from),
                insecure: env.flag_or("MQTT_TLS_INSECURE", false),
            }),
            connect_wait: env.seconds_or("MQTT_CONNECT_WAIT_SECONDS", 5.0)?,
            ack_timeout: env.seconds_or("MQTT_ACK_TIMEOUT_SECONDS", 10.0)?,
        };

        let defaults = ProbeSettings::default();
        let probe = ProbeSettings {
            base_url: env.string_or("CHECK_HOST_BASE_URL", &defaults.base_url),
            max_nodes: env.parsed_or("CHECK_HOST_MAX_NODES", defaults.max_nodes)?,
            success_latency: env.parsed_or("CHECK_HOST_SUCCESS_LATENCY_SECONDS", defaults.success_latency)?,
            result_timeout: env.seconds_or("CHECK_HOST_RESULT_TIMEOUT_SECONDS", 20.0)?,
            poll_interval: env.seconds_or("CHECK_HOST_POLL_INTERVAL_SECONDS", 2.0)?,
            request_timeout: env.seconds_or("CHECK_HOST_REQUEST_TIMEOUT_SECONDS", 5.0)?,
        };

        let target = ProbeTarget::new(
            env.string_or("PROBE_TARGET_HOST", "2.6.1.3"),
            env.parsed_or("PROBE_TARGET_PORT", 4u16)?,
        );

        Ok(Self {
            target,
            probe_interval: env.seconds_or("PROBE_INTERVAL_SECONDS", 300.0)?,
            probe,
            mqtt,
            http_bind: env.parsed_or("ROUTERWATCH_HTTP_BIND", SocketAddr::from(([0, 0, 0, 0], 8080)))?,
        })
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Valeur trimée, `None` si absente ou vide.
    fn optional(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, name: &'static str) -> Result<String, ConfigError> {
        self.optional(name).ok_or(ConfigError::Missing(name))
    }

    fn string_or(&self, name: &str, default: &str) -> String {
        self.optional(name).unwrap_or_else(|| default.to_string())
    }

    fn flag_or(&self, name: &str, default: bool) -> bool {
        match self.optional(name) {
            Some(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
            None => default,
        }
    }

    fn parsed_or<T>(&self, name: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: fmt::Display,
    {
        match self.optional(name) {
            Some(v) => parse_value(name, &v),
            None => Ok(default),
        }
    }

    fn seconds_or(&self, name: &'static str, default: f64) -> Result<Duration, ConfigError> {
        let secs: f64 = self.parsed_or(name, default)?;
        Duration::try_from_secs_f64(secs).map_err(|e| ConfigError::Invalid {
            name,
            value: secs.to_string(),
            reason: e.to_string(),
        })
    }
}

fn parse_value<T>(name: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    value.parse::<T>().map_err(|e| ConfigError::Invalid {
        name,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_qos(level: u8) -> Result<QoS, ConfigError> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(ConfigError::Invalid {
            name: "MQTT_PUBLISH_QOS_STATE",
            value: other.to_string(),
            reason: "expected 0, 1 or 2".into(),
        }),
    }
}
