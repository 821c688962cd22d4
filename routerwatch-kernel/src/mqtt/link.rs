/**
 * LIEN BROKER - Interface entre le publisher et le transport MQTT
 *
 * RÔLE : `BrokerLink` est le côté event loop (pilote la connexion, remonte
 * CONNACK / PUBACK / perte du lien), `BrokerSender` le côté requêtes.
 * En production : `EventLoop` / `AsyncClient` de rumqttc ; en test : les
 * mocks du devkit.
 */

use super::tls;
use super::PublishError;
use crate::config::MqttSettings;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::future::Future;

/// Événements du transport, réduits à ce qui intéresse le publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// CONNACK accepté.
    Connected,
    /// CONNACK avec un code de refus.
    Refused(String),
    /// Un PUBLISH est parti avec ce packet id (0 en QoS 0).
    Sent { pkid: u16 },
    /// PUBACK (QoS 1) ou PUBCOMP (QoS 2).
    Delivered { pkid: u16 },
    /// DISCONNECT envoyé ou reçu.
    Closed,
    Other,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct LinkError(pub String);

pub trait BrokerLink: Send + 'static {
    /// Prochain événement ; après une erreur, l'appel suivant reconnecte.
    fn next_event(&mut self) -> impl Future<Output = Result<LinkEvent, LinkError>> + Send;

    /// Coupe la connexion réseau ; le prochain `next_event` reconnecte.
    fn reset(&mut self);

    /// Oublie les publications encore en attente d'accusé, qui sinon
    /// repartiraient avec leur ancien packet id juste après le CONNACK suivant.
    fn discard_pending(&mut self);
}

pub trait BrokerSender: Send + Sync + 'static {
    fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<(), LinkError>> + Send;

    fn disconnect(&self) -> impl Future<Output = Result<(), LinkError>> + Send;
}

impl BrokerLink for EventLoop {
    async fn next_event(&mut self) -> Result<LinkEvent, LinkError> {
        let event = self.poll().await.map_err(|e| LinkError(e.to_string()))?;
        Ok(match event {
            Event::Incoming(Packet::ConnAck(ack)) if ack.code == ConnectReturnCode::Success => {
                LinkEvent::Connected
            }
            Event::Incoming(Packet::ConnAck(ack)) => LinkEvent::Refused(format!("{:?}", ack.code)),
            Event::Incoming(Packet::PubAck(ack)) => LinkEvent::Delivered { pkid: ack.pkid },
            Event::Incoming(Packet::PubComp(comp)) => LinkEvent::Delivered { pkid: comp.pkid },
            Event::Incoming(Packet::Disconnect) => LinkEvent::Closed,
            Event::Outgoing(Outgoing::Publish(pkid)) => LinkEvent::Sent { pkid },
            Event::Outgoing(Outgoing::Disconnect) => LinkEvent::Closed,
            _ => LinkEvent::Other,
        })
    }

    fn reset(&mut self) {
        self.clean();
    }

    // `poll` rebascule déjà l'état en vol dans `pending` après une erreur
    fn discard_pending(&mut self) {
        if !self.pending.is_empty() {
            tracing::debug!(dropped = self.pending.len(), "discarding unacknowledged MQTT requests");
            self.pending.clear();
        }
    }
}

impl BrokerSender for AsyncClient {
    async fn publish(&self, topic: &str, qos: QoS, retain: bool, payload: Vec<u8>) -> Result<(), LinkError> {
        AsyncClient::publish(self, topic, qos, retain, payload)
            .await
            .map_err(|e| LinkError(e.to_string()))
    }

    async fn disconnect(&self) -> Result<(), LinkError> {
        AsyncClient::disconnect(self).await.map_err(|e| LinkError(e.to_string()))
    }
}

/// Options rumqttc à partir de la config : identifiants, keepalive, TLS.
pub fn mqtt_options(settings: &MqttSettings) -> Result<MqttOptions, PublishError> {
    let mut opts = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
    opts.set_keep_alive(settings.keep_alive);
    opts.set_credentials(&settings.username, &settings.password);
    opts.set_clean_session(true);

    if let Some(tls_settings) = &settings.tls {
        opts.set_transport(tls::transport(tls_settings)?);
    }

    Ok(opts)
}

/// Client + event loop prêts à être confiés au `PublishClient`.
pub fn connect(settings: &MqttSettings) -> Result<(AsyncClient, EventLoop), PublishError> {
    let opts = mqtt_options(settings)?;
    Ok(AsyncClient::new(opts, 10))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TlsSettings;
    use std::time::Duration;

    fn settings() -> MqttSettings {
        MqttSettings {
            host: "broker.local".into(),
            port: 1883,
            username: "router".into(),
            password: "s3cret".into(),
            client_id: "router-telef-service".into(),
            keep_alive: Duration::from_secs(60),
            topic: "exemys/estado/conexion_modem".into(),
            qos: QoS::AtLeastOnce,
            retain: true,
            tls: None,
            connect_wait: Duration::from_secs(5),
            ack_timeout: Duration::from_secs(10),
        }
    }

    #[test]
    fn options_carry_identity_credentials_and_keepalive() {
        let opts = mqtt_options(&settings()).unwrap();
        assert_eq!(opts.client_id(), "router-telef-service");
        assert_eq!(opts.broker_address(), ("broker.local".to_string(), 1883));
        assert_eq!(opts.keep_alive(), Duration::from_secs(60));
        assert_eq!(
            opts.credentials(),
            Some(("router".to_string(), "s3cret".to_string()))
        );
        assert!(opts.clean_session());
    }

    #[test]
    fn missing_ca_file_is_a_tls_error() {
        let mut cfg = settings();
        cfg.tls = Some(TlsSettings {
            ca_cert: Some("/nonexistent/ca.pem".into()),
            ..Default::default()
        });
        assert!(matches!(mqtt_options(&cfg), Err(PublishError::Tls(_))));
    }
}
