/**
 * MODELS - Types métier partagés par le kernel RouterWatch
 *
 * RÔLE : Cible sondée, verdict tri-état, snapshot exposé par /status et
 * payload publié sur le bus MQTT.
 *
 * Les libellés sur le fil restent ceux consommés en aval :
 * "abierto" / "cerrado" / "desconocido".
 */

use serde::{Deserialize, Serialize};
use std::fmt;
use time::macros::format_description;
use time::OffsetDateTime;

/// Endpoint fixe sous surveillance (immuable pour la durée du process).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub host: String,
    pub port: u16,
}

impl ProbeTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }
}

impl fmt::Display for ProbeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Verdict réduit d'un test : toujours exactement l'un des trois états.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProbeOutcome {
    #[serde(rename = "abierto")]
    Open,
    #[serde(rename = "cerrado")]
    Closed,
    /// Tout libellé inconnu se désérialise ici.
    #[serde(rename = "desconocido", other)]
    Unknown,
}

impl ProbeOutcome {
    pub fn label(self) -> &'static str {
        match self {
            ProbeOutcome::Open => "abierto",
            ProbeOutcome::Closed => "cerrado",
            ProbeOutcome::Unknown => "desconocido",
        }
    }

    /// Parse tolérant : tout libellé hors des trois connus donne `Unknown`.
    pub fn from_label(label: &str) -> Self {
        match label.trim() {
            "abierto" => ProbeOutcome::Open,
            "cerrado" => ProbeOutcome::Closed,
            _ => ProbeOutcome::Unknown,
        }
    }
}

impl fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Vue exposée par GET /status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub ip: String,
    pub port: u16,
    pub state: ProbeOutcome,
}

impl StatusSnapshot {
    pub fn unknown(target: &ProbeTarget) -> Self {
        Self {
            ip: target.host.clone(),
            port: target.port,
            state: ProbeOutcome::Unknown,
        }
    }
}

/// Payload publié sur le topic d'état.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatePayload {
    pub estado: ProbeOutcome,
    pub ts: String,
}

impl StatePayload {
    pub fn new(state: ProbeOutcome, at: OffsetDateTime) -> Self {
        Self { estado: state, ts: format_utc_timestamp(at) }
    }
}

/// Dernier état dont le broker a confirmé la livraison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishRecord {
    pub state: ProbeOutcome,
    pub at: OffsetDateTime,
}

/// `YYYY-MM-DDTHH:MM:SSZ`, toujours en UTC, sans fraction de seconde.
pub fn format_utc_timestamp(at: OffsetDateTime) -> String {
    let utc = at.to_offset(time::UtcOffset::UTC);
    let fmt = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]Z");
    // le format ne contient que des composants toujours disponibles
    utc.format(&fmt).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn outcome_labels_round_trip_through_serde() {
        assert_eq!(serde_json::to_string(&ProbeOutcome::Open).unwrap(), "\"abierto\"");
        assert_eq!(serde_json::to_string(&ProbeOutcome::Closed).unwrap(), "\"cerrado\"");
        assert_eq!(serde_json::to_string(&ProbeOutcome::Unknown).unwrap(), "\"desconocido\"");
    }

    #[test]
    fn unrecognised_labels_decode_as_unknown() {
        let parsed: ProbeOutcome = serde_json::from_str("\"filtrado\"").unwrap();
        assert_eq!(parsed, ProbeOutcome::Unknown);
        assert_eq!(ProbeOutcome::from_label("lento"), ProbeOutcome::Unknown);
        assert_eq!(ProbeOutcome::from_label(" abierto "), ProbeOutcome::Open);
    }

    #[test]
    fn payload_timestamp_is_utc_with_trailing_z() {
        let at = datetime!(2024-03-05 07:08:09.750 +02:00);
        let payload = StatePayload::new(ProbeOutcome::Closed, at);
        assert_eq!(payload.ts, "2024-03-05T05:08:09Z");

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json, serde_json::json!({"estado": "cerrado", "ts": "2024-03-05T05:08:09Z"}));
    }

    #[test]
    fn snapshot_serializes_with_status_endpoint_shape() {
        let snap = StatusSnapshot::unknown(&ProbeTarget::new("2.6.1.3", 4));
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json, serde_json::json!({"ip": "2.6.1.3", "port": 4, "state": "desconocido"}));
    }
}
