/**
 * PROBE - Client du service de sondage distribué (check-host.net)
 *
 * RÔLE : Soumettre un test TCP, interroger les résultats par nœud jusqu'à
 * convergence ou expiration, puis réduire le tout en un verdict tri-état.
 *
 * FONCTIONNEMENT :
 * - GET /check-tcp?host=h:p&max_nodes=n   → request_id
 * - GET /check-result/{request_id}         → { nœud: null | [ {time?, error?}, ... ] }
 * - Le premier nœud sous le seuil de latence court-circuite en Open.
 * - Un nœud lent ou en erreur est un signal d'échec ; Closed dès qu'il n'y a
 *   plus de nœud en attente, sinon à l'échéance.
 * - Aucune erreur ne remonte : tout se dégrade en Unknown.
 */

use crate::config::ProbeSettings;
use crate::models::{ProbeOutcome, ProbeTarget};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::future::Future;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("check submission rejected: {0}")]
    Rejected(String),
    #[error("malformed result payload: {0}")]
    Malformed(String),
}

/// Source de verdicts pour la boucle de monitoring.
pub trait Prober: Send + Sync + 'static {
    fn check(&self, target: &ProbeTarget) -> impl Future<Output = ProbeOutcome> + Send;
}

/// Verdict d'un nœud tel qu'extrait du premier résultat qu'il rapporte.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeResult {
    pub node_id: String,
    pub latency: Option<f64>,
    pub error: Option<String>,
    pub pending: bool,
}

impl NodeResult {
    /// `None` quand le nœud a répondu sans donnée exploitable (liste vide,
    /// premier élément qui n'est pas un objet) : on l'ignore pour ce tour.
    pub fn parse(node_id: &str, raw: &Value) -> Option<Self> {
        let mut node = NodeResult {
            node_id: node_id.to_string(),
            latency: None,
            error: None,
            pending: false,
        };

        let first = match raw {
            Value::Null => {
                node.pending = true;
                return Some(node);
            }
            Value::Array(items) => items.first()?.as_object()?,
            _ => return None,
        };

        node.latency = first.get("time").and_then(Value::as_f64);
        node.error = first.get("error").and_then(error_text);
        node.pending = node.latency.is_none() && node.error.is_none();
        Some(node)
    }
}

/// Un champ `error` vide (`""`, `0`, `[]`, `{}`, `false`, `null`) ne compte pas.
fn error_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::String(_) => None,
        other if is_truthy(other) => Some(other.to_string()),
        _ => None,
    }
}

/// Résultat d'un passage sur la réponse d'un poll.
#[derive(Debug, Clone, PartialEq)]
pub enum PollScan {
    /// Un nœud a répondu sous le seuil.
    Open { node_id: String, latency: f64 },
    Partial { failure: bool, pending: bool },
}

/// Réduit une réponse de poll. S'arrête au premier succès qualifiant.
pub fn scan_nodes(nodes: &Map<String, Value>, success_latency: f64) -> PollScan {
    let mut failure = false;
    let mut pending = false;

    for (node_id, raw) in nodes {
        let Some(node) = NodeResult::parse(node_id, raw) else { continue };

        if let Some(latency) = node.latency {
            info!(node = %node.node_id, latency, "node reported connect time");
            if latency <= success_latency {
                return PollScan::Open { node_id: node.node_id, latency };
            }
            failure = true;
        } else if let Some(err) = &node.error {
            warn!(node = %node.node_id, error = %err, "node reported error");
            failure = true;
        } else if node.pending {
            pending = true;
        }
    }

    PollScan::Partial { failure, pending }
}

/// Une requête en vol auprès de l'oracle.
#[derive(Debug)]
struct CheckSession {
    request_id: String,
    started: Instant,
    deadline: Instant,
    failure_detected: bool,
    polls: u32,
}

impl CheckSession {
    fn new(request_id: String, result_timeout: std::time::Duration) -> Self {
        let started = Instant::now();
        Self {
            request_id,
            started,
            deadline: started + result_timeout,
            failure_detected: false,
            polls: 0,
        }
    }

    fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    fn at_deadline(&self) -> ProbeOutcome {
        if self.failure_detected {
            ProbeOutcome::Closed
        } else {
            ProbeOutcome::Unknown
        }
    }
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    #[serde(default)]
    ok: Value,
    #[serde(default)]
    request_id: Option<Value>,
}

pub struct ProbeClient {
    http: reqwest::Client,
    base_url: String,
    settings: ProbeSettings,
}

impl ProbeClient {
    pub fn new(settings: ProbeSettings) -> Result<Self, ProbeError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(settings.request_timeout)
            .user_agent(concat!("routerwatch/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            settings,
        })
    }

    /// Lance un test et attend le verdict. Ne renvoie jamais d'erreur.
    pub async fn check(&self, host: &str, port: u16) -> ProbeOutcome {
        let request_id = match self.start_check(host, port).await {
            Ok(id) => id,
            Err(e) => {
                error!(error = %e, %host, port, "could not start TCP check");
                return ProbeOutcome::Unknown;
            }
        };

        let mut session = CheckSession::new(request_id, self.settings.result_timeout);
        debug!(request_id = %session.request_id, "TCP check submitted");

        while !session.expired() {
            session.polls += 1;
            let nodes = match self.fetch_results(&session.request_id).await {
                Ok(nodes) => nodes,
                Err(e) => {
                    warn!(request_id = %session.request_id, error = %e, "failed to fetch check results");
                    sleep(self.settings.poll_interval).await;
                    continue;
                }
            };

            if !nodes.is_empty() {
                match scan_nodes(&nodes, self.settings.success_latency) {
                    PollScan::Open { node_id, latency } => {
                        info!(request_id = %session.request_id, node = %node_id, latency, polls = session.polls, "target reachable");
                        return ProbeOutcome::Open;
                    }
                    PollScan::Partial { failure, pending } => {
                        session.failure_detected |= failure;
                        if session.failure_detected && !pending {
                            info!(request_id = %session.request_id, polls = session.polls, "all nodes settled, target unreachable");
                            return ProbeOutcome::Closed;
                        }
                    }
                }
            }

            sleep(self.settings.poll_interval).await;
        }

        let outcome = session.at_deadline();
        warn!(
            request_id = %session.request_id,
            polls = session.polls,
            elapsed_ms = session.started.elapsed().as_millis() as u64,
            state = %outcome,
            "check deadline reached"
        );
        outcome
    }

    async fn start_check(&self, host: &str, port: u16) -> Result<String, ProbeError> {
        let resp = self
            .http
            .get(format!("{}/check-tcp", self.base_url))
            .query(&[
                ("host", format!("{host}:{port}")),
                ("max_nodes", self.settings.max_nodes.to_string()),
            ])
            .send()
            .await?
            .error_for_status()?;

        let body: Value = resp.json().await?;
        let parsed: SubmitResponse = serde_json::from_value(body.clone())
            .map_err(|_| ProbeError::Rejected(body.to_string()))?;

        let request_id = match parsed.request_id {
            Some(Value::String(s)) if !s.is_empty() => Some(s),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };

        match (is_truthy(&parsed.ok), request_id) {
            (true, Some(id)) => Ok(id),
            _ => Err(ProbeError::Rejected(body.to_string())),
        }
    }

    async fn fetch_results(&self, request_id: &str) -> Result<Map<String, Value>, ProbeError> {
        let resp = self
            .http
            .get(format!("{}/check-result/{}", self.base_url, request_id))
            .send()
            .await?
            .error_for_status()?;

        match resp.json::<Value>().await? {
            Value::Object(map) => Ok(map),
            other => Err(ProbeError::Malformed(other.to_string())),
        }
    }
}

fn is_truthy(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        Value::Null => false,
    }
}

impl Prober for ProbeClient {
    async fn check(&self, target: &ProbeTarget) -> ProbeOutcome {
        ProbeClient::check(self, &target.host, target.port).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use routerwatch_devkit::oracle_stub::{FakeOracle, OracleScript, Reply};
    use serde_json::json;
    use std::time::Duration;

    fn nodes(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    fn settings(base_url: String, result_timeout_ms: u64) -> ProbeSettings {
        ProbeSettings {
            base_url,
            max_nodes: 3,
            success_latency: 3.0,
            result_timeout: Duration::from_millis(result_timeout_ms),
            poll_interval: Duration::from_millis(10),
            request_timeout: Duration::from_secs(2),
        }
    }

    #[test]
    fn null_entry_is_pending() {
        let node = NodeResult::parse("n1", &Value::Null).unwrap();
        assert!(node.pending);
    }

    #[test]
    fn empty_or_odd_entries_are_ignored() {
        assert_eq!(NodeResult::parse("n1", &json!([])), None);
        assert_eq!(NodeResult::parse("n1", &json!("weird")), None);
        assert_eq!(NodeResult::parse("n1", &json!([42])), None);
    }

    #[test]
    fn latency_and_error_are_extracted_from_first_result() {
        let node = NodeResult::parse("n1", &json!([{"time": 0.25, "address": "1.2.3.4"}])).unwrap();
        assert_eq!(node.latency, Some(0.25));
        assert!(!node.pending);

        let node = NodeResult::parse("n1", &json!([{"error": "Connection refused"}])).unwrap();
        assert_eq!(node.error.as_deref(), Some("Connection refused"));
        assert!(!node.pending);

        // ni latence ni erreur : encore en cours
        let node = NodeResult::parse("n1", &json!([{"time": "n/a", "error": ""}])).unwrap();
        assert!(node.pending);
    }

    #[test]
    fn falsy_error_values_leave_the_node_pending() {
        for empty in [json!(0), json!(0.0), json!([]), json!({}), json!(false), json!(null)] {
            let node = NodeResult::parse("n1", &json!([{ "error": empty }])).unwrap();
            assert_eq!(node.error, None, "{empty}");
            assert!(node.pending, "{empty}");
        }

        let node = NodeResult::parse("n1", &json!([{"error": 110}])).unwrap();
        assert_eq!(node.error.as_deref(), Some("110"));
        assert!(!node.pending);
    }

    #[test]
    fn fast_node_wins_regardless_of_the_others() {
        let scan = scan_nodes(
            &nodes(json!({
                "a": [{"error": "timeout"}],
                "b": null,
                "c": [{"time": 2.9}],
                "d": [{"time": 9.0}],
            })),
            3.0,
        );
        assert_eq!(scan, PollScan::Open { node_id: "c".into(), latency: 2.9 });
    }

    #[test]
    fn threshold_is_inclusive() {
        let scan = scan_nodes(&nodes(json!({"a": [{"time": 3.0}]})), 3.0);
        assert!(matches!(scan, PollScan::Open { .. }));
    }

    #[test]
    fn slow_node_counts_as_failure() {
        let scan = scan_nodes(&nodes(json!({"a": [{"time": 3.5}]})), 3.0);
        assert_eq!(scan, PollScan::Partial { failure: true, pending: false });
    }

    #[test]
    fn failure_with_pending_nodes_is_not_final() {
        let scan = scan_nodes(&nodes(json!({"a": [{"error": "refused"}], "b": null})), 3.0);
        assert_eq!(scan, PollScan::Partial { failure: true, pending: true });
    }

    #[test]
    fn ignored_entries_do_not_count_as_pending() {
        let scan = scan_nodes(&nodes(json!({"a": [{"error": "refused"}], "b": []})), 3.0);
        assert_eq!(scan, PollScan::Partial { failure: true, pending: false });
    }

    #[tokio::test]
    async fn first_fast_node_returns_open_without_further_polling() {
        let oracle = FakeOracle::start(
            OracleScript::accepting("abc").then(Reply::Json(json!({"nodeA": [{"time": 0.5}]}))),
        )
        .await
        .unwrap();
        let client = ProbeClient::new(settings(oracle.base_url(), 2_000)).unwrap();

        let outcome = client.check("2.6.1.3", 4).await;

        assert_eq!(outcome, ProbeOutcome::Open);
        assert_eq!(oracle.polls(), 1);
        let submitted = oracle.submissions();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].host, "2.6.1.3:4");
        assert_eq!(submitted[0].max_nodes, Some(3));
    }

    #[tokio::test]
    async fn error_after_pending_polls_returns_closed_immediately() {
        let oracle = FakeOracle::start(
            OracleScript::accepting("abc")
                .then(Reply::Json(json!({"nodeA": null})))
                .then(Reply::Json(json!({"nodeA": null})))
                .then(Reply::Json(json!({"nodeA": [{"error": "timeout"}]}))),
        )
        .await
        .unwrap();
        let client = ProbeClient::new(settings(oracle.base_url(), 5_000)).unwrap();

        let started = std::time::Instant::now();
        let outcome = client.check("2.6.1.3", 4).await;

        assert_eq!(outcome, ProbeOutcome::Closed);
        assert_eq!(oracle.polls(), 3);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn rejected_submission_is_unknown() {
        let oracle = FakeOracle::start(OracleScript::rejecting()).await.unwrap();
        let client = ProbeClient::new(settings(oracle.base_url(), 500)).unwrap();

        assert_eq!(client.check("h", 1).await, ProbeOutcome::Unknown);
        assert_eq!(oracle.polls(), 0);
    }

    #[tokio::test]
    async fn submission_server_error_is_unknown() {
        let oracle = FakeOracle::start(OracleScript::failing_submission(503)).await.unwrap();
        let client = ProbeClient::new(settings(oracle.base_url(), 500)).unwrap();

        assert_eq!(client.check("h", 1).await, ProbeOutcome::Unknown);
        assert_eq!(oracle.polls(), 0);
    }

    #[tokio::test]
    async fn unreachable_oracle_is_unknown() {
        let client = ProbeClient::new(settings("http://127.0.0.1:1".into(), 500)).unwrap();
        assert_eq!(client.check("h", 1).await, ProbeOutcome::Unknown);
    }

    #[tokio::test]
    async fn transient_poll_errors_are_retried() {
        let oracle = FakeOracle::start(
            OracleScript::accepting("r1")
                .then(Reply::Status(502))
                .then(Reply::Raw("<html>busy</html>".into()))
                .then(Reply::Json(json!(["not", "a", "map"])))
                .then(Reply::Json(json!({"n": [{"time": 0.1}]}))),
        )
        .await
        .unwrap();
        let client = ProbeClient::new(settings(oracle.base_url(), 5_000)).unwrap();

        assert_eq!(client.check("h", 1).await, ProbeOutcome::Open);
        assert_eq!(oracle.polls(), 4);
    }

    #[tokio::test]
    async fn deadline_with_only_pending_nodes_is_unknown() {
        let oracle = FakeOracle::start(
            OracleScript::accepting("r1").then(Reply::Json(json!({"a": null, "b": null}))),
        )
        .await
        .unwrap();
        let client = ProbeClient::new(settings(oracle.base_url(), 150)).unwrap();

        assert_eq!(client.check("h", 1).await, ProbeOutcome::Unknown);
        assert!(oracle.polls() >= 2);
    }

    #[tokio::test]
    async fn deadline_with_failure_and_pending_nodes_is_closed() {
        let oracle = FakeOracle::start(
            OracleScript::accepting("r1")
                .then(Reply::Json(json!({"a": [{"error": "refused"}], "b": null}))),
        )
        .await
        .unwrap();
        let client = ProbeClient::new(settings(oracle.base_url(), 150)).unwrap();

        assert_eq!(client.check("h", 1).await, ProbeOutcome::Closed);
    }

    #[tokio::test]
    async fn failure_seen_earlier_persists_across_polls() {
        // le nœud en erreur disparaît au poll suivant, le drapeau reste acquis
        let oracle = FakeOracle::start(
            OracleScript::accepting("r1")
                .then(Reply::Json(json!({"a": [{"time": 7.5}], "b": null})))
                .then(Reply::Json(json!({"b": []}))),
        )
        .await
        .unwrap();
        let client = ProbeClient::new(settings(oracle.base_url(), 2_000)).unwrap();

        assert_eq!(client.check("h", 1).await, ProbeOutcome::Closed);
        assert_eq!(oracle.polls(), 2);
    }
}
