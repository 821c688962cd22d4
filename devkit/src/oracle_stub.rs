/*!
Faux service check-host.net pour tester le client de sonde hors ligne

Sert `/check-tcp` et `/check-result/{id}` sur un port éphémère local. Le
scénario (`OracleScript`) fixe la réponse à la soumission puis la suite de
réponses renvoyées aux polls successifs ; la dernière se répète.
*/

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Réponse HTTP rejouée par le faux service
#[derive(Debug, Clone)]
pub enum Reply {
    Json(Value),
    Status(u16),
    /// Corps brut, servi en text/html
    Raw(String),
}

impl IntoResponse for Reply {
    fn into_response(self) -> Response {
        match self {
            Reply::Json(v) => Json(v).into_response(),
            Reply::Status(code) => StatusCode::from_u16(code)
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
                .into_response(),
            Reply::Raw(body) => ([(header::CONTENT_TYPE, "text/html")], body).into_response(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OracleScript {
    request_id: Option<String>,
    submission: Reply,
    polls: Vec<Reply>,
}

impl OracleScript {
    /// Soumission acceptée sous l'identifiant donné
    pub fn accepting(request_id: &str) -> Self {
        Self {
            request_id: Some(request_id.to_string()),
            submission: Reply::Json(json!({
                "ok": 1,
                "request_id": request_id,
                "permanent_link": format!("https://check-host.net/check-report/{request_id}"),
                "nodes": {},
            })),
            polls: Vec::new(),
        }
    }

    /// Soumission refusée par le service (quota, cible invalide)
    pub fn rejecting() -> Self {
        Self {
            request_id: None,
            submission: Reply::Json(json!({"ok": 0, "error": "limit_exceeded"})),
            polls: Vec::new(),
        }
    }

    pub fn failing_submission(status: u16) -> Self {
        Self {
            request_id: None,
            submission: Reply::Status(status),
            polls: Vec::new(),
        }
    }

    /// Ajoute la réponse du poll suivant
    pub fn then(mut self, reply: Reply) -> Self {
        self.polls.push(reply);
        self
    }
}

/// Soumission reçue sur `/check-tcp`
#[derive(Debug, Clone)]
pub struct Submission {
    pub host: String,
    pub max_nodes: Option<u32>,
}

#[derive(Default)]
struct Recorded {
    submissions: Vec<Submission>,
    polls: usize,
}

#[derive(Clone)]
struct OracleState {
    script: Arc<OracleScript>,
    recorded: Arc<Mutex<Recorded>>,
}

pub struct FakeOracle {
    addr: SocketAddr,
    recorded: Arc<Mutex<Recorded>>,
    server: JoinHandle<()>,
}

impl FakeOracle {
    pub async fn start(script: OracleScript) -> Result<Self> {
        let recorded = Arc::new(Mutex::new(Recorded::default()));
        let state = OracleState {
            script: Arc::new(script),
            recorded: Arc::clone(&recorded),
        };

        let app = Router::new()
            .route("/check-tcp", get(submit))
            .route("/check-result/{id}", get(poll))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::warn!(error = %e, "[MOCK] oracle server stopped");
            }
        });

        Ok(Self { addr, recorded, server })
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Nombre d'appels à `/check-result/{id}` pour l'identifiant attendu
    pub fn polls(&self) -> usize {
        self.recorded.lock().polls
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.recorded.lock().submissions.clone()
    }
}

impl Drop for FakeOracle {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn submit(State(state): State<OracleState>, Query(params): Query<HashMap<String, String>>) -> Reply {
    let submission = Submission {
        host: params.get("host").cloned().unwrap_or_default(),
        max_nodes: params.get("max_nodes").and_then(|n| n.parse().ok()),
    };
    tracing::debug!(host = %submission.host, "[MOCK] check-tcp");
    state.recorded.lock().submissions.push(submission);
    state.script.submission.clone()
}

async fn poll(State(state): State<OracleState>, Path(id): Path<String>) -> Reply {
    if state.script.request_id.as_deref() != Some(id.as_str()) {
        return Reply::Status(404);
    }

    let index = {
        let mut recorded = state.recorded.lock();
        recorded.polls += 1;
        recorded.polls - 1
    };

    let replies = &state.script.polls;
    match replies.get(index).or_else(|| replies.last()) {
        Some(reply) => reply.clone(),
        None => Reply::Json(json!({})),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn get_json(url: String) -> (u16, Option<Value>) {
        let resp = reqwest::get(url).await.unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.ok())
    }

    #[tokio::test]
    async fn submission_is_recorded_and_polls_replay_in_order() {
        let oracle = FakeOracle::start(
            OracleScript::accepting("abc")
                .then(Reply::Json(json!({"n": null})))
                .then(Reply::Json(json!({"n": [{"time": 0.1}]}))),
        )
        .await
        .unwrap();
        let base = oracle.base_url();

        let (status, body) = get_json(format!("{base}/check-tcp?host=2.6.1.3:4&max_nodes=3")).await;
        assert_eq!(status, 200);
        assert_eq!(body.unwrap()["request_id"], "abc");

        let (_, first) = get_json(format!("{base}/check-result/abc")).await;
        let (_, second) = get_json(format!("{base}/check-result/abc")).await;
        let (_, third) = get_json(format!("{base}/check-result/abc")).await;
        assert_eq!(first.unwrap()["n"], Value::Null);
        assert_eq!(second.unwrap()["n"][0]["time"], 0.1);
        assert_eq!(third.unwrap()["n"][0]["time"], 0.1);

        assert_eq!(oracle.polls(), 3);
        let submissions = oracle.submissions();
        assert_eq!(submissions[0].host, "2.6.1.3:4");
        assert_eq!(submissions[0].max_nodes, Some(3));
    }

    #[tokio::test]
    async fn unknown_request_id_is_not_found() {
        let oracle = FakeOracle::start(OracleScript::accepting("abc")).await.unwrap();
        let (status, _) = get_json(format!("{}/check-result/zzz", oracle.base_url())).await;
        assert_eq!(status, 404);
        assert_eq!(oracle.polls(), 0);
    }

    #[tokio::test]
    async fn empty_script_answers_empty_map() {
        let oracle = FakeOracle::start(OracleScript::accepting("abc")).await.unwrap();
        let (_, body) = get_json(format!("{}/check-result/abc", oracle.base_url())).await;
        assert_eq!(body.unwrap(), json!({}));
    }

    #[tokio::test]
    async fn failing_submission_uses_the_given_status() {
        let oracle = FakeOracle::start(OracleScript::failing_submission(503)).await.unwrap();
        let (status, _) = get_json(format!("{}/check-tcp?host=h:1", oracle.base_url())).await;
        assert_eq!(status, 503);
        assert_eq!(oracle.submissions()[0].max_nodes, None);
    }
}
