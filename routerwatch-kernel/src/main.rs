/**
 * ROUTERWATCH KERNEL - Point d'entrée du service
 *
 * RÔLE : Bootstrap complet : config, logging, client check-host, publisher
 * MQTT, boucle de monitoring et API HTTP. Arrêt propre sur Ctrl-C / SIGTERM.
 *
 * ARCHITECTURE : la boucle sonde un endpoint TCP fixe via check-host.net,
 * met à jour le snapshot exposé sur /status et publie chaque changement
 * d'état sur le bus MQTT.
 */

mod config;
mod context;
mod health;
mod http;
mod models;
mod monitor;
mod mqtt;
mod probe;
mod state;

use crate::config::ServiceConfig;
use crate::context::AppContext;
use crate::mqtt::link::BrokerSender;
use anyhow::{Context, Result};
use std::future::Future;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("routerwatch_kernel=info")),
        )
        .init();

    let cfg = ServiceConfig::from_env().context("invalid configuration")?;
    info!(
        target_host = %cfg.target.host,
        target_port = cfg.target.port,
        broker = %format!("{}:{}", cfg.mqtt.host, cfg.mqtt.port),
        topic = %cfg.mqtt.topic,
        "starting routerwatch"
    );

    let listener = TcpListener::bind(cfg.http_bind)
        .await
        .with_context(|| format!("failed to bind {}", cfg.http_bind))?;

    let ctx = AppContext::start(&cfg)?;
    info!(addr = %cfg.http_bind, "listening");

    serve_until(listener, ctx, shutdown_signal()).await?;
    info!("routerwatch stopped");
    Ok(())
}

/// Sert l'API jusqu'au signal, puis arrête la boucle et le publisher,
/// y compris quand le serveur HTTP sort en erreur.
async fn serve_until<S, F>(listener: TcpListener, ctx: AppContext<S>, signal: F) -> Result<()>
where
    S: BrokerSender,
    F: Future<Output = ()> + Send + 'static,
{
    let app = http::build_router(ctx.http_state());
    let served = axum::serve(listener, app).with_graceful_shutdown(signal).await;

    ctx.shutdown().await;
    served.context("HTTP server failed")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthTracker;
    use crate::models::{ProbeOutcome, ProbeTarget};
    use crate::mqtt::{ConnectionState, PublishClient, PublishOptions};
    use crate::probe::Prober;
    use routerwatch_devkit::mqtt_stub::mock_broker;
    use rumqttc::QoS;
    use std::sync::Arc;
    use std::time::Duration;

    struct FixedProber;

    impl Prober for FixedProber {
        async fn check(&self, _target: &ProbeTarget) -> ProbeOutcome {
            ProbeOutcome::Closed
        }
    }

    #[tokio::test]
    async fn server_exit_stops_the_publisher() {
        let (broker, link) = mock_broker();
        broker.accept_connection();
        let health = HealthTracker::new();
        let publisher = Arc::new(PublishClient::with_link(
            broker.clone(),
            link,
            PublishOptions {
                topic: "exemys/estado/conexion_modem".into(),
                qos: QoS::AtLeastOnce,
                retain: true,
                connect_wait: Duration::from_secs(2),
                ack_timeout: Duration::from_secs(2),
            },
            health.clone(),
        ));
        let ctx = AppContext::launch(
            ProbeTarget::new("2.6.1.3", 4),
            Duration::from_secs(300),
            Arc::new(FixedProber),
            Some(Arc::clone(&publisher)),
            health,
        );

        let mut state = publisher.subscribe_state();
        tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| *s == ConnectionState::Connected))
            .await
            .unwrap()
            .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), serve_until(listener, ctx, async {}))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(publisher.connection_state(), ConnectionState::Disconnected);
        assert_eq!(broker.disconnect_count(), 1);
    }
}
