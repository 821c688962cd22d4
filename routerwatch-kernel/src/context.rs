/**
 * CONTEXTE APPLICATIF - Propriétaire des composants du service
 *
 * RÔLE : Détenir le store d'état, le publisher MQTT et la tâche de
 * monitoring pendant toute la vie du process, puis les arrêter dans l'ordre.
 */

use crate::config::ServiceConfig;
use crate::health::HealthTracker;
use crate::http::AppState;
use crate::models::ProbeTarget;
use crate::monitor::MonitorLoop;
use crate::mqtt::link::BrokerSender;
use crate::mqtt::{MqttPublisher, PublishClient};
use crate::probe::{ProbeClient, Prober};
use crate::state::StatusStore;
use anyhow::{Context, Result};
use rumqttc::AsyncClient;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct AppContext<S: BrokerSender = AsyncClient> {
    status: StatusStore,
    health: HealthTracker,
    publisher: Option<Arc<PublishClient<S>>>,
    monitor: Option<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl AppContext<AsyncClient> {
    /// Construit les clients depuis la config et démarre la boucle.
    pub fn start(cfg: &ServiceConfig) -> Result<Self> {
        let health = HealthTracker::new();
        let prober = ProbeClient::new(cfg.probe.clone()).context("failed to build check-host client")?;
        let publisher = MqttPublisher::connect(&cfg.mqtt, health.clone()).context("failed to set up MQTT publisher")?;

        Ok(Self::launch(
            cfg.target.clone(),
            cfg.probe_interval,
            Arc::new(prober),
            Some(Arc::new(publisher)),
            health,
        ))
    }
}

impl<S: BrokerSender> AppContext<S> {
    pub fn launch<P: Prober>(
        target: ProbeTarget,
        interval: Duration,
        prober: Arc<P>,
        publisher: Option<Arc<PublishClient<S>>>,
        health: HealthTracker,
    ) -> Self {
        let status = StatusStore::new(&target);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let monitor = MonitorLoop::new(target, interval, prober, publisher.clone(), status.clone());
        let handle = tokio::spawn(monitor.run(shutdown_rx));

        Self {
            status,
            health,
            publisher,
            monitor: Some(handle),
            shutdown,
        }
    }

    pub fn http_state(&self) -> AppState {
        AppState {
            status: self.status.clone(),
            health: self.health.clone(),
        }
    }

    /// Annule la boucle, attend sa fin, puis arrête le publisher.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);

        if let Some(handle) = self.monitor.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "monitor task ended abnormally");
            }
        }

        if let Some(publisher) = self.publisher.take() {
            publisher.stop().await;
        }

        info!("application context shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProbeOutcome;
    use crate::mqtt::{ConnectionState, PublishOptions};
    use routerwatch_devkit::mqtt_stub::{mock_broker, MockMqttClient};
    use routerwatch_devkit::test_utils::{init_tracing, wait_until};
    use rumqttc::QoS;

    struct FixedProber(ProbeOutcome);

    impl Prober for FixedProber {
        async fn check(&self, _target: &ProbeTarget) -> ProbeOutcome {
            self.0
        }
    }

    #[tokio::test]
    async fn shutdown_stops_the_loop_then_the_publisher() {
        init_tracing();
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

        let ctx: AppContext<MockMqttClient> = AppContext::launch(
            ProbeTarget::new("2.6.1.3", 4),
            Duration::from_secs(300),
            Arc::new(FixedProber(ProbeOutcome::Open)),
            Some(Arc::clone(&publisher)),
            health,
        );
        let http = ctx.http_state();

        assert!(wait_until(Duration::from_secs(5), || !broker.get_published_messages().is_empty()).await);
        assert_eq!(http.status.snapshot().state, ProbeOutcome::Open);

        tokio::time::timeout(Duration::from_secs(5), ctx.shutdown()).await.unwrap();

        assert_eq!(broker.disconnect_count(), 1);
        assert_eq!(publisher.connection_state(), ConnectionState::Disconnected);
        assert_eq!(http.health.report().broker, ConnectionState::Disconnected);
    }
}
