/**
 * MONITOR - Boucle de surveillance périodique
 *
 * RÔLE : À chaque cycle, lancer un sondage sur une tâche dédiée, mettre à
 * jour le snapshot, et publier seulement si l'état diffère du dernier état
 * dont la livraison a été confirmée.
 *
 * Un cycle en échec (tâche de sondage paniquée...) est journalisé et ne
 * publie rien ; la boucle continue. Arrêt coopératif via un `watch<bool>`,
 * observé pendant le sondage et pendant la pause entre cycles.
 */

use crate::models::{format_utc_timestamp, ProbeOutcome, ProbeTarget, PublishRecord};
use crate::mqtt::link::BrokerSender;
use crate::mqtt::PublishClient;
use crate::probe::Prober;
use crate::state::StatusStore;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinError;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Destination des changements d'état.
pub trait StatePublisher: Send + Sync + 'static {
    /// `true` uniquement sur livraison confirmée.
    fn publish(&self, state: ProbeOutcome) -> impl Future<Output = bool> + Send;
}

impl<S: BrokerSender> StatePublisher for PublishClient<S> {
    async fn publish(&self, state: ProbeOutcome) -> bool {
        PublishClient::publish(self, state).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error("probe task failed: {0}")]
    ProbeTask(#[from] JoinError),
}

#[derive(Debug, PartialEq, Eq)]
enum Cycle {
    Completed(ProbeOutcome),
    Cancelled,
}

pub struct MonitorLoop<P, B> {
    target: ProbeTarget,
    interval: Duration,
    prober: Arc<P>,
    publisher: Option<Arc<B>>,
    status: StatusStore,
    last_published: Option<PublishRecord>,
}

impl<P: Prober, B: StatePublisher> MonitorLoop<P, B> {
    pub fn new(
        target: ProbeTarget,
        interval: Duration,
        prober: Arc<P>,
        publisher: Option<Arc<B>>,
        status: StatusStore,
    ) -> Self {
        Self {
            target,
            interval,
            prober,
            publisher,
            status,
            last_published: None,
        }
    }

    pub fn last_published(&self) -> Option<PublishRecord> {
        self.last_published
    }

    /// Tourne jusqu'à ce que `shutdown` passe à `true` (ou que l'émetteur disparaisse).
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(target = %self.target, interval_secs = self.interval.as_secs(), "monitor loop started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.cycle(&mut shutdown).await {
                Ok(Cycle::Cancelled) => break,
                Ok(Cycle::Completed(state)) => debug!(%state, "monitor cycle completed"),
                Err(e) => error!(error = %e, "monitor cycle failed"),
            }

            tokio::select! {
                _ = sleep(self.interval) => {}
                _ = cancelled(&mut shutdown) => break,
            }
        }

        info!("monitor loop stopped");
    }

    async fn cycle(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<Cycle, CycleError> {
        let prober = Arc::clone(&self.prober);
        let target = self.target.clone();
        let mut task = tokio::spawn(async move { prober.check(&target).await });

        let state = tokio::select! {
            joined = &mut task => joined?,
            _ = cancelled(shutdown) => {
                task.abort();
                return Ok(Cycle::Cancelled);
            }
        };

        self.status.set_state(state);
        self.publish_if_changed(state).await;
        Ok(Cycle::Completed(state))
    }

    async fn publish_if_changed(&mut self, state: ProbeOutcome) {
        let Some(publisher) = &self.publisher else { return };
        if let Some(last) = self.last_published.filter(|r| r.state == state) {
            debug!(%state, since = %format_utc_timestamp(last.at), "state unchanged, nothing to publish");
            return;
        }

        if publisher.publish(state).await {
            self.last_published = Some(PublishRecord { state, at: OffsetDateTime::now_utc() });
        } else {
            warn!(%state, "state not published, retrying on next cycle");
        }
    }
}

async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    // émetteur disparu : on considère l'arrêt demandé
    let _ = shutdown.wait_for(|stop| *stop).await;
}
