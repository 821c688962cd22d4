/**
 * MQTT - Client de publication résilient
 *
 * RÔLE : Maintenir une connexion longue durée au broker et y publier l'état
 * du routeur avec confirmation de livraison.
 *
 * FONCTIONNEMENT :
 * - Une tâche superviseur possède l'event loop pendant toute la vie du client :
 *   elle pilote la connexion, écrit l'état (Disconnected/Connecting/Connected)
 *   dans une cellule `watch`. Un lien perdu est recomposé immédiatement, les
 *   tentatives qui échouent ensuite attendent 2s → 30s.
 * - Les publications non confirmées au moment d'une coupure sont abandonnées,
 *   jamais rejouées après reconnexion.
 * - `publish()` attend l'état Connected (borné), envoie, puis attend le
 *   PUBACK/PUBCOMP. Tout échec demande une reconnexion et renvoie false.
 * - Une seule reconnexion à la fois : garde acquise sans blocage.
 * - `stop()` supprime les reconnexions automatiques et déconnecte.
 */

pub mod link;
mod tls;

use crate::config::MqttSettings;
use crate::health::HealthTracker;
use crate::models::{ProbeOutcome, StatePayload};
use link::{BrokerLink, BrokerSender, LinkError, LinkEvent};
use parking_lot::Mutex;
use rumqttc::{AsyncClient, QoS};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_secs(2);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const STOP_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("TLS setup failed: {0}")]
    Tls(String),
    #[error("no broker connection within {0:?}")]
    NotConnected(Duration),
    #[error("send failed: {0}")]
    Send(#[from] LinkError),
    #[error("broker link lost before delivery: {0}")]
    LinkLost(String),
    #[error("no delivery confirmation within {0:?}")]
    AckTimeout(Duration),
    #[error("payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("publisher is stopping")]
    Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Garde "reconnexion en cours" : acquisition non bloquante, une seule à la fois.
#[derive(Debug, Clone, Default)]
pub struct ReconnectGuard {
    held: Arc<AtomicBool>,
}

impl ReconnectGuard {
    pub fn try_acquire(&self) -> bool {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn release(&self) {
        self.held.store(false, Ordering::Release);
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

/// Publication en attente de confirmation (une seule à la fois).
struct PendingDelivery {
    qos: QoS,
    pkid: Option<u16>,
    done: oneshot::Sender<Result<(), PublishError>>,
}

#[derive(Default)]
struct DeliveryTracker {
    slot: Mutex<Option<PendingDelivery>>,
}

impl DeliveryTracker {
    fn begin(&self, qos: QoS) -> oneshot::Receiver<Result<(), PublishError>> {
        let (done, rx) = oneshot::channel();
        *self.slot.lock() = Some(PendingDelivery { qos, pkid: None, done });
        rx
    }

    fn on_sent(&self, pkid: u16) {
        let mut slot = self.slot.lock();
        let Some(pending) = slot.as_mut() else { return };
        if pending.pkid.is_some() {
            return;
        }
        if pending.qos == QoS::AtMostOnce {
            if let Some(p) = slot.take() {
                let _ = p.done.send(Ok(()));
            }
        } else {
            pending.pkid = Some(pkid);
        }
    }

    fn on_delivered(&self, pkid: u16) {
        let mut slot = self.slot.lock();
        if slot.as_ref().is_some_and(|p| p.pkid == Some(pkid)) {
            if let Some(p) = slot.take() {
                let _ = p.done.send(Ok(()));
            }
        }
    }

    fn on_link_lost(&self, reason: &str) {
        if let Some(p) = self.slot.lock().take() {
            let _ = p.done.send(Err(PublishError::LinkLost(reason.to_string())));
        }
    }

    fn abandon(&self) {
        self.slot.lock().take();
    }
}

/// État partagé entre le client et sa tâche superviseur.
struct LinkShared {
    state: watch::Sender<ConnectionState>,
    deliveries: DeliveryTracker,
    reconnect_guard: ReconnectGuard,
    reconnect_requested: Notify,
    stopping: AtomicBool,
    stop: Notify,
    health: HealthTracker,
}

impl LinkShared {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
        self.health.mark_broker(state);
    }

    fn stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Idempotent : si une reconnexion est déjà en cours, ne fait rien.
    fn request_reconnect(&self) -> bool {
        if self.stopping() {
            return false;
        }
        if self.reconnect_guard.try_acquire() {
            self.reconnect_requested.notify_one();
            true
        } else {
            debug!("reconnect already in progress");
            false
        }
    }
}

/// Paramètres de publication du topic d'état.
#[derive(Debug, Clone)]
pub struct PublishOptions {
    pub topic: String,
    pub qos: QoS,
    pub retain: bool,
    pub connect_wait: Duration,
    pub ack_timeout: Duration,
}

impl From<&MqttSettings> for PublishOptions {
    fn from(s: &MqttSettings) -> Self {
        Self {
            topic: s.topic.clone(),
            qos: s.qos,
            retain: s.retain,
            connect_wait: s.connect_wait,
            ack_timeout: s.ack_timeout,
        }
    }
}

pub type MqttPublisher = PublishClient<AsyncClient>;

pub struct PublishClient<S: BrokerSender> {
    sender: S,
    options: PublishOptions,
    shared: Arc<LinkShared>,
    publish_lock: tokio::sync::Mutex<()>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl MqttPublisher {
    /// Construit le client rumqttc et démarre la supervision de la connexion.
    pub fn connect(settings: &MqttSettings, health: HealthTracker) -> Result<Self, PublishError> {
        let (client, eventloop) = link::connect(settings)?;
        info!(host = %settings.host, port = settings.port, client_id = %settings.client_id, tls = settings.tls.is_some(), "MQTT publisher starting");
        Ok(Self::with_link(client, eventloop, PublishOptions::from(settings), health))
    }
}

impl<S: BrokerSender> PublishClient<S> {
    pub fn with_link<L: BrokerLink>(sender: S, link: L, options: PublishOptions, health: HealthTracker) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let shared = Arc::new(LinkShared {
            state,
            deliveries: DeliveryTracker::default(),
            reconnect_guard: ReconnectGuard::default(),
            reconnect_requested: Notify::new(),
            stopping: AtomicBool::new(false),
            stop: Notify::new(),
            health,
        });

        let supervisor = tokio::spawn(supervise(link, Arc::clone(&shared)));

        Self {
            sender,
            options,
            shared,
            publish_lock: tokio::sync::Mutex::new(()),
            supervisor: Mutex::new(Some(supervisor)),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn reconnect_in_progress(&self) -> bool {
        self.shared.reconnect_guard.is_held()
    }

    /// Demande une reconnexion ; `false` si une tentative est déjà en cours.
    pub fn request_reconnect(&self) -> bool {
        self.shared.request_reconnect()
    }

    /// Publie l'état ; `true` uniquement si le broker a confirmé la livraison.
    pub async fn publish(&self, state: ProbeOutcome) -> bool {
        match self.try_publish(state).await {
            Ok(()) => {
                info!(%state, topic = %self.options.topic, "state published");
                true
            }
            Err(PublishError::Stopping) => {
                warn!(%state, "publisher stopping, state not published");
                false
            }
            Err(e) => {
                error!(%state, error = %e, "failed to publish state");
                self.shared.request_reconnect();
                false
            }
        }
    }

    async fn try_publish(&self, state: ProbeOutcome) -> Result<(), PublishError> {
        let payload = serde_json::to_vec(&StatePayload::new(state, OffsetDateTime::now_utc()))?;
        let _serial = self.publish_lock.lock().await;

        if self.shared.stopping() {
            return Err(PublishError::Stopping);
        }

        let mut state_rx = self.shared.state.subscribe();
        let connected = timeout(
            self.options.connect_wait,
            state_rx.wait_for(|s| *s == ConnectionState::Connected),
        )
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false);
        if !connected {
            return Err(PublishError::NotConnected(self.options.connect_wait));
        }

        let confirmation = self.shared.deliveries.begin(self.options.qos);
        let delivery = async {
            self.sender
                .publish(&self.options.topic, self.options.qos, self.options.retain, payload)
                .await?;
            confirmation
                .await
                .map_err(|_| PublishError::LinkLost("confirmation dropped".into()))?
        };

        let result = match timeout(self.options.ack_timeout, delivery).await {
            Ok(result) => result,
            Err(_) => Err(PublishError::AckTimeout(self.options.ack_timeout)),
        };
        if result.is_err() {
            self.shared.deliveries.abandon();
        }
        result
    }

    /// Arrêt définitif : plus de reconnexion, DISCONNECT propre puis fin de la supervision.
    pub async fn stop(&self) {
        if self.shared.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("stopping MQTT publisher");

        if self.connection_state() == ConnectionState::Connected {
            match timeout(STOP_GRACE, self.sender.disconnect()).await {
                Ok(Err(e)) => warn!(error = %e, "MQTT disconnect request failed"),
                Err(_) => warn!("MQTT disconnect request timed out"),
                Ok(Ok(())) => {}
            }
        } else {
            self.shared.stop.notify_one();
        }

        let handle = self.supervisor.lock().take();
        if let Some(mut handle) = handle {
            if timeout(STOP_GRACE, &mut handle).await.is_err() {
                self.shared.stop.notify_one();
                if timeout(STOP_GRACE, &mut handle).await.is_err() {
                    handle.abort();
                }
            }
        }

        self.shared.set_state(ConnectionState::Disconnected);
        info!("MQTT publisher stopped");
    }
}

impl<S: BrokerSender> Drop for PublishClient<S> {
    fn drop(&mut self) {
        if let Some(handle) = self.supervisor.get_mut().take() {
            handle.abort();
        }
    }
}

/// Tâche superviseur : possède le lien pour toute la vie du client.
async fn supervise<L: BrokerLink>(mut link: L, shared: Arc<LinkShared>) {
    let mut backoff = INITIAL_BACKOFF;

    // la connexion initiale compte comme la tentative en cours
    shared.reconnect_guard.try_acquire();
    shared.set_state(ConnectionState::Connecting);

    loop {
        if shared.stopping() && *shared.state.borrow() != ConnectionState::Connected {
            break;
        }

        let event = tokio::select! {
            biased;
            _ = shared.stop.notified() => break,
            _ = shared.reconnect_requested.notified() => {
                info!("forcing MQTT reconnection");
                link.reset();
                link.discard_pending();
                shared.deliveries.on_link_lost("reconnect requested");
                shared.health.increment_reconnects();
                shared.set_state(ConnectionState::Connecting);
                continue;
            }
            event = link.next_event() => event,
        };

        let failure = match event {
            Ok(LinkEvent::Connected) => {
                info!("MQTT connected");
                backoff = INITIAL_BACKOFF;
                shared.set_state(ConnectionState::Connected);
                shared.reconnect_guard.release();
                continue;
            }
            Ok(LinkEvent::Sent { pkid }) => {
                shared.deliveries.on_sent(pkid);
                continue;
            }
            Ok(LinkEvent::Delivered { pkid }) => {
                shared.deliveries.on_delivered(pkid);
                continue;
            }
            Ok(LinkEvent::Other) => continue,
            Ok(LinkEvent::Closed) => "connection closed".to_string(),
            Ok(LinkEvent::Refused(code)) => format!("connection refused ({code})"),
            Err(e) => e.to_string(),
        };

        let was_connected = *shared.state.borrow() == ConnectionState::Connected;
        link.discard_pending();
        shared.deliveries.on_link_lost(&failure);
        shared.set_state(ConnectionState::Disconnected);
        if shared.stopping() {
            debug!(reason = %failure, "MQTT link closed during shutdown");
            break;
        }

        // une seule tentative : si un publish a déjà pris la garde, on la réutilise
        shared.reconnect_guard.try_acquire();
        shared.health.increment_reconnects();

        // lien établi perdu : on recompose tout de suite, le backoff ne
        // s'applique qu'aux connexions qui échouent
        if was_connected {
            warn!(reason = %failure, "MQTT disconnected, reconnecting");
            shared.set_state(ConnectionState::Connecting);
            continue;
        }

        warn!(reason = %failure, retry_in_secs = backoff.as_secs(), "MQTT connection attempt failed");
        tokio::select! {
            biased;
            _ = shared.stop.notified() => break,
            _ = sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
        shared.set_state(ConnectionState::Connecting);
    }

    shared.deliveries.on_link_lost("publisher stopped");
    shared.reconnect_guard.release();
    debug!("MQTT supervisor finished");
}
