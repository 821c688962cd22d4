/*!
Broker MQTT simulé pour tester le publisher sans broker réel

`mock_broker()` renvoie une paire client / boucle d'événements reliée par un
canal, à l'image de `rumqttc::AsyncClient::new`. Le client enregistre chaque
publication et pousse les événements correspondants (envoi, accusé) que la
boucle restitue ensuite dans l'ordre.

Comme rumqttc, une publication QoS 1/2 sans accusé au moment d'une coupure
(ou d'un `clean()`) passe dans `pending` et est renvoyée avec son ancien pkid
juste après le CONNACK suivant, sauf si `discard_pending()` a été appelé.
*/

use anyhow::Result;
use parking_lot::Mutex;
use rumqttc::QoS;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// Événements restitués par `MockEventLoop::poll`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEvent {
    ConnAck,
    Refused(String),
    /// Publication écrite sur le socket (pkid 0 en QoS 0)
    Sent(u16),
    /// PUBACK / PUBCOMP reçu
    Acked(u16),
    Disconnected,
    /// Coupure réseau : `poll` la transforme en erreur
    LinkDown(String),
}

#[derive(Debug, thiserror::Error)]
pub enum MockLinkError {
    #[error("connection lost: {0}")]
    LinkDown(String),
    #[error("broker handle dropped")]
    Closed,
    #[error("publish rejected by mock broker")]
    PublishRejected,
}

#[derive(Default)]
struct BrokerShared {
    resets: AtomicUsize,
    disconnects: AtomicUsize,
    /// Publications QoS 1/2 envoyées et pas encore accusées
    inflight: Mutex<Vec<(u16, MockMessage)>>,
}

/// Mock MQTT Client qui simule rumqttc::AsyncClient
#[derive(Clone)]
pub struct MockMqttClient {
    published_messages: Arc<Mutex<Vec<MockMessage>>>,
    events: mpsc::UnboundedSender<MockEvent>,
    next_pkid: Arc<AtomicU16>,
    auto_ack: Arc<AtomicBool>,
    fail_publish: Arc<AtomicBool>,
    shared: Arc<BrokerShared>,
}

/// Mock de `rumqttc::EventLoop`
pub struct MockEventLoop {
    events: mpsc::UnboundedReceiver<MockEvent>,
    shared: Arc<BrokerShared>,
    published_messages: Arc<Mutex<Vec<MockMessage>>>,
    /// Publications à renvoyer après le prochain CONNACK
    pub pending: VecDeque<(u16, MockMessage)>,
    replaying: bool,
}

pub fn mock_broker() -> (MockMqttClient, MockEventLoop) {
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(BrokerShared::default());
    let published_messages = Arc::new(Mutex::new(Vec::new()));
    let client = MockMqttClient {
        published_messages: Arc::clone(&published_messages),
        events: tx,
        next_pkid: Arc::new(AtomicU16::new(0)),
        auto_ack: Arc::new(AtomicBool::new(true)),
        fail_publish: Arc::new(AtomicBool::new(false)),
        shared: Arc::clone(&shared),
    };
    let eventloop = MockEventLoop {
        events: rx,
        shared,
        published_messages,
        pending: VecDeque::new(),
        replaying: false,
    };
    (client, eventloop)
}

impl MockMqttClient {
    fn push(&self, event: MockEvent) {
        // la boucle peut déjà avoir été abandonnée par le test
        let _ = self.events.send(event);
    }

    fn allocate_pkid(&self) -> u16 {
        loop {
            let pkid = self.next_pkid.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if pkid != 0 {
                return pkid;
            }
        }
    }

    /// Le broker répond CONNACK à la prochaine lecture de la boucle
    pub fn accept_connection(&self) {
        self.push(MockEvent::ConnAck);
    }

    pub fn refuse_connection<S: Into<String>>(&self, reason: S) {
        self.push(MockEvent::Refused(reason.into()));
    }

    /// Simule une coupure réseau
    pub fn drop_connection<S: Into<String>>(&self, reason: S) {
        self.push(MockEvent::LinkDown(reason.into()));
    }

    /// Désactivé : les publications QoS 1/2 restent sans accusé
    pub fn set_auto_ack(&self, enabled: bool) {
        self.auto_ack.store(enabled, Ordering::Relaxed);
    }

    pub fn set_publish_failure(&self, enabled: bool) {
        self.fail_publish.store(enabled, Ordering::Relaxed);
    }

    /// Simule la publication d'un message (compatible avec AsyncClient)
    pub async fn publish<S, V>(&self, topic: S, qos: QoS, retain: bool, payload: V) -> Result<(), MockLinkError>
    where
        S: Into<String>,
        V: Into<Vec<u8>>,
    {
        if self.fail_publish.load(Ordering::Relaxed) {
            return Err(MockLinkError::PublishRejected);
        }

        let message = MockMessage {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
        };
        tracing::debug!(topic = %message.topic, bytes = message.payload.len(), "[MOCK] published");
        self.published_messages.lock().push(message.clone());

        if qos == QoS::AtMostOnce {
            self.push(MockEvent::Sent(0));
        } else {
            let pkid = self.allocate_pkid();
            self.push(MockEvent::Sent(pkid));
            if self.auto_ack.load(Ordering::Relaxed) {
                self.push(MockEvent::Acked(pkid));
            } else {
                self.shared.inflight.lock().push((pkid, message));
            }
        }
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<(), MockLinkError> {
        self.shared.disconnects.fetch_add(1, Ordering::Relaxed);
        self.push(MockEvent::Disconnected);
        Ok(())
    }

    /// Récupère tous les messages publiés (pour assertions de tests)
    pub fn get_published_messages(&self) -> Vec<MockMessage> {
        self.published_messages.lock().clone()
    }

    /// Trouve les messages publiés sur un topic donné
    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        self.published_messages
            .lock()
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }

    /// Parse le dernier message d'un topic en JSON
    pub fn get_last_json_message<T>(&self, topic: &str) -> Result<Option<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        match self.find_messages_by_topic(topic).last() {
            Some(last_msg) => Ok(Some(serde_json::from_slice(&last_msg.payload)?)),
            None => Ok(None),
        }
    }

    /// Nombre de remises à zéro forcées de la boucle
    pub fn reset_count(&self) -> usize {
        self.shared.resets.load(Ordering::Relaxed)
    }

    pub fn disconnect_count(&self) -> usize {
        self.shared.disconnects.load(Ordering::Relaxed)
    }
}

impl MockEventLoop {
    /// Attend le prochain événement ; reste en attente tant que rien n'est poussé.
    pub async fn poll(&mut self) -> Result<MockEvent, MockLinkError> {
        if self.replaying {
            if let Some((pkid, message)) = self.pending.pop_front() {
                tracing::debug!(pkid, topic = %message.topic, "[MOCK] replaying unacknowledged publish");
                self.published_messages.lock().push(message.clone());
                self.shared.inflight.lock().push((pkid, message));
                return Ok(MockEvent::Sent(pkid));
            }
            self.replaying = false;
        }

        match self.events.recv().await {
            Some(MockEvent::LinkDown(reason)) => {
                // comme rumqttc : l'état en vol est conservé pour la session suivante
                self.requeue_inflight();
                Err(MockLinkError::LinkDown(reason))
            }
            Some(MockEvent::ConnAck) => {
                self.replaying = !self.pending.is_empty();
                Ok(MockEvent::ConnAck)
            }
            Some(MockEvent::Acked(pkid)) => {
                self.shared.inflight.lock().retain(|(p, _)| *p != pkid);
                Ok(MockEvent::Acked(pkid))
            }
            Some(event) => Ok(event),
            None => Err(MockLinkError::Closed),
        }
    }

    /// Équivalent de `EventLoop::clean` : compte la remise à zéro et garde
    /// les publications non accusées pour la session suivante
    pub fn clean(&mut self) {
        self.shared.resets.fetch_add(1, Ordering::Relaxed);
        self.requeue_inflight();
    }

    /// Oublie les publications en attente de renvoi
    pub fn discard_pending(&mut self) {
        self.pending.clear();
    }

    fn requeue_inflight(&mut self) {
        let inflight = std::mem::take(&mut *self.shared.inflight.lock());
        self.pending.extend(inflight);
    }
}
