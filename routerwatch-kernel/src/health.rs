use crate::mqtt::ConnectionState;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Serialize)]
pub struct ServiceHealth {
    pub status: &'static str,
    pub broker: ConnectionState,
    pub broker_reconnects: u32,
    pub uptime_seconds: u64,
}

/// Santé du process : uptime, état du lien broker, nombre de reconnexions.
#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    broker_reconnects: Arc<AtomicU32>,
    broker_state: Arc<Mutex<ConnectionState>>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            broker_reconnects: Arc::new(AtomicU32::new(0)),
            broker_state: Arc::new(Mutex::new(ConnectionState::Disconnected)),
        }
    }

    pub fn mark_broker(&self, state: ConnectionState) {
        *self.broker_state.lock() = state;
    }

    pub fn increment_reconnects(&self) {
        self.broker_reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconnects(&self) -> u32 {
        self.broker_reconnects.load(Ordering::Relaxed)
    }

    pub fn report(&self) -> ServiceHealth {
        ServiceHealth {
            status: "ok",
            broker: *self.broker_state.lock(),
            broker_reconnects: self.reconnects(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }
}
