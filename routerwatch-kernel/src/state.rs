use crate::models::{ProbeOutcome, ProbeTarget, StatusSnapshot};
use parking_lot::Mutex;
use std::sync::Arc;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// Snapshot {host, port, state} : un seul écrivain (la boucle de monitoring),
/// lecteurs via `snapshot()`.
#[derive(Clone)]
pub struct StatusStore {
    inner: Shared<StatusSnapshot>,
}

impl StatusStore {
    pub fn new(target: &ProbeTarget) -> Self {
        Self { inner: new_state(StatusSnapshot::unknown(target)) }
    }

    pub fn set_state(&self, state: ProbeOutcome) {
        self.inner.lock().state = state;
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.inner.lock().clone()
    }
}
