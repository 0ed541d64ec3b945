use super::{CallResult, CoinCall, CoinCallShared};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CoinCallStatus {
    Dialing,
    Talking,
}

impl std::fmt::Display for CoinCallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoinCallStatus::Dialing => write!(f, "dialing"),
            CoinCallStatus::Talking => write!(f, "talking"),
        }
    }
}

struct CoinCallEntry {
    call_id: String,
    channel: String,
    target: String,
    started_at: DateTime<Utc>,
    shared: CoinCallShared,
}

/// Point-in-time view of an active coin call.
#[derive(Clone, Debug, Serialize)]
pub struct CoinCallSnapshot {
    pub call_id: String,
    pub channel: String,
    pub target: String,
    pub started_at: DateTime<Utc>,
    pub status: CoinCallStatus,
    pub hopper: u32,
    pub collected: u32,
    pub result: Option<CallResult>,
}

impl CoinCallEntry {
    fn snapshot(&self) -> CoinCallSnapshot {
        let state = self.shared.lock();
        CoinCallSnapshot {
            call_id: self.call_id.clone(),
            channel: self.channel.clone(),
            target: self.target.clone(),
            started_at: self.started_at,
            status: if state.is_answered() {
                CoinCallStatus::Talking
            } else {
                CoinCallStatus::Dialing
            },
            hopper: state.hopper,
            collected: state.collected,
            result: state.result(),
        }
    }
}

/// Active coin calls, keyed by call id.
#[derive(Default)]
pub struct CoinCallRegistry {
    inner: RwLock<HashMap<String, CoinCallEntry>>,
}

impl CoinCallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert the call; it is removed again when the returned guard drops.
    pub fn register(self: &Arc<Self>, call: &CoinCall) -> Registration {
        let entry = CoinCallEntry {
            call_id: call.id.clone(),
            channel: call.caller.name(),
            target: call.options.dial_target(),
            started_at: Utc::now(),
            shared: call.shared.clone(),
        };
        self.inner.write().unwrap().insert(call.id.clone(), entry);
        Registration {
            registry: self.clone(),
            call_id: call.id.clone(),
        }
    }

    fn remove(&self, call_id: &str) {
        self.inner.write().unwrap().remove(call_id);
    }

    pub fn count(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn get(&self, call_id: &str) -> Option<CoinCallSnapshot> {
        self.inner
            .read()
            .unwrap()
            .get(call_id)
            .map(CoinCallEntry::snapshot)
    }

    pub fn list_recent(&self, limit: usize) -> Vec<CoinCallSnapshot> {
        let mut entries: Vec<_> = self
            .inner
            .read()
            .unwrap()
            .values()
            .map(CoinCallEntry::snapshot)
            .collect();
        entries.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        entries.truncate(limit);
        entries
    }
}

pub struct Registration {
    registry: Arc<CoinCallRegistry>,
    call_id: String,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.remove(&self.call_id);
    }
}
