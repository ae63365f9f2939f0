// Session ownership: a bounded preload map filled ahead of navigation and the running map kept
// in step with session state changes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, error, info};

use super::listener::StateListener;
use super::session::Session;
use super::state::SessionState;
use crate::config::SessionConfig;

/// Why a preload insert was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreloadRejection {
    AlreadyPreloaded,
    Full,
}

/// Preload entry looked up on behalf of a navigation.
pub enum PreloadLookup {
    Miss,
    /// Entry was compatible and is now owned by the caller.
    Hit(Arc<Session>),
    /// Entry was stale or configured differently; it has been removed and must be destroyed.
    Stale(Arc<Session>),
}

pub struct SessionPool {
    capacity: usize,
    preload: Mutex<HashMap<String, Arc<Session>>>,
    running: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            preload: Mutex::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn preload_len(&self) -> usize {
        self.preload.lock().len()
    }

    pub fn running_len(&self) -> usize {
        self.running.lock().len()
    }

    pub fn is_preloaded(&self, session_id: &str) -> bool {
        self.preload.lock().contains_key(session_id)
    }

    pub fn is_running(&self, session_id: &str) -> bool {
        self.running.lock().contains_key(session_id)
    }

    /// Check-and-insert under one lock so two preloads of one id cannot both succeed.
    pub fn insert_preload(&self, session: Arc<Session>) -> Result<(), PreloadRejection> {
        let mut preload = self.preload.lock();
        if preload.contains_key(session.id()) {
            return Err(PreloadRejection::AlreadyPreloaded);
        }
        if preload.len() >= self.capacity {
            return Err(PreloadRejection::Full);
        }
        preload.insert(session.id().to_string(), session);
        Ok(())
    }

    /// Room for another preload of `session_id`, checked before a session is built for it.
    pub fn can_preload(&self, session_id: &str) -> Result<(), PreloadRejection> {
        let preload = self.preload.lock();
        if preload.contains_key(session_id) {
            Err(PreloadRejection::AlreadyPreloaded)
        } else if preload.len() >= self.capacity {
            Err(PreloadRejection::Full)
        } else {
            Ok(())
        }
    }

    /// Take the preload entry for `session_id` if it is still usable under `config`.
    pub fn take_preload(&self, session_id: &str, config: &SessionConfig) -> PreloadLookup {
        let mut preload = self.preload.lock();
        let Some(session) = preload.get(session_id) else {
            return PreloadLookup::Miss;
        };
        let usable = is_usable(session, config);
        match preload.remove(session_id) {
            Some(session) if !usable => PreloadLookup::Stale(session),
            Some(session) => PreloadLookup::Hit(session),
            None => PreloadLookup::Miss,
        }
    }

    /// Remove the preload entry for `session_id` when it is expired or configured unlike
    /// `config`. A usable entry stays in place.
    pub fn evict_stale_preload(&self, session_id: &str, config: &SessionConfig) -> Option<Arc<Session>> {
        let mut preload = self.preload.lock();
        if is_usable(preload.get(session_id)?, config) {
            return None;
        }
        preload.remove(session_id)
    }

    pub fn remove_preload(&self, session_id: &str) -> Option<Arc<Session>> {
        self.preload.lock().remove(session_id)
    }

    /// Empty the preload map, handing back what it held.
    pub fn drain_preload(&self) -> Vec<Arc<Session>> {
        self.preload.lock().drain().map(|(_, s)| s).collect()
    }

    pub fn running_session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.running.lock().get(session_id).cloned()
    }
}

fn is_usable(session: &Session, config: &SessionConfig) -> bool {
    let expiry = session.config().preload_expiry;
    let expired = !expiry.is_zero() && Instant::now().duration_since(session.created_at()) > expiry;
    let compatible = session.config() == config;
    if expired || !compatible {
        error!(
            "preload session {} unusable: expired={}, compatible={}",
            session.id(),
            expired,
            compatible
        );
    }
    !expired && compatible
}

impl StateListener for SessionPool {
    fn on_state_changed(&self, session: &Arc<Session>, old: SessionState, new: SessionState) {
        debug!("session {} state {} -> {} (pool)", session.log_id(), old, new);
        match new {
            SessionState::Running => {
                self.running
                    .lock()
                    .insert(session.id().to_string(), Arc::clone(session));
            }
            SessionState::Destroyed => {
                let mut running = self.running.lock();
                if running
                    .get(session.id())
                    .map_or(false, |current| Arc::ptr_eq(current, session))
                {
                    running.remove(session.id());
                    info!("session {} left running pool", session.log_id());
                }
            }
            _ => {}
        }
    }
}
