// Lifecycle hooks and the registries sessions keep them in.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::session::Session;
use super::state::SessionState;

/// Hooks fired as a session moves through its flow. Every hook defaults to a no-op.
pub trait SessionListener: Send + Sync {
    fn on_start(&self) {}

    fn on_refresh(&self) {}

    fn on_load_local_cache(&self, _html: Option<&str>) {}

    fn on_first_load(&self, _html: Option<&str>) {}

    fn on_data_updated(&self, _server_rsp: &str) {}

    fn on_template_changed(&self, _html: &str) {}

    fn on_http_error(&self, _code: i32) {}

    fn on_hit_cache(&self) {}

    fn on_unavailable(&self) {}

    fn on_save_cache(&self, _html: &str, _template: Option<&str>, _data: &str) {}

    fn on_destroy(&self) {}
}

/// Observer of state transitions. The session pool is one.
pub trait StateListener: Send + Sync {
    fn on_state_changed(&self, session: &Arc<Session>, old: SessionState, new: SessionState);
}

/// Returned by registration; pass it back to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(u64);

pub struct ListenerRegistry<L: ?Sized> {
    next_id: AtomicU64,
    entries: Mutex<Vec<(u64, Arc<L>)>>,
}

impl<L: ?Sized> ListenerRegistry<L> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, listener: Arc<L>) -> ListenerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().push((id, listener));
        ListenerHandle(id)
    }

    pub fn remove(&self, handle: ListenerHandle) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(id, _)| *id != handle.0);
        entries.len() != before
    }

    /// Listeners in registration order, copied so hooks run without the lock held.
    pub fn snapshot(&self) -> Vec<Arc<L>> {
        self.entries
            .lock()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<L: ?Sized> Default for ListenerRegistry<L> {
    fn default() -> Self {
        Self::new()
    }
}
