// Persisted metadata of cached pages and sub-resources.

use std::collections::HashMap;

use anyhow::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Validators and bookkeeping for one cached page, keyed by session id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub etag: String,
    pub template_tag: String,
    pub html_digest: String,
    pub html_size: u64,
    pub template_update_time: i64,
    /// Epoch millis until which the page may be used without asking the server.
    pub cache_expired_time: i64,
    /// Epoch millis until which the server asked not to be consulted.
    pub unavailable_until: i64,
    pub hit_count: u32,
}

impl SessionRecord {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Self::default()
        }
    }

    /// Clear everything but the id.
    pub fn reset(&mut self) {
        *self = Self::new(std::mem::take(&mut self.session_id));
    }

    /// A record without an etag or digest does not describe usable content.
    pub fn is_valid(&self) -> bool {
        !self.etag.is_empty() && !self.html_digest.is_empty()
    }
}

/// Bookkeeping for one cached sub-resource, keyed by the digest of its url.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub resource_id: String,
    pub digest: String,
    pub size: u64,
    pub expired_time: i64,
}

impl ResourceRecord {
    pub fn reset(&mut self) {
        *self = Self {
            resource_id: std::mem::take(&mut self.resource_id),
            ..Self::default()
        };
    }
}

/// Durable key/record store behind the caches.
pub trait MetadataStore: Send + Sync {
    fn session(&self, session_id: &str) -> Result<Option<SessionRecord>>;

    /// Insert or overwrite the record as given.
    fn put_session(&self, record: &SessionRecord) -> Result<()>;

    fn remove_session(&self, session_id: &str) -> Result<()>;

    /// Every page record, least hit first.
    fn list_sessions(&self) -> Result<Vec<SessionRecord>>;

    fn increment_hit_count(&self, session_id: &str) -> Result<()>;

    fn clear_sessions(&self) -> Result<()>;

    fn resource(&self, resource_id: &str) -> Result<Option<ResourceRecord>>;

    fn put_resource(&self, record: &ResourceRecord) -> Result<()>;

    fn remove_resource(&self, resource_id: &str) -> Result<()>;

    /// Every resource record, soonest expiry first.
    fn list_resources(&self) -> Result<Vec<ResourceRecord>>;

    /// False while the store is migrating and must not be used.
    fn is_ready(&self) -> bool {
        true
    }
}

/// Store new validators for a page, keeping the hit count it already earned.
pub fn save_session(store: &dyn MetadataStore, record: &SessionRecord) -> Result<()> {
    let mut record = record.clone();
    if let Some(stored) = store.session(&record.session_id)? {
        record.hit_count = stored.hit_count;
    }
    store.put_session(&record)
}

/// Mark a page's server unavailable until `until` (epoch millis).
pub fn set_unavailable_until(store: &dyn MetadataStore, session_id: &str, until: i64) -> Result<()> {
    let mut record = store
        .session(session_id)?
        .unwrap_or_else(|| SessionRecord::new(session_id));
    record.unavailable_until = until;
    store.put_session(&record)
}

pub fn unavailable_until(store: &dyn MetadataStore, session_id: &str) -> i64 {
    match store.session(session_id) {
        Ok(record) => record.map(|r| r.unavailable_until).unwrap_or(0),
        Err(e) => {
            tracing::warn!("read unavailable time of {} failed: {}", session_id, e);
            0
        }
    }
}

/// Process-local store, used when no database is configured.
#[derive(Default)]
pub struct MemoryMetadataStore {
    sessions: Mutex<HashMap<String, SessionRecord>>,
    resources: Mutex<HashMap<String, ResourceRecord>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetadataStore for MemoryMetadataStore {
    fn session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        Ok(self.sessions.lock().get(session_id).cloned())
    }

    fn put_session(&self, record: &SessionRecord) -> Result<()> {
        self.sessions
            .lock()
            .insert(record.session_id.clone(), record.clone());
        Ok(())
    }

    fn remove_session(&self, session_id: &str) -> Result<()> {
        self.sessions.lock().remove(session_id);
        Ok(())
    }

    fn list_sessions(&self) -> Result<Vec<SessionRecord>> {
        let mut records: Vec<_> = self.sessions.lock().values().cloned().collect();
        records.sort_by(|a, b| {
            a.hit_count
                .cmp(&b.hit_count)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        Ok(records)
    }

    fn increment_hit_count(&self, session_id: &str) -> Result<()> {
        if let Some(record) = self.sessions.lock().get_mut(session_id) {
            record.hit_count += 1;
        }
        Ok(())
    }

    fn clear_sessions(&self) -> Result<()> {
        self.sessions.lock().clear();
        Ok(())
    }

    fn resource(&self, resource_id: &str) -> Result<Option<ResourceRecord>> {
        Ok(self.resources.lock().get(resource_id).cloned())
    }

    fn put_resource(&self, record: &ResourceRecord) -> Result<()> {
        self.resources
            .lock()
            .insert(record.resource_id.clone(), record.clone());
        Ok(())
    }

    fn remove_resource(&self, resource_id: &str) -> Result<()> {
        self.resources.lock().remove(resource_id);
        Ok(())
    }

    fn list_resources(&self) -> Result<Vec<ResourceRecord>> {
        let mut records: Vec<_> = self.resources.lock().values().cloned().collect();
        records.sort_by(|a, b| {
            a.expired_time
                .cmp(&b.expired_time)
                .then_with(|| a.resource_id.cmp(&b.resource_id))
        });
        Ok(records)
    }
}
