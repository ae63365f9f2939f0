// Local page and sub-resource caches: files on disk plus their metadata records.

pub mod digest;
pub mod evictor;
pub mod files;
pub mod metadata;
pub mod resource;
#[cfg(feature = "sqlite")]
pub mod sqlite;
pub mod validator;

use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{info, warn};

use files::CacheLayout;
use metadata::MetadataStore;

/// Wall clock in epoch millis, the unit every persisted timestamp uses.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Delete a page's files and its metadata record. True when both are gone.
pub fn remove_session_cache(layout: &CacheLayout, store: &dyn MetadataStore, session_id: &str) -> bool {
    let files_removed = layout.delete_session_files(session_id);
    let record_removed = match store.remove_session(session_id) {
        Ok(()) => true,
        Err(e) => {
            warn!("remove metadata of {} failed: {}", session_id, e);
            false
        }
    };
    info!("removed session cache {} (files={}, record={})", session_id, files_removed, record_removed);
    files_removed && record_removed
}
