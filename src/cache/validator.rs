// Resolves whether a session has usable local content.

use std::sync::Arc;

use tracing::{error, info};

use super::digest;
use super::files::CacheLayout;
use super::metadata::MetadataStore;
use super::remove_session_cache;
use crate::error::SessionError;

/// Host-supplied source of cached html. Interceptors are asked in order and the first
/// `Some` wins; when any are configured the default file lookup is not used.
pub trait CacheInterceptor: Send + Sync {
    fn cached_html(&self, session_id: &str, url: &str) -> Option<String>;
}

pub struct CacheValidator {
    layout: Arc<CacheLayout>,
    store: Arc<dyn MetadataStore>,
    verify_with_digest: bool,
}

impl CacheValidator {
    pub fn new(layout: Arc<CacheLayout>, store: Arc<dyn MetadataStore>, verify_with_digest: bool) -> Self {
        Self {
            layout,
            store,
            verify_with_digest,
        }
    }

    /// Cached html for `session_id`, or `None` when nothing usable is cached.
    ///
    /// `Err(DataVerifyFail)` means cached content existed but failed its integrity check; the
    /// files and record are already purged and the caller should proceed as a first load.
    pub fn cached_html(
        &self,
        session_id: &str,
        url: &str,
        interceptors: &[Arc<dyn CacheInterceptor>],
    ) -> Result<Option<String>, SessionError> {
        if !interceptors.is_empty() {
            return Ok(interceptors
                .iter()
                .find_map(|interceptor| interceptor.cached_html(session_id, url)));
        }
        self.default_cached_html(session_id)
    }

    fn default_cached_html(&self, session_id: &str) -> Result<Option<String>, SessionError> {
        let record = match self.store.session(session_id) {
            Ok(record) => record,
            Err(e) => {
                error!("read metadata of {} failed: {}", session_id, e);
                None
            }
        };

        let outcome = match record.filter(|r| r.is_valid()) {
            None => {
                info!("session {} has no cached page", session_id);
                Ok(None)
            }
            Some(record) => {
                if let Err(e) = self.store.increment_hit_count(session_id) {
                    error!("increment hit count of {} failed: {}", session_id, e);
                }
                match self.layout.read_html(session_id).filter(|h| !h.is_empty()) {
                    None => {
                        error!("session {} cached page is missing", session_id);
                        Ok(None)
                    }
                    Some(html) => {
                        let verified = if self.verify_with_digest {
                            digest::verify(html.as_bytes(), &record.html_digest)
                        } else {
                            self.layout.html_size(session_id) == Some(record.html_size)
                        };
                        if verified {
                            return Ok(Some(html));
                        }
                        error!(
                            "session {} cached page failed {} verification",
                            session_id,
                            if self.verify_with_digest { "digest" } else { "size" }
                        );
                        Err(SessionError::DataVerifyFail)
                    }
                }
            }
        };

        remove_session_cache(&self.layout, self.store.as_ref(), session_id);
        outcome
    }
}
