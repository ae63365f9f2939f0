// Cache of pre-fetched sub-resources, keyed by the digest of their url.

use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use tracing::{debug, error, info, warn};

use super::digest;
use super::files::CacheLayout;
use super::metadata::{MetadataStore, ResourceRecord};
use super::now_millis;
use crate::source::traits::ResponseHeaders;

pub struct ResourceCache {
    layout: Arc<CacheLayout>,
    store: Arc<dyn MetadataStore>,
    verify_with_digest: bool,
    max_age_ms: i64,
}

impl ResourceCache {
    pub fn new(
        layout: Arc<CacheLayout>,
        store: Arc<dyn MetadataStore>,
        verify_with_digest: bool,
        max_age_ms: u64,
    ) -> Self {
        Self {
            layout,
            store,
            verify_with_digest,
            max_age_ms: max_age_ms as i64,
        }
    }

    /// Cached content of `url` if it is unexpired and passes verification. Anything that
    /// fails verification is deleted.
    pub fn get(&self, url: &str) -> Option<Bytes> {
        if url.is_empty() {
            return None;
        }
        let resource_id = digest::resource_id(url);
        let record = match self.store.resource(&resource_id) {
            Ok(record) => record?,
            Err(e) => {
                error!("read resource record of {} failed: {}", url, e);
                return None;
            }
        };
        if record.expired_time < now_millis() {
            debug!("resource {} expired", url);
            return None;
        }

        let content = if record.digest.is_empty() {
            info!("resource {} has an empty record", url);
            None
        } else {
            match self.layout.read_resource(&resource_id).filter(|c| !c.is_empty()) {
                None => {
                    error!("resource {} cache file is missing", url);
                    None
                }
                Some(content) => {
                    let verified = if self.verify_with_digest {
                        digest::verify(&content, &record.digest)
                    } else {
                        content.len() as u64 == record.size
                    };
                    if verified {
                        Some(content)
                    } else {
                        error!("resource {} failed verification", url);
                        None
                    }
                }
            }
        };

        match content {
            Some(content) => Some(Bytes::from(content)),
            None => {
                self.remove(&resource_id);
                None
            }
        }
    }

    /// Response headers stored alongside `url`'s content.
    pub fn headers(&self, url: &str) -> ResponseHeaders {
        self.layout.read_resource_headers(&digest::resource_id(url))
    }

    /// Persist a downloaded resource and its record.
    pub fn save(&self, url: &str, content: &[u8], headers: &ResponseHeaders) -> Result<()> {
        let resource_id = digest::resource_id(url);
        self.layout.save_resource_files(&resource_id, content, headers)?;
        self.store.put_resource(&ResourceRecord {
            resource_id,
            digest: digest::content_digest(content),
            size: content.len() as u64,
            expired_time: now_millis() + self.max_age_ms,
        })?;
        debug!("saved resource {} ({} bytes)", url, content.len());
        Ok(())
    }

    fn remove(&self, resource_id: &str) {
        self.layout.delete_resource_files(resource_id);
        if let Err(e) = self.store.remove_resource(resource_id) {
            warn!("remove resource record {} failed: {}", resource_id, e);
        }
    }
}
