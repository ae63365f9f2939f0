// Size-bounded trimming of the page and sub-resource caches.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use super::files::{self, CacheLayout};
use super::metadata::MetadataStore;
use crate::config::{TRIM_HIGH_WATER, TRIM_LOW_WATER};

/// What one trim pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrimReport {
    pub size_before: u64,
    pub size_after: u64,
    pub entries_removed: usize,
}

impl TrimReport {
    pub fn triggered(&self) -> bool {
        self.size_after != self.size_before || self.entries_removed > 0
    }
}

/// One evictable entry: the file stem on disk and the metadata key to drop with it.
struct Candidate {
    stem: String,
    key: String,
}

pub struct CacheEvictor {
    layout: Arc<CacheLayout>,
    store: Arc<dyn MetadataStore>,
    cache_max_size: u64,
    resource_cache_max_size: u64,
}

impl CacheEvictor {
    pub fn new(
        layout: Arc<CacheLayout>,
        store: Arc<dyn MetadataStore>,
        cache_max_size: u64,
        resource_cache_max_size: u64,
    ) -> Self {
        Self {
            layout,
            store,
            cache_max_size,
            resource_cache_max_size,
        }
    }

    /// Trim cached pages, least hit first.
    pub fn trim_pages(&self) -> TrimReport {
        let records = match self.store.list_sessions() {
            Ok(records) => records,
            Err(e) => {
                warn!("list session records failed: {}", e);
                Vec::new()
            }
        };
        let candidates = records
            .into_iter()
            .map(|r| Candidate {
                stem: self.layout.session_stem(&r.session_id),
                key: r.session_id,
            })
            .collect();
        trim(self.layout.cache_dir(), self.cache_max_size, candidates, |id| {
            self.store.remove_session(id)
        })
    }

    /// Trim cached sub-resources, soonest expiry first.
    pub fn trim_resources(&self) -> TrimReport {
        let records = match self.store.list_resources() {
            Ok(records) => records,
            Err(e) => {
                warn!("list resource records failed: {}", e);
                Vec::new()
            }
        };
        let candidates = records
            .into_iter()
            .map(|r| Candidate {
                stem: r.resource_id.clone(),
                key: r.resource_id,
            })
            .collect();
        trim(
            self.layout.resource_dir(),
            self.resource_cache_max_size,
            candidates,
            |id| self.store.remove_resource(id),
        )
    }
}

fn trim<F>(dir: &Path, max_size: u64, candidates: Vec<Candidate>, remove_record: F) -> TrimReport
where
    F: Fn(&str) -> anyhow::Result<()>,
{
    let started = Instant::now();
    let (size_before, mut files_by_stem) = files::scan_dir(dir);
    let mut report = TrimReport {
        size_before,
        size_after: size_before,
        entries_removed: 0,
    };

    let high_water = max_size as f64 * TRIM_HIGH_WATER;
    let low_water = max_size as f64 * TRIM_LOW_WATER;
    if (size_before as f64) <= high_water {
        return report;
    }
    info!(
        "trimming {}: {} bytes cached, budget {}",
        dir.display(),
        size_before,
        max_size
    );

    let mut size = size_before;
    for candidate in candidates {
        if (size as f64) <= low_water {
            break;
        }
        let Some(paths) = files_by_stem.remove(&candidate.stem) else {
            continue;
        };
        let mut deleted_any = false;
        for path in paths {
            let len = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            match fs::remove_file(&path) {
                Ok(()) => {
                    size = size.saturating_sub(len);
                    deleted_any = true;
                    debug!("trim deleted {}", path.display());
                }
                Err(e) => warn!("trim failed to delete {}: {}", path.display(), e),
            }
        }
        if deleted_any {
            if let Err(e) = remove_record(&candidate.key) {
                warn!("trim failed to remove record {}: {}", candidate.key, e);
            }
            report.entries_removed += 1;
        }
    }

    report.size_after = size;
    info!(
        "trim of {} finished: {} -> {} bytes, {} entries, cost {}ms",
        dir.display(),
        size_before,
        size,
        report.entries_removed,
        started.elapsed().as_millis()
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::metadata::{MemoryMetadataStore, SessionRecord};

    #[test]
    fn test_below_high_water_is_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Arc::new(CacheLayout::new(dir.path().join("p"), dir.path().join("r")));
        layout.ensure_dirs().unwrap();
        fs::write(layout.html_path("a"), vec![b'x'; 80]).unwrap();
        let store = Arc::new(MemoryMetadataStore::new());
        store.put_session(&SessionRecord::new("a")).unwrap();

        let evictor = CacheEvictor::new(layout.clone(), store.clone(), 100, 100);
        let report = evictor.trim_pages();
        assert!(!report.triggered());
        assert!(layout.read_html("a").is_some());
        assert!(store.session("a").unwrap().is_some());
    }
}
