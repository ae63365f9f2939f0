// Session engine: the facade hosts drive, plus the services every session shares.

pub mod listener;
pub mod pool;
mod quick;
pub mod session;
mod standard;
pub mod state;
pub mod stats;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use anyhow::Result;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::cache::evictor::{CacheEvictor, TrimReport};
use crate::cache::files::CacheLayout;
use crate::cache::metadata::{self, MetadataStore};
use crate::cache::resource::ResourceCache;
use crate::cache::validator::CacheValidator;
use crate::cache::{now_millis, remove_session_cache};
use crate::config::{EngineConfig, SessionConfig};
use crate::host::{HtmlAssembler, SessionRuntime};
use crate::source::http::HttpConnectionFactory;
use crate::source::traits::ConnectionFactory;

pub use listener::{ListenerHandle, SessionListener, StateListener};
pub use pool::{PreloadLookup, PreloadRejection, SessionPool};
pub use session::{InterceptLocation, Session};
pub use state::{CacheOffline, FlowOutcome, ResultCode, SessionState};
pub use stats::{SessionStatistics, StatsSnapshot};

/// Services shared by every session of one engine.
pub(crate) struct EngineContext {
    pub(crate) config: EngineConfig,
    pub(crate) runtime: Arc<dyn SessionRuntime>,
    pub(crate) store: Arc<dyn MetadataStore>,
    pub(crate) layout: Arc<CacheLayout>,
    pub(crate) validator: CacheValidator,
    pub(crate) resource_cache: Arc<ResourceCache>,
    pub(crate) evictor: CacheEvictor,
    pub(crate) assembler: Arc<dyn HtmlAssembler>,
    pub(crate) default_factory: Arc<dyn ConnectionFactory>,
    pub(crate) handle: Handle,
    /// Bounds concurrent session flows.
    pub(crate) workers: Arc<Semaphore>,
    last_trim: Mutex<Option<Instant>>,
}

impl EngineContext {
    pub(crate) fn trim(&self) -> (TrimReport, TrimReport) {
        let pages = self.evictor.trim_pages();
        let resources = self.evictor.trim_resources();
        *self.last_trim.lock() = Some(Instant::now());
        info!(
            "cache trimmed: pages {} -> {}, resources {} -> {}",
            pages.size_before, pages.size_after, resources.size_before, resources.size_after
        );
        (pages, resources)
    }

    /// Trim when the check interval has passed since the last trim.
    pub(crate) fn check_trim(&self) {
        let interval = Duration::from_millis(self.config.cache_check_interval_ms);
        let due = match *self.last_trim.lock() {
            Some(at) => at.elapsed() >= interval,
            None => true,
        };
        if due {
            self.trim();
        }
    }
}

/// Keeps the pool's running map in step without the sessions owning the pool.
struct PoolStateListener(Weak<SessionPool>);

impl StateListener for PoolStateListener {
    fn on_state_changed(&self, session: &Arc<Session>, old: SessionState, new: SessionState) {
        if let Some(pool) = self.0.upgrade() {
            pool.on_state_changed(session, old, new);
        }
    }
}

/// Entry point for hosts: creates, preloads and removes sessions and manages the cache.
pub struct Engine {
    ctx: Arc<EngineContext>,
    pool: Arc<SessionPool>,
    available: AtomicBool,
    /// Serializes pool-facing calls so per-id presence checks and inserts are atomic.
    ops: Mutex<()>,
}

impl Engine {
    /// Build an engine over the given host collaborators. Sessions run on `handle`.
    pub fn new(
        config: EngineConfig,
        runtime: Arc<dyn SessionRuntime>,
        store: Arc<dyn MetadataStore>,
        assembler: Arc<dyn HtmlAssembler>,
        handle: Handle,
    ) -> Result<Self> {
        Self::with_connection_factory(
            config,
            runtime,
            store,
            assembler,
            Arc::new(HttpConnectionFactory::default()),
            handle,
        )
    }

    /// Like [`Engine::new`], with a transport used by sessions that do not configure one.
    pub fn with_connection_factory(
        config: EngineConfig,
        runtime: Arc<dyn SessionRuntime>,
        store: Arc<dyn MetadataStore>,
        assembler: Arc<dyn HtmlAssembler>,
        default_factory: Arc<dyn ConnectionFactory>,
        handle: Handle,
    ) -> Result<Self> {
        let layout = Arc::new(CacheLayout::new(&config.cache_dir, &config.resource_cache_dir));
        layout.ensure_dirs()?;

        let ctx = EngineContext {
            validator: CacheValidator::new(
                Arc::clone(&layout),
                Arc::clone(&store),
                config.verify_cache_with_digest,
            ),
            resource_cache: Arc::new(ResourceCache::new(
                Arc::clone(&layout),
                Arc::clone(&store),
                config.verify_cache_with_digest,
                config.resource_max_age_ms,
            )),
            evictor: CacheEvictor::new(
                Arc::clone(&layout),
                Arc::clone(&store),
                config.cache_max_size,
                config.resource_cache_max_size,
            ),
            workers: Arc::new(Semaphore::new(config.max_session_workers.max(1))),
            last_trim: Mutex::new(None),
            runtime,
            store,
            layout,
            assembler,
            default_factory,
            handle,
            config,
        };
        info!(
            "engine created: cache_dir={}, preload capacity={}",
            ctx.config.cache_dir, ctx.config.max_preload_sessions
        );
        Ok(Self {
            pool: Arc::new(SessionPool::new(ctx.config.max_preload_sessions)),
            ctx: Arc::new(ctx),
            available: AtomicBool::new(true),
            ops: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.ctx.config
    }

    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    /// Open or close `pre_create` and `create`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        info!("engine available: {}", available);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst) && self.ctx.store.is_ready()
    }

    pub fn make_session_id(&self, url: &str, account_related: bool) -> String {
        self.ctx.runtime.make_session_id(url, account_related)
    }

    /// Create a session ahead of navigation and park it in the preload pool.
    pub fn pre_create(&self, url: &str, config: SessionConfig) -> bool {
        if !self.is_available() {
            error!("pre create failed: engine unavailable");
            return false;
        }
        let _ops = self.ops.lock();
        let id = self.make_session_id(url, config.account_related);
        if id.is_empty() {
            return false;
        }
        if let Some(stale) = self.pool.evict_stale_preload(&id, &config) {
            info!("session {} replaced in preload pool", stale.log_id());
            stale.destroy();
        }
        if let Err(rejection) = self.pool.can_preload(&id) {
            error!("pre create of {} rejected: {:?}", id, rejection);
            return false;
        }
        if !self.is_session_available(&id) || !self.ctx.runtime.is_network_valid() {
            return false;
        }

        let Some(session) = self.build_session(&id, url, config) else {
            return false;
        };
        session.set_is_preload(true);
        if let Err(rejection) = self.pool.insert_preload(Arc::clone(&session)) {
            error!("pre create of {} rejected: {:?}", id, rejection);
            session.destroy();
            return false;
        }
        if session.config().auto_start {
            session.start();
        }
        info!("session {} preloaded for {}", session.log_id(), id);
        true
    }

    /// Session for a navigation: a compatible preloaded one, or a new one. `None` when the
    /// engine is unavailable, the id is inside its unavailable window, or a session with the
    /// same id is already running.
    pub fn create(&self, url: &str, config: SessionConfig) -> Option<Arc<Session>> {
        if !self.is_available() {
            error!("create failed: engine unavailable");
            return None;
        }
        let _ops = self.ops.lock();
        let id = self.make_session_id(url, config.account_related);
        if id.is_empty() {
            return None;
        }

        match self.pool.take_preload(&id, &config) {
            PreloadLookup::Hit(session) => {
                session.set_is_preload(false);
                info!("session {} promoted from preload pool", session.log_id());
                return Some(session);
            }
            PreloadLookup::Stale(session) => session.destroy(),
            PreloadLookup::Miss => {}
        }

        if !self.is_session_available(&id) {
            return None;
        }
        let session = self.build_session(&id, url, config)?;
        if session.config().auto_start {
            session.start();
        }
        Some(session)
    }

    /// Drop the cached page of `session_id`, destroying a preloaded session for it. Fails
    /// while a session with that id is running.
    pub fn remove_session_cache(&self, session_id: &str) -> bool {
        let _ops = self.ops.lock();
        if let Some(session) = self.pool.remove_preload(session_id) {
            info!("session {} removed from preload pool", session.log_id());
            session.destroy();
        }
        if self.pool.is_running(session_id) {
            error!("remove cache of {} failed: session is running", session_id);
            return false;
        }
        remove_session_cache(&self.ctx.layout, self.ctx.store.as_ref(), session_id);
        true
    }

    /// Destroy every preloaded session and delete the whole page cache. Fails while any
    /// session is running.
    pub fn clean_cache(&self) -> bool {
        let _ops = self.ops.lock();
        let preloaded = self.pool.drain_preload();
        if !preloaded.is_empty() {
            info!("clean cache: destroying {} preload sessions", preloaded.len());
        }
        for session in preloaded {
            session.destroy();
        }
        if self.pool.running_len() > 0 {
            error!("clean cache failed: {} sessions running", self.pool.running_len());
            return false;
        }
        let files_removed = self.ctx.layout.delete_all_session_files();
        match self.ctx.store.clear_sessions() {
            Ok(()) => files_removed,
            Err(e) => {
                error!("clean cache: clear metadata failed: {}", e);
                false
            }
        }
    }

    /// Evict from the page cache and the sub-resource cache until both fit their budgets.
    pub fn trim(&self) -> (TrimReport, TrimReport) {
        self.ctx.trim()
    }

    fn is_session_available(&self, session_id: &str) -> bool {
        let until = metadata::unavailable_until(self.ctx.store.as_ref(), session_id);
        if now_millis() > until {
            return true;
        }
        warn!("session id {} unavailable until {}", session_id, until);
        false
    }

    fn build_session(&self, id: &str, url: &str, config: SessionConfig) -> Option<Arc<Session>> {
        if self.pool.is_running(id) {
            error!("create of {} rejected: a session with this id is running", id);
            return None;
        }
        let session = Session::new(id, url, config, Arc::clone(&self.ctx));
        session.add_state_listener(Arc::new(PoolStateListener(Arc::downgrade(&self.pool))));
        Some(session)
    }
}
