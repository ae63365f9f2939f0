// One page load: the state machine shared by both delivery strategies, the conditional
// request round, the resource-interception rendezvous and the per-session file worker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Condvar, Mutex};
use reqwest::Url;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::listener::{ListenerHandle, ListenerRegistry, SessionListener, StateListener};
use super::quick::QuickFlow;
use super::standard::StandardFlow;
use super::state::{self, CacheOffline, FlowOutcome, ResultCode, SessionState};
use super::stats::{SessionStatistics, StatsSnapshot};
use super::EngineContext;
use crate::cache::metadata::{self, SessionRecord};
use crate::cache::{digest, now_millis, remove_session_cache};
use crate::config::{
    SessionConfig, SessionMode, DIFF_DELIVERY_WINDOW_MS, HEADER_ACCEPT_DIFF, HEADER_CACHE_OFFLINE,
    HEADER_COOKIE, HEADER_HTML_DIGEST, HEADER_IF_NONE_MATCH, HEADER_LINK, HEADER_SDK_VERSION,
    HEADER_SET_COOKIE, HEADER_TEMPLATE_CHANGE, HEADER_TEMPLATE_TAG, HEADER_USER_AGENT,
    RELOAD_NOTIFY_SPACING_MS, RENDERER_FILE_THREAD, SDK_VERSION, USER_AGENT_PRODUCT,
};
use crate::download::{FetcherOptions, SubResourceFetcher};
use crate::error::{SessionError, CODE_SUCCESS};
use crate::host::{charset_of, DiffDataCallback, ResourceResponse, SessionClient};
use crate::source::server::SessionServer;
use crate::source::stream::SessionStream;
use crate::source::traits::{ConnectionFactory, ConnectionRequest};

static NEXT_LOG_ID: AtomicU64 = AtomicU64::new(1);

/// Thread the renderer's last resource request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptLocation {
    None,
    DedicatedThread,
    OtherThread,
}

/// The five delivery callbacks plus the renderer-facing entry points a strategy owns.
#[async_trait]
pub(crate) trait FlowStrategy: Send + Sync {
    fn on_load_local_cache(&self, session: &Arc<Session>, html: Option<String>);

    async fn on_first_load(&self, session: &Arc<Session>);

    async fn on_data_update(&self, session: &Arc<Session>, server_rsp: Option<String>);

    async fn on_template_change(&self, session: &Arc<Session>, html: Option<String>);

    fn on_http_error(&self, _session: &Arc<Session>, _code: i32) {}

    /// Only called when a local cache was in use.
    fn on_service_unavailable(&self, _session: &Arc<Session>) {}

    fn on_not_modified(&self, session: &Arc<Session>) {
        session.post_notify_result(ResultCode::HitCache, ResultCode::HitCache);
    }

    fn on_client_ready(&self, session: &Arc<Session>) -> bool;

    /// Register the result receiver on the main thread, then deliver the current result.
    fn on_web_ready(&self, session: &Arc<Session>, callback: Arc<dyn DiffDataCallback>) -> bool {
        let seq = session.cancel_web_ready();
        session.post_main(Duration::ZERO, move |s| {
            if s.web_ready_seq.load(Ordering::SeqCst) != seq {
                return;
            }
            s.replace_web_callback(Some(callback));
            let (src, final_code) = s.result_codes();
            s.set_result(src, final_code, true);
        });
        true
    }

    fn on_request_resource(&self, session: &Arc<Session>, url: &str) -> Option<ResourceResponse>;

    /// Drop strategy-held state on destroy.
    fn clear_session_data(&self) {}
}

enum FileJob {
    /// Persist `html` of `server`'s response.
    Save(Arc<SessionServer>, String),
    /// Persist the body a renderer just finished reading.
    SaveOnServerClose(Arc<SessionServer>),
    /// Persist materialized html plus the server's data of a data-only update.
    SaveDataUpdate {
        server: Arc<SessionServer>,
        html: String,
        data: String,
        html_digest: String,
    },
}

/// State guarded by the session's monitor.
struct Monitor {
    state: SessionState,
    pending_stream: Option<SessionStream>,
    pending_diff: Option<String>,
}

pub struct Session {
    id: String,
    log_id: u64,
    url: String,
    config: SessionConfig,
    created_at: Instant,
    ctx: Arc<EngineContext>,
    me: Weak<Session>,
    strategy: Box<dyn FlowStrategy>,

    monitor: Mutex<Monitor>,
    state_changed: Condvar,

    intercept: Mutex<CancellationToken>,
    page_finished: CancellationToken,
    client_ready: AtomicBool,
    was_notified: AtomicBool,
    waiting_for_save: AtomicBool,
    waiting_for_destroy: AtomicBool,
    waiting_for_worker: AtomicBool,
    was_reload: AtomicBool,
    is_preload: AtomicBool,
    /// Set once the current server's response has been handed to the file worker.
    persist_claimed: AtomicBool,
    intercept_location: Mutex<InterceptLocation>,
    result: Mutex<(ResultCode, ResultCode)>,

    server: Mutex<Option<Arc<SessionServer>>>,
    client: Mutex<Option<Arc<dyn SessionClient>>>,
    web_callback: Mutex<Option<Arc<dyn DiffDataCallback>>>,
    web_ready_seq: AtomicU64,
    captured_cookie: Option<String>,

    listeners: ListenerRegistry<dyn SessionListener>,
    state_listeners: ListenerRegistry<dyn StateListener>,
    fetcher: Arc<SubResourceFetcher>,
    stats: SessionStatistics,
    file_jobs: mpsc::UnboundedSender<(Duration, FileJob)>,
}

impl Session {
    pub(crate) fn new(
        id: impl Into<String>,
        url: &str,
        config: SessionConfig,
        ctx: Arc<EngineContext>,
    ) -> Arc<Self> {
        let id = id.into();
        let url = url.trim().to_string();
        let log_id = NEXT_LOG_ID.fetch_add(1, Ordering::Relaxed);

        let captured_cookie = if ctx.config.cookie_on_session_create {
            ctx.runtime.cookie(&url).filter(|c| !c.is_empty())
        } else {
            None
        };

        let factory = config
            .connection_factory
            .clone()
            .unwrap_or_else(|| Arc::clone(&ctx.default_factory));
        let fetcher = Arc::new(SubResourceFetcher::new(
            Arc::clone(&ctx.resource_cache),
            factory,
            Arc::clone(&ctx.runtime),
            ctx.handle.clone(),
            FetcherOptions {
                max_downloading_tasks: ctx.config.max_downloading_tasks,
                connect_timeout: config.connect_timeout,
                read_timeout: config.read_timeout,
                intercept_wait_timeout: ctx.config.sub_resource_wait_timeout(),
            },
        ));

        let strategy: Box<dyn FlowStrategy> = match config.mode {
            SessionMode::Quick => Box::new(QuickFlow::new()),
            SessionMode::Standard => Box::new(StandardFlow::new()),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new_cyclic(|me: &Weak<Session>| {
            spawn_file_worker(&ctx, me.clone(), rx);
            Session {
                id,
                log_id,
                stats: SessionStatistics::new(url.clone()),
                url,
                config,
                created_at: Instant::now(),
                ctx: Arc::clone(&ctx),
                me: me.clone(),
                strategy,
                monitor: Mutex::new(Monitor {
                    state: SessionState::None,
                    pending_stream: None,
                    pending_diff: None,
                }),
                state_changed: Condvar::new(),
                intercept: Mutex::new(CancellationToken::new()),
                page_finished: CancellationToken::new(),
                client_ready: AtomicBool::new(false),
                was_notified: AtomicBool::new(false),
                waiting_for_save: AtomicBool::new(false),
                waiting_for_destroy: AtomicBool::new(false),
                waiting_for_worker: AtomicBool::new(false),
                was_reload: AtomicBool::new(false),
                is_preload: AtomicBool::new(false),
                persist_claimed: AtomicBool::new(false),
                intercept_location: Mutex::new(InterceptLocation::None),
                result: Mutex::new((ResultCode::Unknown, ResultCode::Unknown)),
                server: Mutex::new(None),
                client: Mutex::new(None),
                web_callback: Mutex::new(None),
                web_ready_seq: AtomicU64::new(0),
                captured_cookie,
                listeners: ListenerRegistry::new(),
                state_listeners: ListenerRegistry::new(),
                fetcher,
                file_jobs: tx,
            }
        });
        info!(
            "session {} create: id={}, url={}, mode={:?}",
            session.log_id, session.id, session.url, session.config.mode
        );
        session
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn log_id(&self) -> u64 {
        self.log_id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn state(&self) -> SessionState {
        self.monitor.lock().state
    }

    pub fn is_destroyed(&self) -> bool {
        self.state() == SessionState::Destroyed
    }

    pub fn is_destroyed_or_waiting(&self) -> bool {
        self.is_destroyed() || self.waiting_for_destroy.load(Ordering::SeqCst)
    }

    pub fn is_preload(&self) -> bool {
        self.is_preload.load(Ordering::SeqCst)
    }

    pub(crate) fn set_is_preload(&self, preload: bool) {
        self.is_preload.store(preload, Ordering::SeqCst);
    }

    /// `(original, final)` result of the current round.
    pub fn result_codes(&self) -> (ResultCode, ResultCode) {
        *self.result.lock()
    }

    pub fn statistics(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn fetcher(&self) -> &Arc<SubResourceFetcher> {
        &self.fetcher
    }

    pub fn add_listener(&self, listener: Arc<dyn SessionListener>) -> ListenerHandle {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&self, handle: ListenerHandle) -> bool {
        self.listeners.remove(handle)
    }

    pub fn add_state_listener(&self, listener: Arc<dyn StateListener>) -> ListenerHandle {
        self.state_listeners.add(listener)
    }

    pub fn remove_state_listener(&self, handle: ListenerHandle) -> bool {
        self.state_listeners.remove(handle)
    }

    /// Attach the renderer view. A session binds at most one client.
    pub fn bind_client(&self, client: Arc<dyn SessionClient>) -> bool {
        let mut slot = self.client.lock();
        if slot.is_some() {
            warn!("session {} bind client rejected: already bound", self.log_id);
            return false;
        }
        *slot = Some(client);
        info!("session {} bind client", self.log_id);
        true
    }

    pub fn start(&self) {
        if !self.compare_and_set_state(SessionState::None, SessionState::Running) {
            debug!("session {} start ignored, state={}", self.log_id, self.state());
            return;
        }
        info!("session {} now post flow task", self.log_id);
        self.stats.record_start();
        for l in self.listeners.snapshot() {
            l.on_start();
        }
        self.waiting_for_worker.store(true, Ordering::SeqCst);
        self.notify_state_change(SessionState::None, SessionState::Running);
        self.spawn_flow(true);
    }

    /// Run another round against the server. Only a Ready session refreshes.
    pub fn refresh(&self) -> bool {
        if !self.compare_and_set_state(SessionState::Ready, SessionState::Running) {
            info!("session {} refresh ignored, state={}", self.log_id, self.state());
            return false;
        }
        self.reset_intercept();
        self.was_reload.store(true, Ordering::SeqCst);
        *self.result.lock() = (ResultCode::Unknown, ResultCode::Unknown);
        if let Some(stale) = self.take_pending_stream() {
            stale.discard();
        }
        self.stats.record_start();
        for l in self.listeners.snapshot() {
            l.on_refresh();
        }
        self.waiting_for_worker.store(true, Ordering::SeqCst);
        self.notify_state_change(SessionState::Ready, SessionState::Running);
        self.spawn_flow(false);
        true
    }

    pub fn on_client_ready(&self) -> bool {
        match self.me.upgrade() {
            Some(me) => self.strategy.on_client_ready(&me),
            None => false,
        }
    }

    /// Register the in-page result receiver and deliver the current result to it.
    pub fn on_web_ready(&self, callback: Arc<dyn DiffDataCallback>) -> bool {
        match self.me.upgrade() {
            Some(me) => self.strategy.on_web_ready(&me, callback),
            None => false,
        }
    }

    pub fn on_client_page_finished(&self, url: &str) {
        if self.is_match_current_url(url) {
            info!("session {} page finished", self.log_id);
            self.page_finished.cancel();
        }
    }

    /// Renderer resource interception. Blocks the calling thread while the main resource is
    /// still being fetched; call it from a renderer thread, never from async code.
    pub fn on_client_request_resource(&self, url: &str) -> Option<ResourceResponse> {
        let on_file_thread = std::thread::current().name() == Some(RENDERER_FILE_THREAD);
        *self.intercept_location.lock() = if on_file_thread {
            InterceptLocation::DedicatedThread
        } else {
            InterceptLocation::OtherThread
        };

        let response = if self.is_match_current_url(url) {
            self.me
                .upgrade()
                .and_then(|me| self.strategy.on_request_resource(&me, url))
        } else if self.is_destroyed() {
            None
        } else {
            self.fetcher
                .on_request_sub_resource(url, || self.is_destroyed_or_waiting())
                .map(|mut r| {
                    r.headers.extend(self.config.custom_response_headers.clone());
                    r
                })
        };

        *self.intercept_location.lock() = InterceptLocation::None;
        response
    }

    /// Same host (case-insensitive) and same path, ignoring a trailing slash.
    pub fn is_match_current_url(&self, url: &str) -> bool {
        let (Ok(src), Ok(other)) = (Url::parse(&self.url), Url::parse(url.trim())) else {
            return false;
        };
        let same_host = match (src.host_str(), other.host_str()) {
            (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
            _ => false,
        };
        if !same_host {
            return false;
        }
        let normalize = |path: &str| format!("{}/", path.trim_end_matches('/')).to_ascii_lowercase();
        normalize(src.path()) == normalize(other.path())
    }

    pub fn destroy(&self) {
        self.destroy_with(false);
    }

    /// Tear the session down. Unforced destruction waits for an outstanding flow or cache write,
    /// forcing itself after the configured grace period.
    pub(crate) fn destroy_with(&self, force: bool) {
        if self.is_destroyed() {
            return;
        }

        self.client.lock().take();
        if let Some(stream) = self.take_pending_stream() {
            stream.discard();
        }
        self.monitor.lock().pending_diff = None;
        self.strategy.clear_session_data();
        self.fetcher.shutdown();
        self.post_trim_check();

        if force || self.can_destroy() {
            let old = {
                let mut monitor = self.monitor.lock();
                if monitor.state == SessionState::Destroyed {
                    return;
                }
                let old = monitor.state;
                monitor.state = SessionState::Destroyed;
                self.state_changed.notify_all();
                old
            };

            if !force {
                if let Some(server) = self.server.lock().take() {
                    server.disconnect();
                }
            }

            self.notify_state_change(old, SessionState::Destroyed);
            self.state_listeners.clear();
            self.waiting_for_destroy.store(false, Ordering::SeqCst);
            for l in self.listeners.snapshot() {
                l.on_destroy();
            }
            self.listeners.clear();
            info!("session {} destroyed, force={}", self.log_id, force);
            return;
        }

        if self
            .waiting_for_destroy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!(
                "session {} waiting for destroy, worker={} save={}",
                self.log_id,
                self.waiting_for_worker.load(Ordering::SeqCst),
                self.waiting_for_save.load(Ordering::SeqCst)
            );
            self.post_main(self.ctx.config.force_destroy_delay(), |s| s.destroy_with(true));
        }
    }

    fn can_destroy(&self) -> bool {
        !self.waiting_for_worker.load(Ordering::SeqCst) && !self.waiting_for_save.load(Ordering::SeqCst)
    }

    fn post_force_destroy_if_need(&self) -> bool {
        if self.waiting_for_destroy.load(Ordering::SeqCst) && self.can_destroy() {
            self.post_main(Duration::ZERO, |s| s.destroy_with(true));
            return true;
        }
        false
    }

    fn post_trim_check(&self) {
        let ctx = Arc::clone(&self.ctx);
        self.ctx
            .runtime
            .post_to_background(Box::new(move || ctx.check_trim()), Duration::from_millis(50));
    }

    // ---- monitor ----

    fn compare_and_set_state(&self, expect: SessionState, next: SessionState) -> bool {
        let mut monitor = self.monitor.lock();
        if monitor.state != expect || !expect.can_move_to(next) {
            return false;
        }
        monitor.state = next;
        self.state_changed.notify_all();
        true
    }

    /// CAS `from -> to`, optionally telling the state listeners.
    pub(crate) fn switch_state(&self, from: SessionState, to: SessionState, notify: bool) -> bool {
        if !self.compare_and_set_state(from, to) {
            return false;
        }
        if notify {
            self.notify_state_change(from, to);
        }
        true
    }

    fn notify_state_change(&self, old: SessionState, new: SessionState) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        debug!("session {} state {} -> {}", self.log_id, old, new);
        for l in self.state_listeners.snapshot() {
            l.on_state_changed(&me, old, new);
        }
    }

    pub(crate) fn set_pending_stream(&self, stream: SessionStream) {
        let previous = {
            let mut monitor = self.monitor.lock();
            let previous = monitor.pending_stream.replace(stream);
            self.state_changed.notify_all();
            previous
        };
        if let Some(previous) = previous {
            previous.discard();
        }
    }

    pub(crate) fn take_pending_stream(&self) -> Option<SessionStream> {
        self.monitor.lock().pending_stream.take()
    }

    pub(crate) fn set_pending_diff(&self, diff: Option<String>) {
        self.monitor.lock().pending_diff = diff;
    }

    /// Block while the flow is Running with nothing to hand out, up to the configured bound.
    pub(crate) fn wait_for_main_resource(&self) {
        let started = Instant::now();
        let deadline = started + self.ctx.config.resource_wait_timeout();
        let mut monitor = self.monitor.lock();
        while monitor.state == SessionState::Running && monitor.pending_stream.is_none() {
            if self.state_changed.wait_until(&mut monitor, deadline).timed_out() {
                info!("session {} wait for main resource timed out", self.log_id);
                break;
            }
        }
        debug!(
            "session {} waited {}ms for main resource",
            self.log_id,
            started.elapsed().as_millis()
        );
    }

    // ---- flags ----

    pub(crate) fn intercept_token(&self) -> CancellationToken {
        self.intercept.lock().clone()
    }

    pub(crate) fn is_intercepted(&self) -> bool {
        self.intercept.lock().is_cancelled()
    }

    /// Mark the main resource intercepted. False if it already was.
    pub(crate) fn try_mark_intercepted(&self) -> bool {
        let token = self.intercept.lock();
        if token.is_cancelled() {
            return false;
        }
        token.cancel();
        true
    }

    pub(crate) fn mark_intercepted(&self) {
        self.intercept.lock().cancel();
    }

    fn reset_intercept(&self) {
        *self.intercept.lock() = CancellationToken::new();
    }

    pub(crate) fn page_finished_token(&self) -> &CancellationToken {
        &self.page_finished
    }

    pub(crate) fn is_client_ready(&self) -> bool {
        self.client_ready.load(Ordering::SeqCst)
    }

    /// Flip client readiness on. False if it already was.
    pub(crate) fn mark_client_ready(&self) -> bool {
        self.client_ready
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn was_reload(&self) -> bool {
        self.was_reload.load(Ordering::SeqCst)
    }

    // ---- collaborators ----

    pub(crate) fn client(&self) -> Option<Arc<dyn SessionClient>> {
        self.client.lock().clone()
    }

    pub(crate) fn server(&self) -> Option<Arc<SessionServer>> {
        self.server.lock().clone()
    }

    pub(crate) fn listeners(&self) -> Vec<Arc<dyn SessionListener>> {
        self.listeners.snapshot()
    }

    pub(crate) fn notify_error(&self, code: i32) {
        let client = self.client();
        self.ctx.runtime.notify_error(client.as_ref(), &self.url, code);
    }

    /// Run `task` on the renderer's main thread after `delay`.
    pub(crate) fn post_main<F>(&self, delay: Duration, task: F)
    where
        F: FnOnce(&Arc<Session>) + Send + 'static,
    {
        let Some(session) = self.me.upgrade() else {
            return;
        };
        self.ctx
            .runtime
            .post_to_main(Box::new(move || task(&session)), delay);
    }

    pub(crate) fn post_notify_result(&self, src: ResultCode, final_code: ResultCode) {
        self.post_main(Duration::ZERO, move |s| s.set_result(src, final_code, true));
    }

    /// Headers stored with the cached page, plus the configured response headers.
    pub(crate) fn cache_headers(&self) -> HashMap<String, String> {
        let mut headers = self.ctx.layout.read_headers(&self.id).filtered();
        headers.extend(self.config.custom_response_headers.clone());
        headers
    }

    /// Headers of the live response, plus the configured response headers.
    pub(crate) fn server_headers(&self) -> HashMap<String, String> {
        let mut headers = self
            .server()
            .map(|s| s.headers().filtered())
            .unwrap_or_default();
        headers.extend(self.config.custom_response_headers.clone());
        headers
    }

    pub(crate) fn server_charset(&self) -> String {
        charset_of(
            &self
                .server()
                .map(|s| s.headers().filtered())
                .unwrap_or_default(),
        )
    }

    pub(crate) fn server_cache_offline(&self) -> CacheOffline {
        CacheOffline::parse(
            self.server()
                .and_then(|s| s.header(HEADER_CACHE_OFFLINE))
                .as_deref(),
        )
    }

    /// Whether the current response may be written to the page cache.
    pub(crate) fn need_save(&self) -> bool {
        let Some(server) = self.server() else {
            return false;
        };
        let offline = CacheOffline::parse(server.header(HEADER_CACHE_OFFLINE).as_deref());
        state::need_save_data(self.config.support_cache_control, offline, &server.headers())
    }

    /// `data` object and html digest of a data-update payload.
    pub(crate) fn parse_server_data(&self, rsp: &str) -> Option<(Value, String)> {
        let json: Value = match serde_json::from_str(rsp) {
            Ok(json) => json,
            Err(e) => {
                error!("session {} data update is not json: {}", self.log_id, e);
                self.notify_error(SessionError::ServerDataException(e.to_string()).code());
                return None;
            }
        };
        let Some(data) = json.get("data").filter(|d| d.is_object()).cloned() else {
            error!("session {} data update carries no data object", self.log_id);
            self.notify_error(SessionError::ServerDataException("missing data".into()).code());
            return None;
        };
        let html_digest = json
            .get(HEADER_HTML_DIGEST)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Some((data, html_digest))
    }

    /// Whether a data update may replace the cached page. Otherwise the cache is dropped.
    pub(crate) fn keeps_data_update(&self, has_diff: bool, has_html: bool) -> bool {
        if !has_diff || !has_html {
            return false;
        }
        self.need_save() || self.server_cache_offline() == CacheOffline::Other
    }

    /// Diff of the server's data against the cached data.
    pub(crate) fn compute_diff(&self, server_data: &Value) -> Option<Value> {
        let local = self.ctx.layout.read_data(&self.id);
        self.ctx
            .assembler
            .compute_diff(&self.id, local.as_ref(), server_data)
    }

    /// Rebuild the full page from the cached template and the server's data.
    pub(crate) fn build_html(&self, server_data: &Value, html_digest: &str, approx_size: usize) -> Option<String> {
        let template = self.ctx.layout.read_template(&self.id)?;
        let local = self.ctx.layout.read_data(&self.id);
        self.ctx
            .assembler
            .build_html(
                &self.id,
                &template,
                local.as_ref(),
                server_data,
                html_digest,
                approx_size,
            )
            .filter(|h| !h.is_empty())
    }

    pub(crate) fn remove_cache(&self) {
        remove_session_cache(&self.ctx.layout, self.ctx.store.as_ref(), &self.id);
    }

    /// Read the response body as a stream that breaks out early when `brk` fires. Closing a
    /// stream reports back so a fully read page can be persisted.
    pub(crate) async fn response_stream(&self, brk: &CancellationToken) -> Option<SessionStream> {
        let server = self.server()?;
        let weak = self.me.clone();
        let closed_server = Arc::clone(&server);
        server
            .response_stream(brk, move |complete| {
                if let Some(session) = weak.upgrade() {
                    session.on_server_closed(&closed_server, complete);
                }
            })
            .await
    }

    pub(crate) async fn response_data(&self, read_to_end: bool) -> Option<String> {
        let server = self.server()?;
        server.response_data(read_to_end).await.filter(|h| !h.is_empty())
    }

    // ---- result notification ----

    pub(crate) fn replace_web_callback(&self, callback: Option<Arc<dyn DiffDataCallback>>) {
        *self.web_callback.lock() = callback;
    }

    /// Forget the result receiver and any registration still queued. Returns the new sequence.
    pub(crate) fn cancel_web_ready(&self) -> u64 {
        self.replace_web_callback(None);
        self.web_ready_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Record the round's result and, when asked, deliver it to the in-page callback.
    pub(crate) fn set_result(&self, src: ResultCode, final_code: ResultCode, notify: bool) {
        info!(
            "session {} set result: src={}, final={}",
            self.log_id,
            src.code(),
            final_code.code()
        );
        *self.result.lock() = (src, final_code);
        self.stats.record_modes(src.code(), final_code.code());
        if !notify {
            return;
        }

        if self.was_notified.load(Ordering::SeqCst) {
            debug!("session {} result already notified once", self.log_id);
        }
        if self.web_callback.lock().is_none() {
            debug!("session {} result not delivered: no web callback yet", self.log_id);
            return;
        }
        if final_code == ResultCode::Unknown {
            debug!("session {} result not delivered: final code unknown", self.log_id);
            return;
        }
        self.was_notified.store(true, Ordering::SeqCst);

        let mut json = Map::new();
        if final_code == ResultCode::DataUpdate {
            let pending = self.monitor.lock().pending_diff.take();
            if let Some(pending) = pending {
                match self.diff_result(&pending) {
                    Some((result, local_delta)) => {
                        json.insert("result".to_string(), Value::String(result));
                        if let Some(delta) = local_delta {
                            json.insert("local_refresh_time".to_string(), Value::from(delta));
                        }
                    }
                    None => return,
                }
            }
        }
        json.insert("code".to_string(), Value::from(final_code.code()));
        json.insert("srcCode".to_string(), Value::from(src.code()));

        let mut extra = Map::new();
        if let Some(server) = self.server() {
            let text = |v: Option<String>| Value::String(v.unwrap_or_default());
            extra.insert(server.etag_key(), text(server.etag()));
            extra.insert(
                HEADER_TEMPLATE_TAG.to_string(),
                text(server.header(HEADER_TEMPLATE_TAG)),
            );
            extra.insert(
                HEADER_CACHE_OFFLINE.to_string(),
                text(server.header(HEADER_CACHE_OFFLINE)),
            );
        }
        extra.insert("isReload".to_string(), Value::Bool(self.was_reload()));
        json.insert("extra".to_string(), Value::Object(extra));
        self.monitor.lock().pending_diff = None;

        let payload = Value::Object(json).to_string();
        let mut delay = 0;
        if self.was_reload() {
            let since_last = now_millis() - self.stats.last_diff_callback_time();
            if since_last < RELOAD_NOTIFY_SPACING_MS {
                delay = RELOAD_NOTIFY_SPACING_MS - since_last;
            }
        }

        if delay > 0 {
            debug!("session {} result delivery delayed {}ms", self.log_id, delay);
            self.post_main(Duration::from_millis(delay as u64), move |s| {
                s.deliver_result(&payload);
            });
        } else {
            self.deliver_result(&payload);
        }
    }

    fn deliver_result(&self, payload: &str) {
        let callback = self.web_callback.lock().clone();
        if let Some(callback) = callback {
            callback.call_back(payload);
            self.stats.set_last_diff_callback_time(now_millis());
        }
    }

    /// The diff as delivered to the page, and the age of the page-side refresh stamp. `None`
    /// when the diff arrived too late to be useful.
    fn diff_result(&self, pending: &str) -> Option<(String, Option<i64>)> {
        let mut diff = match serde_json::from_str::<Value>(pending) {
            Ok(Value::Object(map)) => map,
            Ok(other) => return Some((other.to_string(), None)),
            Err(e) => {
                warn!("session {} pending diff is not json: {}", self.log_id, e);
                return Some((pending.to_string(), None));
            }
        };
        let mut local_delta = None;
        if let Some(stamp) = diff.remove("local_refresh_time") {
            let delta = now_millis() - stamp.as_i64().unwrap_or(0);
            if delta > DIFF_DELIVERY_WINDOW_MS {
                warn!(
                    "session {} diff dropped, page asked {}ms ago",
                    self.log_id, delta
                );
                return None;
            }
            if delta > 0 {
                local_delta = Some(delta);
            }
        }
        Some((Value::Object(diff).to_string(), local_delta))
    }

    // ---- flow ----

    fn spawn_flow(&self, first_request: bool) {
        let Some(session) = self.me.upgrade() else {
            return;
        };
        let workers = Arc::clone(&self.ctx.workers);
        self.ctx.handle.spawn(async move {
            let _permit = match workers.acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!("session {} flow rejected: {}", session.log_id, e);
                    session.waiting_for_worker.store(false, Ordering::SeqCst);
                    return;
                }
            };
            session.run_flow(first_request).await;
        });
    }

    async fn run_flow(self: &Arc<Self>, first_request: bool) {
        if self.state() != SessionState::Running {
            warn!("session {} run flow skipped, state={}", self.log_id, self.state());
            self.waiting_for_worker.store(false, Ordering::SeqCst);
            self.post_force_destroy_if_need();
            return;
        }
        self.stats.record_flow_start();

        let mut cache_html = None;
        let local = if first_request {
            cache_html = match self.ctx.validator.cached_html(
                &self.id,
                &self.url,
                &self.config.cache_interceptors,
            ) {
                Ok(html) => html,
                Err(e) => {
                    warn!("session {} cached html rejected: {}", self.log_id, e);
                    self.notify_error(e.code());
                    None
                }
            };
            self.stats.record_cache_verify();
            let local = self.stored_record();
            self.strategy
                .on_load_local_cache(self, cache_html.clone());
            for l in self.listeners.snapshot() {
                l.on_load_local_cache(cache_html.as_deref());
            }
            local
        } else {
            self.previous_server_record()
        };

        let has_cache = cache_html.as_deref().map_or(false, |h| !h.is_empty()) || !first_request;

        if !self.ctx.runtime.is_network_valid() {
            if has_cache && !self.config.bad_network_toast.is_empty() {
                self.post_main(self.ctx.config.bad_network_toast_delay(), |s| {
                    if s.is_client_ready() && !s.is_destroyed_or_waiting() {
                        s.ctx.runtime.show_toast(&s.config.bad_network_toast);
                    }
                });
            }
            info!("session {} network unavailable, skip connection", self.log_id);
        } else {
            self.handle_connection(has_cache, &local).await;
            self.stats.record_connection_flow_finish();
        }

        self.switch_state(SessionState::Running, SessionState::Ready, true);
        self.waiting_for_worker.store(false, Ordering::SeqCst);
        if self.post_force_destroy_if_need() {
            info!("session {} flow finished, posting deferred destroy", self.log_id);
        }
        debug!("session {} flow finished", self.log_id);
    }

    fn stored_record(&self) -> SessionRecord {
        match self.ctx.store.session(&self.id) {
            Ok(Some(record)) => record,
            Ok(None) => SessionRecord::new(self.id.clone()),
            Err(e) => {
                warn!("session {} read metadata failed: {}", self.log_id, e);
                SessionRecord::new(self.id.clone())
            }
        }
    }

    /// Validators of the last response, the baseline of a reload round.
    fn previous_server_record(&self) -> SessionRecord {
        let mut record = SessionRecord::new(self.id.clone());
        let Some(server) = self.server() else {
            return record;
        };
        if self.config.support_local_split
            && (server.etag().is_none() || server.header(HEADER_TEMPLATE_TAG).is_none())
        {
            server.separate_template_and_data();
        }
        record.etag = server.etag().unwrap_or_default();
        record.template_tag = server.header(HEADER_TEMPLATE_TAG).unwrap_or_default();
        record
    }

    fn user_agent(&self) -> String {
        let product = format!("{}/{}", USER_AGENT_PRODUCT, SDK_VERSION);
        let ua = self.ctx.runtime.user_agent();
        if ua.trim().is_empty() {
            product
        } else {
            format!("{} {}", ua.trim(), product)
        }
    }

    fn build_request(&self, local: &SessionRecord) -> ConnectionRequest {
        let mut request = ConnectionRequest::new(self.url.clone());
        request.connect_timeout = self.config.connect_timeout;
        request.read_timeout = self.config.read_timeout;
        request.direct_address = self.ctx.runtime.host_direct_address(&self.url);
        self.stats.set_direct_address(request.direct_address.is_some());

        let cookie = if self.ctx.config.cookie_on_session_create {
            self.captured_cookie.clone()
        } else {
            self.ctx.runtime.cookie(&self.url)
        };

        let mut request = request
            .header(HEADER_IF_NONE_MATCH, local.etag.clone())
            .header(HEADER_TEMPLATE_TAG, local.template_tag.clone())
            .header(HEADER_USER_AGENT, self.user_agent())
            .header(
                HEADER_ACCEPT_DIFF,
                if self.config.accept_diff { "true" } else { "false" },
            )
            .header(HEADER_SDK_VERSION, SDK_VERSION);
        if let Some(cookie) = cookie.filter(|c| !c.is_empty()) {
            request = request.header(HEADER_COOKIE, cookie);
        }
        for (name, value) in &self.config.custom_request_headers {
            request = request.header(name, value.clone());
        }
        request
    }

    fn connection_factory(&self) -> Arc<dyn ConnectionFactory> {
        self.config
            .connection_factory
            .clone()
            .unwrap_or_else(|| Arc::clone(&self.ctx.default_factory))
    }

    async fn handle_connection(self: &Arc<Self>, has_cache: bool, local: &SessionRecord) {
        if self.config.support_cache_control && now_millis() < local.cache_expired_time {
            info!(
                "session {} cache fresh until {}, skip connection",
                self.log_id, local.cache_expired_time
            );
            self.strategy.on_not_modified(self);
            for l in self.listeners.snapshot() {
                l.on_hit_cache();
            }
            return;
        }

        self.stats.record_connection_flow_start();
        let request = self.build_request(local);
        let server = Arc::new(SessionServer::new(
            self.log_id,
            &self.id,
            request,
            self.connection_factory().as_ref(),
            self.config.support_local_split,
            Arc::clone(&self.ctx.assembler),
        ));
        self.persist_claimed.store(false, Ordering::SeqCst);
        *self.server.lock() = Some(Arc::clone(&server));

        self.stats.record_connection_connect();
        let mut code = server.connect().await;
        if code == CODE_SUCCESS {
            self.stats.record_connection_respond();
            code = server.response_code();
            self.apply_cookies(&server);
        }
        info!("session {} connection responded, code={}", self.log_id, code);

        if self.is_destroyed_or_waiting() {
            info!("session {} destroyed while connecting", self.log_id);
            return;
        }

        if let Some(links) = server.header(HEADER_LINK) {
            let links: Vec<String> = links
                .split(';')
                .map(|l| l.trim().to_string())
                .filter(|l| !l.is_empty())
                .collect();
            if !links.is_empty() {
                let fetcher = Arc::clone(&self.fetcher);
                self.ctx.runtime.post_to_background(
                    Box::new(move || fetcher.add_preload_tasks(&links)),
                    Duration::ZERO,
                );
            }
        }

        let offline = CacheOffline::parse(server.header(HEADER_CACHE_OFFLINE).as_deref());
        let outcome = state::classify(
            code,
            offline,
            server.etag().as_deref(),
            server.header(HEADER_TEMPLATE_CHANGE).as_deref(),
            has_cache,
        );
        info!(
            "session {} outcome {:?} (offline={:?}, has_cache={})",
            self.log_id, outcome, offline, has_cache
        );

        match outcome {
            FlowOutcome::NotModified => {
                self.strategy.on_not_modified(self);
                for l in self.listeners.snapshot() {
                    l.on_hit_cache();
                }
            }
            FlowOutcome::HttpError(code) => {
                self.strategy.on_http_error(self, code);
                for l in self.listeners.snapshot() {
                    l.on_http_error(code);
                }
                self.notify_error(code);
            }
            FlowOutcome::ServiceUnavailable => {
                if has_cache {
                    self.strategy.on_service_unavailable(self);
                }
                let until = now_millis() + self.ctx.config.unavailable_time_ms as i64;
                if let Err(e) = metadata::set_unavailable_until(self.ctx.store.as_ref(), &self.id, until) {
                    warn!("session {} record unavailable window failed: {}", self.log_id, e);
                }
                for l in self.listeners.snapshot() {
                    l.on_unavailable();
                }
            }
            FlowOutcome::FirstLoad => self.strategy.on_first_load(self).await,
            FlowOutcome::DropCache => {
                info!("session {} offline mode {:?}, drop cache", self.log_id, offline);
                self.remove_cache();
            }
            FlowOutcome::ProtocolViolation => {
                warn!("session {} response lacks etag or template-change, drop cache", self.log_id);
                self.remove_cache();
            }
            FlowOutcome::DataUpdate => {
                self.strategy
                    .on_data_update(self, server.updated_data())
                    .await
            }
            FlowOutcome::TemplateChange => {
                let html = self.response_data(self.was_reload()).await;
                self.strategy.on_template_change(self, html).await
            }
        }
    }

    /// Hand `set-cookie` values to the host. Interception on a renderer thread other than the
    /// file thread may hold the cookie store, so the write is deferred there.
    fn apply_cookies(&self, server: &SessionServer) {
        let cookies = server.headers().get_all(HEADER_SET_COOKIE).to_vec();
        if cookies.is_empty() {
            return;
        }
        let location = *self.intercept_location.lock();
        if location == InterceptLocation::OtherThread {
            let runtime = Arc::clone(&self.ctx.runtime);
            let url = self.url.clone();
            self.ctx.runtime.post_to_background(
                Box::new(move || {
                    runtime.set_cookie(&url, &cookies);
                }),
                Duration::ZERO,
            );
        } else {
            self.ctx.runtime.set_cookie(&self.url, &cookies);
        }
    }

    // ---- persistence ----

    /// Claim the single persist of the current response.
    pub(crate) fn claim_persist(&self) -> bool {
        !self.persist_claimed.swap(true, Ordering::SeqCst)
    }

    /// Schedule the current response's page to be saved.
    pub(crate) fn post_save(&self, html: String) {
        let Some(server) = self.server() else {
            return;
        };
        if !self.claim_persist() {
            debug!("session {} response already scheduled for save", self.log_id);
            return;
        }
        self.queue_file_job(FileJob::Save(server, html), self.ctx.config.save_cache_delay());
    }

    pub(crate) fn post_save_data_update(&self, html: String, data: String, html_digest: String) {
        let Some(server) = self.server() else {
            return;
        };
        if !self.claim_persist() {
            return;
        }
        self.queue_file_job(
            FileJob::SaveDataUpdate {
                server,
                html,
                data,
                html_digest,
            },
            Duration::ZERO,
        );
    }

    fn queue_file_job(&self, job: FileJob, delay: Duration) {
        if self.file_jobs.send((delay, job)).is_err() {
            warn!("session {} file worker gone", self.log_id);
        }
    }

    fn on_server_closed(&self, server: &Arc<SessionServer>, complete: bool) {
        if self.is_destroyed_or_waiting() {
            return;
        }
        self.waiting_for_save.store(true, Ordering::SeqCst);
        if complete {
            let offline = CacheOffline::parse(server.header(HEADER_CACHE_OFFLINE).as_deref());
            if state::need_save_data(self.config.support_cache_control, offline, &server.headers())
                && self.claim_persist()
            {
                info!("session {} response closed, post save task", self.log_id);
                self.queue_file_job(
                    FileJob::SaveOnServerClose(Arc::clone(server)),
                    self.ctx.config.save_cache_delay(),
                );
                return;
            }
        } else {
            warn!("session {} response closed before it was read completely", self.log_id);
        }
        self.waiting_for_save.store(false, Ordering::SeqCst);
        self.post_force_destroy_if_need();
    }

    async fn run_file_job(&self, job: FileJob) {
        match job {
            FileJob::Save(server, html) => self.do_save(&server, &html),
            FileJob::SaveOnServerClose(server) => {
                if !self.is_destroyed_or_waiting() {
                    let html = server.response_data(false).await;
                    if let Some(html) = html.filter(|h| !h.is_empty()) {
                        let started = Instant::now();
                        self.do_save(&server, &html);
                        debug!(
                            "session {} save on close cost {}ms",
                            self.log_id,
                            started.elapsed().as_millis()
                        );
                    }
                }
                self.waiting_for_save.store(false, Ordering::SeqCst);
                self.post_force_destroy_if_need();
            }
            FileJob::SaveDataUpdate {
                server,
                html,
                data,
                html_digest,
            } => {
                if self.is_destroyed() {
                    return;
                }
                for l in self.listeners.snapshot() {
                    l.on_save_cache(&html, None, &data);
                }
                self.persist(&server, &html, None, &data, &html_digest);
            }
        }
    }

    fn do_save(&self, server: &SessionServer, html: &str) {
        if self.is_destroyed_or_waiting() {
            warn!("session {} save skipped, session is going away", self.log_id);
            return;
        }
        let split = server.split().filter(|s| !s.template.is_empty());
        let Some(split) = split.filter(|_| !html.is_empty()) else {
            error!("session {} save failed: cannot split html", self.log_id);
            self.notify_error(SessionError::SplitHtml.code());
            return;
        };
        let html_digest = server
            .header(HEADER_HTML_DIGEST)
            .unwrap_or_else(|| digest::content_digest(html.as_bytes()));
        let data = split.data.to_string();
        for l in self.listeners.snapshot() {
            l.on_save_cache(html, Some(&split.template), &data);
        }
        self.persist(server, html, Some(&split.template), &data, &html_digest);
    }

    fn persist(
        &self,
        server: &SessionServer,
        html: &str,
        template: Option<&str>,
        data: &str,
        html_digest: &str,
    ) {
        let headers = server.headers();
        let size = match self
            .ctx
            .layout
            .save_session_files(&self.id, html, template, data, &headers)
        {
            Ok(size) => size,
            Err(e) => {
                error!("session {} save files failed: {}", self.log_id, e);
                let code = e
                    .downcast_ref::<SessionError>()
                    .map(SessionError::code)
                    .unwrap_or_else(|| SessionError::WriteFile(e.to_string()).code());
                self.notify_error(code);
                return;
            }
        };

        let now = now_millis();
        let template_update_time = if template.is_some() {
            now
        } else {
            self.stored_record().template_update_time
        };
        let record = SessionRecord {
            session_id: self.id.clone(),
            etag: server.etag().unwrap_or_default(),
            template_tag: server.header(HEADER_TEMPLATE_TAG).unwrap_or_default(),
            html_digest: html_digest.to_string(),
            html_size: size,
            template_update_time,
            cache_expired_time: state::cache_expired_time(
                &headers,
                now,
                self.ctx.config.resource_max_age_ms,
            ),
            unavailable_until: 0,
            hit_count: 0,
        };
        match metadata::save_session(self.ctx.store.as_ref(), &record) {
            Ok(()) => info!(
                "session {} saved cache: etag={}, size={}",
                self.log_id, record.etag, size
            ),
            Err(e) => error!("session {} save metadata failed: {}", self.log_id, e),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("log_id", &self.log_id)
            .field("id", &self.id)
            .field("url", &self.url)
            .field("state", &self.state())
            .field("mode", &self.config.mode)
            .finish()
    }
}

/// Serialized cache writes of one session. Ends when the session is dropped.
fn spawn_file_worker(
    ctx: &EngineContext,
    session: Weak<Session>,
    mut jobs: mpsc::UnboundedReceiver<(Duration, FileJob)>,
) {
    ctx.handle.spawn(async move {
        while let Some((delay, job)) = jobs.recv().await {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let Some(session) = session.upgrade() else {
                break;
            };
            session.run_file_job(job).await;
        }
    });
}
