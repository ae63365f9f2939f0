// Delivery by injecting complete html into the renderer. Outcomes become messages on the
// renderer's main thread; until the renderer is ready only the latest one is kept.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::session::{FlowStrategy, Session};
use super::state::{CacheOffline, ResultCode, SessionState};
use crate::config::DEFAULT_CHARSET;
use crate::error::SessionError;
use crate::host::{mime_type_for, ResourceResponse};

#[derive(Debug, Clone)]
enum QuickMessage {
    /// Show the cached page, or let the renderer load the url when there is none.
    PreLoad { html: Option<String>, generation: u64 },
    FirstLoad { html: Option<String> },
    DataUpdate { html: Option<String>, diff: Option<String> },
    TemplateChange { html: Option<String>, refresh: bool },
    ConnectionError,
    ServiceUnavailable,
}

#[derive(Default)]
struct QuickState {
    pending: Mutex<Option<QuickMessage>>,
    /// Bumped to drop preload messages not yet handled.
    preload_generation: AtomicU64,
    load_url_invoked: AtomicBool,
    load_data_invoked: AtomicBool,
}

pub(crate) struct QuickFlow {
    state: Arc<QuickState>,
}

impl QuickFlow {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(QuickState::default()),
        }
    }

    fn post(&self, session: &Arc<Session>, msg: QuickMessage) {
        let state = Arc::clone(&self.state);
        session.post_main(Duration::ZERO, move |s| state.handle(s, msg));
    }

    fn cancel_preload(&self) {
        self.state.preload_generation.fetch_add(1, Ordering::SeqCst);
    }
}

impl QuickState {
    fn handle(&self, session: &Arc<Session>, msg: QuickMessage) {
        if session.is_destroyed_or_waiting() {
            debug!("session {} drop message, session is going away", session.log_id());
            return;
        }
        if let QuickMessage::PreLoad { generation, .. } = &msg {
            if *generation != self.preload_generation.load(Ordering::SeqCst) {
                debug!("session {} drop superseded preload", session.log_id());
                return;
            }
        }
        if !session.is_client_ready() {
            info!("session {} client not ready, keep {:?} pending", session.log_id(), kind(&msg));
            *self.pending.lock() = Some(msg);
            return;
        }

        match msg {
            QuickMessage::PreLoad { html: None, .. } => self.load_url(session, "preload without cache"),
            QuickMessage::PreLoad { html: Some(html), .. } => {
                if self
                    .load_data_invoked
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    error!("session {} preload: data already loaded", session.log_id());
                    return;
                }
                info!("session {} preload: load cached data", session.log_id());
                if let Some(client) = session.client() {
                    client.load_data_with_headers(
                        session.url(),
                        &html,
                        "text/html",
                        DEFAULT_CHARSET,
                        session.url(),
                        &session.cache_headers(),
                    );
                }
            }
            QuickMessage::FirstLoad { html: None } => {
                if session.is_intercepted() {
                    session.set_result(ResultCode::FirstLoad, ResultCode::FirstLoad, true);
                } else {
                    error!("session {} first load: url was not intercepted", session.log_id());
                }
            }
            QuickMessage::FirstLoad { html: Some(html) } => {
                if self.latch(&self.load_url_invoked) {
                    info!("session {} first load: deliver complete html", session.log_id());
                    self.load_server_data(session, &html);
                    session.set_result(ResultCode::FirstLoad, ResultCode::HitCache, false);
                } else {
                    session.set_result(ResultCode::FirstLoad, ResultCode::FirstLoad, true);
                }
            }
            QuickMessage::DataUpdate { html, diff } => self.handle_data_update(session, html, diff),
            QuickMessage::TemplateChange { html, refresh } => {
                self.handle_template_change(session, html, refresh)
            }
            QuickMessage::ConnectionError => self.load_url(session, "connection error"),
            QuickMessage::ServiceUnavailable => self.load_url(session, "service unavailable"),
        }
    }

    fn handle_data_update(&self, session: &Arc<Session>, html: Option<String>, diff: Option<String>) {
        if self.load_data_invoked.load(Ordering::SeqCst) {
            let has_diff = diff.as_deref().map_or(false, |d| !d.is_empty());
            session.set_pending_diff(diff);
            if has_diff {
                info!("session {} data update: notify page", session.log_id());
                session.set_result(ResultCode::DataUpdate, ResultCode::DataUpdate, true);
            } else {
                info!("session {} data update: nothing to refresh", session.log_id());
                session.set_result(ResultCode::DataUpdate, ResultCode::HitCache, true);
            }
            return;
        }

        if let Some(html) = html.filter(|h| !h.is_empty()) {
            info!("session {} data update: deliver rebuilt html", session.log_id());
            session.set_pending_diff(None);
            self.load_server_data(session, &html);
            session.set_result(ResultCode::DataUpdate, ResultCode::HitCache, false);
            return;
        }

        error!("session {} data update without html, load url", session.log_id());
        if let Some(client) = session.client() {
            client.load_url(session.url(), None);
        }
        session.set_result(ResultCode::DataUpdate, ResultCode::FirstLoad, false);
    }

    fn handle_template_change(&self, session: &Arc<Session>, html: Option<String>, refresh: bool) {
        let html = html.filter(|h| !h.is_empty());
        if self.load_data_invoked.load(Ordering::SeqCst) {
            if refresh {
                match html {
                    Some(html) => self.load_server_data(session, &html),
                    None => {
                        if let Some(client) = session.client() {
                            client.load_url(session.url(), None);
                        }
                    }
                }
                session.set_result(ResultCode::TemplateChange, ResultCode::TemplateChange, false);
            } else {
                info!("session {} template change: keep current page", session.log_id());
                session.set_result(ResultCode::TemplateChange, ResultCode::HitCache, true);
            }
        } else if let Some(html) = html {
            info!("session {} template change: deliver new html", session.log_id());
            self.load_server_data(session, &html);
            session.set_result(ResultCode::TemplateChange, ResultCode::HitCache, false);
        } else {
            error!("session {} template change without html, load url", session.log_id());
            if let Some(client) = session.client() {
                client.load_url(session.url(), None);
            }
            session.set_result(ResultCode::TemplateChange, ResultCode::FirstLoad, false);
        }
        session.cancel_web_ready();
    }

    fn load_url(&self, session: &Arc<Session>, reason: &str) {
        if !self.latch(&self.load_url_invoked) {
            debug!("session {} {}: url already loaded", session.log_id(), reason);
            return;
        }
        info!("session {} {}: load url", session.log_id(), reason);
        if let Some(client) = session.client() {
            client.load_url(session.url(), None);
        }
    }

    fn load_server_data(&self, session: &Arc<Session>, html: &str) {
        if let Some(client) = session.client() {
            client.load_data_with_headers(
                session.url(),
                html,
                "text/html",
                &session.server_charset(),
                session.url(),
                &session.server_headers(),
            );
        }
    }

    fn latch(&self, flag: &AtomicBool) -> bool {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

fn kind(msg: &QuickMessage) -> &'static str {
    match msg {
        QuickMessage::PreLoad { .. } => "preload",
        QuickMessage::FirstLoad { .. } => "first-load",
        QuickMessage::DataUpdate { .. } => "data-update",
        QuickMessage::TemplateChange { .. } => "template-change",
        QuickMessage::ConnectionError => "connection-error",
        QuickMessage::ServiceUnavailable => "service-unavailable",
    }
}

#[async_trait]
impl FlowStrategy for QuickFlow {
    fn on_load_local_cache(&self, session: &Arc<Session>, html: Option<String>) {
        let html = html.filter(|h| !h.is_empty());
        if html.is_none() {
            info!("session {} has no cache, first load", session.log_id());
        }
        let generation = self.state.preload_generation.load(Ordering::SeqCst);
        self.post(session, QuickMessage::PreLoad { html, generation });
    }

    async fn on_first_load(&self, session: &Arc<Session>) {
        let brk = session.intercept_token();
        let Some(stream) = session.response_stream(&brk).await else {
            error!("session {} first load: no response stream", session.log_id());
            return;
        };
        session.set_pending_stream(stream);

        let html = session.response_data(false).await;
        info!(
            "session {} first load: complete html={}",
            session.log_id(),
            html.is_some()
        );
        self.cancel_preload();
        self.post(session, QuickMessage::FirstLoad { html: html.clone() });
        for l in session.listeners() {
            l.on_first_load(html.as_deref());
        }

        if !session.need_save() {
            info!("session {} first load: response not cacheable", session.log_id());
            return;
        }
        if let Some(html) = html {
            if !self.state.load_url_invoked.load(Ordering::SeqCst) && !session.is_intercepted() {
                session.switch_state(SessionState::Running, SessionState::Ready, true);
                session.post_save(html);
            }
        }
    }

    async fn on_data_update(&self, session: &Arc<Session>, server_rsp: Option<String>) {
        let (rsp, mut html) = match server_rsp.filter(|r| !r.is_empty()) {
            Some(rsp) => (Some(rsp), session.response_data(false).await),
            None => (session.response_data(true).await, None),
        };
        let Some(rsp) = rsp else {
            error!("session {} data update: empty response", session.log_id());
            return;
        };
        let Some((data, html_digest)) = session.parse_server_data(&rsp) else {
            return;
        };
        let offline = session.server_cache_offline();

        let diff = session.compute_diff(&data);
        if diff.is_none() {
            error!("session {} data update: diff failed", session.log_id());
            session.notify_error(SessionError::MergeDiff.code());
        }

        let mut sent = false;
        if self.state.load_data_invoked.load(Ordering::SeqCst) {
            let diff = diff
                .as_ref()
                .filter(|_| offline != CacheOffline::Store)
                .map(|d| d.to_string());
            self.post(session, QuickMessage::DataUpdate { html: None, diff });
            sent = true;
        }

        if html.is_none() {
            html = session.build_html(&data, &html_digest, rsp.len());
        }
        if html.is_none() {
            error!("session {} data update: build html failed", session.log_id());
            session.notify_error(SessionError::BuildHtml.code());
        }
        if !sent {
            self.cancel_preload();
            self.post(
                session,
                QuickMessage::DataUpdate {
                    html: html.clone(),
                    diff: None,
                },
            );
        }
        for l in session.listeners() {
            l.on_data_updated(&rsp);
        }

        if !session.keeps_data_update(diff.is_some(), html.is_some()) {
            info!("session {} data update: drop cache", session.log_id());
            session.remove_cache();
            return;
        }
        if let Some(html) = html.filter(|_| session.need_save()) {
            session.switch_state(SessionState::Running, SessionState::Ready, true);
            session.post_save_data_update(html, data.to_string(), html_digest);
        }
    }

    async fn on_template_change(&self, session: &Arc<Session>, html: Option<String>) {
        let mut html = html.filter(|h| !h.is_empty());
        if html.is_none() {
            let Some(stream) = session.response_stream(session.page_finished_token()).await else {
                error!("session {} template change: no response stream", session.log_id());
                return;
            };
            session.set_pending_stream(stream);
            html = session.response_data(session.was_reload()).await;
        }

        let offline = session.server_cache_offline();
        if session.was_reload() {
            session.post_notify_result(ResultCode::TemplateChange, ResultCode::TemplateChange);
        } else {
            self.cancel_preload();
            self.post(
                session,
                QuickMessage::TemplateChange {
                    html: html.clone(),
                    refresh: offline != CacheOffline::Store,
                },
            );
        }
        for l in session.listeners() {
            l.on_template_changed(html.as_deref().unwrap_or_default());
        }

        if session.need_save() {
            session.switch_state(SessionState::Running, SessionState::Ready, true);
            if let Some(html) = html {
                session.post_save(html);
            }
        } else if offline == CacheOffline::False {
            info!("session {} template change: offline false, drop cache", session.log_id());
            session.remove_cache();
        }
    }

    fn on_http_error(&self, session: &Arc<Session>, code: i32) {
        if session.config().reload_in_bad_network {
            info!("session {} http error {}, fall back to url", session.log_id(), code);
            self.cancel_preload();
            self.post(session, QuickMessage::ConnectionError);
        }
    }

    fn on_service_unavailable(&self, session: &Arc<Session>) {
        self.cancel_preload();
        self.post(session, QuickMessage::ServiceUnavailable);
    }

    fn on_client_ready(&self, session: &Arc<Session>) -> bool {
        if !session.mark_client_ready() {
            return false;
        }
        let pending = self.state.pending.lock().take();
        info!(
            "session {} client ready, pending message: {}",
            session.log_id(),
            pending.as_ref().map_or("none", kind)
        );
        match pending {
            Some(msg) => self.state.handle(session, msg),
            None if session.state() == SessionState::None => session.start(),
            None => {}
        }
        true
    }

    fn on_request_resource(&self, session: &Arc<Session>, url: &str) -> Option<ResourceResponse> {
        if !session.try_mark_intercepted() {
            warn!("session {} main resource already intercepted", session.log_id());
            return None;
        }
        session.wait_for_main_resource();

        let stream = session.take_pending_stream()?;
        if session.is_destroyed_or_waiting() {
            error!("session {} request resource: session is going away", session.log_id());
            stream.discard();
            return None;
        }
        Some(ResourceResponse {
            mime: mime_type_for(url).to_string(),
            charset: session.server_charset(),
            headers: session.server_headers(),
            stream,
        })
    }

    fn clear_session_data(&self) {
        self.state.pending.lock().take();
    }
}
