// Delivery by answering the renderer's request for the main resource with a stream: the
// cached page right away, or the live response (possibly still downloading).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info};

use super::session::{FlowStrategy, Session};
use super::state::{CacheOffline, ResultCode, SessionState};
use crate::config::DEFAULT_CHARSET;
use crate::error::SessionError;
use crate::host::{mime_type_for, ResourceResponse};
use crate::source::stream::SessionStream;

pub(crate) struct StandardFlow {
    /// The pending stream holds the cached page rather than the live response.
    is_cache_pending: AtomicBool,
    /// Result notifications carry this sequence; only the latest one is delivered.
    result_seq: Arc<AtomicU64>,
}

impl StandardFlow {
    pub(crate) fn new() -> Self {
        Self {
            is_cache_pending: AtomicBool::new(false),
            result_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Queue a result notification on the main thread, superseding any still queued.
    fn post_result(
        &self,
        session: &Arc<Session>,
        src: ResultCode,
        final_code: ResultCode,
        diff: Option<String>,
        refresh: bool,
    ) {
        let seq = self.result_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let current = Arc::clone(&self.result_seq);
        session.post_main(Duration::ZERO, move |s| {
            if s.is_destroyed_or_waiting() || current.load(Ordering::SeqCst) != seq {
                return;
            }
            if final_code == ResultCode::DataUpdate {
                s.set_pending_diff(diff);
            }
            if final_code == ResultCode::TemplateChange && refresh {
                info!("session {} template changed, reload url", s.log_id());
                if let Some(client) = s.client() {
                    client.load_url(s.url(), None);
                }
            }
            s.set_result(src, final_code, true);
        });
    }
}

#[async_trait]
impl FlowStrategy for StandardFlow {
    fn on_load_local_cache(&self, session: &Arc<Session>, html: Option<String>) {
        let Some(html) = html.filter(|h| !h.is_empty()) else {
            info!("session {} has no cache, first load", session.log_id());
            return;
        };
        session.set_pending_stream(SessionStream::from_bytes(html));
        self.is_cache_pending.store(true, Ordering::SeqCst);
        session.switch_state(SessionState::Running, SessionState::Ready, true);
    }

    async fn on_first_load(&self, session: &Arc<Session>) {
        let brk = session.intercept_token();
        let Some(stream) = session.response_stream(&brk).await else {
            error!("session {} first load: no response stream", session.log_id());
            return;
        };
        session.set_pending_stream(stream);

        let html = session.response_data(false).await;
        let final_code = if html.is_some() {
            ResultCode::HitCache
        } else {
            ResultCode::FirstLoad
        };
        self.is_cache_pending.store(false, Ordering::SeqCst);
        self.post_result(session, ResultCode::FirstLoad, final_code, None, false);
        for l in session.listeners() {
            l.on_first_load(html.as_deref());
        }

        if let Some(html) = html.filter(|_| session.need_save()) {
            session.switch_state(SessionState::Running, SessionState::Ready, true);
            session.post_save(html);
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
        if offline.needs_refresh() {
            self.post_result(
                session,
                ResultCode::DataUpdate,
                ResultCode::DataUpdate,
                diff.as_ref().map(|d| d.to_string()),
                false,
            );
        }
        for l in session.listeners() {
            l.on_data_updated(&rsp);
        }

        if html.is_none() {
            html = session.build_html(&data, &html_digest, rsp.len());
        }
        match &html {
            Some(page) if !session.is_intercepted() && offline.needs_refresh() => {
                debug!("session {} data update: serve rebuilt page", session.log_id());
                session.set_pending_stream(SessionStream::from_bytes(page.clone()));
                self.is_cache_pending.store(false, Ordering::SeqCst);
                self.post_result(session, ResultCode::DataUpdate, ResultCode::HitCache, None, false);
            }
            Some(_) => {}
            None => {
                error!("session {} data update: build html failed", session.log_id());
                session.notify_error(SessionError::BuildHtml.code());
            }
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
        if let Some(page) = &html {
            if !session.is_intercepted() {
                session.set_pending_stream(SessionStream::from_bytes(page.clone()));
            }
        } else {
            let Some(stream) = session.response_stream(session.page_finished_token()).await else {
                error!("session {} template change: no response stream", session.log_id());
                return;
            };
            session.set_pending_stream(stream);
            html = session.response_data(false).await;
        }

        let offline = session.server_cache_offline();
        let mut final_code = ResultCode::TemplateChange;
        let mut refresh = false;
        if !session.is_intercepted() {
            if html.is_none() {
                debug!("session {} template change: page still streaming", session.log_id());
                return;
            }
            final_code = ResultCode::HitCache;
        } else if offline.needs_refresh() {
            refresh = true;
        } else {
            final_code = ResultCode::HitCache;
        }
        self.is_cache_pending.store(false, Ordering::SeqCst);
        self.post_result(session, ResultCode::TemplateChange, final_code, None, refresh);
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

    /// Withdraw the cached page. A renderer that already took it reloads the url.
    fn on_service_unavailable(&self, session: &Arc<Session>) {
        self.result_seq.fetch_add(1, Ordering::SeqCst);
        let was_cache = self.is_cache_pending.swap(false, Ordering::SeqCst);
        if let Some(stream) = session.take_pending_stream() {
            info!("session {} service unavailable, drop cached stream", session.log_id());
            stream.discard();
            return;
        }
        if was_cache && session.is_intercepted() {
            session.post_main(Duration::ZERO, |s| {
                if s.is_destroyed_or_waiting() {
                    return;
                }
                info!("session {} service unavailable, load url", s.log_id());
                if let Some(client) = s.client() {
                    client.load_url(s.url(), None);
                }
            });
        }
    }

    fn on_client_ready(&self, session: &Arc<Session>) -> bool {
        if !session.mark_client_ready() {
            return false;
        }
        if session.state() == SessionState::None {
            session.start();
        }
        session.post_main(Duration::ZERO, |s| {
            if s.is_destroyed_or_waiting() {
                return;
            }
            info!("session {} client ready, load url", s.log_id());
            if let Some(client) = s.client() {
                client.load_url(s.url(), None);
            }
        });
        true
    }

    fn on_request_resource(&self, session: &Arc<Session>, url: &str) -> Option<ResourceResponse> {
        session.mark_intercepted();
        session.wait_for_main_resource();

        let stream = session.take_pending_stream()?;
        if session.is_destroyed_or_waiting() {
            error!("session {} request resource: session is going away", session.log_id());
            stream.discard();
            return None;
        }
        let (charset, headers) = if self.is_cache_pending.load(Ordering::SeqCst) {
            (DEFAULT_CHARSET.to_string(), session.cache_headers())
        } else {
            (session.server_charset(), session.server_headers())
        };
        Some(ResourceResponse {
            mime: mime_type_for(url).to_string(),
            charset,
            headers,
            stream,
        })
    }

    fn clear_session_data(&self) {
        self.is_cache_pending.store(false, Ordering::SeqCst);
    }
}
