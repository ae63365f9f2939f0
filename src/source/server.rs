// Conditional request for a session's main resource plus everything read back from it.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::stream::{self, SessionStream};
use super::traits::{ConnectionFactory, ConnectionRequest, ResponseHeaders, SessionConnection};
use crate::cache::digest;
use crate::config::{
    HEADER_CACHE_OFFLINE, HEADER_ETAG, HEADER_ETAG_KEY, HEADER_HTML_DIGEST, HEADER_IF_NONE_MATCH,
    HEADER_TEMPLATE_CHANGE, HEADER_TEMPLATE_TAG,
};
use crate::error::{SessionError, CODE_SUCCESS};
use crate::host::{HtmlAssembler, SplitHtml};

#[derive(Default)]
struct ServerState {
    code: i32,
    headers: ResponseHeaders,
    /// Body bytes read before the response was complete or bridged.
    partial: BytesMut,
    /// The whole body, once read to the end.
    html: Option<String>,
    split: Option<SplitHtml>,
    updated_data: Option<String>,
}

pub struct SessionServer {
    log_id: u64,
    session_id: String,
    request_etag: String,
    request_template_tag: String,
    local_split: bool,
    assembler: Arc<dyn HtmlAssembler>,
    conn: tokio::sync::Mutex<Option<Box<dyn SessionConnection>>>,
    state: Mutex<ServerState>,
    closed: CancellationToken,
}

impl SessionServer {
    pub fn new(
        log_id: u64,
        session_id: &str,
        request: ConnectionRequest,
        factory: &dyn ConnectionFactory,
        local_split: bool,
        assembler: Arc<dyn HtmlAssembler>,
    ) -> Self {
        let request_etag = request
            .headers
            .get(HEADER_IF_NONE_MATCH)
            .cloned()
            .unwrap_or_default();
        let request_template_tag = request
            .headers
            .get(HEADER_TEMPLATE_TAG)
            .cloned()
            .unwrap_or_default();
        Self {
            log_id,
            session_id: session_id.to_string(),
            request_etag,
            request_template_tag,
            local_split,
            assembler,
            conn: tokio::sync::Mutex::new(Some(factory.create(request))),
            state: Mutex::new(ServerState {
                code: -1,
                ..ServerState::default()
            }),
            closed: CancellationToken::new(),
        }
    }

    /// Open the connection. Returns [`CODE_SUCCESS`] or a negative connection error code.
    pub async fn connect(&self) -> i32 {
        let mut guard = self.conn.lock().await;
        let Some(conn) = guard.as_mut() else {
            return SessionError::NullConnection.code();
        };

        let result = tokio::select! {
            _ = self.closed.cancelled() => Err(anyhow::anyhow!("connection closed before connect")),
            r = conn.connect() => r,
        };
        if let Err(e) = result {
            warn!("session {} connect failed: {}", self.log_id, e);
            return SessionError::from_transport(&e).code();
        }

        let (code, needs_split) = {
            let mut state = self.state.lock();
            state.code = conn.response_code();
            state.headers = conn.response_headers();
            let etag_key = etag_key_of(&state.headers);
            let needs_split = state.code == 200
                && (!state.headers.contains(&etag_key)
                    || !state.headers.contains(HEADER_TEMPLATE_TAG));
            (state.code, needs_split)
        };

        if self.local_split && needs_split {
            let mut body = BytesMut::new();
            match stream::read_until(conn.as_mut(), &mut body, None, &self.closed, |_| {}).await {
                Ok(_) => {
                    conn.disconnect();
                    *guard = None;
                    self.complete(body.freeze());
                    self.separate_template_and_data();
                }
                Err(e) => {
                    warn!("session {} read for local split failed: {}", self.log_id, e);
                    return SessionError::from_transport(&e).code();
                }
            }
        }

        debug!("session {} server connected, code={}", self.log_id, code);
        CODE_SUCCESS
    }

    /// Derive validators for a page the server sent without them: etag from the whole page,
    /// template tag from the template. A page matching the request etag turns into a 304.
    pub fn separate_template_and_data(&self) {
        let mut state = self.state.lock();
        let Some(html) = state.html.clone() else {
            return;
        };

        let etag = digest::content_digest(html.as_bytes());
        let etag_key = etag_key_of(&state.headers);
        state.headers.set(&etag_key, etag.clone());
        state.headers.set(HEADER_HTML_DIGEST, etag.clone());
        if !state.headers.contains(HEADER_CACHE_OFFLINE) {
            state.headers.set(HEADER_CACHE_OFFLINE, "true");
        }

        if !self.request_etag.is_empty() && etag == self.request_etag {
            info!("session {} local split: page unchanged, answering 304", self.log_id);
            state.code = 304;
            return;
        }

        if state.split.is_none() {
            state.split = self.assembler.split(&self.session_id, &html);
        }
        let Some(split) = state.split.clone() else {
            warn!("session {} local split failed", self.log_id);
            return;
        };

        let template_tag = digest::content_digest(split.template.as_bytes());
        let template_changed = template_tag != self.request_template_tag;
        state.headers.set(HEADER_TEMPLATE_TAG, template_tag);
        state.headers.set(
            HEADER_TEMPLATE_CHANGE,
            if template_changed { "true" } else { "false" },
        );
        if !template_changed {
            let mut payload = Map::new();
            payload.insert("data".to_string(), split.data);
            payload.insert(HEADER_HTML_DIGEST.to_string(), Value::String(etag));
            state.updated_data = Some(Value::Object(payload).to_string());
        }
    }

    pub fn response_code(&self) -> i32 {
        self.state.lock().code
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.state.lock().headers.get(name).map(str::to_string)
    }

    pub fn headers(&self) -> ResponseHeaders {
        self.state.lock().headers.clone()
    }

    /// Header the entity tag is read from; servers may rename it via `page-etag-key`.
    pub fn etag_key(&self) -> String {
        etag_key_of(&self.state.lock().headers)
    }

    pub fn etag(&self) -> Option<String> {
        let state = self.state.lock();
        state
            .headers
            .get(&etag_key_of(&state.headers))
            .map(str::to_string)
    }

    pub fn is_read_complete(&self) -> bool {
        self.state.lock().html.is_some()
    }

    /// Read the body until it ends or `brk` fires. A complete body becomes an in-memory
    /// stream whose drop reports `on_close(true)`; otherwise the rest of the body is bridged
    /// and `on_close` fires once the network side finishes.
    pub async fn response_stream<F>(
        self: &Arc<Self>,
        brk: &CancellationToken,
        on_close: F,
    ) -> Option<SessionStream>
    where
        F: FnOnce(bool) + Send + 'static,
    {
        if let Some(html) = self.state.lock().html.clone() {
            return Some(SessionStream::from_bytes(html).with_close_hook(move || on_close(true)));
        }

        let mut guard = self.conn.lock().await;
        let mut conn = guard.take()?;
        let mut body = std::mem::take(&mut self.state.lock().partial);

        match stream::read_until(conn.as_mut(), &mut body, Some(brk), &self.closed, |_| {}).await {
            Ok(true) => {
                conn.disconnect();
                let full = body.freeze();
                self.complete(full.clone());
                Some(SessionStream::from_bytes(full).with_close_hook(move || on_close(true)))
            }
            Ok(false) => {
                debug!(
                    "session {} bridging response after {} bytes",
                    self.log_id,
                    body.len()
                );
                let server = Arc::clone(self);
                Some(stream::bridge(
                    body.freeze(),
                    conn,
                    self.closed.clone(),
                    move |full| {
                        let complete = full.is_some();
                        if let Some(full) = full {
                            server.complete(full);
                        }
                        on_close(complete);
                    },
                ))
            }
            Err(e) => {
                warn!("session {} read response failed: {}", self.log_id, e);
                conn.disconnect();
                None
            }
        }
    }

    /// The whole page, reading what is left of the body first when `read_to_end` is set.
    pub async fn response_data(&self, read_to_end: bool) -> Option<String> {
        if let Some(html) = self.state.lock().html.clone() {
            return Some(html);
        }
        if !read_to_end {
            return None;
        }

        let mut guard = self.conn.lock().await;
        let mut conn = guard.take()?;
        let mut body = std::mem::take(&mut self.state.lock().partial);
        match stream::read_until(conn.as_mut(), &mut body, None, &self.closed, |_| {}).await {
            Ok(_) => {
                conn.disconnect();
                let full = body.freeze();
                self.complete(full);
                self.state.lock().html.clone()
            }
            Err(e) => {
                warn!("session {} read response data failed: {}", self.log_id, e);
                conn.disconnect();
                None
            }
        }
    }

    /// Template/data split of the complete page, computed on first use.
    pub fn split(&self) -> Option<SplitHtml> {
        let mut state = self.state.lock();
        if state.split.is_none() {
            let html = state.html.clone()?;
            state.split = self.assembler.split(&self.session_id, &html);
        }
        state.split.clone()
    }

    /// Data-update payload synthesized by local split, if any.
    pub fn updated_data(&self) -> Option<String> {
        self.state.lock().updated_data.clone()
    }

    /// Abort any read in progress and release the connection.
    pub fn disconnect(&self) {
        self.closed.cancel();
        if let Ok(mut guard) = self.conn.try_lock() {
            if let Some(mut conn) = guard.take() {
                conn.disconnect();
            }
        }
    }

    fn complete(&self, full: Bytes) {
        let mut state = self.state.lock();
        state.partial.clear();
        state.html = Some(String::from_utf8_lossy(&full).into_owned());
    }
}

fn etag_key_of(headers: &ResponseHeaders) -> String {
    headers
        .get(HEADER_ETAG_KEY)
        .map(str::to_ascii_lowercase)
        .unwrap_or_else(|| HEADER_ETAG.to_string())
}
