// One sub-resource download and the requesters waiting on it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use tokio_util::sync::CancellationToken;

use crate::source::stream::SessionStream;
use crate::source::traits::ResponseHeaders;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    Initiated,
    Queued,
    Downloading,
    Downloaded,
    LoadedFromCache,
}

/// Progress hooks of one requester. Every hook has a no-op default.
pub trait DownloadCallback: Send + Sync {
    fn on_start(&self) {}

    fn on_progress(&self, _done: u64, _total: u64) {}

    fn on_success(&self, _content: &Bytes, _headers: &ResponseHeaders) {}

    fn on_error(&self, _code: i32) {}

    fn on_finish(&self) {}
}

pub struct DownloadTask {
    url: String,
    direct_address: Option<String>,
    cookie: Option<String>,
    state: Mutex<DownloadState>,
    headers: Mutex<ResponseHeaders>,
    stream: Mutex<Option<SessionStream>>,
    stream_ready: Condvar,
    intercept_requested: CancellationToken,
    callbacks: Mutex<Vec<Arc<dyn DownloadCallback>>>,
}

impl DownloadTask {
    pub fn new(url: impl Into<String>, direct_address: Option<String>, cookie: Option<String>) -> Self {
        Self {
            url: url.into(),
            direct_address,
            cookie,
            state: Mutex::new(DownloadState::Initiated),
            headers: Mutex::new(ResponseHeaders::new()),
            stream: Mutex::new(None),
            stream_ready: Condvar::new(),
            intercept_requested: CancellationToken::new(),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn direct_address(&self) -> Option<&str> {
        self.direct_address.as_deref()
    }

    pub fn cookie(&self) -> Option<&str> {
        self.cookie.as_deref()
    }

    pub fn state(&self) -> DownloadState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: DownloadState) {
        *self.state.lock() = state;
    }

    pub fn headers(&self) -> ResponseHeaders {
        self.headers.lock().clone()
    }

    pub(crate) fn set_headers(&self, headers: ResponseHeaders) {
        *self.headers.lock() = headers;
    }

    pub fn add_callback(&self, callback: Arc<dyn DownloadCallback>) {
        self.callbacks.lock().push(callback);
    }

    /// Snapshot, so hooks never run under the list lock.
    pub(crate) fn callbacks(&self) -> Vec<Arc<dyn DownloadCallback>> {
        self.callbacks.lock().clone()
    }

    /// Ask the download to stop buffering and hand over a stream as soon as possible.
    pub fn request_intercept(&self) {
        self.intercept_requested.cancel();
    }

    pub fn is_intercept_requested(&self) -> bool {
        self.intercept_requested.is_cancelled()
    }

    pub(crate) fn intercept_token(&self) -> &CancellationToken {
        &self.intercept_requested
    }

    /// Publish the readable body and wake a waiting interceptor.
    pub(crate) fn publish_stream(&self, stream: SessionStream) {
        let mut slot = self.stream.lock();
        *slot = Some(stream);
        self.stream_ready.notify_all();
    }

    pub fn has_stream(&self) -> bool {
        self.stream.lock().is_some()
    }

    /// Take the body, blocking the calling thread up to `timeout` for it to be published.
    /// Call from a renderer thread, never from async code.
    pub fn take_stream(&self, timeout: Duration) -> Option<SessionStream> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.stream.lock();
        while slot.is_none() {
            if self.stream_ready.wait_until(&mut slot, deadline).timed_out() {
                break;
            }
        }
        slot.take()
    }
}

impl std::fmt::Debug for DownloadTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadTask")
            .field("url", &self.url)
            .field("state", &self.state())
            .field("intercept_requested", &self.is_intercept_requested())
            .finish()
    }
}
