// Bounded-concurrency pre-fetch of sub-resources named by a page's link hints.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::task::{DownloadCallback, DownloadState, DownloadTask};
use crate::cache::resource::ResourceCache;
use crate::config::HEADER_COOKIE;
use crate::error::{SessionError, CODE_UNKNOWN};
use crate::host::{charset_of, mime_type_for, ResourceResponse, SessionRuntime};
use crate::source::stream::{self, SessionStream};
use crate::source::traits::{ConnectionFactory, ConnectionRequest, ResponseHeaders};

/// Persists a pre-fetched resource once its body is complete.
struct CacheOnSuccess {
    url: String,
    cache: Arc<ResourceCache>,
}

impl DownloadCallback for CacheOnSuccess {
    fn on_start(&self) {
        debug!("start downloading sub resource {}", self.url);
    }

    fn on_success(&self, content: &Bytes, headers: &ResponseHeaders) {
        if let Err(e) = self.cache.save(&self.url, content, headers) {
            warn!("cache sub resource {} failed: {}", self.url, e);
        }
    }

    fn on_error(&self, code: i32) {
        info!("download sub resource {} failed, code={}", self.url, code);
    }
}

/// Timeouts and limits of one fetcher.
#[derive(Debug, Clone)]
pub struct FetcherOptions {
    pub max_downloading_tasks: usize,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// Bound on an interceptor's wait for a stream that has not been published yet.
    pub intercept_wait_timeout: Duration,
}

type InFlight = Mutex<HashMap<String, Arc<DownloadTask>>>;

#[derive(Default)]
struct Slots {
    pending: VecDeque<Arc<DownloadTask>>,
    running: usize,
    shut_down: bool,
}

/// Starts downloads in request order, at most `max_downloading_tasks` at a time.
struct Dispatcher {
    factory: Arc<dyn ConnectionFactory>,
    handle: Handle,
    options: FetcherOptions,
    /// Downloads queued or running, by url.
    in_flight: InFlight,
    slots: Mutex<Slots>,
}

/// A running download's claim on a slot; dropping it starts the next queued download.
struct Slot(Arc<Dispatcher>);

impl Drop for Slot {
    fn drop(&mut self) {
        self.0.release();
    }
}

impl Dispatcher {
    fn enqueue(self: &Arc<Self>, task: Arc<DownloadTask>) {
        let mut slots = self.slots.lock();
        if slots.shut_down {
            drop(slots);
            debug!("sub resource {} refused after shutdown", task.url());
            finish(&task, &self.in_flight);
            return;
        }
        if slots.running < self.options.max_downloading_tasks.max(1) {
            slots.running += 1;
            drop(slots);
            self.start(task);
        } else {
            task.set_state(DownloadState::Queued);
            info!("sub resource {} queued behind {} waiting", task.url(), slots.pending.len());
            slots.pending.push_back(task);
        }
    }

    fn start(self: &Arc<Self>, task: Arc<DownloadTask>) {
        task.set_state(DownloadState::Downloading);
        let slot = Slot(Arc::clone(self));
        self.handle.spawn(run_download(task, slot));
    }

    /// Hand a freed slot to the oldest queued download.
    fn release(self: &Arc<Self>) {
        let next = {
            let mut slots = self.slots.lock();
            let next = if slots.shut_down {
                None
            } else {
                slots.pending.pop_front()
            };
            if next.is_none() {
                slots.running = slots.running.saturating_sub(1);
            }
            next
        };
        if let Some(task) = next {
            self.start(task);
        }
    }

    fn shutdown(&self) {
        let dropped: Vec<_> = {
            let mut slots = self.slots.lock();
            slots.shut_down = true;
            slots.pending.drain(..).collect()
        };
        for task in dropped {
            debug!("sub resource {} dropped from queue", task.url());
            finish(&task, &self.in_flight);
        }
    }
}

pub struct SubResourceFetcher {
    cache: Arc<ResourceCache>,
    runtime: Arc<dyn SessionRuntime>,
    options: FetcherOptions,
    dispatcher: Arc<Dispatcher>,
    /// Tasks created from link hints; only these answer sub-resource requests.
    resource_tasks: Mutex<HashMap<String, Arc<DownloadTask>>>,
}

impl SubResourceFetcher {
    pub fn new(
        cache: Arc<ResourceCache>,
        factory: Arc<dyn ConnectionFactory>,
        runtime: Arc<dyn SessionRuntime>,
        handle: Handle,
        options: FetcherOptions,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher {
            factory,
            handle,
            options: options.clone(),
            in_flight: Mutex::new(HashMap::new()),
            slots: Mutex::new(Slots::default()),
        });
        Self {
            cache,
            runtime,
            options,
            dispatcher,
            resource_tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Start (or join) the download of `url`. A second request for a url already queued or
    /// running attaches `callback` to the existing task. A verified cache hit returns a task
    /// that is already complete.
    pub fn download(
        &self,
        url: &str,
        direct_address: Option<String>,
        cookie: Option<String>,
        callback: Arc<dyn DownloadCallback>,
    ) -> Option<Arc<DownloadTask>> {
        if url.is_empty() {
            return None;
        }

        let mut in_flight = self.dispatcher.in_flight.lock();
        if let Some(existing) = in_flight.get(url) {
            debug!("sub resource {} already downloading", url);
            existing.add_callback(callback);
            return Some(Arc::clone(existing));
        }

        let task = Arc::new(DownloadTask::new(url, direct_address, cookie));
        task.add_callback(callback);

        if let Some(content) = self.cache.get(url) {
            task.set_headers(self.cache.headers(url));
            task.publish_stream(SessionStream::from_bytes(content));
            task.set_state(DownloadState::LoadedFromCache);
            info!("sub resource {} loaded from cache", url);
            return Some(task);
        }

        in_flight.insert(url.to_string(), Arc::clone(&task));
        drop(in_flight);
        self.dispatcher.enqueue(Arc::clone(&task));
        Some(task)
    }

    /// Pre-fetch every link not already requested, with the host's address hint and cookie.
    pub fn add_preload_tasks(&self, links: &[String]) {
        for link in links.iter().map(|l| l.trim()).filter(|l| !l.is_empty()) {
            if self.resource_tasks.lock().contains_key(link) {
                continue;
            }
            let callback = Arc::new(CacheOnSuccess {
                url: link.to_string(),
                cache: Arc::clone(&self.cache),
            });
            let direct_address = self.runtime.host_direct_address(link);
            let cookie = self.runtime.cookie(link);
            if let Some(task) = self.download(link, direct_address, cookie, callback) {
                self.resource_tasks
                    .lock()
                    .entry(link.to_string())
                    .or_insert(task);
            }
        }
    }

    /// Answer a renderer request for a pre-fetched sub-resource. Blocks the calling thread
    /// while a started download has not published its stream yet. `is_gone` is checked after
    /// the wait; a stream obtained for a requester that went away meanwhile is discarded.
    pub fn on_request_sub_resource<F>(&self, url: &str, is_gone: F) -> Option<ResourceResponse>
    where
        F: Fn() -> bool,
    {
        let task = self.resource_tasks.lock().get(url).cloned()?;
        task.request_intercept();
        match task.state() {
            DownloadState::Initiated | DownloadState::Queued => {
                debug!("sub resource {} not started, renderer loads it itself", url);
                return None;
            }
            _ => {}
        }

        let stream = task.take_stream(self.options.intercept_wait_timeout)?;
        if is_gone() {
            info!("sub resource {} ready after its session went away", url);
            stream.discard();
            return None;
        }
        let headers = task.headers().filtered();
        Some(ResourceResponse {
            mime: mime_type_for(url).to_string(),
            charset: charset_of(&headers),
            headers,
            stream,
        })
    }

    pub fn task(&self, url: &str) -> Option<Arc<DownloadTask>> {
        self.resource_tasks.lock().get(url).cloned()
    }

    /// Drop downloads that are still waiting for a slot. Running downloads finish.
    pub fn shutdown(&self) {
        self.dispatcher.shutdown();
    }
}

async fn run_download(task: Arc<DownloadTask>, slot: Slot) {
    let dispatcher = Arc::clone(&slot.0);
    let in_flight = &dispatcher.in_flight;
    let options = &dispatcher.options;
    for callback in task.callbacks() {
        callback.on_start();
    }

    let mut request = ConnectionRequest::new(task.url());
    request.connect_timeout = options.connect_timeout;
    request.read_timeout = options.read_timeout;
    request.direct_address = task.direct_address().map(str::to_string);
    if let Some(cookie) = task.cookie().filter(|c| !c.is_empty()) {
        request = request.header(HEADER_COOKIE, cookie);
    }
    let mut conn = dispatcher.factory.create(request);

    if let Err(e) = conn.connect().await {
        warn!("sub resource {} connect failed: {}", task.url(), e);
        fail(&task, in_flight, SessionError::from_transport(&e).code());
        return;
    }
    let code = conn.response_code();
    if code != 200 {
        conn.disconnect();
        fail(&task, in_flight, code);
        return;
    }

    let headers = conn.response_headers();
    task.set_headers(headers.clone());
    let total = conn.content_length();
    let callbacks = task.callbacks();
    let closed = CancellationToken::new();
    let mut body = BytesMut::new();

    let read = stream::read_until(
        conn.as_mut(),
        &mut body,
        Some(task.intercept_token()),
        &closed,
        |done| {
            if let Some(total) = total.filter(|t| *t > 0) {
                for callback in &callbacks {
                    callback.on_progress(done as u64, total);
                }
            }
        },
    )
    .await;

    match read {
        Ok(true) => {
            conn.disconnect();
            let content = body.freeze();
            info!("sub resource {} downloaded into memory", task.url());
            task.publish_stream(SessionStream::from_bytes(content.clone()));
            succeed(&task, in_flight, &content, &headers);
        }
        Ok(false) => {
            info!("sub resource {} bridged to interceptor", task.url());
            let done_task = Arc::clone(&task);
            let bridged = stream::bridge(body.freeze(), conn, closed, move |full| {
                match full {
                    Some(content) => succeed(&done_task, &slot.0.in_flight, &content, &headers),
                    None => fail(&done_task, &slot.0.in_flight, CODE_UNKNOWN),
                }
                drop(slot);
            });
            task.publish_stream(bridged);
        }
        Err(e) => {
            warn!("sub resource {} read failed: {}", task.url(), e);
            conn.disconnect();
            fail(&task, in_flight, CODE_UNKNOWN);
        }
    }
}

fn succeed(
    task: &Arc<DownloadTask>,
    in_flight: &InFlight,
    content: &Bytes,
    headers: &ResponseHeaders,
) {
    for callback in task.callbacks() {
        callback.on_success(content, headers);
    }
    finish(task, in_flight);
}

fn fail(task: &Arc<DownloadTask>, in_flight: &InFlight, code: i32) {
    for callback in task.callbacks() {
        callback.on_error(code);
    }
    finish(task, in_flight);
}

fn finish(task: &Arc<DownloadTask>, in_flight: &InFlight) {
    in_flight.lock().remove(task.url());
    task.set_state(DownloadState::Downloaded);
    for callback in task.callbacks() {
        callback.on_finish();
    }
}
