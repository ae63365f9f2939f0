// Host fakes shared by the integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tempfile::TempDir;
use tokio::runtime::Handle;

use page_session_engine::cache::digest::content_digest;
use page_session_engine::cache::files::CacheLayout;
use page_session_engine::cache::metadata::{MemoryMetadataStore, MetadataStore, SessionRecord};
use page_session_engine::cache::now_millis;
use page_session_engine::engine::{Session, SessionListener, SessionState, StateListener};
use page_session_engine::host::{
    DiffDataCallback, HostTask, HtmlAssembler, SessionClient, SessionRuntime, SplitHtml,
};
use page_session_engine::source::traits::{
    ConnectionFactory, ConnectionRequest, ResponseHeaders, SessionConnection,
};
use page_session_engine::{Engine, EngineConfig};

const DATA_MARK: &str = "<!--data:";

/// A page as the fake assembler lays it out: the template, then the data in a trailing comment.
pub fn page(template: &str, data: &Value) -> String {
    format!("{}{}{}-->", template, DATA_MARK, data)
}

// ---- runtime ----

pub struct FakeRuntime {
    main: Mutex<mpsc::Sender<HostTask>>,
    network_valid: AtomicBool,
    cookies: Mutex<HashMap<String, String>>,
    pub stored_cookies: Mutex<Vec<String>>,
    pub errors: Mutex<Vec<i32>>,
    pub toasts: Mutex<Vec<String>>,
}

impl FakeRuntime {
    /// Starts a thread named `main` that runs posted tasks in order.
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::channel::<HostTask>();
        thread::Builder::new()
            .name("main".to_string())
            .spawn(move || {
                for task in rx {
                    task();
                }
            })
            .expect("spawn main thread");
        Arc::new(Self {
            main: Mutex::new(tx),
            network_valid: AtomicBool::new(true),
            cookies: Mutex::new(HashMap::new()),
            stored_cookies: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
            toasts: Mutex::new(Vec::new()),
        })
    }

    pub fn set_network_valid(&self, valid: bool) {
        self.network_valid.store(valid, Ordering::SeqCst);
    }

    pub fn put_cookie(&self, url: &str, cookie: &str) {
        self.cookies.lock().insert(url.to_string(), cookie.to_string());
    }

    pub fn errors(&self) -> Vec<i32> {
        self.errors.lock().clone()
    }
}

impl SessionRuntime for FakeRuntime {
    fn is_network_valid(&self) -> bool {
        self.network_valid.load(Ordering::SeqCst)
    }

    fn cookie(&self, url: &str) -> Option<String> {
        self.cookies.lock().get(url).cloned()
    }

    fn set_cookie(&self, _url: &str, cookies: &[String]) -> bool {
        self.stored_cookies.lock().extend_from_slice(cookies);
        true
    }

    fn user_agent(&self) -> String {
        "FakeRenderer/1.0".to_string()
    }

    fn host_direct_address(&self, _url: &str) -> Option<String> {
        None
    }

    fn show_toast(&self, message: &str) {
        self.toasts.lock().push(message.to_string());
    }

    fn notify_error(&self, _client: Option<&Arc<dyn SessionClient>>, _url: &str, code: i32) {
        self.errors.lock().push(code);
    }

    fn make_session_id(&self, url: &str, _account_related: bool) -> String {
        url.to_string()
    }

    fn post_to_main(&self, task: HostTask, delay: Duration) {
        let tx = self.main.lock().clone();
        if delay.is_zero() {
            let _ = tx.send(task);
            return;
        }
        thread::spawn(move || {
            thread::sleep(delay);
            let _ = tx.send(task);
        });
    }

    fn post_to_background(&self, task: HostTask, delay: Duration) {
        thread::spawn(move || {
            if !delay.is_zero() {
                thread::sleep(delay);
            }
            task();
        });
    }
}

// ---- renderer ----

#[derive(Debug, Clone, PartialEq)]
pub enum ClientCall {
    LoadUrl(String),
    LoadData {
        html: String,
        charset: String,
        headers: HashMap<String, String>,
    },
}

#[derive(Default)]
pub struct FakeClient {
    calls: Mutex<Vec<ClientCall>>,
}

impl FakeClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<ClientCall> {
        self.calls.lock().clone()
    }

    pub fn loaded_urls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, ClientCall::LoadUrl(_)))
            .count()
    }

    pub fn loaded_html(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                ClientCall::LoadData { html, .. } => Some(html),
                ClientCall::LoadUrl(_) => None,
            })
            .collect()
    }
}

impl SessionClient for FakeClient {
    fn load_url(&self, url: &str, _extras: Option<HashMap<String, String>>) {
        self.calls.lock().push(ClientCall::LoadUrl(url.to_string()));
    }

    fn load_data_with_headers(
        &self,
        _base_url: &str,
        html: &str,
        _mime: &str,
        charset: &str,
        _history_url: &str,
        headers: &HashMap<String, String>,
    ) {
        self.calls.lock().push(ClientCall::LoadData {
            html: html.to_string(),
            charset: charset.to_string(),
            headers: headers.clone(),
        });
    }
}

#[derive(Default)]
pub struct RecordingCallback {
    payloads: Mutex<Vec<String>>,
}

impl RecordingCallback {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn payloads(&self) -> Vec<Value> {
        self.payloads
            .lock()
            .iter()
            .filter_map(|p| serde_json::from_str(p).ok())
            .collect()
    }
}

impl DiffDataCallback for RecordingCallback {
    fn call_back(&self, result: &str) {
        self.payloads.lock().push(result.to_string());
    }
}

// ---- assembly ----

pub struct FakeAssembler;

impl HtmlAssembler for FakeAssembler {
    fn split(&self, _session_id: &str, html: &str) -> Option<SplitHtml> {
        let (template, rest) = html.rsplit_once(DATA_MARK)?;
        let data = serde_json::from_str(rest.strip_suffix("-->")?).ok()?;
        Some(SplitHtml {
            template: template.to_string(),
            data,
        })
    }

    fn compute_diff(
        &self,
        _session_id: &str,
        local_data: Option<&Value>,
        server_data: &Value,
    ) -> Option<Value> {
        let server = server_data.as_object()?;
        let Some(local) = local_data.and_then(Value::as_object) else {
            return Some(server_data.clone());
        };
        let diff: Map<String, Value> = server
            .iter()
            .filter(|(k, v)| local.get(*k) != Some(*v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Some(Value::Object(diff))
    }

    fn build_html(
        &self,
        _session_id: &str,
        template: &str,
        local_data: Option<&Value>,
        server_data: &Value,
        html_digest: &str,
        _approx_size: usize,
    ) -> Option<String> {
        let mut merged = local_data
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        for (k, v) in server_data.as_object()? {
            merged.insert(k.clone(), v.clone());
        }
        let html = page(template, &Value::Object(merged));
        if !html_digest.is_empty() && content_digest(html.as_bytes()) != html_digest {
            return None;
        }
        Some(html)
    }
}

// ---- transport ----

#[derive(Debug, Clone)]
pub struct ScriptedResponse {
    pub code: i32,
    pub headers: Vec<(String, String)>,
    pub chunks: Vec<Bytes>,
    pub connect_delay: Duration,
    pub fail_connect: bool,
}

impl ScriptedResponse {
    pub fn ok(body: impl Into<String>) -> Self {
        let body = body.into();
        let mid = body.len() / 2;
        let mid = (mid..=body.len())
            .find(|i| body.is_char_boundary(*i))
            .unwrap_or(body.len());
        Self {
            code: 200,
            headers: vec![(
                "content-type".to_string(),
                "text/html; charset=utf-8".to_string(),
            )],
            chunks: vec![
                Bytes::from(body[..mid].to_string()),
                Bytes::from(body[mid..].to_string()),
            ],
            connect_delay: Duration::ZERO,
            fail_connect: false,
        }
    }

    pub fn status(code: i32) -> Self {
        Self {
            code,
            headers: Vec::new(),
            chunks: Vec::new(),
            connect_delay: Duration::ZERO,
            fail_connect: false,
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub fn failing() -> Self {
        Self {
            fail_connect: true,
            ..Self::status(-1)
        }
    }
}

struct ScriptedConnection {
    response: ScriptedResponse,
    chunks: VecDeque<Bytes>,
}

#[async_trait]
impl SessionConnection for ScriptedConnection {
    async fn connect(&mut self) -> Result<()> {
        if !self.response.connect_delay.is_zero() {
            tokio::time::sleep(self.response.connect_delay).await;
        }
        if self.response.fail_connect {
            return Err(anyhow!("connection refused"));
        }
        Ok(())
    }

    fn response_code(&self) -> i32 {
        self.response.code
    }

    fn response_headers(&self) -> ResponseHeaders {
        let mut headers = ResponseHeaders::new();
        for (name, value) in &self.response.headers {
            headers.append(name, value.clone());
        }
        headers
    }

    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        Ok(self.chunks.pop_front())
    }

    fn content_length(&self) -> Option<u64> {
        Some(self.response.chunks.iter().map(|c| c.len() as u64).sum())
    }

    fn disconnect(&mut self) {
        self.chunks.clear();
    }
}

/// Answers requests from a queue; the last response repeats once the queue is down to it.
pub struct ScriptedFactory {
    responses: Mutex<VecDeque<ScriptedResponse>>,
    requests: Mutex<Vec<ConnectionRequest>>,
    created: AtomicUsize,
}

impl ScriptedFactory {
    pub fn new(responses: Vec<ScriptedResponse>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
            created: AtomicUsize::new(0),
        })
    }

    pub fn requests(&self) -> Vec<ConnectionRequest> {
        self.requests.lock().clone()
    }

    pub fn request_header(&self, index: usize, name: &str) -> Option<String> {
        self.requests
            .lock()
            .get(index)
            .and_then(|r| r.headers.get(name).cloned())
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl ConnectionFactory for ScriptedFactory {
    fn create(&self, request: ConnectionRequest) -> Box<dyn SessionConnection> {
        self.created.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request);
        let response = {
            let mut responses = self.responses.lock();
            if responses.len() > 1 {
                responses.pop_front()
            } else {
                responses.front().cloned()
            }
        }
        .unwrap_or_else(|| ScriptedResponse::status(404));
        Box::new(ScriptedConnection {
            chunks: response.chunks.iter().cloned().collect(),
            response,
        })
    }
}

// ---- listeners ----

#[derive(Default)]
pub struct RecordingListener {
    pub events: Mutex<Vec<String>>,
    pub saves: AtomicUsize,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    fn push(&self, event: &str) {
        self.events.lock().push(event.to_string());
    }
}

impl SessionListener for RecordingListener {
    fn on_start(&self) {
        self.push("start");
    }

    fn on_first_load(&self, _html: Option<&str>) {
        self.push("first_load");
    }

    fn on_data_updated(&self, _server_rsp: &str) {
        self.push("data_updated");
    }

    fn on_template_changed(&self, _html: &str) {
        self.push("template_changed");
    }

    fn on_http_error(&self, code: i32) {
        self.push(&format!("http_error:{}", code));
    }

    fn on_hit_cache(&self) {
        self.push("hit_cache");
    }

    fn on_unavailable(&self) {
        self.push("unavailable");
    }

    fn on_save_cache(&self, _html: &str, _template: Option<&str>, _data: &str) {
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.push("save_cache");
    }

    fn on_destroy(&self) {
        self.push("destroy");
    }
}

#[derive(Default)]
pub struct TransitionRecorder {
    transitions: Mutex<Vec<(SessionState, SessionState)>>,
}

impl TransitionRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn transitions(&self) -> Vec<(SessionState, SessionState)> {
        self.transitions.lock().clone()
    }
}

impl StateListener for TransitionRecorder {
    fn on_state_changed(&self, _session: &Arc<Session>, old: SessionState, new: SessionState) {
        self.transitions.lock().push((old, new));
    }
}

// ---- engine ----

pub struct Harness {
    pub engine: Engine,
    pub runtime: Arc<FakeRuntime>,
    pub store: Arc<MemoryMetadataStore>,
    pub layout: CacheLayout,
    pub factory: Arc<ScriptedFactory>,
    _dir: TempDir,
}

/// Short timeouts so deferred work settles within a test.
pub fn test_config(dir: &TempDir) -> EngineConfig {
    EngineConfig {
        cache_dir: dir.path().join("html").to_string_lossy().into_owned(),
        resource_cache_dir: dir.path().join("res").to_string_lossy().into_owned(),
        save_cache_delay_ms: 10,
        force_destroy_delay_ms: 200,
        bad_network_toast_delay_ms: 10,
        resource_wait_timeout_ms: 3000,
        sub_resource_wait_timeout_ms: 1000,
        ..EngineConfig::default()
    }
}

pub fn harness(responses: Vec<ScriptedResponse>) -> Harness {
    harness_with(responses, |_| {})
}

pub fn harness_with(responses: Vec<ScriptedResponse>, tweak: impl FnOnce(&mut EngineConfig)) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(&dir);
    tweak(&mut config);
    let layout = CacheLayout::new(&config.cache_dir, &config.resource_cache_dir);
    let runtime = FakeRuntime::new();
    let store = Arc::new(MemoryMetadataStore::new());
    let factory = ScriptedFactory::new(responses);
    let engine = Engine::with_connection_factory(
        config,
        runtime.clone(),
        store.clone(),
        Arc::new(FakeAssembler),
        factory.clone(),
        Handle::current(),
    )
    .expect("engine");
    Harness {
        engine,
        runtime,
        store,
        layout,
        factory,
        _dir: dir,
    }
}

impl Harness {
    /// Write a valid cached page for `session_id` and return its html.
    pub fn seed_cache(&self, session_id: &str, template: &str, data: &Value, etag: &str) -> String {
        let html = page(template, data);
        let mut headers = ResponseHeaders::new();
        headers.append("content-type", "text/html; charset=utf-8");
        headers.append("etag", etag);
        self.layout
            .save_session_files(session_id, &html, Some(template), &data.to_string(), &headers)
            .expect("seed files");
        self.store
            .put_session(&SessionRecord {
                session_id: session_id.to_string(),
                etag: etag.to_string(),
                template_tag: content_digest(template.as_bytes()),
                html_digest: content_digest(html.as_bytes()),
                html_size: html.len() as u64,
                template_update_time: now_millis(),
                cache_expired_time: 0,
                unavailable_until: 0,
                hit_count: 0,
            })
            .expect("seed record");
        html
    }

    pub fn record(&self, session_id: &str) -> Option<SessionRecord> {
        self.store.session(session_id).expect("read record")
    }
}

/// Poll `cond` until it holds or five seconds pass.
pub async fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// Request the main resource from a blocking thread, the way a renderer does, and read it.
pub async fn intercept(session: &Arc<Session>) -> Option<(String, String)> {
    let session = Arc::clone(session);
    tokio::task::spawn_blocking(move || {
        use std::io::Read;
        let url = session.url().to_string();
        let mut response = session.on_client_request_resource(&url)?;
        let mut body = String::new();
        response.stream.read_to_string(&mut body).ok()?;
        Some((response.charset, body))
    })
    .await
    .expect("intercept thread")
}
