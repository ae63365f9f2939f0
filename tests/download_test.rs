// Sub-resource pre-fetching: task sharing, the resource cache and renderer interception.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::runtime::Handle;

use common::*;
use page_session_engine::cache::files::CacheLayout;
use page_session_engine::cache::metadata::MemoryMetadataStore;
use page_session_engine::cache::resource::ResourceCache;
use page_session_engine::download::{DownloadCallback, DownloadState, FetcherOptions, SubResourceFetcher};
use page_session_engine::source::traits::ResponseHeaders;

#[derive(Default)]
struct Counter {
    successes: AtomicUsize,
    errors: AtomicUsize,
    finishes: AtomicUsize,
}

impl DownloadCallback for Counter {
    fn on_success(&self, _content: &Bytes, _headers: &ResponseHeaders) {
        self.successes.fetch_add(1, Ordering::SeqCst);
    }

    fn on_error(&self, _code: i32) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }

    fn on_finish(&self) {
        self.finishes.fetch_add(1, Ordering::SeqCst);
    }
}

struct Fixture {
    fetcher: SubResourceFetcher,
    cache: Arc<ResourceCache>,
    factory: Arc<ScriptedFactory>,
    _dir: tempfile::TempDir,
}

fn fixture(responses: Vec<ScriptedResponse>, max_downloading_tasks: usize) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let layout = Arc::new(CacheLayout::new(dir.path().join("html"), dir.path().join("res")));
    layout.ensure_dirs().unwrap();
    let cache = Arc::new(ResourceCache::new(
        layout,
        Arc::new(MemoryMetadataStore::new()),
        true,
        60_000,
    ));
    let factory = ScriptedFactory::new(responses);
    let fetcher = SubResourceFetcher::new(
        cache.clone(),
        factory.clone(),
        FakeRuntime::new(),
        Handle::current(),
        FetcherOptions {
            max_downloading_tasks,
            connect_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(1),
            intercept_wait_timeout: Duration::from_secs(1),
        },
    );
    Fixture {
        fetcher,
        cache,
        factory,
        _dir: dir,
    }
}

fn script(body: &str) -> ScriptedResponse {
    ScriptedResponse::ok(body)
        .header("content-type", "application/javascript; charset=utf-8")
        .delay(Duration::from_millis(100))
}

#[tokio::test(flavor = "multi_thread")]
async fn test_same_url_shares_one_download() {
    let f = fixture(vec![script("console.log(1)")], 3);
    let url = "https://cdn.com/app.js";
    let first = Arc::new(Counter::default());
    let second = Arc::new(Counter::default());

    let a = f.fetcher.download(url, None, None, first.clone()).unwrap();
    let b = f.fetcher.download(url, None, None, second.clone()).unwrap();
    assert!(Arc::ptr_eq(&a, &b));

    assert!(wait_for(|| second.finishes.load(Ordering::SeqCst) == 1).await);
    assert_eq!(first.successes.load(Ordering::SeqCst), 1);
    assert_eq!(second.successes.load(Ordering::SeqCst), 1);
    assert_eq!(f.factory.created(), 1);
    assert_eq!(a.state(), DownloadState::Downloaded);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_download_reports_error() {
    let f = fixture(vec![ScriptedResponse::status(404)], 3);
    let counter = Arc::new(Counter::default());
    f.fetcher
        .download("https://cdn.com/missing.js", None, None, counter.clone())
        .unwrap();

    assert!(wait_for(|| counter.finishes.load(Ordering::SeqCst) == 1).await);
    assert_eq!(counter.errors.load(Ordering::SeqCst), 1);
    assert_eq!(counter.successes.load(Ordering::SeqCst), 0);
    assert!(f.cache.get("https://cdn.com/missing.js").is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_drops_queued_downloads() {
    let f = fixture(vec![script("slow").delay(Duration::from_millis(300))], 1);
    let running = Arc::new(Counter::default());
    let queued = Arc::new(Counter::default());

    let first = f
        .fetcher
        .download("https://cdn.com/a.js", None, None, running.clone())
        .unwrap();
    assert!(wait_for(|| first.state() == DownloadState::Downloading).await);
    let waiting = f
        .fetcher
        .download("https://cdn.com/b.js", None, None, queued.clone())
        .unwrap();
    assert!(wait_for(|| waiting.state() == DownloadState::Queued).await);

    f.fetcher.shutdown();
    assert!(wait_for(|| queued.finishes.load(Ordering::SeqCst) == 1).await);
    assert_eq!(queued.successes.load(Ordering::SeqCst), 0);

    assert!(wait_for(|| running.finishes.load(Ordering::SeqCst) == 1).await);
    assert_eq!(running.successes.load(Ordering::SeqCst), 1);
    assert_eq!(f.factory.created(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_link_hints_answer_sub_resource_requests() {
    let f = Arc::new(fixture(vec![script("body{}")], 3));
    let url = "https://cdn.com/site.css";
    f.fetcher.add_preload_tasks(&[url.to_string(), " ".to_string()]);
    f.fetcher.add_preload_tasks(&[url.to_string()]);

    let task = f.fetcher.task(url).unwrap();
    assert!(wait_for(|| task.has_stream()).await);
    assert_eq!(f.factory.created(), 1);

    let fixture = f.clone();
    let answer = tokio::task::spawn_blocking(move || {
        use std::io::Read;
        let mut response = fixture.fetcher.on_request_sub_resource(url, || false)?;
        let mut body = String::new();
        response.stream.read_to_string(&mut body).ok()?;
        Some((response.mime, response.charset, body))
    })
    .await
    .unwrap();

    let (mime, charset, body) = answer.unwrap();
    assert_eq!(mime, "text/css");
    assert_eq!(charset, "utf-8");
    assert_eq!(body, "body{}");
    assert!(f
        .fetcher
        .on_request_sub_resource("https://cdn.com/unknown.css", || false)
        .is_none());

    // Hinted downloads land in the resource cache; the next request never hits the network.
    assert!(wait_for(|| f.cache.get(url).is_some()).await);
    assert_eq!(f.cache.get(url).unwrap(), Bytes::from("body{}"));
    let again = f
        .fetcher
        .download(url, None, None, Arc::new(Counter::default()))
        .unwrap();
    assert_eq!(again.state(), DownloadState::LoadedFromCache);
    assert_eq!(f.factory.created(), 1);
}

struct StartOrder {
    url: &'static str,
    order: Arc<parking_lot::Mutex<Vec<&'static str>>>,
}

impl DownloadCallback for StartOrder {
    fn on_start(&self) {
        self.order.lock().push(self.url);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_queued_downloads_start_in_request_order() {
    let f = fixture(vec![script("x").delay(Duration::from_millis(30))], 1);
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let urls = [
        "https://cdn.com/0.js",
        "https://cdn.com/1.js",
        "https://cdn.com/2.js",
        "https://cdn.com/3.js",
        "https://cdn.com/4.js",
    ];

    let tasks: Vec<_> = urls
        .iter()
        .map(|&url| {
            let callback = Arc::new(StartOrder {
                url,
                order: order.clone(),
            });
            f.fetcher.download(url, None, None, callback).unwrap()
        })
        .collect();
    for task in &tasks[1..] {
        assert_eq!(task.state(), DownloadState::Queued);
    }

    assert!(wait_for(|| tasks.iter().all(|t| t.state() == DownloadState::Downloaded)).await);
    assert_eq!(*order.lock(), urls.to_vec());
    assert_eq!(f.factory.created(), urls.len());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stream_is_withheld_from_departed_requester() {
    let f = Arc::new(fixture(vec![script("body{}")], 3));
    let url = "https://cdn.com/late.css";
    f.fetcher.add_preload_tasks(&[url.to_string()]);
    let task = f.fetcher.task(url).unwrap();
    assert!(wait_for(|| task.has_stream()).await);

    let fixture = f.clone();
    let answer = tokio::task::spawn_blocking(move || {
        fixture.fetcher.on_request_sub_resource(url, || true).is_some()
    })
    .await
    .unwrap();
    assert!(!answer);
    assert!(!task.has_stream());
}
