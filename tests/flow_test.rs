// End-to-end session flows against a scripted server.

mod common;

use std::time::{Duration, Instant};

use serde_json::{json, Value};

use common::*;
use page_session_engine::cache::digest::content_digest;
use page_session_engine::cache::now_millis;
use page_session_engine::{ResultCode, SessionConfig, SessionMode, SessionState};

const URL: &str = "https://example.com/page";
const TEMPLATE: &str = "<html><body>{{a}} {{b}}</body></html>";

fn quick() -> SessionConfig {
    SessionConfig::builder().auto_start(false).build()
}

fn standard() -> SessionConfig {
    SessionConfig::builder()
        .auto_start(false)
        .mode(SessionMode::Standard)
        .build()
}

/// A data-only update answering a cached page.
fn data_update(etag: &str, server_data: &Value, merged: &Value) -> ScriptedResponse {
    let body = json!({
        "data": server_data,
        "html-digest": content_digest(page(TEMPLATE, merged).as_bytes()),
    });
    ScriptedResponse::ok(body.to_string())
        .header("etag", etag)
        .header("cache-offline", "true")
        .header("template-change", "false")
        .header("template-tag", &content_digest(TEMPLATE.as_bytes()))
}

#[tokio::test(flavor = "multi_thread")]
async fn test_quick_first_load_serves_and_persists() {
    let html = page(TEMPLATE, &json!({"a": 1, "b": "x"}));
    let h = harness(vec![ScriptedResponse::ok(html.clone())
        .header("etag", "e1")
        .header("cache-offline", "true")
        .header("template-tag", "t1")
        .delay(Duration::from_millis(50))]);
    let session = h.engine.create(URL, quick()).unwrap();
    let client = FakeClient::new();
    assert!(session.bind_client(client.clone()));
    assert!(!session.bind_client(FakeClient::new()));

    assert!(session.on_client_ready());
    assert!(wait_for(|| client.loaded_urls() == 1).await);

    let (charset, body) = intercept(&session).await.unwrap();
    assert_eq!(charset, "utf-8");
    assert_eq!(body, html);

    assert!(wait_for(|| h.record(URL).map_or(false, |r| r.etag == "e1")).await);
    let record = h.record(URL).unwrap();
    assert_eq!(record.html_digest, content_digest(html.as_bytes()));
    assert_eq!(h.layout.read_template(URL).as_deref(), Some(TEMPLATE));
    assert_eq!(h.layout.read_data(URL), Some(json!({"a": 1, "b": "x"})));
    assert!(wait_for(|| session.result_codes() == (ResultCode::FirstLoad, ResultCode::FirstLoad)).await);
    assert_eq!(client.loaded_urls(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_quick_not_modified_keeps_cached_page() {
    let h = harness(vec![ScriptedResponse::status(304).header("etag", "e1")]);
    let cached = h.seed_cache(URL, TEMPLATE, &json!({"a": 1}), "e1");

    let session = h.engine.create(URL, quick()).unwrap();
    let client = FakeClient::new();
    let listener = RecordingListener::new();
    session.add_listener(listener.clone());
    session.bind_client(client.clone());
    session.on_client_ready();

    assert!(wait_for(|| session.result_codes() == (ResultCode::HitCache, ResultCode::HitCache)).await);
    assert_eq!(client.loaded_html(), vec![cached]);
    assert_eq!(h.factory.request_header(0, "if-none-match").as_deref(), Some("e1"));
    assert_eq!(
        h.factory.request_header(0, "template-tag"),
        Some(content_digest(TEMPLATE.as_bytes()))
    );
    assert!(h
        .factory
        .request_header(0, "user-agent")
        .unwrap()
        .starts_with("FakeRenderer/1.0 PageSession/"));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(listener.saves(), 0);
    assert!(listener.events().contains(&"hit_cache".to_string()));
    assert_eq!(h.record(URL).unwrap().hit_count, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_quick_data_update_delivers_diff_on_web_ready() {
    let local = json!({"a": 1, "b": "x"});
    let server = json!({"a": 2, "b": "x"});
    let merged = json!({"a": 2, "b": "x"});
    let h = harness(vec![
        data_update("e2", &server, &merged).delay(Duration::from_millis(50))
    ]);
    h.seed_cache(URL, TEMPLATE, &local, "e1");

    let session = h.engine.create(URL, quick()).unwrap();
    let client = FakeClient::new();
    session.bind_client(client.clone());
    session.on_client_ready();

    assert!(wait_for(|| session.result_codes() == (ResultCode::DataUpdate, ResultCode::DataUpdate)).await);
    let callback = RecordingCallback::new();
    assert!(session.on_web_ready(callback.clone()));
    assert!(wait_for(|| !callback.payloads().is_empty()).await);

    let payload = &callback.payloads()[0];
    assert_eq!(payload["code"], 200);
    assert_eq!(payload["srcCode"], 200);
    let result: Value = serde_json::from_str(payload["result"].as_str().unwrap()).unwrap();
    assert_eq!(result, json!({"a": 2}));
    assert_eq!(payload["extra"]["etag"], "e2");
    assert_eq!(payload["extra"]["isReload"], false);

    assert!(wait_for(|| h.record(URL).map_or(false, |r| r.etag == "e2")).await);
    assert_eq!(h.layout.read_html(URL), Some(page(TEMPLATE, &merged)));
    assert_eq!(h.layout.read_data(URL), Some(server));
    assert_eq!(h.layout.read_template(URL).as_deref(), Some(TEMPLATE));
    assert_eq!(client.loaded_html().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_standard_serves_cache_then_persists_merged_page() {
    let local = json!({"a": 1, "b": "x"});
    let server = json!({"a": 5});
    let merged = json!({"a": 5, "b": "x"});
    let h = harness(vec![
        data_update("e2", &server, &merged).delay(Duration::from_millis(150))
    ]);
    let cached = h.seed_cache(URL, TEMPLATE, &local, "e1");

    let session = h.engine.create(URL, standard()).unwrap();
    let client = FakeClient::new();
    session.bind_client(client.clone());
    assert!(session.on_client_ready());
    assert!(!session.on_client_ready());

    let (charset, body) = intercept(&session).await.unwrap();
    assert_eq!(charset, "utf-8");
    assert_eq!(body, cached);
    assert!(wait_for(|| client.loaded_urls() == 1).await);

    let callback = RecordingCallback::new();
    session.on_web_ready(callback.clone());
    assert!(wait_for(|| !callback.payloads().is_empty()).await);
    let payload = &callback.payloads()[0];
    assert_eq!(payload["code"], 200);
    let result: Value = serde_json::from_str(payload["result"].as_str().unwrap()).unwrap();
    assert_eq!(result, json!({"a": 5}));

    assert!(wait_for(|| h.record(URL).map_or(false, |r| r.etag == "e2")).await);
    assert_eq!(h.layout.read_html(URL), Some(page(TEMPLATE, &merged)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_standard_withdraws_cache_when_service_unavailable() {
    let h = harness(vec![ScriptedResponse::ok("<p>busy</p>")
        .header("cache-offline", "http")
        .delay(Duration::from_millis(50))]);
    h.seed_cache(URL, TEMPLATE, &json!({"a": 1, "b": "x"}), "e1");

    let session = h.engine.create(URL, standard()).unwrap();
    let listener = RecordingListener::new();
    session.add_listener(listener.clone());
    session.start();

    assert!(wait_for(|| listener.events().contains(&"unavailable".to_string())).await);
    assert!(h.record(URL).map_or(false, |r| r.unavailable_until > now_millis()));
    assert!(intercept(&session).await.is_none());
    assert_eq!(listener.saves(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_state_transitions_only_move_forward() {
    let h = harness(vec![ScriptedResponse::status(304)]);
    h.seed_cache(URL, TEMPLATE, &json!({"a": 1}), "e1");

    let session = h.engine.create(URL, quick()).unwrap();
    let recorder = TransitionRecorder::new();
    session.add_state_listener(recorder.clone());
    assert_eq!(session.state(), SessionState::None);

    session.start();
    session.start();
    assert!(wait_for(|| session.state() == SessionState::Ready).await);
    assert!(session.refresh());
    assert!(wait_for(|| session.state() == SessionState::Ready).await);
    session.destroy();
    assert!(wait_for(|| session.is_destroyed()).await);
    session.destroy();
    assert!(!session.refresh());

    let transitions = recorder.transitions();
    assert!(transitions.iter().all(|(old, new)| old.can_move_to(*new)));
    assert_eq!(
        transitions,
        vec![
            (SessionState::None, SessionState::Running),
            (SessionState::Running, SessionState::Ready),
            (SessionState::Ready, SessionState::Running),
            (SessionState::Running, SessionState::Ready),
            (SessionState::Ready, SessionState::Destroyed),
        ]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_refresh_sends_last_validators() {
    let h = harness(vec![ScriptedResponse::status(304).header("etag", "e1")]);
    h.seed_cache(URL, TEMPLATE, &json!({"a": 1}), "e1");

    let session = h.engine.create(URL, quick()).unwrap();
    session.bind_client(FakeClient::new());
    session.on_client_ready();
    assert!(wait_for(|| session.result_codes().1 == ResultCode::HitCache).await);
    assert!(wait_for(|| session.state() == SessionState::Ready).await);

    assert!(session.refresh());
    assert!(wait_for(|| h.factory.created() == 2).await);
    assert_eq!(h.factory.request_header(1, "if-none-match").as_deref(), Some("e1"));
    assert!(wait_for(|| session.result_codes().1 == ResultCode::HitCache).await);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_intercept_blocks_until_response_arrives() {
    let html = page(TEMPLATE, &json!({"a": 1}));
    let h = harness(vec![ScriptedResponse::ok(html.clone())
        .header("etag", "e1")
        .header("cache-offline", "true")
        .delay(Duration::from_millis(300))]);
    let session = h.engine.create(URL, standard()).unwrap();
    session.bind_client(FakeClient::new());
    session.on_client_ready();

    let started = Instant::now();
    let (_, body) = intercept(&session).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(body, html);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_intercept_wait_is_bounded() {
    let h = harness_with(
        vec![ScriptedResponse::ok("late").delay(Duration::from_secs(3))],
        |c| c.resource_wait_timeout_ms = 200,
    );
    let session = h.engine.create(URL, quick()).unwrap();
    session.bind_client(FakeClient::new());
    session.on_client_ready();
    assert!(wait_for(|| session.state() == SessionState::Running).await);

    let started = Instant::now();
    assert!(intercept(&session).await.is_none());
    let waited = started.elapsed();
    assert!(waited >= Duration::from_millis(150), "waited {:?}", waited);
    assert!(waited < Duration::from_secs(2), "waited {:?}", waited);

    // The main resource is only handed out once.
    assert!(intercept(&session).await.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_destroy_waits_for_running_flow() {
    let h = harness_with(
        vec![ScriptedResponse::status(304).delay(Duration::from_millis(300))],
        |c| c.force_destroy_delay_ms = 10_000,
    );
    let session = h.engine.create(URL, quick()).unwrap();
    let listener = RecordingListener::new();
    session.add_listener(listener.clone());
    session.start();
    assert_eq!(session.state(), SessionState::Running);

    session.destroy();
    assert!(session.is_destroyed_or_waiting());
    assert!(!session.is_destroyed());

    assert!(wait_for(|| session.is_destroyed()).await);
    assert!(listener.events().contains(&"destroy".to_string()));
    assert!(!h.engine.pool().is_running(URL));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_http_error_reports_code() {
    let h = harness(vec![ScriptedResponse::status(500)]);
    let session = h.engine.create(URL, quick()).unwrap();
    let listener = RecordingListener::new();
    session.add_listener(listener.clone());
    session.start();

    assert!(wait_for(|| session.state() == SessionState::Ready).await);
    assert!(listener.events().contains(&"http_error:500".to_string()));
    assert!(h.runtime.errors().contains(&500));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_bad_network_skips_connection_and_toasts() {
    let h = harness(vec![ScriptedResponse::status(304)]);
    h.seed_cache(URL, TEMPLATE, &json!({"a": 1}), "e1");
    h.runtime.set_network_valid(false);

    let session = h.engine.create(URL, quick()).unwrap();
    session.bind_client(FakeClient::new());
    session.on_client_ready();

    assert!(wait_for(|| session.state() == SessionState::Ready).await);
    assert!(wait_for(|| !h.runtime.toasts.lock().is_empty()).await);
    assert_eq!(h.factory.created(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_url_matching_ignores_host_case_and_trailing_slash() {
    let h = harness(vec![ScriptedResponse::status(304)]);
    let session = h.engine.create(URL, quick()).unwrap();

    assert!(session.is_match_current_url("https://EXAMPLE.com/page/"));
    assert!(session.is_match_current_url("https://example.com/page?from=feed"));
    assert!(!session.is_match_current_url("https://example.com/other"));
    assert!(!session.is_match_current_url("https://example.org/page"));
    assert!(!session.is_match_current_url("not a url"));
}
