use std::time::Duration;

use super::*;
use gphotos_core::{RetryPolicy, TokenClient};
use serde_json::{Value, json};
use sqlx::sqlite::SqlitePoolOptions;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn make_store() -> MirrorStore {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let store = MirrorStore::from_pool(pool, "alice");
    store.init().await.unwrap();
    store
}

fn make_client(server: &MockServer) -> PhotosClient {
    let tokens = TokenClient::with_base_url(&server.uri(), "alice").unwrap();
    PhotosClient::with_base_url(&server.uri(), tokens)
        .unwrap()
        .with_token("test-token")
        .with_retry_policy(RetryPolicy::new(5, Duration::from_millis(1), 1))
}

async fn make_engine(server: &MockServer) -> SyncEngine {
    SyncEngine::new(make_client(server), make_store().await)
}

fn item(key: &str) -> Value {
    json!({
        "mediaKey": key,
        "info": { "fileName": format!("{key}.jpg"), "sizeBytes": 10, "mediaType": 1 }
    })
}

fn tombstone(key: &str) -> Value {
    json!({ "type": 1, "media": { "mediaKey": key } })
}

async fn mount_post(server: &MockServer, endpoint: &str, body: Value, response: Value) {
    Mock::given(method("POST"))
        .and(path(endpoint))
        .and(body_json(body))
        .respond_with(ResponseTemplate::new(200).set_body_json(response))
        .expect(1)
        .mount(server)
        .await;
}

async fn keys(engine: &SyncEngine) -> Vec<String> {
    engine.store().list_media_keys().await.unwrap()
}

#[tokio::test]
async fn initial_sync_pages_through_and_applies_tombstones() {
    let server = MockServer::start().await;
    mount_post(
        &server,
        "/v1/library:state",
        json!({ "stateToken": "" }),
        json!({ "stateToken": "s1", "pageToken": "p1", "items": [item("A")] }),
    )
    .await;
    mount_post(
        &server,
        "/v1/library:pageInit",
        json!({ "pageToken": "p1" }),
        json!({ "items": [item("B")], "deletions": [tombstone("A")] }),
    )
    .await;

    let engine = make_engine(&server).await;
    let report = engine.run_cycle().await.unwrap();

    assert_eq!(keys(&engine).await, vec!["B".to_string()]);
    let cursor = engine.store().get_cursor().await.unwrap();
    assert_eq!(cursor.state_token, "s1");
    assert_eq!(cursor.page_token, "");
    assert!(cursor.init_complete);
    assert!(cursor.last_sync_at.is_some());
    assert_eq!(
        report,
        SyncReport {
            updated: 2,
            deleted: 1,
            pages: 2,
            initialized: true
        }
    );
    assert_eq!(engine.last_report(), Some(report));
}

#[tokio::test]
async fn steady_cycle_pages_against_requested_state_token() {
    let server = MockServer::start().await;
    mount_post(
        &server,
        "/v1/library:state",
        json!({ "stateToken": "s1" }),
        json!({ "stateToken": "s2", "pageToken": "p9", "items": [item("C")] }),
    )
    .await;
    mount_post(
        &server,
        "/v1/library:page",
        json!({ "stateToken": "s1", "pageToken": "p9" }),
        json!({ "items": [item("D")] }),
    )
    .await;

    let engine = make_engine(&server).await;
    engine.store().set_cursor(Some("s1"), Some("")).await.unwrap();
    engine.store().set_init_complete(true).await.unwrap();

    let report = engine.run_cycle().await.unwrap();

    assert_eq!(keys(&engine).await, vec!["C".to_string(), "D".to_string()]);
    let cursor = engine.store().get_cursor().await.unwrap();
    assert_eq!(cursor.state_token, "s2");
    assert_eq!(cursor.page_token, "");
    assert_eq!(cursor.page_anchor, "");
    assert!(!report.initialized);
    assert_eq!(report.pages, 2);
}

#[tokio::test]
async fn interrupted_pagination_resumes_before_state_fetch() {
    let server = MockServer::start().await;
    mount_post(
        &server,
        "/v1/library:state",
        json!({ "stateToken": "" }),
        json!({ "stateToken": "s1", "pageToken": "p1", "items": [item("A")] }),
    )
    .await;
    Mock::given(method("POST"))
        .and(path("/v1/library:pageInit"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let engine = make_engine(&server).await;
    let err = engine.run_cycle().await.unwrap_err();
    assert!(matches!(err, SyncError::Remote(_)));

    let cursor = engine.store().get_cursor().await.unwrap();
    assert_eq!(cursor.state_token, "s1");
    assert_eq!(cursor.page_token, "p1");
    assert!(!cursor.init_complete);
    assert_eq!(keys(&engine).await, vec!["A".to_string()]);
    assert_eq!(engine.last_report(), None);

    server.reset().await;
    mount_post(
        &server,
        "/v1/library:pageInit",
        json!({ "pageToken": "p1" }),
        json!({ "items": [item("B")], "deletions": [tombstone("A")] }),
    )
    .await;
    mount_post(
        &server,
        "/v1/library:state",
        json!({ "stateToken": "s1" }),
        json!({ "stateToken": "s1" }),
    )
    .await;

    engine.run_cycle().await.unwrap();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests[0].url.path(), "/v1/library:pageInit");
    assert_eq!(requests[1].url.path(), "/v1/library:state");
    assert_eq!(keys(&engine).await, vec!["B".to_string()]);
    let cursor = engine.store().get_cursor().await.unwrap();
    assert_eq!(cursor.state_token, "s1");
    assert_eq!(cursor.page_token, "");
    assert!(cursor.init_complete);
}

#[tokio::test]
async fn resumed_steady_pagination_uses_original_state_token() {
    let server = MockServer::start().await;
    mount_post(
        &server,
        "/v1/library:page",
        json!({ "stateToken": "s1", "pageToken": "p4" }),
        json!({ "items": [item("E")] }),
    )
    .await;
    mount_post(
        &server,
        "/v1/library:state",
        json!({ "stateToken": "s2" }),
        json!({ "stateToken": "s3" }),
    )
    .await;

    let engine = make_engine(&server).await;
    engine
        .store()
        .update_cursor(&CursorUpdate {
            state_token: Some("s2".into()),
            page_token: Some("p4".into()),
            page_anchor: Some("s1".into()),
        })
        .await
        .unwrap();
    engine.store().set_init_complete(true).await.unwrap();

    engine.run_cycle().await.unwrap();

    assert_eq!(keys(&engine).await, vec!["E".to_string()]);
    assert_eq!(engine.store().get_cursor().await.unwrap().state_token, "s3");
}

#[tokio::test]
async fn repeated_page_leaves_same_mirror() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/library:state"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "stateToken": "s1",
            "items": [item("A"), item("B")],
            "deletions": [tombstone("Z")]
        })))
        .expect(2)
        .mount(&server)
        .await;

    let engine = make_engine(&server).await;
    engine.run_cycle().await.unwrap();
    let first = engine.store().get_by_media_key("A").await.unwrap();
    let second_report = engine.run_cycle().await.unwrap();

    assert_eq!(keys(&engine).await, vec!["A".to_string(), "B".to_string()]);
    assert_eq!(engine.store().get_by_media_key("A").await.unwrap(), first);
    assert_eq!(second_report.deleted, 0);
}

#[tokio::test]
async fn later_tombstone_removes_earlier_insert() {
    let server = MockServer::start().await;
    mount_post(
        &server,
        "/v1/library:state",
        json!({ "stateToken": "s1" }),
        json!({ "stateToken": "s2", "items": [item("A")] }),
    )
    .await;
    mount_post(
        &server,
        "/v1/library:state",
        json!({ "stateToken": "s2" }),
        json!({ "stateToken": "s3", "deletions": [tombstone("A")] }),
    )
    .await;

    let engine = make_engine(&server).await;
    engine.store().set_cursor(Some("s1"), None).await.unwrap();
    engine.store().set_init_complete(true).await.unwrap();

    engine.run_cycle().await.unwrap();
    assert_eq!(keys(&engine).await, vec!["A".to_string()]);
    engine.run_cycle().await.unwrap();

    assert!(keys(&engine).await.is_empty());
    assert_eq!(engine.last_report().unwrap().deleted, 1);
}

#[tokio::test]
async fn decode_failure_leaves_cursor_unchanged() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/library:state"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{\"items\": [{}]}"))
        .mount(&server)
        .await;

    let engine = make_engine(&server).await;
    engine.store().set_cursor(Some("s1"), None).await.unwrap();
    engine.store().set_init_complete(true).await.unwrap();

    let err = engine.run_cycle().await.unwrap_err();

    assert!(matches!(err, SyncError::Remote(PhotosError::Decode(_))));
    let cursor = engine.store().get_cursor().await.unwrap();
    assert_eq!(cursor.state_token, "s1");
    assert_eq!(cursor.last_sync_at, None);
    assert_eq!(engine.store().count().await.unwrap(), 0);
}

#[tokio::test]
async fn cancelled_engine_issues_no_requests() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(0)
        .mount(&server)
        .await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let engine = make_engine(&server).await.with_cancellation(cancel);

    assert!(matches!(engine.run_cycle().await, Err(SyncError::Cancelled)));
}

#[tokio::test]
async fn concurrent_cycles_run_one_after_another() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/library:state"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "stateToken": "s1", "items": [item("A")] }))
                .set_delay(Duration::from_millis(20)),
        )
        .expect(2)
        .mount(&server)
        .await;

    let engine = Arc::new(make_engine(&server).await);
    let (first, second) = tokio::join!(engine.run_cycle(), engine.run_cycle());

    let first = first.unwrap();
    let second = second.unwrap();
    assert!(first.initialized != second.initialized);
    assert_eq!(keys(&engine).await, vec!["A".to_string()]);
}

#[tokio::test]
async fn repeated_triggers_coalesce() {
    let trigger = SyncTrigger::new();
    trigger.trigger();
    trigger.trigger();
    trigger.trigger();

    tokio::time::timeout(Duration::from_millis(50), trigger.notified())
        .await
        .unwrap();
    let second = tokio::time::timeout(Duration::from_millis(50), trigger.notified()).await;

    assert!(second.is_err());
}

/// Answers with `body` and cancels `cancel`, as if shutdown began while the
/// response was in flight.
struct CancelAfterResponse {
    body: Value,
    cancel: CancellationToken,
}

impl wiremock::Respond for CancelAfterResponse {
    fn respond(&self, _request: &wiremock::Request) -> ResponseTemplate {
        self.cancel.cancel();
        ResponseTemplate::new(200).set_body_json(self.body.clone())
    }
}

#[tokio::test]
async fn cancellation_between_pages_keeps_cursor_at_last_applied_page() {
    let server = MockServer::start().await;
    let cancel = CancellationToken::new();
    Mock::given(method("POST"))
        .and(path("/v1/library:state"))
        .and(body_json(json!({ "stateToken": "" })))
        .respond_with(CancelAfterResponse {
            body: json!({ "stateToken": "s1", "pageToken": "p1", "items": [item("A")] }),
            cancel: cancel.clone(),
        })
        .expect(1)
        .mount(&server)
        .await;

    let store = make_store().await;
    let engine = SyncEngine::new(make_client(&server), store.clone()).with_cancellation(cancel);

    assert!(matches!(engine.run_cycle().await, Err(SyncError::Cancelled)));
    let cursor = store.get_cursor().await.unwrap();
    assert_eq!(cursor.state_token, "s1");
    assert_eq!(cursor.page_token, "p1");
    assert!(!cursor.init_complete);
    assert_eq!(engine.last_report(), None);
    assert_eq!(keys(&engine).await, vec!["A".to_string()]);

    mount_post(
        &server,
        "/v1/library:pageInit",
        json!({ "pageToken": "p1" }),
        json!({ "items": [item("B")] }),
    )
    .await;
    mount_post(
        &server,
        "/v1/library:state",
        json!({ "stateToken": "s1" }),
        json!({ "stateToken": "s2" }),
    )
    .await;

    let resumed = SyncEngine::new(make_client(&server), store.clone());
    let report = resumed.run_cycle().await.unwrap();

    assert!(report.initialized);
    assert_eq!(report.pages, 2);
    assert_eq!(keys(&resumed).await, vec!["A".to_string(), "B".to_string()]);
    let cursor = store.get_cursor().await.unwrap();
    assert_eq!(cursor.state_token, "s2");
    assert!(cursor.page_token.is_empty());
    assert!(cursor.init_complete);
}
