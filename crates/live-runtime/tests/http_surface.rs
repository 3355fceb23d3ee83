//! Router-level tests for the duplex upgrade and the recording routes.
//!
//! Requests go through `tower::ServiceExt::oneshot`, so no listener is
//! bound. The duplex endpoint can only be exercised up to the upgrade.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use common::secret::SecretString;
use http_body_util::BodyExt;
use live_runtime::actors::{ActorMetrics, DispatcherHandle, RoomRegistryHandle};
use live_runtime::gateway::{self, GatewayState, IdentityVerifier};
use live_runtime::model::{RecordingStatus, Session};
use live_runtime::recording::routes::{self, RecordingApi};
use live_runtime::recording::{IngestSettings, RecordingIngestor};
use live_runtime::runtime::{RuntimeSettings, SessionRuntime};
use live_runtime::store::{MemorySessionStore, SessionStore};
use live_test_utils::{MockObjectStorage, SessionFixture, TestIdentityToken, TEST_TOKEN_SECRET};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

const ORGANIZER: &str = "organizer-1";
const MIN_PART: usize = 16;

struct App {
    router: Router,
    store: Arc<MemorySessionStore>,
    storage: MockObjectStorage,
    session: Session,
}

async fn app() -> App {
    let store = Arc::new(MemorySessionStore::new());
    let session = SessionFixture::new(ORGANIZER)
        .live()
        .insert(store.as_ref())
        .await;
    let shared: Arc<dyn SessionStore> = Arc::clone(&store) as Arc<dyn SessionStore>;
    let metrics = ActorMetrics::new();
    let verifier = Arc::new(IdentityVerifier::new(
        &SecretString::from(TEST_TOKEN_SECRET),
        Duration::from_secs(300),
    ));

    let dispatcher = DispatcherHandle::new(
        Arc::clone(&shared),
        Arc::clone(&metrics),
        64,
        CancellationToken::new(),
    );
    let runtime = Arc::new(SessionRuntime::new(
        Arc::clone(&shared),
        RoomRegistryHandle::new(Arc::clone(&metrics)),
        dispatcher,
        RuntimeSettings::default(),
    ));

    let storage = MockObjectStorage::new(MIN_PART);
    let ingestor = Arc::new(RecordingIngestor::new(
        shared,
        Arc::new(storage.clone()),
        IngestSettings {
            min_part_size: MIN_PART,
            stale_after: Duration::from_secs(60),
            max_chunk_bytes: 64,
        },
    ));

    let router = gateway::router(Arc::new(GatewayState {
        runtime,
        verifier: Arc::clone(&verifier),
        metrics,
        shutdown: CancellationToken::new(),
    }))
    .merge(routes::router(Arc::new(RecordingApi { ingestor, verifier })));

    App {
        router,
        store,
        storage,
        session,
    }
}

impl App {
    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, body)
    }
}

fn bearer(subject: &str) -> String {
    format!("Bearer {}", TestIdentityToken::new(subject).sign_default())
}

fn init_request(auth: Option<&str>, body: &Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri("/v1/recordings")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(auth) = auth {
        builder = builder.header(header::AUTHORIZATION, auth);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn chunk_request(auth: &str, upload_id: &str, bytes: &'static [u8]) -> Request<Body> {
    Request::builder()
        .method(Method::PUT)
        .uri(format!("/v1/recordings/{upload_id}/chunks"))
        .header(header::AUTHORIZATION, auth)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .body(Body::from(bytes))
        .unwrap()
}

fn finalize_request(auth: &str, upload_id: &str) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(format!("/v1/recordings/{upload_id}/finalize"))
        .header(header::AUTHORIZATION, auth)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_live_endpoint_rejects_missing_token() {
    let app = app().await;
    let request = Request::builder()
        .uri("/v1/live")
        .body(Body::empty())
        .unwrap();

    let (status, body) = app.send(request).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "UNAUTHENTICATED");
}

#[tokio::test]
async fn test_live_endpoint_rejects_expired_query_token() {
    let app = app().await;
    let token = TestIdentityToken::new("alice").expired().sign_default();
    let request = Request::builder()
        .uri(format!("/v1/live?token={token}"))
        .body(Body::empty())
        .unwrap();

    let (status, _) = app.send(request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_live_endpoint_rejects_foreign_signature() {
    let app = app().await;
    let token = TestIdentityToken::new("alice").sign("some-other-secret-entirely");
    let request = Request::builder()
        .uri("/v1/live")
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap();

    let (status, _) = app.send(request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_live_endpoint_valid_token_without_upgrade_is_not_unauthorized() {
    let app = app().await;
    let request = Request::builder()
        .uri("/v1/live")
        .header(header::AUTHORIZATION, bearer("alice"))
        .body(Body::empty())
        .unwrap();

    let (status, _) = app.send(request).await;
    assert_ne!(status, StatusCode::UNAUTHORIZED);
    assert!(status.is_client_error());
}

#[tokio::test]
async fn test_recording_routes_require_token() {
    let app = app().await;
    let body = json!({ "session_id": app.session.id, "content_type": "video/webm" });

    let (status, _) = app.send(init_request(None, &body)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(app.storage.open_uploads().is_empty());
}

#[tokio::test]
async fn test_recording_init_by_attendee_is_forbidden() {
    let app = app().await;
    let body = json!({ "session_id": app.session.id, "content_type": "video/webm" });

    let (status, body) = app.send(init_request(Some(&bearer("alice")), &body)).await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "FORBIDDEN");
}

#[tokio::test]
async fn test_recording_upload_over_http() {
    let app = app().await;
    let auth = bearer(ORGANIZER);
    let body = json!({ "session_id": app.session.id, "content_type": "video/webm" });

    let (status, started) = app.send(init_request(Some(&auth), &body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(started["mode"], "multipart");
    let upload_id = started["upload_id"].as_str().unwrap().to_string();

    let (status, receipt) = app
        .send(chunk_request(&auth, &upload_id, b"0123456789"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(receipt["parts"], 0);

    let (status, receipt) = app
        .send(chunk_request(&auth, &upload_id, b"abcdefghij"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(receipt["parts"], 1);
    assert_eq!(receipt["received_bytes"], 20);

    // Someone else's token cannot touch the upload.
    let (status, _) = app
        .send(finalize_request(&bearer("mallory"), &upload_id))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, done) = app.send(finalize_request(&auth, &upload_id)).await;
    assert_eq!(status, StatusCode::OK);
    let url = done["url"].as_str().unwrap();

    let (_, object) = app.storage.only_object();
    assert_eq!(&object[..], b"0123456789abcdefghij");

    let session = app.store.find_by_id(app.session.id).await.unwrap().unwrap();
    assert_eq!(session.recording.status, RecordingStatus::Completed);
    assert_eq!(session.recording.url.as_deref(), Some(url));

    let (status, _) = app.send(finalize_request(&auth, &upload_id)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_oversized_chunk_is_rejected() {
    let app = app().await;
    let auth = bearer(ORGANIZER);
    let body = json!({ "session_id": app.session.id, "content_type": "audio/webm" });
    let (_, started) = app.send(init_request(Some(&auth), &body)).await;
    let upload_id = started["upload_id"].as_str().unwrap();

    let big: &'static [u8] = &[0u8; 65];
    let (status, _) = app.send(chunk_request(&auth, upload_id, big)).await;

    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
}
