//! Trial Session Controller against an in-process mock backend.
//!
//! Run with: `cargo test -p trialsync_core --test controller_test`

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use trialsync_core::{
    AccessGate, BackendClient, ClientError, EventBus, KeyValueStore, MemoryStore, RequiredTier,
    StartOutcome, StoreError, SyncError, SyncOutcome, Tier, TrialEvent, TrialPhase,
    TrialSessionController, TrialStore,
};

const TOKEN: &str = "test-token";

async fn spawn_backend(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock backend");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve mock backend");
    });
    format!("http://{}", addr)
}

fn start_trial_route(status: StatusCode, body: Value) -> Router {
    Router::new().route(
        "/api/start-trial",
        post(move |headers: HeaderMap| {
            let body = body.clone();
            async move {
                let expected = format!("Bearer {}", TOKEN);
                let authorized = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    == Some(expected.as_str());
                if authorized {
                    (status, Json(body))
                } else {
                    (StatusCode::UNAUTHORIZED, Json(json!({"ok": false, "error": "unauthorized"})))
                }
            }
        }),
    )
}

fn controller(base_url: &str) -> TrialSessionController {
    TrialSessionController::new(
        BackendClient::new(base_url, Some(TOKEN.to_string())),
        Arc::new(TrialStore::in_memory()),
        EventBus::new(),
    )
}

#[tokio::test]
async fn successful_start_persists_trial_and_hides_button() {
    let base = spawn_backend(start_trial_route(
        StatusCode::OK,
        json!({
            "ok": true,
            "trial_active": true,
            "trial_started_at": "2025-01-01T00:00:00Z",
            "trial_expires_at": "2025-01-01T05:00:00Z",
        }),
    ))
    .await;
    let ctl = controller(&base);
    let mut events = ctl.events().subscribe();

    let state = match ctl.start_trial().await {
        StartOutcome::Started(state) => state,
        other => panic!("expected Started, got {:?}", other),
    };
    assert_eq!(state.duration(), chrono::Duration::hours(5));

    let stored = ctl.store().load().unwrap().complete().unwrap();
    assert_eq!(stored.expires_at - stored.started_at, chrono::Duration::hours(5));

    let view = ctl.view();
    assert!(!view.button_visible);
    assert!(view.active_styling);
    assert_eq!(ctl.phase(), TrialPhase::Active);
    assert_eq!(events.recv().await.unwrap(), TrialEvent::Started(state));
}

#[tokio::test]
async fn rejected_start_reenables_button_without_touching_storage() {
    let base = spawn_backend(start_trial_route(
        StatusCode::BAD_REQUEST,
        json!({"ok": false, "error": "already used"}),
    ))
    .await;
    let ctl = controller(&base);
    let mut events = ctl.events().subscribe();
    let mut stored = ctl.store().subscribe();
    stored.borrow_and_update();

    let outcome = ctl.start_trial().await;
    assert_eq!(outcome, StartOutcome::Failed("already used".to_string()));

    let view = ctl.view();
    assert!(view.button_visible);
    assert!(view.button_enabled);
    assert_eq!(view.status_text.as_deref(), Some("already used"));
    assert_eq!(ctl.phase(), TrialPhase::Idle);
    assert!(!stored.has_changed().unwrap());
    assert!(ctl.store().load().unwrap().is_empty());
    assert_eq!(
        events.recv().await.unwrap(),
        TrialEvent::StartFailed("already used".to_string())
    );
}

#[tokio::test]
async fn network_failure_shows_generic_message() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let ctl = controller(&format!("http://{}", addr));
    match ctl.start_trial().await {
        StartOutcome::Failed(msg) => {
            assert_eq!(msg, trialsync_core::controller::GENERIC_START_ERROR)
        }
        other => panic!("expected Failed, got {:?}", other),
    }
    assert!(ctl.view().button_enabled);
    assert!(ctl.store().load().unwrap().is_empty());
}

#[tokio::test]
async fn success_with_reversed_timestamps_is_a_failure() {
    let base = spawn_backend(start_trial_route(
        StatusCode::OK,
        json!({
            "ok": true,
            "trial_active": true,
            "trial_started_at": "2025-01-01T05:00:00Z",
            "trial_expires_at": "2025-01-01T00:00:00Z",
        }),
    ))
    .await;
    let ctl = controller(&base);
    assert!(matches!(ctl.start_trial().await, StartOutcome::Failed(_)));
    assert_eq!(ctl.phase(), TrialPhase::Idle);
    assert!(ctl.store().load().unwrap().is_empty());
}

#[tokio::test]
async fn second_click_while_starting_is_ignored() {
    let app = Router::new().route(
        "/api/start-trial",
        post(|| async {
            tokio::time::sleep(Duration::from_millis(150)).await;
            Json(json!({
                "ok": true,
                "trial_active": true,
                "trial_started_at": "2025-01-01T00:00:00Z",
                "trial_expires_at": "2025-01-01T05:00:00Z",
            }))
        }),
    );
    let base = spawn_backend(app).await;
    let ctl = controller(&base);

    let (first, second) = tokio::join!(ctl.start_trial(), ctl.start_trial());
    assert!(matches!(first, StartOutcome::Started(_)));
    assert_eq!(second, StartOutcome::Ignored(TrialPhase::Starting));
    assert_eq!(
        ctl.start_trial().await,
        StartOutcome::Ignored(TrialPhase::Active)
    );
}

#[tokio::test]
async fn expiry_brings_the_button_back() {
    let base = spawn_backend(start_trial_route(
        StatusCode::OK,
        json!({
            "ok": true,
            "trial_active": true,
            "trial_started_at": "2025-01-01T00:00:00Z",
            "trial_expires_at": "2025-01-01T05:00:00Z",
        }),
    ))
    .await;
    let ctl = controller(&base);
    ctl.start_trial().await;
    ctl.on_expired();
    assert_eq!(ctl.phase(), TrialPhase::Idle);
    assert!(ctl.view().button_visible);
}

#[derive(Clone)]
struct SessionState {
    body: Arc<Mutex<Value>>,
}

async fn session_lite(State(s): State<SessionState>) -> Json<Value> {
    Json(s.body.lock().unwrap().clone())
}

#[tokio::test]
async fn session_sync_follows_the_server() {
    let state = SessionState {
        body: Arc::new(Mutex::new(json!({
            "ok": true,
            "trial_active": true,
            "trial_started_at": "2030-01-01T00:00:00Z",
            "trial_expires_at": "2030-01-01T05:00:00Z",
        }))),
    };
    let app = Router::new()
        .route("/api/session-lite", get(session_lite))
        .with_state(state.clone());
    let base = spawn_backend(app).await;
    let ctl = controller(&base);

    assert!(matches!(ctl.sync_session().await.unwrap(), SyncOutcome::Active(_)));
    assert_eq!(ctl.phase(), TrialPhase::Active);
    assert!(ctl.store().load().unwrap().is_active());

    *state.body.lock().unwrap() = json!({"ok": true, "trial_active": false});
    assert_eq!(ctl.sync_session().await.unwrap(), SyncOutcome::Inactive);
    assert_eq!(ctl.phase(), TrialPhase::Idle);
    assert!(ctl.store().load().unwrap().is_empty());
    assert!(ctl.view().button_visible);

    *state.body.lock().unwrap() = json!({"ok": false});
    assert_eq!(ctl.sync_session().await.unwrap(), SyncOutcome::Skipped);
}

#[tokio::test]
async fn restore_keeps_live_trial_and_drops_expired_one() {
    let ctl = controller("http://127.0.0.1:9");
    let live = trialsync_core::TrialState::from_timestamps(
        "2020-01-01T00:00:00Z",
        "2999-01-01T00:00:00Z",
        Some("gold"),
    )
    .unwrap();
    ctl.store().save(&live).unwrap();
    assert_eq!(ctl.restore(), Some(live));
    assert_eq!(ctl.phase(), TrialPhase::Active);

    let ctl = controller("http://127.0.0.1:9");
    let stale = trialsync_core::TrialState::from_timestamps(
        "2020-01-01T00:00:00Z",
        "2020-01-01T05:00:00Z",
        None,
    )
    .unwrap();
    ctl.store().save(&stale).unwrap();
    assert_eq!(ctl.restore(), None);
    assert!(ctl.store().load().unwrap().is_empty());
}

#[tokio::test]
async fn user_plan_feeds_the_access_gate() {
    let app = Router::new().route(
        "/api/user-plan",
        get(|| async { Json(json!({"plan": "free", "trial_active": true})) }),
    );
    let base = spawn_backend(app).await;
    let ctl = controller(&base);

    let snap = ctl.refresh_access().await.unwrap();
    assert_eq!(snap.tier, Tier::Bronze);
    let gate = AccessGate::default();
    assert!(gate.decide(&snap, Tier::Gold.into()).unlocked);
    assert!(!gate.decide(&snap, RequiredTier::Referral).unlocked);
}

#[tokio::test]
async fn non_json_error_surfaces_status() {
    let app = Router::new().route(
        "/api/user-plan",
        get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
    );
    let base = spawn_backend(app).await;
    let ctl = controller(&base);

    match ctl.refresh_access().await {
        Err(SyncError::Client(ClientError::Status { status, body, .. })) => {
            assert_eq!(status, 500);
            assert_eq!(body, "boom");
        }
        other => panic!("expected status error, got {:?}", other),
    }
}

/// Accepts reads, refuses every write.
struct ReadOnlyStore;

impl KeyValueStore for ReadOnlyStore {
    fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
        Ok(None)
    }

    fn set(&self, key: &str, _value: &str) -> Result<(), StoreError> {
        Err(StoreError::Sled(sled::Error::Unsupported(format!("read-only: {}", key))))
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        Err(StoreError::Sled(sled::Error::Unsupported(format!("read-only: {}", key))))
    }
}

#[tokio::test]
async fn storage_failure_does_not_block_a_successful_start() {
    let base = spawn_backend(start_trial_route(
        StatusCode::OK,
        json!({
            "ok": true,
            "trial_active": true,
            "trial_started_at": "2025-01-01T00:00:00Z",
            "trial_expires_at": "2025-01-01T05:00:00Z",
        }),
    ))
    .await;
    let ctl = TrialSessionController::new(
        BackendClient::new(&base, Some(TOKEN.to_string())),
        Arc::new(TrialStore::new(Arc::new(ReadOnlyStore))),
        EventBus::new(),
    );

    assert!(matches!(ctl.start_trial().await, StartOutcome::Started(_)));
    assert_eq!(ctl.phase(), TrialPhase::Active);
    assert!(!ctl.view().button_visible);
}

#[tokio::test]
async fn restore_keeps_active_trial_without_start_time() {
    let backend = Arc::new(MemoryStore::new());
    backend.set("trial_active", "true").unwrap();
    backend.set("trial_expires_at", "2999-01-01T05:00:00Z").unwrap();
    let ctl = TrialSessionController::new(
        BackendClient::new("http://127.0.0.1:9", None),
        Arc::new(TrialStore::new(backend)),
        EventBus::new(),
    )
    .with_fallback_duration(Duration::from_secs(2 * 3600));

    let state = ctl.restore().expect("cached trial kept");
    assert_eq!(state.duration(), chrono::Duration::hours(2));
    assert_eq!(state.plan_limits_from, Tier::Gold);
    assert_eq!(ctl.phase(), TrialPhase::Active);
    assert!(!ctl.view().button_visible);

    let stored = ctl.store().load().unwrap();
    assert_eq!(stored.expires_at.as_deref(), Some("2999-01-01T05:00:00Z"));
    assert_eq!(stored.started_at, None);
}

#[tokio::test]
async fn restore_drops_inactive_partial_cache() {
    let backend = Arc::new(MemoryStore::new());
    backend.set("trial_active", "false").unwrap();
    backend.set("trial_expires_at", "2999-01-01T05:00:00Z").unwrap();
    let ctl = TrialSessionController::new(
        BackendClient::new("http://127.0.0.1:9", None),
        Arc::new(TrialStore::new(backend)),
        EventBus::new(),
    );

    assert_eq!(ctl.restore(), None);
    assert_eq!(ctl.phase(), TrialPhase::Idle);
    assert!(ctl.store().load().unwrap().is_empty());
}

fn require_bearer(headers: &HeaderMap) -> Result<(), StatusCode> {
    let expected = format!("Bearer {}", TOKEN);
    match headers.get("authorization").and_then(|v| v.to_str().ok()) {
        Some(v) if v == expected => Ok(()),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

#[tokio::test]
async fn v1_endpoints_send_bearer_token() {
    let app = Router::new()
        .route(
            "/v1/me",
            get(|headers: HeaderMap| async move {
                require_bearer(&headers)?;
                Ok::<_, StatusCode>(Json(json!({
                    "plan": "growth",
                    "trial_active": false,
                    "email": "user@example.test",
                })))
            }),
        )
        .route(
            "/v1/entitlements",
            get(|headers: HeaderMap| async move {
                require_bearer(&headers)?;
                Ok::<_, StatusCode>(Json(json!({
                    "tier": "max",
                    "trial_active": true,
                    "limits": {"messages_per_day": 500},
                })))
            }),
        )
        .route(
            "/v1/trial/start",
            post(|headers: HeaderMap| async move {
                require_bearer(&headers)?;
                Ok::<_, StatusCode>(Json(json!({
                    "ok": true,
                    "active": true,
                    "started_at": "2025-01-01T00:00:00Z",
                    "expires_at": "2025-01-01T05:00:00Z",
                })))
            }),
        );
    let base = spawn_backend(app).await;
    let client = BackendClient::new(&base, Some(TOKEN.to_string()));

    let me = client.me().await.unwrap();
    assert_eq!(me.tier.as_deref(), Some("growth"));
    assert_eq!(me.extra.get("email"), Some(&json!("user@example.test")));

    let ent = client.entitlements().await.unwrap();
    assert!(ent.trial_active);
    assert_eq!(ent.limit("messages_per_day"), Some(500));

    let started = client.start_trial_v1().await.unwrap();
    assert!(started.succeeded());
    assert_eq!(
        started.trial_state().unwrap().duration(),
        chrono::Duration::hours(5)
    );

    let anonymous = BackendClient::new(&base, None);
    match anonymous.me().await {
        Err(ClientError::Status { status, .. }) => assert_eq!(status, 401),
        other => panic!("expected 401, got {:?}", other),
    }
}
