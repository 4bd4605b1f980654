use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tokio::{net::TcpListener, sync::Mutex};

use super::*;
use crate::{fakes::sample_session, session::SessionStateManager};

const API_KEY: &str = "public-test-key";
const USER_ID: &str = "3f2b8a52-5d0c-4c57-9a53-0f6f1b0a6e11";

#[derive(Clone, Default)]
struct ServerState {
    queries: Arc<Mutex<Vec<(String, HashMap<String, String>, Option<String>)>>>,
    sign_ups: Arc<Mutex<Vec<Value>>>,
    logouts: Arc<Mutex<Vec<Option<String>>>>,
}

fn token_body(access_token: &str, role: &str) -> Value {
    json!({
        "access_token": access_token,
        "token_type": "bearer",
        "expires_in": 3600,
        "refresh_token": "refresh-ok",
        "user": {
            "id": USER_ID,
            "email": "ana@example.com",
            "user_metadata": { "rol": role }
        }
    })
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

async fn handle_token(
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if header(&headers, "apikey").as_deref() != Some(API_KEY) {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "message": "No API key found" })))
            .into_response();
    }

    match params.get("grant_type").map(String::as_str) {
        Some("password") if body["password"] == "secret" => {
            Json(token_body("access-1", "admin")).into_response()
        }
        Some("password") => (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "invalid_grant",
                "error_description": "Invalid login credentials"
            })),
        )
            .into_response(),
        Some("refresh_token") if body["refresh_token"] == "refresh-ok" => {
            Json(token_body("access-refreshed", "admin")).into_response()
        }
        Some("refresh_token") if body["refresh_token"] == "refresh-during-outage" => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "message": "upstream auth unavailable" })),
        )
            .into_response(),
        Some("refresh_token") => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "code": 400, "msg": "Invalid Refresh Token: Refresh Token Not Found" })),
        )
            .into_response(),
        _ => StatusCode::BAD_REQUEST.into_response(),
    }
}

async fn handle_signup(State(state): State<ServerState>, Json(body): Json<Value>) -> Response {
    state.sign_ups.lock().await.push(body.clone());
    match body["email"].as_str() {
        Some("taken@example.com") => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "code": 422, "msg": "User already registered" })),
        )
            .into_response(),
        Some("confirm@example.com") => Json(json!({
            "id": USER_ID,
            "email": "confirm@example.com",
            "user_metadata": body["data"].clone()
        }))
        .into_response(),
        _ => Json(token_body("access-signup", "cliente")).into_response(),
    }
}

async fn handle_logout(State(state): State<ServerState>, headers: HeaderMap) -> Response {
    let authorization = header(&headers, "authorization");
    state.logouts.lock().await.push(authorization.clone());
    if authorization.as_deref() == Some("Bearer access-broken") {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "msg": "logout backend unavailable" })),
        )
            .into_response();
    }
    StatusCode::NO_CONTENT.into_response()
}

async fn handle_view(
    State(state): State<ServerState>,
    Path(view): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    state
        .queries
        .lock()
        .await
        .push((view.clone(), params, header(&headers, "authorization")));

    match view.as_str() {
        "vista_medio_transporte" => Json(json!([
            { "medio_transporte": "VIA MARITIMO", "total_operaciones": 40 },
            { "medio_transporte": "TERRESTRE", "total_operaciones": 12 }
        ]))
        .into_response(),
        "vista_operaciones_recientes" => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "code": "42P01",
                "message": "relation \"public.vista_operaciones_recientes\" does not exist"
            })),
        )
            .into_response(),
        _ => Json(json!([])).into_response(),
    }
}

async fn spawn_gateway_server() -> (String, ServerState) {
    let state = ServerState::default();
    let app = Router::new()
        .route("/auth/v1/token", post(handle_token))
        .route("/auth/v1/signup", post(handle_signup))
        .route("/auth/v1/logout", post(handle_logout))
        .route("/rest/v1/:view", get(handle_view))
        .with_state(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), state)
}

fn gateway(base_url: &str) -> RestGateway {
    RestGateway::new(base_url, API_KEY, SessionStore::in_memory()).expect("gateway")
}

#[test]
fn base_url_gains_trailing_slash_so_paths_nest() {
    let gateway = gateway("https://example.supabase.co/project");
    assert_eq!(
        gateway
            .endpoint("auth/v1/signup")
            .expect("endpoint")
            .as_str(),
        "https://example.supabase.co/project/auth/v1/signup"
    );
}

#[test]
fn rejects_unparseable_base_url() {
    let err = RestGateway::new("not a url", API_KEY, SessionStore::in_memory())
        .err()
        .expect("invalid url");
    assert_eq!(err.code, FaultCode::Validation);
}

#[tokio::test]
async fn sign_in_returns_session_and_broadcasts_change() {
    let (base_url, _) = spawn_gateway_server().await;
    let gateway = gateway(&base_url);
    let mut changes = gateway.subscribe_auth_changes();

    let session = gateway
        .sign_in(&Credentials::new("ana@example.com", "secret"))
        .await
        .expect("sign in");

    assert_eq!(session.access_token, "access-1");
    assert!(session.expires_at.is_some());
    let change = changes.recv().await.expect("change");
    assert_eq!(change.event, AuthEvent::SignedIn);
    assert_eq!(change.session, Some(session));
}

#[tokio::test]
async fn sign_in_failure_carries_gateway_message_verbatim() {
    let (base_url, _) = spawn_gateway_server().await;
    let gateway = gateway(&base_url);

    let fault = gateway
        .sign_in(&Credentials::new("ana@example.com", "wrong"))
        .await
        .expect_err("bad password");

    assert_eq!(fault.code, FaultCode::Validation);
    assert_eq!(fault.message, "Invalid login credentials");
}

#[tokio::test]
async fn sign_up_forwards_profile_metadata_as_data() {
    let (base_url, state) = spawn_gateway_server().await;
    let gateway = gateway(&base_url);
    let mut metadata = Metadata::new();
    metadata.insert("nombre".into(), json!("Ana"));
    metadata.insert("rol".into(), json!("cliente"));

    let outcome = gateway
        .sign_up(&Credentials::new("confirm@example.com", "secret"), metadata)
        .await
        .expect("sign up");

    assert!(outcome.session.is_none());
    assert_eq!(
        outcome.user.and_then(|user| user.role()),
        Some(shared::domain::Role::Client)
    );
    let sign_ups = state.sign_ups.lock().await;
    assert_eq!(sign_ups[0]["data"]["nombre"], "Ana");
    assert_eq!(sign_ups[0]["password"], "secret");
}

#[tokio::test]
async fn duplicate_sign_up_is_a_fault() {
    let (base_url, _) = spawn_gateway_server().await;
    let gateway = gateway(&base_url);

    let fault = gateway
        .sign_up(
            &Credentials::new("taken@example.com", "secret"),
            Metadata::new(),
        )
        .await
        .expect_err("duplicate");
    assert_eq!(fault.message, "User already registered");
}

#[tokio::test]
async fn query_sends_select_limit_and_bearer() {
    let (base_url, state) = spawn_gateway_server().await;
    let gateway = gateway(&base_url);

    let rows = gateway
        .query(View::TransportModeTotals, None)
        .await
        .expect("transport rows");
    assert_eq!(rows.len(), 2);

    gateway
        .sign_in(&Credentials::new("ana@example.com", "secret"))
        .await
        .expect("sign in");
    gateway
        .query(View::MonthlyOperations, View::MonthlyOperations.row_limit())
        .await
        .expect("monthly rows");

    let queries = state.queries.lock().await;
    let (view, params, authorization) = &queries[0];
    assert_eq!(view, "vista_medio_transporte");
    assert_eq!(params.get("select").map(String::as_str), Some("*"));
    assert!(!params.contains_key("limit"));
    assert_eq!(
        authorization.as_deref(),
        Some(format!("Bearer {API_KEY}").as_str())
    );

    let (view, params, authorization) = &queries[1];
    assert_eq!(view, "vista_operaciones_por_mes");
    assert_eq!(params.get("limit").map(String::as_str), Some("12"));
    assert_eq!(authorization.as_deref(), Some("Bearer access-1"));
}

#[tokio::test]
async fn query_fault_uses_error_body_message() {
    let (base_url, _) = spawn_gateway_server().await;
    let gateway = gateway(&base_url);

    let fault = gateway
        .query(View::RecentOperations, Some(10))
        .await
        .expect_err("missing view");
    assert_eq!(fault.code, FaultCode::Query);
    assert!(fault.message.contains("does not exist"), "{fault}");
}

#[tokio::test]
async fn unreachable_gateway_is_a_transport_fault() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    let gateway = gateway(&format!("http://{addr}"));

    let fault = gateway
        .query(View::GeneralStatistics, Some(10))
        .await
        .expect_err("nothing listening");
    assert_eq!(fault.code, FaultCode::Transport);
}

#[tokio::test]
async fn sign_out_clears_locally_even_when_remote_fails() {
    let (base_url, state) = spawn_gateway_server().await;
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("session.json");
    let mut broken = sample_session(Some("admin"));
    broken.access_token = "access-broken".into();
    SessionStore::at_path(&path)
        .save(&broken)
        .await
        .expect("seed session");

    let gateway =
        RestGateway::new(&base_url, API_KEY, SessionStore::at_path(&path)).expect("gateway");
    assert!(gateway
        .current_session()
        .await
        .expect("restore")
        .is_some());
    let mut changes = gateway.subscribe_auth_changes();

    let fault = gateway.sign_out().await.expect_err("remote logout fails");
    assert_eq!(fault.message, "logout backend unavailable");

    let change = changes.recv().await.expect("change");
    assert_eq!(change, AuthChange::new(AuthEvent::SignedOut, None));
    assert_eq!(gateway.current_session().await.expect("current"), None);
    assert!(!path.exists());
    assert_eq!(
        state.logouts.lock().await.as_slice(),
        &[Some("Bearer access-broken".to_string())]
    );
}

#[tokio::test]
async fn expired_session_is_refreshed_on_restore() {
    let (base_url, _) = spawn_gateway_server().await;
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("session.json");
    let mut expired = sample_session(Some("admin"));
    expired.expires_at = Some(1);
    expired.refresh_token = Some("refresh-ok".into());
    SessionStore::at_path(&path)
        .save(&expired)
        .await
        .expect("seed session");

    let gateway =
        RestGateway::new(&base_url, API_KEY, SessionStore::at_path(&path)).expect("gateway");
    let session = gateway
        .current_session()
        .await
        .expect("restore")
        .expect("refreshed session");

    assert_eq!(session.access_token, "access-refreshed");
    let persisted = SessionStore::at_path(&path)
        .load()
        .await
        .expect("load")
        .expect("persisted");
    assert_eq!(persisted.access_token, "access-refreshed");
}

#[tokio::test]
async fn expired_session_with_rejected_refresh_is_absent() {
    let (base_url, _) = spawn_gateway_server().await;
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("session.json");
    let mut expired = sample_session(None);
    expired.expires_at = Some(1);
    expired.refresh_token = Some("refresh-revoked".into());
    SessionStore::at_path(&path)
        .save(&expired)
        .await
        .expect("seed session");

    let gateway =
        RestGateway::new(&base_url, API_KEY, SessionStore::at_path(&path)).expect("gateway");

    assert_eq!(gateway.current_session().await.expect("restore"), None);
    assert!(!path.exists());
}

async fn seed_expired(path: &std::path::Path, role: &str, refresh_token: &str) {
    let mut expired = sample_session(Some(role));
    expired.expires_at = Some(1);
    expired.refresh_token = Some(refresh_token.into());
    SessionStore::at_path(path)
        .save(&expired)
        .await
        .expect("seed session");
}

#[tokio::test]
async fn refresh_outage_keeps_persisted_session() {
    let (base_url, _) = spawn_gateway_server().await;
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("session.json");
    seed_expired(&path, "admin", "refresh-during-outage").await;

    let gateway =
        RestGateway::new(&base_url, API_KEY, SessionStore::at_path(&path)).expect("gateway");
    let fault = gateway
        .current_session()
        .await
        .expect_err("outage surfaces");

    assert_eq!(fault.code, FaultCode::Internal);
    assert_eq!(fault.message, "upstream auth unavailable");
    let persisted = SessionStore::at_path(&path)
        .load()
        .await
        .expect("load")
        .expect("still persisted");
    assert_eq!(persisted.refresh_token.as_deref(), Some("refresh-during-outage"));
    assert_eq!(gateway.current_session().await.expect("second lookup"), None);
}

#[tokio::test]
async fn valid_persisted_session_is_announced_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("session.json");
    let session = sample_session(Some("cliente"));
    SessionStore::at_path(&path)
        .save(&session)
        .await
        .expect("seed session");

    let gateway = RestGateway::new("http://127.0.0.1:9", API_KEY, SessionStore::at_path(&path))
        .expect("gateway");
    let mut changes = gateway.subscribe_auth_changes();

    assert_eq!(
        gateway.current_session().await.expect("restore"),
        Some(session.clone())
    );
    assert_eq!(
        gateway.current_session().await.expect("again"),
        Some(session.clone())
    );

    let change = changes.recv().await.expect("change");
    assert_eq!(change.event, AuthEvent::InitialSession);
    assert_eq!(change.session, Some(session));
    assert!(changes.try_recv().is_err());
}

#[tokio::test]
async fn manager_start_with_rejected_refresh_is_signed_out() {
    let (base_url, _) = spawn_gateway_server().await;
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("session.json");
    seed_expired(&path, "admin", "refresh-revoked").await;

    let gateway = Arc::new(
        RestGateway::new(&base_url, API_KEY, SessionStore::at_path(&path)).expect("gateway"),
    );
    let manager = SessionStateManager::new(gateway);
    manager.start().await;

    assert!(manager.is_initialized());
    assert!(!manager.is_authenticated());
    assert!(!manager.is_admin());
    assert!(!path.exists());

    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert!(!manager.is_authenticated());
}

#[tokio::test]
async fn manager_start_with_refreshed_session_holds_new_token() {
    let (base_url, _) = spawn_gateway_server().await;
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("session.json");
    seed_expired(&path, "admin", "refresh-ok").await;

    let gateway = Arc::new(
        RestGateway::new(&base_url, API_KEY, SessionStore::at_path(&path)).expect("gateway"),
    );
    let manager = SessionStateManager::new(gateway);
    manager.start().await;

    assert!(manager.is_admin());
    assert_eq!(
        manager.current_session().map(|session| session.access_token),
        Some("access-refreshed".to_string())
    );
}
