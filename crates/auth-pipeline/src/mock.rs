//! In-process API server for tests
//!
//! Serves the auth endpoints plus a few protected and public resources on
//! `127.0.0.1:0`. Protected routes accept exactly one bearer token, which
//! login and refresh replace, so a test can revoke a credential server-side
//! by pointing `accepted` elsewhere.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::{Value, json};
use tokio::net::TcpListener;

/// How long `/slow/{id}` waits before checking the token.
pub const SLOW_RESPONSE: Duration = Duration::from_millis(200);

/// `exp` for tokens that stay valid for the whole test run (2100-01-01).
const FAR_FUTURE: i64 = 4_102_444_800;

/// `exp` for tokens that are already expired.
const LONG_AGO: i64 = 1_000_000_000;

/// Unsigned JWT-shaped token whose `sub` claim is `label`.
pub fn jwt(label: &str, exp: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"{label}","exp":{exp}}}"#));
    format!("{header}.{payload}.c2lnbmF0dXJl")
}

pub fn valid_token(label: &str) -> String {
    jwt(label, FAR_FUTURE)
}

pub fn expired_token(label: &str) -> String {
    jwt(label, LONG_AGO)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshMode {
    /// New access token, refresh token unchanged.
    Issue,
    /// New access token and new refresh token.
    Rotate,
    /// Fail with this status.
    Reject(u16),
}

struct MockState {
    refresh_mode: Mutex<RefreshMode>,
    refresh_delay: Mutex<Duration>,
    refresh_calls: AtomicUsize,
    last_refresh_body: Mutex<Option<Value>>,
    login_access: Mutex<String>,
    accepted: Mutex<String>,
    item_calls: AtomicUsize,
    logout_calls: AtomicUsize,
    last_logout: Mutex<Option<(Option<String>, Value)>>,
}

impl MockState {
    fn accept(&self, token: &str) {
        *self.accepted.lock().unwrap() = token.to_string();
    }

    fn bearer_matches(&self, headers: &HeaderMap) -> bool {
        let accepted = self.accepted.lock().unwrap();
        bearer(headers).is_some_and(|token| !accepted.is_empty() && token == *accepted)
    }
}

fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}

pub struct MockApi {
    pub url: String,
    state: Arc<MockState>,
    _server: tokio::task::JoinHandle<()>,
}

impl MockApi {
    pub async fn start() -> Self {
        let state = Arc::new(MockState {
            refresh_mode: Mutex::new(RefreshMode::Issue),
            refresh_delay: Mutex::new(Duration::ZERO),
            refresh_calls: AtomicUsize::new(0),
            last_refresh_body: Mutex::new(None),
            login_access: Mutex::new(valid_token("A1")),
            accepted: Mutex::new(String::new()),
            item_calls: AtomicUsize::new(0),
            logout_calls: AtomicUsize::new(0),
            last_logout: Mutex::new(None),
        });

        let app = Router::new()
            .route("/auth/refresh", post(refresh))
            .route("/auth/login", post(login))
            .route("/auth/register", post(register))
            .route("/auth/logout", post(logout))
            .route("/items/{id}", get(item))
            .route("/slow/{id}", get(slow_item))
            .route("/always-401", get(always_unauthorized))
            .route("/broken-json", get(broken_json))
            .route("/missing", get(missing))
            .route("/public", get(public))
            .route("/no-content", get(no_content))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            url: format!("http://{addr}"),
            state,
            _server: server,
        }
    }

    pub fn set_refresh_mode(&self, mode: RefreshMode) {
        *self.state.refresh_mode.lock().unwrap() = mode;
    }

    pub fn set_refresh_delay(&self, delay: Duration) {
        *self.state.refresh_delay.lock().unwrap() = delay;
    }

    /// Make login hand out an access token that is already expired.
    pub fn expire_login_token(&self) {
        *self.state.login_access.lock().unwrap() = expired_token("A1");
    }

    /// Token protected routes accept from now on.
    pub fn accept(&self, token: &str) {
        self.state.accept(token);
    }

    /// Access token the `n`th refresh hands out (1-based).
    pub fn issued_token(&self, n: usize) -> String {
        valid_token(&format!("A{}", n + 1))
    }

    pub fn refresh_calls(&self) -> usize {
        self.state.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn item_calls(&self) -> usize {
        self.state.item_calls.load(Ordering::SeqCst)
    }

    pub fn logout_calls(&self) -> usize {
        self.state.logout_calls.load(Ordering::SeqCst)
    }

    pub fn last_refresh_body(&self) -> Option<Value> {
        self.state.last_refresh_body.lock().unwrap().clone()
    }

    /// Bearer token and body of the last logout call.
    pub fn last_logout(&self) -> Option<(Option<String>, Value)> {
        self.state.last_logout.lock().unwrap().clone()
    }
}

async fn refresh(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> Response {
    let n = state.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
    *state.last_refresh_body.lock().unwrap() = Some(body);

    let delay = *state.refresh_delay.lock().unwrap();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let mode = *state.refresh_mode.lock().unwrap();
    let access = valid_token(&format!("A{}", n + 1));
    match mode {
        RefreshMode::Issue => {
            state.accept(&access);
            Json(json!({ "access": access })).into_response()
        }
        RefreshMode::Rotate => {
            state.accept(&access);
            Json(json!({ "access": access, "refresh": format!("R{}", n + 1) })).into_response()
        }
        RefreshMode::Reject(status) => (
            StatusCode::from_u16(status).unwrap(),
            Json(json!({ "detail": "Token is invalid or expired", "code": "token_not_valid" })),
        )
            .into_response(),
    }
}

async fn login(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> Response {
    if body["username"] != "alice" || body["password"] != "pw" {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "detail": "No active account found with the given credentials" })),
        )
            .into_response();
    }
    let access = state.login_access.lock().unwrap().clone();
    state.accept(&access);
    Json(json!({
        "access": access,
        "refresh": "R1",
        "user": { "id": 1, "username": "alice" },
    }))
    .into_response()
}

async fn register(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> Response {
    let Some(username) = body["username"].as_str() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "username": ["This field is required."] })),
        )
            .into_response();
    };
    let access = valid_token("A1");
    state.accept(&access);
    Json(json!({
        "user": { "id": 2, "username": username },
        "tokens": { "access": access, "refresh": "R1" },
    }))
    .into_response()
}

async fn logout(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> StatusCode {
    state.logout_calls.fetch_add(1, Ordering::SeqCst);
    *state.last_logout.lock().unwrap() = Some((bearer(&headers), body));
    StatusCode::RESET_CONTENT
}

async fn item(
    State(state): State<Arc<MockState>>,
    Path(id): Path<u64>,
    headers: HeaderMap,
) -> Response {
    state.item_calls.fetch_add(1, Ordering::SeqCst);
    if !state.bearer_matches(&headers) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "detail": "Given token not valid for any token type" })),
        )
            .into_response();
    }
    Json(json!({ "id": id, "token": bearer(&headers) })).into_response()
}

/// Like `item`, but checks the token only after a delay, so a call can
/// present a credential that is replaced while it is in flight.
async fn slow_item(
    State(state): State<Arc<MockState>>,
    Path(id): Path<u64>,
    headers: HeaderMap,
) -> Response {
    tokio::time::sleep(SLOW_RESPONSE).await;
    item(State(state), Path(id), headers).await
}

async fn always_unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({ "detail": "nope" }))).into_response()
}

async fn broken_json() -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        "{\"id\": 1,",
    )
        .into_response()
}

async fn missing() -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "detail": "Not found." }))).into_response()
}

async fn public(headers: HeaderMap) -> Json<Value> {
    Json(json!({ "public": true, "had_credentials": headers.contains_key(header::AUTHORIZATION) }))
}

async fn no_content() -> StatusCode {
    StatusCode::NO_CONTENT
}
