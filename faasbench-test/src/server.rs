//! Exposes an in-process stand-in for deployed benchmark functions.
//!
//! ```
//! use faasbench_test::server::TestServer;
//!
//! #[tokio::main]
//! async fn main() {
//!    let server = TestServer::new().await;
//!    let url = server.url("/ok");
//!    // point a function config at the URL...
//! }
//! ```
//!
//! The server answers on these routes:
//!
//! - `/ok`: status 200 with the JSON body `{"ok":true}` and an `aws-request-id` header.
//! - `/fail`: status 500.
//! - `/flaky`: status 500 on the first request, then like `/ok`.
//! - `/garbage`: status 200 with a body that is not JSON.
//! - `/auth`: like `/ok` if the `x-api-key` header equals [`API_KEY`], otherwise status 401.
//! - `/token`: an OAuth token endpoint answering JWT bearer grants with [`ID_TOKEN`].

use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Mutex};

use axum::extract::{Form, State};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;

/// The key accepted by the `/auth` route.
pub const API_KEY: &str = "test-api-key";

/// The identity token issued by the `/token` route.
pub const ID_TOKEN: &str = "test-identity-token";

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

type Hits = Arc<Mutex<HashMap<String, usize>>>;

/// An in-process HTTP server for use in integration tests.
///
/// It listens on a random available port on localhost and counts the requests per path.
#[derive(Debug)]
pub struct TestServer {
    handle: tokio::task::JoinHandle<()>,
    socket: SocketAddr,
    hits: Hits,
}

impl TestServer {
    pub async fn new() -> Self {
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let listener = TcpListener::bind(addr).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();

        let hits = Hits::default();
        let app = Router::new()
            .route("/ok", get(ok))
            .route("/fail", get(fail))
            .route("/flaky", get(flaky))
            .route("/garbage", get(garbage))
            .route("/auth", get(auth))
            .route("/token", post(token))
            .with_state(hits.clone());

        let handle = tokio::spawn(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            handle,
            socket,
            hits,
        }
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.socket.port(), path)
    }

    /// Returns the number of requests received on the given path, ignoring the query.
    pub fn hits(&self, path: &str) -> usize {
        let hits = self.hits.lock().unwrap();
        hits.get(path).copied().unwrap_or_default()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn record(hits: &Hits, uri: &Uri) -> usize {
    let mut hits = hits.lock().unwrap();
    let count = hits.entry(uri.path().to_owned()).or_default();
    *count += 1;
    *count
}

fn success(request: usize) -> Response {
    (
        [("aws-request-id", format!("request-{request}"))],
        Json(json!({"ok": true})),
    )
        .into_response()
}

async fn ok(State(hits): State<Hits>, uri: Uri) -> Response {
    success(record(&hits, &uri))
}

async fn fail(State(hits): State<Hits>, uri: Uri) -> StatusCode {
    record(&hits, &uri);
    StatusCode::INTERNAL_SERVER_ERROR
}

async fn flaky(State(hits): State<Hits>, uri: Uri) -> Response {
    match record(&hits, &uri) {
        1 => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        request => success(request),
    }
}

async fn garbage(State(hits): State<Hits>, uri: Uri) -> &'static str {
    record(&hits, &uri);
    "<html>definitely not json</html>"
}

async fn auth(State(hits): State<Hits>, uri: Uri, headers: HeaderMap) -> Response {
    let request = record(&hits, &uri);
    match headers.get("x-api-key") {
        Some(key) if key == API_KEY => success(request),
        _ => StatusCode::UNAUTHORIZED.into_response(),
    }
}

async fn token(
    State(hits): State<Hits>,
    uri: Uri,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    record(&hits, &uri);

    let grant_type = form.get("grant_type").map(String::as_str);
    let assertion = form.get("assertion").map(String::as_str).unwrap_or_default();
    if grant_type != Some(JWT_BEARER_GRANT) || assertion.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "invalid_grant"})),
        )
            .into_response();
    }

    Json(json!({"id_token": ID_TOKEN})).into_response()
}
