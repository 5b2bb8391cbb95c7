//! In-process mock registry for HTTP-level tests.
//!
//! Routes are matched newest first, so a test can mount generic content and
//! then override a single path (corruption, range replies, failures).

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

/// Canned response.
#[derive(Clone)]
pub struct Reply {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Reply {
    pub fn status(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn bytes(body: impl Into<Vec<u8>>) -> Self {
        Self::status(200).body(body)
    }

    pub fn typed(content_type: &str, body: impl Into<Vec<u8>>) -> Self {
        Self::bytes(body).header("content-type", content_type)
    }

    pub fn json(value: serde_json::Value) -> Self {
        Self::typed("application/json", value.to_string())
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    fn into_response(self) -> Response {
        let mut builder = axum::http::Response::builder().status(self.status);
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder
            .body(Body::from(self.body))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }
}

struct Route {
    path: String,
    headers: Vec<(String, String)>,
    query: Vec<(String, String)>,
    remaining: Option<usize>,
    reply: Reply,
}

impl Route {
    fn matches(&self, request: &Recorded) -> bool {
        self.path == request.path
            && self.remaining != Some(0)
            && self
                .headers
                .iter()
                .all(|(k, v)| request.headers.get(k) == Some(v))
            && self
                .query
                .iter()
                .all(|(k, v)| request.query.get(k) == Some(v))
    }
}

/// A request the mock received.
#[derive(Clone, Debug)]
pub struct Recorded {
    pub path: String,
    pub headers: HashMap<String, String>,
    pub query: HashMap<String, String>,
}

#[derive(Default)]
struct Shared {
    routes: Mutex<Vec<Route>>,
    requests: Mutex<Vec<Recorded>>,
}

pub struct MockRegistry {
    host: String,
    shared: Arc<Shared>,
    _server: JoinHandle<()>,
}

/// Route under construction; mounted by [`RouteBuilder::reply`].
pub struct RouteBuilder<'a> {
    registry: &'a MockRegistry,
    route: Route,
}

impl RouteBuilder<'_> {
    /// Only match requests carrying this header value.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.route
            .headers
            .push((name.to_ascii_lowercase(), value.to_string()));
        self
    }

    /// Only match requests with this query parameter.
    pub fn query(mut self, name: &str, value: &str) -> Self {
        self.route.query.push((name.to_string(), value.to_string()));
        self
    }

    /// Stop matching after `n` requests.
    pub fn times(mut self, n: usize) -> Self {
        self.route.remaining = Some(n);
        self
    }

    pub fn reply(mut self, reply: Reply) {
        self.route.reply = reply;
        self.registry.shared.routes.lock().push(self.route);
    }
}

impl MockRegistry {
    pub async fn start() -> Self {
        let shared = Arc::new(Shared::default());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let host = listener.local_addr().unwrap().to_string();
        let app = Router::new().fallback(handle).with_state(shared.clone());
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            host,
            shared,
            _server: server,
        }
    }

    /// `127.0.0.1:<port>`
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn uri(&self) -> String {
        format!("http://{}", self.host)
    }

    pub fn on(&self, path: impl Into<String>) -> RouteBuilder<'_> {
        RouteBuilder {
            registry: self,
            route: Route {
                path: path.into(),
                headers: Vec::new(),
                query: Vec::new(),
                remaining: None,
                reply: Reply::status(404),
            },
        }
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.shared.requests.lock().clone()
    }

    /// Number of requests whose path ends with `suffix`.
    pub fn hits(&self, suffix: &str) -> usize {
        self.shared
            .requests
            .lock()
            .iter()
            .filter(|r| r.path.ends_with(suffix))
            .count()
    }

    /// Forget all routes and recorded requests.
    pub fn reset(&self) {
        self.shared.routes.lock().clear();
        self.shared.requests.lock().clear();
    }
}

async fn handle(
    State(shared): State<Arc<Shared>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    let request = Recorded {
        path: uri.path().to_string(),
        headers: headers
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
            .collect(),
        query,
    };
    shared.requests.lock().push(request.clone());

    let reply = {
        let mut routes = shared.routes.lock();
        routes
            .iter_mut()
            .rev()
            .find(|route| route.matches(&request))
            .map(|route| {
                if let Some(remaining) = route.remaining.as_mut() {
                    *remaining -= 1;
                }
                route.reply.clone()
            })
    };

    match reply {
        Some(reply) => reply.into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
