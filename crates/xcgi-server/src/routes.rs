//! HTTP routes for the xcgi server.
//!
//! Every request goes through [`dispatch`]: resolve the root, answer CORS
//! preflights, try the static layer, then run the matching script.

use std::io;
use std::sync::Arc;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::header::{self, HeaderMap, HeaderValue};
use axum::http::{Method, StatusCode, Version};
use axum::response::{IntoResponse, Response};
use xcgi_core::bus::{self, Gate};
use xcgi_core::{
    EnvBuilder, ExecutionRequest, Executor, Fields, RequestMeta, RootRegistry, ScriptOutput,
};
use xcgi_core::rest;

use crate::assets::StaticFiles;
use crate::form;

/// Query parameter carrying a long-poll token.
pub const WAIT_PARAM: &str = "_wait";

const CORS_ALLOW_METHODS: &str = "POST, GET, PUT, DELETE, OPTIONS";
const CORS_ALLOW_HEADERS: &str = "X-Requested-With, X-HTTP-Method-Override, Content-Type, Accept";
const CORS_MAX_AGE: &str = "86400";

/// Application state shared across handlers.
pub struct AppState {
    /// Known site roots.
    pub registry: Arc<RootRegistry>,
    /// Script runner shared by all roots.
    pub executor: Executor,
    /// Static file handler of each root.
    pub statics: StaticFiles,
    /// Environment every script starts from.
    pub base_env: Vec<(String, String)>,
}

impl AppState {
    /// Build state whose scripts inherit this process's environment.
    pub fn new(registry: Arc<RootRegistry>, executor: Executor) -> Self {
        Self {
            statics: StaticFiles::new(&registry.roots()),
            registry,
            executor,
            base_env: std::env::vars().collect(),
        }
    }
}

/// Create the dispatching router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .fallback(dispatch)
        .layer(DefaultBodyLimit::disable())
        .with_state(state)
}

/// Create a router that sends every request to the HTTPS listener.
pub fn create_redirect_router(https_port: u16) -> Router {
    Router::new().fallback(move |request: Request| async move { redirect(https_port, &request) })
}

async fn dispatch(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let host = request_host(&parts.headers, &parts.uri);
    let path = parts.uri.path().to_string();

    let Some(root) = state.registry.resolve(&host, &path) else {
        tracing::debug!(%host, %path, "No root for request");
        return not_found();
    };

    if parts.method == Method::OPTIONS {
        return preflight();
    }

    let relative = root.relative_path(&path);
    if let Some(response) = state
        .statics
        .try_serve(&root, &relative, &parts.method, &parts.headers)
        .await
    {
        return response;
    }

    let objects = rest::decompose(&relative);
    let Some(kind) = rest::choose_script(parts.method.as_str(), &objects) else {
        return not_found();
    };
    let location = match rest::locate_script(root.path(), &objects, kind).await {
        Ok(location) => location,
        Err(e) => {
            tracing::debug!("{}", e);
            return not_found();
        }
    };

    let query = form::parse_query(parts.uri.query());
    let headers = header_pairs(&parts.headers);
    let mut env = EnvBuilder::new(state.base_env.iter().cloned()).request(&RequestMeta {
        url: &path,
        method: parts.method.as_str(),
        http_version: http_version(parts.version),
        headers: &headers,
        query: &query,
        objects: &objects,
        document_root: root.path(),
    });

    let notify_id = rest::notify_id(&objects);
    if parts.method == Method::GET
        && let Some(token) = wait_token(&query)
    {
        let wait_id = bus::wait_id(token).to_string();
        if let Gate::Closed(subscription) = root.bus().gate(&notify_id, &wait_id) {
            subscription.notified().await;
            tracing::debug!(%notify_id, %wait_id, "Long-poll released");
        }
        root.bus().record_wait(&wait_id);
    }

    let uploads = match form::read_body(Request::from_parts(parts, body), &mut env).await {
        Ok(uploads) => uploads,
        Err(e) => {
            // Unparseable bodies answer 404, not 400.
            tracing::warn!("Failed to read request body: {}", e);
            return not_found();
        }
    };

    let execution = ExecutionRequest {
        work_dir: location.work_dir,
        script: location.file_name,
        env: env.build(),
    };
    let output = match state.executor.execute(execution).await {
        Ok(output) => output,
        Err(e) => {
            tracing::error!("{}", e);
            return abort_connection();
        }
    };
    drop(uploads);

    if kind.is_mutation() && output.is_success() {
        let released = root.bus().notify(&notify_id);
        tracing::debug!(%notify_id, released, "Notified scope");
    }

    script_response(output)
}

/// Long-poll token of a request. An empty `_wait=` asks for no wait.
fn wait_token(query: &Fields) -> Option<&str> {
    form::first(query, WAIT_PARAM).filter(|token| !token.is_empty())
}

/// Host the request was addressed to, from `Host` or the request target.
fn request_host(headers: &HeaderMap, uri: &axum::http::Uri) -> String {
    headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| uri.authority().map(|a| a.as_str()))
        .unwrap_or_default()
        .to_string()
}

/// Request headers as name/value pairs, repeated headers joined by `", "`.
fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .keys()
        .map(|name| {
            let joined = headers
                .get_all(name)
                .iter()
                .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
                .collect::<Vec<_>>()
                .join(", ");
            (name.as_str().to_string(), joined)
        })
        .collect()
}

fn http_version(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "0.9",
        Version::HTTP_10 => "1.0",
        Version::HTTP_2 => "2.0",
        Version::HTTP_3 => "3.0",
        _ => "1.1",
    }
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "404 Not Found").into_response()
}

fn preflight() -> Response {
    let mut response = StatusCode::OK.into_response();
    let headers = response.headers_mut();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(CORS_ALLOW_METHODS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
        HeaderValue::from_static("false"),
    );
    headers.insert(header::ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static(CORS_MAX_AGE));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(CORS_ALLOW_HEADERS),
    );
    response
}

fn script_response(output: ScriptOutput) -> Response {
    let status =
        StatusCode::from_u16(output.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (status, output.body).into_response();
    let headers = response.headers_mut();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    match output.content_type {
        Some(content_type) => {
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
        }
        None => {
            headers.remove(header::CONTENT_TYPE);
        }
    }
    response
}

/// A response whose body fails immediately, so the connection is torn down
/// without a usable answer.
fn abort_connection() -> Response {
    let failing = futures::stream::once(futures::future::ready(Err::<Bytes, _>(
        io::Error::new(io::ErrorKind::ConnectionAborted, "script terminated abnormally"),
    )));
    Response::new(Body::from_stream(failing))
}

fn redirect(https_port: u16, request: &Request) -> Response {
    let host = request_host(request.headers(), request.uri());
    let host = if https_port == 443 {
        host
    } else {
        let name = host.split(':').next().unwrap_or_default();
        format!("{name}:{https_port}")
    };
    let target = request
        .uri()
        .path_and_query()
        .map_or("/", |pq| pq.as_str());

    match HeaderValue::from_str(&format!("https://{host}{target}")) {
        Ok(location) => {
            let mut response = (StatusCode::FOUND, "302 Moved").into_response();
            response.headers_mut().insert(header::LOCATION, location);
            response
        }
        Err(_) => StatusCode::BAD_REQUEST.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_pairs_join_repeats() {
        let mut headers = HeaderMap::new();
        headers.append(header::ACCEPT, HeaderValue::from_static("text/html"));
        headers.append(header::ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert("x-trace-id", HeaderValue::from_static("abc"));

        let pairs = header_pairs(&headers);
        assert!(pairs.contains(&("accept".to_string(), "text/html, application/json".to_string())));
        assert!(pairs.contains(&("x-trace-id".to_string(), "abc".to_string())));
        assert_eq!(pairs.len(), 2);
    }

    #[test]
    fn test_empty_wait_token_is_ignored() {
        assert_eq!(wait_token(&form::parse_query(Some("_wait=tab-1"))), Some("tab-1"));
        assert_eq!(wait_token(&form::parse_query(Some("_wait="))), None);
        assert_eq!(wait_token(&form::parse_query(Some("page=2"))), None);
    }

    #[test]
    fn test_http_version_strings() {
        assert_eq!(http_version(Version::HTTP_10), "1.0");
        assert_eq!(http_version(Version::HTTP_11), "1.1");
        assert_eq!(http_version(Version::HTTP_2), "2.0");
    }

    #[test]
    fn test_script_response_headers() {
        let response = script_response(ScriptOutput {
            status: 204,
            content_type: None,
            body: Vec::new(),
        });
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert!(response.headers().get(header::CONTENT_TYPE).is_none());
    }

    #[test]
    fn test_redirect_location() {
        let request = Request::builder()
            .uri("/orders?page=2")
            .header(header::HOST, "shop.example.com:8080")
            .body(Body::empty())
            .unwrap();

        let response = redirect(8443, &request);
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers()[header::LOCATION],
            "https://shop.example.com:8443/orders?page=2"
        );

        let response = redirect(443, &request);
        assert_eq!(
            response.headers()[header::LOCATION],
            "https://shop.example.com:8080/orders?page=2"
        );
    }

    #[tokio::test]
    async fn test_abort_connection_body_fails() {
        let response = abort_connection();
        assert!(axum::body::to_bytes(response.into_body(), usize::MAX).await.is_err());
    }
}
