//! Static asset short-circuit.
//!
//! Requests for files with a known asset extension are served straight from
//! the root directory. Anything not found there falls through to scripts.

use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::Response;
use rustc_hash::FxHashMap;
use tower::ServiceExt;
use tower_http::services::ServeDir;
use xcgi_core::Root;

/// File extensions served as static assets.
pub const ASSET_EXTENSIONS: &[&str] = &[
    // documents
    "htm", "html", "txt", "js", "json", "pdf", "css", "csv", "tsv",
    // images
    "jpg", "png", "gif", "svg", "ico",
    // audio and video
    "wav", "webm", "ogg", "mp3", "mp4", "mpeg",
    // fonts
    "eot", "otf", "ttf", "woff", "woff2", "sfnt",
    // archives
    "zip", "tar", "gz", "tgz", "7z", "rar",
    // misc
    "map", "msi",
];

/// Whether a namespace-relative path names a static asset.
pub fn is_asset(path: &str) -> bool {
    Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            ASSET_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
}

/// Static file handlers, one per root.
///
/// A root's handler is built once and kept for the life of the server;
/// reloads only add handlers for new roots.
#[derive(Debug, Default)]
pub struct StaticFiles {
    handlers: RwLock<FxHashMap<String, ServeDir>>,
}

impl StaticFiles {
    /// Build handlers for `roots`.
    pub fn new(roots: &[Arc<Root>]) -> Self {
        let files = Self::default();
        files.add(roots);
        files
    }

    /// Add handlers for roots that do not have one yet.
    pub fn add(&self, roots: &[Arc<Root>]) {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        for root in roots {
            handlers
                .entry(root.dir().to_string())
                .or_insert_with(|| serve_dir(root.path()));
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The handler for `root`, created on first use if the root is new.
    fn handler(&self, root: &Root) -> ServeDir {
        if let Some(handler) = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(root.dir())
        {
            return handler.clone();
        }
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(root.dir().to_string())
            .or_insert_with(|| serve_dir(root.path()))
            .clone()
    }

    /// Try to serve `relative` from `root`.
    ///
    /// Returns `None` when the request is not for an asset or the file does
    /// not exist, so the caller can continue with dynamic dispatch.
    pub async fn try_serve(
        &self,
        root: &Root,
        relative: &str,
        method: &Method,
        headers: &HeaderMap,
    ) -> Option<Response> {
        if !matches!(*method, Method::GET | Method::HEAD) || !is_asset(relative) {
            return None;
        }
        let uri: Uri = relative.parse().ok()?;

        let mut static_request = Request::new(Body::empty());
        *static_request.method_mut() = method.clone();
        *static_request.uri_mut() = uri;
        *static_request.headers_mut() = headers.clone();

        let response = match self.handler(root).oneshot(static_request).await {
            Ok(response) => response,
            Err(never) => match never {},
        };

        if response.status() == StatusCode::NOT_FOUND {
            return None;
        }
        Some(response.map(Body::new))
    }
}

fn serve_dir(root_dir: &Path) -> ServeDir {
    ServeDir::new(root_dir).append_index_html_on_directories(false)
}
