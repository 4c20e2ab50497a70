//! Query strings and form bodies.
//!
//! POST and PUT requests carrying `multipart/form-data` or
//! `application/x-www-form-urlencoded` bodies have their fields copied into
//! the script environment. Uploaded files are written to a per-request
//! temporary directory that lives until the script has finished.

use std::path::{Path, PathBuf};

use axum::extract::{FromRequest, Multipart, Request};
use axum::http::{Method, header};
use tokio::io::AsyncWriteExt;
use url::form_urlencoded;
use xcgi_core::{EnvBuilder, Fields};

use crate::error::{ServerError, ServerResult};

/// Group `key=value` pairs by key, keeping first-seen key order.
pub fn group_pairs(pairs: impl IntoIterator<Item = (String, String)>) -> Fields {
    let mut fields: Fields = Vec::new();
    for (key, value) in pairs {
        match fields.iter_mut().find(|(k, _)| *k == key) {
            Some((_, values)) => values.push(value),
            None => fields.push((key, vec![value])),
        }
    }
    fields
}

/// Parse a raw query string into grouped fields.
pub fn parse_query(query: Option<&str>) -> Fields {
    let query = query.unwrap_or_default();
    group_pairs(
        form_urlencoded::parse(query.as_bytes()).map(|(k, v)| (k.into_owned(), v.into_owned())),
    )
}

/// First value of `key`, if present.
pub fn first<'a>(fields: &'a Fields, key: &str) -> Option<&'a str> {
    fields
        .iter()
        .find(|(k, _)| k == key)
        .and_then(|(_, values)| values.first())
        .map(String::as_str)
}

/// How a request body should be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    Multipart,
    UrlEncoded,
    Ignored,
}

impl BodyKind {
    pub fn of(request: &Request) -> Self {
        if !matches!(*request.method(), Method::POST | Method::PUT) {
            return BodyKind::Ignored;
        }
        let content_type = request
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if content_type.starts_with("multipart/form-data") {
            BodyKind::Multipart
        } else if content_type.starts_with("application/x-www-form-urlencoded") {
            BodyKind::UrlEncoded
        } else {
            BodyKind::Ignored
        }
    }
}

/// Temporary directory holding a request's uploaded files.
///
/// Removed with everything in it on drop.
#[derive(Debug, Default)]
pub struct Uploads {
    dir: Option<PathBuf>,
}

impl Uploads {
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    async fn ensure_dir(&mut self) -> ServerResult<PathBuf> {
        if let Some(dir) = &self.dir {
            return Ok(dir.clone());
        }
        let dir = std::env::temp_dir().join(format!("xcgi-upload-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.map_err(|e| ServerError::Io {
            path: dir.clone(),
            message: e.to_string(),
        })?;
        self.dir = Some(dir.clone());
        Ok(dir)
    }
}

impl Drop for Uploads {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take()
            && let Err(e) = std::fs::remove_dir_all(&dir)
        {
            tracing::warn!("Failed to remove upload directory {}: {}", dir.display(), e);
        }
    }
}

/// Read the request body into `env` as `_POST_*` and `_FILES_*` variables.
pub async fn read_body(request: Request, env: &mut EnvBuilder) -> ServerResult<Uploads> {
    match BodyKind::of(&request) {
        BodyKind::Multipart => read_multipart(request, env).await,
        BodyKind::UrlEncoded => {
            let bytes = axum::body::to_bytes(request.into_body(), usize::MAX)
                .await
                .map_err(|e| ServerError::Body(e.to_string()))?;
            let fields = group_pairs(
                form_urlencoded::parse(&bytes).map(|(k, v)| (k.into_owned(), v.into_owned())),
            );
            env.post_fields(&fields);
            Ok(Uploads::default())
        }
        BodyKind::Ignored => Ok(Uploads::default()),
    }
}

async fn read_multipart(request: Request, env: &mut EnvBuilder) -> ServerResult<Uploads> {
    let mut multipart = Multipart::from_request(request, &())
        .await
        .map_err(|e| ServerError::Body(e.to_string()))?;
    let mut uploads = Uploads::default();
    let mut posted = Vec::new();
    let mut files = Vec::new();

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| ServerError::Body(e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let Some(file_name) = field.file_name().map(str::to_string) else {
            let value = field
                .text()
                .await
                .map_err(|e| ServerError::Body(e.to_string()))?;
            posted.push((name, value));
            continue;
        };

        let dir = uploads.ensure_dir().await?;
        let extension = Path::new(&file_name)
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy()))
            .unwrap_or_default();
        let path = dir.join(format!("{}{}", uuid::Uuid::new_v4(), extension));
        let mut file = tokio::fs::File::create(&path).await?;
        let mut size = 0usize;
        while let Some(chunk) = field
            .chunk()
            .await
            .map_err(|e| ServerError::Body(e.to_string()))?
        {
            size += chunk.len();
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        // Empty file inputs are submitted by browsers even when nothing was picked.
        if size == 0 {
            tokio::fs::remove_file(&path).await?;
            continue;
        }
        files.push((name, path.to_string_lossy().to_string()));
    }

    env.post_fields(&group_pairs(posted));
    env.files(&group_pairs(files));
    Ok(uploads)
}
