//! REST-style path decomposition and script selection.
//!
//! `/users/7/posts` reads as `[(users, 7), (posts, -)]`. The HTTP verb and
//! whether the final pair has an id pick one of the conventional scripts in
//! the final resource's directory.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Script run when the routed one does not exist, looked up at the root's top directory.
pub const DEFAULT_SCRIPT: &str = "default.sh";

/// One `(resource, id)` pair from a URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathObject {
    pub resource: String,
    pub id: Option<String>,
}

impl PathObject {
    pub fn new(resource: impl Into<String>, id: Option<&str>) -> Self {
        Self {
            resource: resource.into(),
            id: id.map(str::to_string),
        }
    }
}

/// Split a namespace-relative path into resource/id pairs.
///
/// Empty segments are dropped; a trailing unpaired segment has no id.
pub fn decompose(path: &str) -> Vec<PathObject> {
    let mut objects: Vec<PathObject> = Vec::new();
    for (i, segment) in path.split('/').filter(|s| !s.is_empty()).enumerate() {
        if i % 2 == 0 {
            objects.push(PathObject::new(segment, None));
        } else if let Some(last) = objects.last_mut() {
            last.id = Some(segment.to_string());
        }
    }
    objects
}

/// Join path objects back into a `/`-separated path.
pub fn join(objects: &[PathObject]) -> String {
    let mut path = String::new();
    for object in objects {
        path.push('/');
        path.push_str(&object.resource);
        if let Some(id) = &object.id {
            path.push('/');
            path.push_str(id);
        }
    }
    if path.is_empty() {
        path.push('/');
    }
    path
}

/// Collection scope invalidated by a mutation: every pair except the final id.
pub fn notify_id(objects: &[PathObject]) -> String {
    match objects.split_last() {
        Some((last, parents)) => {
            let mut scope = parents.to_vec();
            scope.push(PathObject::new(last.resource.clone(), None));
            join(&scope)
        }
        None => join(&[]),
    }
}

/// The conventional scripts a request can route to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptKind {
    Index,
    Show,
    Create,
    Update,
    Destroy,
}

impl ScriptKind {
    /// Script file name inside the resource directory.
    pub fn file_name(self) -> &'static str {
        match self {
            ScriptKind::Index => "index.sh",
            ScriptKind::Show => "show.sh",
            ScriptKind::Create => "create.sh",
            ScriptKind::Update => "update.sh",
            ScriptKind::Destroy => "destroy.sh",
        }
    }

    /// Whether a successful run of this script notifies waiters.
    pub fn is_mutation(self) -> bool {
        matches!(self, ScriptKind::Create | ScriptKind::Update | ScriptKind::Destroy)
    }
}

impl fmt::Display for ScriptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_name())
    }
}

/// Pick the script for an HTTP method; unsupported methods get `None`.
pub fn choose_script(method: &str, objects: &[PathObject]) -> Option<ScriptKind> {
    match method {
        "GET" => match objects.last() {
            Some(PathObject { id: Some(_), .. }) => Some(ScriptKind::Show),
            _ => Some(ScriptKind::Index),
        },
        "POST" => Some(ScriptKind::Create),
        "PUT" => Some(ScriptKind::Update),
        "DELETE" => Some(ScriptKind::Destroy),
        _ => None,
    }
}

/// Where a chosen script lives and runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptLocation {
    /// Working directory for the process.
    pub work_dir: PathBuf,
    /// Script file name relative to `work_dir`.
    pub file_name: String,
}

impl ScriptLocation {
    pub fn script_path(&self) -> PathBuf {
        self.work_dir.join(&self.file_name)
    }
}

/// Find the script for `kind` under `root_dir`, falling back once to
/// [`DEFAULT_SCRIPT`] at the top of the root.
///
/// The script directory is the final resource's name. Resource names that
/// would leave the root (`.`/`..`) route straight to the fallback.
pub async fn locate_script(
    root_dir: &Path,
    objects: &[PathObject],
    kind: ScriptKind,
) -> Result<ScriptLocation> {
    let resource = objects.last().map_or("", |o| o.resource.as_str());
    if resource != "." && resource != ".." {
        let work_dir = root_dir.join(resource);
        if is_file(&work_dir.join(kind.file_name())).await {
            return Ok(ScriptLocation {
                work_dir,
                file_name: kind.file_name().to_string(),
            });
        }
    }

    if is_file(&root_dir.join(DEFAULT_SCRIPT)).await {
        return Ok(ScriptLocation {
            work_dir: root_dir.to_path_buf(),
            file_name: DEFAULT_SCRIPT.to_string(),
        });
    }

    Err(Error::ScriptNotFound {
        path: root_dir.join(resource).join(kind.file_name()),
    })
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .is_ok_and(|meta| meta.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_decompose_pairs() {
        assert_eq!(
            decompose("/users/7/posts"),
            vec![PathObject::new("users", Some("7")), PathObject::new("posts", None)]
        );
        assert_eq!(decompose("/orders/42"), vec![PathObject::new("orders", Some("42"))]);
        assert_eq!(decompose("//orders//42/"), vec![PathObject::new("orders", Some("42"))]);
        assert!(decompose("/").is_empty());
        assert!(decompose("").is_empty());
    }

    #[test]
    fn test_decompose_then_join() {
        for path in ["/users/7/posts", "/orders/42", "/a/1/b/2/c/3", "/"] {
            assert_eq!(join(&decompose(path)), path);
        }
        assert_eq!(join(&decompose("orders/42/")), "/orders/42");
    }

    #[test]
    fn test_notify_id_drops_final_id() {
        assert_eq!(notify_id(&decompose("/orders/42")), "/orders");
        assert_eq!(notify_id(&decompose("/orders")), "/orders");
        assert_eq!(notify_id(&decompose("/users/7/posts/3")), "/users/7/posts");
        assert_eq!(notify_id(&decompose("/users/7/posts")), "/users/7/posts");
        assert_eq!(notify_id(&[]), "/");
    }

    #[test]
    fn test_choose_script() {
        let item = decompose("/orders/42");
        let list = decompose("/orders");
        assert_eq!(choose_script("GET", &item), Some(ScriptKind::Show));
        assert_eq!(choose_script("GET", &list), Some(ScriptKind::Index));
        assert_eq!(choose_script("GET", &[]), Some(ScriptKind::Index));
        assert_eq!(choose_script("POST", &list), Some(ScriptKind::Create));
        assert_eq!(choose_script("PUT", &item), Some(ScriptKind::Update));
        assert_eq!(choose_script("DELETE", &item), Some(ScriptKind::Destroy));
        assert_eq!(choose_script("PATCH", &item), None);
    }

    #[test]
    fn test_mutations() {
        assert!(!ScriptKind::Index.is_mutation());
        assert!(!ScriptKind::Show.is_mutation());
        assert!(ScriptKind::Create.is_mutation());
        assert!(ScriptKind::Update.is_mutation());
        assert!(ScriptKind::Destroy.is_mutation());
    }

    #[tokio::test]
    async fn test_locate_script_prefers_resource_dir() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir(temp.path().join("orders")).unwrap();
        std::fs::write(temp.path().join("orders/show.sh"), "").unwrap();
        std::fs::write(temp.path().join(DEFAULT_SCRIPT), "").unwrap();

        let found = locate_script(temp.path(), &decompose("/orders/42"), ScriptKind::Show)
            .await
            .unwrap();
        assert_eq!(found.work_dir, temp.path().join("orders"));
        assert_eq!(found.file_name, "show.sh");
    }

    #[tokio::test]
    async fn test_locate_script_falls_back_to_default() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join(DEFAULT_SCRIPT), "").unwrap();

        let found = locate_script(temp.path(), &decompose("/orders"), ScriptKind::Create)
            .await
            .unwrap();
        assert_eq!(found.work_dir, temp.path());
        assert_eq!(found.file_name, DEFAULT_SCRIPT);

        let escaped = locate_script(temp.path(), &decompose("/.."), ScriptKind::Index)
            .await
            .unwrap();
        assert_eq!(escaped.file_name, DEFAULT_SCRIPT);
    }

    #[tokio::test]
    async fn test_locate_script_missing() {
        let temp = TempDir::new().unwrap();
        let err = locate_script(temp.path(), &decompose("/orders"), ScriptKind::Index)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ScriptNotFound { .. }));
    }
}
