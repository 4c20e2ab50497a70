//! Site roots and the registry that resolves requests to them.
//!
//! Every directory under the sites path is one root. Its name encodes the
//! routing rule: `<domain>_<segment>_<segment>...`, where an empty domain
//! matches any host and the segments form the URL namespace.

use std::cmp::Reverse;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use crate::bus::NotifyBus;
use crate::error::{Error, Result};

/// Separator between the domain and namespace segments of a root directory name.
pub const ROOTDIR_DELIMITER: char = '_';

/// One site root, parsed once from its directory name.
#[derive(Debug)]
pub struct Root {
    dir: String,
    domain: String,
    namespace: String,
    depth: usize,
    path: PathBuf,
    bus: NotifyBus,
}

impl Root {
    /// Parse a root from its directory name inside `sites_path`.
    pub fn parse(sites_path: &Path, dir: &str) -> Self {
        let mut parts = dir.split(ROOTDIR_DELIMITER);
        let domain = parts.next().unwrap_or_default().to_string();
        let segments: Vec<&str> = parts.collect();
        let depth = segments.iter().filter(|s| !s.is_empty()).count();

        Self {
            dir: dir.to_string(),
            domain,
            namespace: format!("/{}", segments.join("/")),
            depth,
            path: sites_path.join(dir),
            bus: NotifyBus::new(),
        }
    }

    /// Directory name this root was parsed from.
    pub fn dir(&self) -> &str {
        &self.dir
    }

    /// Host fragment this root answers for; empty means any host.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// URL prefix owned by this root, always starting with `/`.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Number of non-empty namespace segments.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Whether the root matches every host.
    pub fn is_wildcard(&self) -> bool {
        self.domain.is_empty()
    }

    /// Filesystem directory holding the root's scripts and assets.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Long-poll bus scoped to this root.
    pub fn bus(&self) -> &NotifyBus {
        &self.bus
    }

    /// Whether a request for `host` and `path` belongs to this root.
    pub fn matches(&self, host: &str, path: &str) -> bool {
        (self.is_wildcard() || host.contains(&self.domain)) && path.starts_with(&self.namespace)
    }

    /// Strip the query string and the namespace from a request path.
    ///
    /// The result always starts with `/`.
    pub fn relative_path(&self, url: &str) -> String {
        let path = url.split('?').next().unwrap_or_default();
        if self.namespace.len() <= 1 {
            return path.to_string();
        }
        let rest = path.get(self.namespace.len()..).unwrap_or_default();
        if rest.starts_with('/') {
            rest.to_string()
        } else {
            format!("/{rest}")
        }
    }

    /// Ordering key: deeper namespaces first, wildcard domains first among
    /// equal depth, then longer names, then by name for determinism.
    fn rank(&self) -> (Reverse<usize>, bool, Reverse<usize>, &str) {
        (
            Reverse(self.depth),
            !self.is_wildcard(),
            Reverse(self.dir.len()),
            &self.dir,
        )
    }
}

/// Append-only set of roots under one sites directory.
///
/// Readers take a snapshot of the ranked list; reloads build a new list and
/// swap it in, so resolution never waits on a rescan.
#[derive(Debug)]
pub struct RootRegistry {
    sites_path: PathBuf,
    roots: RwLock<Arc<[Arc<Root>]>>,
}

impl RootRegistry {
    /// Scan `sites_path` and build the initial registry.
    pub fn scan(sites_path: impl AsRef<Path>) -> Result<Self> {
        let sites_path = sites_path.as_ref().to_path_buf();
        let mut roots: Vec<Arc<Root>> = list_root_dirs(&sites_path)?
            .iter()
            .map(|dir| Arc::new(Root::parse(&sites_path, dir)))
            .collect();
        roots.sort_by(|a, b| a.rank().cmp(&b.rank()));

        Ok(Self {
            sites_path,
            roots: RwLock::new(roots.into()),
        })
    }

    /// Sites directory this registry was built from.
    pub fn sites_path(&self) -> &Path {
        &self.sites_path
    }

    /// Current ranked list of roots.
    pub fn roots(&self) -> Arc<[Arc<Root>]> {
        self.roots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Find the highest-ranked root matching `host` and `path`.
    pub fn resolve(&self, host: &str, path: &str) -> Option<Arc<Root>> {
        self.roots()
            .iter()
            .find(|root| root.matches(host, path))
            .cloned()
    }

    /// Rescan the sites directory and add roots whose directory is new.
    ///
    /// Existing roots are kept as they are, including ones whose directory
    /// has disappeared. Returns the roots that were added.
    pub fn reload(&self) -> Result<Vec<Arc<Root>>> {
        let dirs = list_root_dirs(&self.sites_path)?;

        let mut guard = self.roots.write().unwrap_or_else(PoisonError::into_inner);
        let added: Vec<Arc<Root>> = dirs
            .iter()
            .filter(|dir| !guard.iter().any(|root| root.dir() == dir.as_str()))
            .map(|dir| Arc::new(Root::parse(&self.sites_path, dir)))
            .collect();

        if !added.is_empty() {
            let mut roots: Vec<Arc<Root>> = guard.iter().cloned().collect();
            roots.extend(added.iter().cloned());
            roots.sort_by(|a, b| a.rank().cmp(&b.rank()));
            *guard = roots.into();
        }

        Ok(added)
    }

    /// Forget every recorded wait token on every root.
    pub fn sweep_waits(&self) {
        for root in self.roots().iter() {
            root.bus().sweep_waits();
        }
    }
}

/// List candidate root directory names, skipping hidden entries and plain files.
fn list_root_dirs(sites_path: &Path) -> Result<Vec<String>> {
    let entries = std::fs::read_dir(sites_path).map_err(|source| Error::SitesDir {
        path: sites_path.to_path_buf(),
        source,
    })?;

    let mut dirs = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        dirs.push(name);
    }
    Ok(dirs)
}
