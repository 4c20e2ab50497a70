//! xcgi HTTP server.
//!
//! Serves every site root under one sites directory by running shell
//! scripts chosen from the request's REST shape.
//!
//! # Architecture
//!
//! The server consists of:
//! - **Routes**: the request dispatcher and the HTTPS redirect handler
//! - **Form**: query string and request body parsing into the environment
//! - **Assets**: static file short-circuit
//! - **Watcher**: picks up site directories created while running

pub mod assets;
pub mod error;
pub mod form;
pub mod routes;
pub mod watcher;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum_server::Handle;
use axum_server::tls_rustls::RustlsConfig;
use tokio::task::{JoinHandle, JoinSet};
use xcgi_core::execute::default_max_instances;
use xcgi_core::{Executor, RootRegistry};

pub use assets::StaticFiles;
pub use error::{ServerError, ServerResult};
pub use routes::{AppState, create_redirect_router, create_router};
pub use watcher::SitesWatcher;

/// Environment variable naming the TLS private key file.
pub const HTTPS_KEY_VAR: &str = "XCGI_HTTPS_KEY";
/// Environment variable naming the TLS certificate file.
pub const HTTPS_CERT_VAR: &str = "XCGI_HTTPS_CERT";

/// How often remembered wait tokens are forgotten.
pub const WAIT_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// TLS key and certificate files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub key: PathBuf,
    pub cert: PathBuf,
}

impl TlsFiles {
    /// Read the key and certificate paths from the environment.
    ///
    /// Returns `None` unless both variables name existing files.
    pub fn from_env() -> Option<Self> {
        let key = PathBuf::from(std::env::var_os(HTTPS_KEY_VAR)?);
        let cert = PathBuf::from(std::env::var_os(HTTPS_CERT_VAR)?);
        (key.is_file() && cert.is_file()).then_some(Self { key, cert })
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Directory holding one subdirectory per site root.
    pub sites_path: PathBuf,
    /// Address the listeners bind to.
    pub bind_host: String,
    pub http_port: u16,
    pub https_port: u16,
    /// Run the HTTP listener.
    pub http: bool,
    /// Run the HTTPS listener.
    pub https: bool,
    /// Make the HTTP listener redirect to HTTPS instead of dispatching.
    pub redirect: bool,
    /// Most scripts running at once.
    pub max_instances: usize,
    /// Shell program scripts are run with.
    pub shell: String,
    pub tls: Option<TlsFiles>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            sites_path: PathBuf::from("."),
            bind_host: "0.0.0.0".to_string(),
            http_port: 80,
            https_port: 443,
            http: true,
            https: true,
            redirect: false,
            max_instances: default_max_instances(),
            shell: "bash".to_string(),
            tls: None,
        }
    }
}

impl ServerConfig {
    /// Settle which listeners run.
    ///
    /// HTTPS without usable key and certificate files is dropped when HTTP
    /// can still serve, and is an error otherwise. Redirecting needs both.
    pub fn resolve(mut self) -> ServerResult<Self> {
        if self.https && self.tls.is_none() {
            if !self.http {
                return Err(ServerError::Config(format!(
                    "HTTPS requires {HTTPS_KEY_VAR} and {HTTPS_CERT_VAR} to name existing files"
                )));
            }
            tracing::warn!(
                "HTTPS disabled: set {} and {} to enable it",
                HTTPS_KEY_VAR,
                HTTPS_CERT_VAR
            );
            self.https = false;
        }
        if !self.http && !self.https {
            return Err(ServerError::Config("No listener enabled".to_string()));
        }
        if self.redirect && !(self.http && self.https) {
            tracing::warn!("Redirect disabled: it needs both HTTP and HTTPS listeners");
            self.redirect = false;
        }
        Ok(self)
    }
}

/// Resolve the shell program on `PATH`, keeping the bare name when not found.
pub fn resolve_shell(shell: &str) -> PathBuf {
    which::which(shell).unwrap_or_else(|_| PathBuf::from(shell))
}

/// Start the xcgi server and run until a termination signal.
pub async fn serve(config: ServerConfig) -> ServerResult<()> {
    let config = config.resolve()?;
    let registry = Arc::new(RootRegistry::scan(&config.sites_path)?);
    let shell = resolve_shell(&config.shell);
    let executor = Executor::new(&shell, config.max_instances);

    greet(&config, &shell, &registry);

    let state = Arc::new(AppState::new(registry.clone(), executor.clone()));
    let watcher_task = spawn_watcher(state.clone())?;
    let sweep_task = tokio::spawn(sweep_waits(registry.clone()));

    let handle = Handle::new();
    let mut listeners = JoinSet::new();

    if config.http {
        let addr = socket_addr(&config.bind_host, config.http_port)?;
        let app = if config.redirect {
            create_redirect_router(config.https_port)
        } else {
            create_router(state.clone())
        };
        tracing::info!("Online at port {}", config.http_port);
        listeners.spawn(
            axum_server::bind(addr)
                .handle(handle.clone())
                .serve(app.into_make_service()),
        );
    }

    if config.https
        && let Some(tls) = &config.tls
    {
        let addr = socket_addr(&config.bind_host, config.https_port)?;
        let rustls = RustlsConfig::from_pem_file(&tls.cert, &tls.key)
            .await
            .map_err(|e| ServerError::Tls(e.to_string()))?;
        tracing::info!("Online at port {}", config.https_port);
        listeners.spawn(
            axum_server::bind_rustls(addr, rustls)
                .handle(handle.clone())
                .serve(create_router(state.clone()).into_make_service()),
        );
    }

    let outcome = tokio::select! {
        _ = shutdown_signal() => Ok(()),
        Some(joined) = listeners.join_next() => match joined {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ServerError::from(e)),
            Err(e) => Err(ServerError::Io {
                path: PathBuf::new(),
                message: e.to_string(),
            }),
        },
    };

    let killed = executor.groups().kill_all();
    if killed > 0 {
        tracing::info!("Killed {} running script(s)", killed);
    }

    handle.shutdown();
    listeners.abort_all();
    watcher_task.abort();
    sweep_task.abort();

    tracing::info!("Server shutdown complete");
    outcome
}

fn greet(config: &ServerConfig, shell: &Path, registry: &RootRegistry) {
    tracing::info!("Welcome to XCGI!");
    tracing::info!("Sites path at {}", registry.sites_path().display());
    tracing::info!("Max instances is {}", config.max_instances);
    tracing::info!("Shell used is {}", shell.display());
    tracing::info!("HTTP port is {}", config.http_port);
    tracing::info!("HTTPS port is {}", config.https_port);
    for root in registry.roots().iter() {
        tracing::info!("Site found: {}", root.dir());
    }
}

fn socket_addr(host: &str, port: u16) -> ServerResult<SocketAddr> {
    format!("{host}:{port}")
        .parse()
        .map_err(|_| ServerError::Config(format!("Invalid address: {host}:{port}")))
}

/// Add roots for site directories created after startup.
fn spawn_watcher(state: Arc<AppState>) -> ServerResult<JoinHandle<()>> {
    let mut watcher = SitesWatcher::new(state.registry.sites_path())?;
    Ok(tokio::spawn(async move {
        while watcher.recv().await.is_some() {
            match state.registry.reload() {
                Ok(added) => {
                    state.statics.add(&added);
                    for root in added {
                        tracing::info!("Site found: {}", root.dir());
                    }
                }
                Err(e) => tracing::warn!("Failed to rescan sites: {}", e),
            }
        }
    }))
}

async fn sweep_waits(registry: Arc<RootRegistry>) {
    let mut interval = tokio::time::interval(WAIT_SWEEP_INTERVAL);
    // The first tick completes immediately.
    interval.tick().await;
    loop {
        interval.tick().await;
        registry.sweep_waits();
        tracing::debug!("Cleared remembered wait tokens");
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let (Ok(mut term), Ok(mut int), Ok(mut hup)) = (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
        signal(SignalKind::hangup()),
    ) else {
        tracing::warn!("Cannot install signal handlers, waiting for Ctrl+C");
        let _ = tokio::signal::ctrl_c().await;
        return;
    };

    let name = tokio::select! {
        _ = term.recv() => "SIGTERM",
        _ = int.recv() => "SIGINT",
        _ = hup.recv() => "SIGHUP",
    };
    tracing::info!("Received {}", name);
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("Received shutdown signal");
    }
}
