//! xcgi CLI - serve site directories through shell scripts.

use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::{ArgAction, Parser};
use xcgi_server::{ServerConfig, TlsFiles};

#[derive(Parser, Debug)]
#[command(name = "xcgi")]
#[command(about = "Serve REST-shaped site directories by running shell scripts")]
#[command(version)]
#[command(disable_help_flag = true)]
struct Cli {
    /// Directory holding one subdirectory per site
    #[arg(default_value = ".")]
    sites_path: PathBuf,

    /// Ports as <http>:<https>, either side may be left empty
    #[arg(short = 'p', long = "ports", value_name = "HTTP:HTTPS")]
    ports: Option<String>,

    /// Serve HTTP only
    #[arg(short = 'h', long = "http-only", conflicts_with = "https_only")]
    http_only: bool,

    /// Serve HTTPS only
    #[arg(short = 's', long = "https-only")]
    https_only: bool,

    /// Redirect HTTP requests to HTTPS
    #[arg(short = 'r', long)]
    redirect: bool,

    /// Most scripts running at once
    #[arg(short = 'm', long = "max-instances")]
    max_instances: Option<usize>,

    /// Shell used to run scripts
    #[arg(long, default_value = "bash")]
    shell: String,

    /// Address to bind the listeners to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Print help
    #[arg(long, action = ArgAction::Help)]
    help: Option<bool>,
}

/// Parse `<http>:<https>`, keeping `defaults` for empty sides.
fn parse_ports(value: &str, defaults: (u16, u16)) -> anyhow::Result<(u16, u16)> {
    let (http, https) = value.split_once(':').unwrap_or((value, ""));
    let parse = |side: &str, default: u16| -> anyhow::Result<u16> {
        if side.is_empty() {
            return Ok(default);
        }
        side.parse()
            .with_context(|| format!("Invalid port '{side}' in '{value}'"))
    };
    Ok((parse(http, defaults.0)?, parse(https, defaults.1)?))
}

impl Cli {
    fn into_config(self) -> anyhow::Result<ServerConfig> {
        let defaults = ServerConfig::default();
        let (http_port, https_port) = match &self.ports {
            Some(value) => parse_ports(value, (defaults.http_port, defaults.https_port))?,
            None => (defaults.http_port, defaults.https_port),
        };
        let max_instances = self.max_instances.unwrap_or(defaults.max_instances);
        if max_instances == 0 {
            bail!("Max instances must be at least 1");
        }

        Ok(ServerConfig {
            sites_path: self.sites_path,
            bind_host: self.host,
            http_port,
            https_port,
            http: !self.https_only,
            https: !self.http_only,
            redirect: self.redirect,
            max_instances,
            shell: self.shell,
            tls: TlsFiles::from_env(),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = cli.into_config()?;
    xcgi_server::serve(config).await?;
    Ok(())
}
