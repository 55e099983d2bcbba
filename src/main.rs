use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use octomon::config::{Config, Env};

#[derive(Parser)]
#[command(name = "octomon", version, about = "GitHub webhook gateway and workers")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: PathBuf,

    /// Bind address (overrides GATEWAY_HOST / SERVICE_HOST).
    #[arg(long, global = true)]
    host: Option<String>,

    /// Bind port (overrides GATEWAY_PORT / SERVICE_PORT).
    #[arg(long, global = true)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Public ingress: webhook verification, routing, dashboard.
    Gateway,
    /// PR review worker.
    PrReviewer,
    /// Issue replication worker.
    IssueCopier,
    /// Issue/comment scoring worker.
    IssueScorer,
}

fn init_logging(config: &Config) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let json = config.logging.format == "json";

    let log_file = config.logging.file.as_ref().and_then(|path| {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| eprintln!("Cannot open log file {}: {e} — using stdout", path.display()))
            .ok()
    });

    match (log_file, json) {
        (Some(file), true) => builder.json().with_writer(std::sync::Mutex::new(file)).init(),
        (Some(file), false) => builder
            .with_ansi(false)
            .with_writer(std::sync::Mutex::new(file))
            .init(),
        (None, true) => builder.json().init(),
        (None, false) => builder.init(),
    }
}

fn bind_address(cli: &Cli, host_var: &str, port_var: &str, default_port: u16) -> (String, u16) {
    let host = cli
        .host
        .clone()
        .or_else(|| std::env::var(host_var).ok())
        .unwrap_or_else(|| "0.0.0.0".to_owned());
    let port = cli
        .port
        .or_else(|| std::env::var(port_var).ok().and_then(|p| p.parse().ok()))
        .unwrap_or(default_port);
    (host, port)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load_or_default(&cli.config)?;
    init_logging(&config);
    let env = Env::from_process();

    match cli.command {
        Command::Gateway => {
            let (host, port) = bind_address(&cli, "GATEWAY_HOST", "GATEWAY_PORT", 8080);
            octomon::gateway::run(&host, port, config, env).await
        }
        Command::PrReviewer => {
            let (host, port) = bind_address(&cli, "SERVICE_HOST", "SERVICE_PORT", 8081);
            octomon::reviewer::run(&host, port, config, env).await
        }
        Command::IssueCopier => {
            let (host, port) = bind_address(&cli, "SERVICE_HOST", "SERVICE_PORT", 8082);
            octomon::copier::run(&host, port, config, env).await
        }
        Command::IssueScorer => {
            let (host, port) = bind_address(&cli, "SERVICE_HOST", "SERVICE_PORT", 8083);
            octomon::scorer::run(&host, port, config, env).await
        }
    }
}
