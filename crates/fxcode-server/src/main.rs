//! fxcode-server binary.

use clap::Parser;
use fxcode_server::{CliOverrides, LogLevel, LogLevelService, ServerConfig, SessionServer};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter};

/// How long sessions get to close once a shutdown signal arrives.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// fxcode-server: reconnectable workbench sessions over WebSocket
#[derive(Parser, Debug)]
#[command(name = "fxcode-server", version, about = "fxcode remote session server")]
struct Cli {
    /// Listen address
    #[arg(long)]
    host: Option<String>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Config file path
    #[arg(long, default_value = "~/.fxcode/config.toml")]
    config: String,

    /// Build identifier clients are expected to present
    #[arg(long)]
    commit: Option<String>,

    /// Root of the static client content
    #[arg(long)]
    app_root: Option<String>,

    /// Additional installed-extension directory (repeatable)
    #[arg(long = "extra-extensions-dir")]
    extra_extensions_dirs: Vec<String>,

    /// Initial log level (trace, debug, info, warning, error, critical, off).
    /// Clients can change it later through the `logger` channel.
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            host: self.host.clone(),
            port: self.port,
            commit: self.commit.clone(),
            app_root: self.app_root.clone(),
            extra_extensions_dirs: self.extra_extensions_dirs.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let Some(level) = LogLevel::from_name(&cli.log_level) else {
        eprintln!("fxcode-server: unknown log level '{}'", cli.log_level);
        return ExitCode::FAILURE;
    };
    let log_level = init_logging(level);
    info!(version = env!("CARGO_PKG_VERSION"), ?level, "starting fxcode-server");

    let config = match ServerConfig::load(Some(Path::new(&cli.config)), cli.overrides()) {
        Ok(config) => config,
        Err(e) => {
            error!(config = %cli.config, error = %e, "failed to load config");
            return ExitCode::FAILURE;
        }
    };

    let server = Arc::new(SessionServer::with_log_level(config, log_level));
    server.environment().ensure_directories().await;

    let code = tokio::select! {
        result = server.clone().run() => match result {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!(error = %e, "server error");
                ExitCode::FAILURE
            }
        },
        _ = shutdown_signal() => {
            info!("received shutdown signal");
            ExitCode::SUCCESS
        }
    };

    let closed = server.shutdown(SHUTDOWN_GRACE).await;
    info!(sessions = closed, "fxcode-server stopped");
    code
}

/// Install the fmt subscriber behind a reloadable filter. `RUST_LOG`, when
/// set, decides the initial filter; the logger channel replaces it.
fn init_logging(level: LogLevel) -> Arc<LogLevelService> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.directive()));
    let (filter, handle) = reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();
    Arc::new(LogLevelService::reloading(level, handle))
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
                return;
            }
            Err(e) => warn!(error = %e, "SIGTERM handler unavailable, waiting for Ctrl+C"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Ctrl+C handler unavailable");
        std::future::pending::<()>().await;
    }
}
