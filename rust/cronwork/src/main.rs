//! Cronwork - Main Entry Point
//!
//! Serves the task API, runs due commands on the embedded queue and records
//! every execution.

use clap::Parser;
use mimalloc::MiMalloc;
use tokio_util::sync::CancellationToken;

use cronwork::config::{AppConfig, ConfigValidator};
use cronwork::logging::init_tracing;
use cronwork::runtime::Runtime;
use cronwork::{log_banner, log_init_step, log_init_warning};

// Use mimalloc for better performance
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Command-line arguments. Each one overrides the loaded configuration.
#[derive(Parser, Debug)]
#[command(name = "cronwork")]
#[command(about = "Cron-triggered shell command scheduler")]
#[command(version)]
struct Args {
    /// Host to bind to.
    #[arg(long, env = "CRONWORK_HOST")]
    host: Option<String>,

    /// Port to listen on.
    #[arg(short, long, env = "CRONWORK_PORT")]
    port: Option<u16>,

    /// SQLite database file.
    #[arg(long, env = "DATABASE_PATH")]
    database: Option<String>,

    /// Maximum commands running at once.
    #[arg(long, env = "CRONWORK_CONCURRENCY")]
    concurrency: Option<usize>,

    /// Log level.
    #[arg(long, env = "CRONWORK_LOG_LEVEL")]
    log_level: Option<String>,

    /// Emit logs as JSON.
    #[arg(long, env = "CRONWORK_JSON_LOGS")]
    json_logs: bool,
}

impl Args {
    fn apply(self, config: &mut AppConfig) {
        if let Some(host) = self.host {
            config.server.host = host;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(path) = self.database {
            config.database.path = path;
        }
        if let Some(concurrency) = self.concurrency {
            config.queue.concurrency = concurrency;
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
        if self.json_logs {
            config.logging.json = true;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::load_unchecked()?;
    args.apply(&mut config);
    init_tracing(&config.logging);
    ConfigValidator::validate(&config)
        .map_err(|e| anyhow::anyhow!("Configuration validation failed:\n\n{e}"))?;

    log_banner!(
        format!("cronwork v{}", env!("CARGO_PKG_VERSION")),
        format!(
            "queue '{}', concurrency {}",
            config.queue.name, config.queue.concurrency
        )
    );

    log_init_step!(1, 4, "Storage", &config.database.path);
    let runtime = Runtime::build(&config).await?;

    log_init_step!(2, 4, "Background loops");
    let shutdown = CancellationToken::new();
    let handles = runtime.start(&shutdown);

    log_init_step!(3, 4, "Schedules");
    match runtime.service.restore_schedules().await {
        Ok(restored) => tracing::info!(restored, "Schedules registered"),
        Err(e) => log_init_warning!("Schedules not restored: {}", e),
    }

    let addr = format!("{}:{}", config.server.host, config.server.port);
    log_init_step!(4, 4, "HTTP", &addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    let app = cronwork::api::app(runtime.service.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("HTTP server stopped; waiting for running jobs");
    shutdown.cancel();
    handles.join().await;
    runtime.queue.close();

    tracing::info!("Server shut down gracefully");
    Ok(())
}

/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
