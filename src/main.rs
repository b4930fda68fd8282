//! hey-server: a TCP acceptor with a bounded worker pool
//!
//! Every connection gets one canned HTTP/1.1 answer:
//! - Connections are handled by a fixed number of workers
//! - Waiting connections sit in a bounded queue; overflow is refused with 503
//! - Requests are framed, size-limited and read under a deadline
//! - Ctrl-C or SIGTERM stops accepting and drains in-flight connections
//! - Configuration via CLI arguments or TOML file

use hey_server::config::Config;
use hey_server::server::Server;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        workers = ?config.workers,
        max_concurrency = config.max_concurrency,
        queue_depth = config.queue_depth,
        max_request_size = config.max_request_size,
        read_timeout_ms = config.read_timeout.as_millis() as u64,
        work_delay_ms = config.work_delay.as_millis() as u64,
        "Starting hey-server"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.build()?;

    runtime.block_on(async {
        let server = Server::new(config);
        let report = server.run(shutdown_signal()).await?;
        if report.cut_off > 0 {
            warn!(cut_off = report.cut_off, "Some connections did not finish before shutdown");
        }
        Ok::<(), Box<dyn std::error::Error>>(())
    })
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl-C, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}
