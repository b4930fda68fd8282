//! TCP acceptor.
//!
//! Accepts connections, hands them to the worker pool, rejects them with
//! `503` when the pool's queue is full, and drains in-flight work on
//! shutdown. Lifecycle: `Listening -> Draining -> Stopped`.

use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::connection::{refuse, Limits};
use crate::error::{is_resource_exhaustion, is_transient_accept_error, ServerError};
use crate::listener;
use crate::pool::{Job, WorkerPool};
use crate::response::Response;
use crate::service::{Greeter, Service};

/// First pause after the acceptor runs out of descriptors or buffers
const MIN_BACKOFF: Duration = Duration::from_millis(5);

/// Longest pause between accept retries
const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Lifecycle of the acceptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Not yet serving.
    Idle,
    /// Accepting connections.
    Listening,
    /// No longer accepting; waiting for in-flight connections.
    Draining,
    /// Workers are gone and the listener is closed.
    Stopped,
}

/// Counters gathered over one run.
#[derive(Debug, Clone, Default)]
pub struct ServerReport {
    /// Connections returned by `accept`.
    pub accepted: u64,
    /// Connections answered with `503` because the queue was full.
    pub rejected: u64,
    /// Connections released by a worker.
    pub handled: u64,
    /// Most connections handled at the same time.
    pub peak_concurrency: usize,
    /// Connections aborted when the shutdown grace period ran out.
    pub cut_off: usize,
    pub uptime: Duration,
}

/// Server instance
pub struct Server<S> {
    config: Config,
    service: Arc<S>,
    state: watch::Sender<ServerState>,
}

impl Server<Greeter> {
    /// Create a server answering with the configured body after the
    /// configured delay.
    pub fn new(config: Config) -> Self {
        let greeter = Greeter::new(config.work_delay, &config.body);
        Self::with_service(config, greeter)
    }
}

impl<S: Service> Server<S> {
    /// Create a server running `service` for each request.
    pub fn with_service(config: Config, service: S) -> Self {
        let (state, _) = watch::channel(ServerState::Idle);
        Self {
            config,
            service: Arc::new(service),
            state,
        }
    }

    /// Watch lifecycle transitions.
    pub fn state(&self) -> watch::Receiver<ServerState> {
        self.state.subscribe()
    }

    /// Bind the configured address and serve until `shutdown` completes.
    pub async fn run<F>(&self, shutdown: F) -> Result<ServerReport, ServerError>
    where
        F: Future<Output = ()>,
    {
        let listener = listener::bind(self.config.listen)?;
        self.serve(listener, shutdown).await
    }

    /// Serve connections from an already bound listener until `shutdown`
    /// completes or `accept` fails fatally.
    pub async fn serve<F>(
        &self,
        listener: TcpListener,
        shutdown: F,
    ) -> Result<ServerReport, ServerError>
    where
        F: Future<Output = ()>,
    {
        let started = Instant::now();
        let limits = Limits::from(&self.config);
        let pool = WorkerPool::new(
            self.config.max_concurrency,
            self.config.queue_depth,
            Arc::clone(&self.service),
            limits,
        )?;
        // Bounds the tasks that deliver `503` to rejected clients.
        let refusals = Arc::new(Semaphore::new(self.config.max_concurrency));

        let mut report = ServerReport::default();
        let mut backoff = MIN_BACKOFF;

        if let Ok(addr) = listener.local_addr() {
            info!(
                address = %addr,
                max_concurrency = self.config.max_concurrency,
                queue_depth = self.config.queue_depth,
                started_at = %Utc::now().to_rfc3339(),
                "Server listening"
            );
        }
        self.state.send_replace(ServerState::Listening);

        tokio::pin!(shutdown);

        let result = loop {
            debug!("Waiting for a client to connect");

            let accepted = tokio::select! {
                () = &mut shutdown => break Ok(()),
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    backoff = MIN_BACKOFF;
                    report.accepted += 1;
                    debug!(
                        peer = %peer,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Client connected"
                    );

                    let job = Job {
                        stream,
                        peer,
                        accepted_at: Instant::now(),
                    };
                    if let Err(job) = pool.try_submit(job) {
                        report.rejected += 1;
                        warn!(peer = %job.peer, queued = pool.queued(), "Server busy, rejecting connection");
                        reject_busy(job.stream, &refusals, limits);
                    }
                }
                Err(e) if is_transient_accept_error(&e) => {
                    warn!(error = %e, "Transient accept error");
                    if is_resource_exhaustion(&e) {
                        tokio::select! {
                            () = &mut shutdown => break Ok(()),
                            () = tokio::time::sleep(backoff) => {}
                        }
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                    }
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    break Err(ServerError::Accept(e));
                }
            }
        };

        self.state.send_replace(ServerState::Draining);
        drop(listener);
        info!(
            in_flight = pool.registry().len(),
            queued = pool.queued(),
            "Stopped accepting, draining connections"
        );

        let registry = Arc::clone(pool.registry());
        report.cut_off = pool.shutdown(self.config.shutdown_grace).await;
        report.handled = registry.handled();
        report.peak_concurrency = registry.peak();
        report.uptime = started.elapsed();

        self.state.send_replace(ServerState::Stopped);
        info!(
            accepted = report.accepted,
            rejected = report.rejected,
            handled = report.handled,
            peak_concurrency = report.peak_concurrency,
            cut_off = report.cut_off,
            "Server stopped"
        );

        result.map(|()| report)
    }
}

/// Tell a client the server is saturated without blocking the acceptor.
fn reject_busy(stream: TcpStream, refusals: &Arc<Semaphore>, limits: Limits) {
    match Arc::clone(refusals).try_acquire_owned() {
        Ok(permit) => {
            tokio::spawn(async move {
                if let Err(e) = refuse(stream, &Response::busy(), &limits).await {
                    debug!(error = %e, "Could not deliver busy response");
                }
                drop(permit);
            });
        }
        Err(_) => {
            // Too many refusals in flight; a fresh socket's send buffer is
            // empty, so a non-blocking write almost always fits.
            if let Err(e) = stream.try_write(&Response::busy()) {
                debug!(error = %e, "Could not deliver busy response");
            }
        }
    }
}
