//! Fixed-size worker pool fed by a bounded queue.
//!
//! The acceptor submits connections without waiting. Each worker takes
//! one connection at a time from the shared queue and runs its handler to
//! completion, so at most `size` connections are handled at once and at
//! most `queue_depth` wait. Submission fails when the queue is full and the
//! caller decides how to reject.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, trace, warn};

use crate::connection::{handle_connection, Limits};
use crate::error::ServerError;
use crate::registry::{Connection, ConnectionRegistry};
use crate::service::Service;

/// An accepted connection waiting for a worker.
#[derive(Debug)]
pub struct Job<T> {
    pub stream: T,
    pub peer: SocketAddr,
    pub accepted_at: Instant,
}

/// Pool of handler tasks.
pub struct WorkerPool<T> {
    workers: Vec<Worker>,
    sender: Option<mpsc::Sender<Job<T>>>,
    receiver: Arc<Mutex<mpsc::Receiver<Job<T>>>>,
    registry: Arc<ConnectionRegistry>,
    queue_depth: usize,
}

struct Worker {
    id: usize,
    handle: JoinHandle<()>,
}

impl<T> WorkerPool<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Create a new pool and start its workers.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<S: Service>(
        size: usize,
        queue_depth: usize,
        service: Arc<S>,
        limits: Limits,
    ) -> Result<Self, ServerError> {
        if size == 0 {
            return Err(ServerError::Pool("size must be greater than zero"));
        }
        if queue_depth == 0 {
            return Err(ServerError::Pool("queue depth must be greater than zero"));
        }

        let (sender, receiver) = mpsc::channel(queue_depth);
        let receiver = Arc::new(Mutex::new(receiver));
        let registry = ConnectionRegistry::new(size);

        let workers = (0..size)
            .map(|id| Worker {
                id,
                handle: tokio::spawn(run_worker(
                    id,
                    Arc::clone(&receiver),
                    Arc::clone(&service),
                    limits,
                    Arc::clone(&registry),
                )),
            })
            .collect();

        Ok(Self {
            workers,
            sender: Some(sender),
            receiver,
            registry,
            queue_depth,
        })
    }

    /// Queue a connection for handling without waiting.
    ///
    /// Gives the job back when the queue is full or the pool is shutting down.
    pub fn try_submit(&self, job: Job<T>) -> Result<(), Job<T>> {
        let Some(sender) = self.sender.as_ref() else {
            return Err(job);
        };
        sender.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(job) | mpsc::error::TrySendError::Closed(job) => job,
        })
    }

    /// Connections currently held by a worker.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Connections waiting in the queue.
    pub fn queued(&self) -> usize {
        self.sender
            .as_ref()
            .map_or(0, |sender| self.queue_depth - sender.capacity())
    }

    /// Stop taking work, let workers drain the queue, and wait up to
    /// `grace` for them. Returns how many connections were cut off, held
    /// by a worker or still queued.
    pub async fn shutdown(mut self, grace: Duration) -> usize {
        drop(self.sender.take());

        let drained = timeout(grace, async {
            for worker in &mut self.workers {
                if let Err(e) = (&mut worker.handle).await {
                    error!(worker = worker.id, error = %e, "Worker failed");
                }
            }
        })
        .await;

        if drained.is_ok() {
            return 0;
        }

        let in_flight = self.registry.snapshot();
        warn!(
            in_flight = in_flight.len(),
            grace_ms = grace.as_millis() as u64,
            "Shutdown grace period expired, aborting workers"
        );
        for conn in &in_flight {
            warn!(
                peer = %conn.peer,
                state = ?conn.state,
                age_ms = conn.accepted_at.elapsed().as_millis() as u64,
                "Cutting off connection"
            );
        }

        for worker in &mut self.workers {
            worker.handle.abort();
            // Resolves once the aborted task has released the queue lock.
            let _ = (&mut worker.handle).await;
        }

        // Nobody will answer what is left in the queue; dropping closes it.
        let mut queued = 0;
        let mut receiver = self.receiver.lock().await;
        while let Ok(job) = receiver.try_recv() {
            debug!(peer = %job.peer, "Dropping queued connection");
            queued += 1;
        }

        in_flight.len() + queued
    }
}

async fn run_worker<T, S>(
    id: usize,
    receiver: Arc<Mutex<mpsc::Receiver<Job<T>>>>,
    service: Arc<S>,
    limits: Limits,
    registry: Arc<ConnectionRegistry>,
) where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: Service,
{
    loop {
        // The lock is only held while waiting for the next job.
        let job = receiver.lock().await.recv().await;

        let Some(job) = job else {
            debug!(worker = id, "Worker disconnected; shutting down");
            break;
        };

        let Some(guard) = registry.insert(Connection::new(job.peer, job.accepted_at)) else {
            error!(worker = id, peer = %job.peer, "No registry slot for connection, dropping it");
            continue;
        };

        trace!(
            worker = id,
            peer = %job.peer,
            queued_ms = job.accepted_at.elapsed().as_millis() as u64,
            "Worker got a connection"
        );

        match handle_connection(job.stream, service.as_ref(), &limits, &guard).await {
            Ok(()) => trace!(worker = id, peer = %job.peer, "Connection done"),
            Err(e) => debug!(worker = id, peer = %job.peer, error = %e, "Connection error"),
        }
    }
}
