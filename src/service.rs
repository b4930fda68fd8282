//! The unit of work performed for each framed request.
//!
//! The handler bounds every call with the configured work deadline, so an
//! implementation may take as long as it likes without pinning a worker.

use bytes::Bytes;
use std::future::Future;
use std::time::Duration;

use crate::response::Response;

/// Produces the response for one request.
pub trait Service: Send + Sync + 'static {
    /// Handle the framed request bytes, returning a complete response.
    fn call(&self, request: Bytes) -> impl Future<Output = Bytes> + Send;
}

/// Waits a fixed delay, then answers `200 OK` with a fixed body.
///
/// The request content is ignored.
#[derive(Debug, Clone)]
pub struct Greeter {
    delay: Duration,
    response: Bytes,
}

impl Greeter {
    pub fn new(delay: Duration, body: &str) -> Self {
        Self {
            delay,
            response: Response::ok(body.as_bytes()),
        }
    }
}

impl Service for Greeter {
    async fn call(&self, _request: Bytes) -> Bytes {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.response.clone()
    }
}
