//! Per-connection handler.
//!
//! Reads one framed request, runs the service, writes the response and
//! closes. Every step has a deadline, and the handler as a whole is bounded
//! by `handler_timeout`. Failures end this connection only.

use bytes::{Bytes, BytesMut};
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::config::Config;
use crate::error::ConnError;
use crate::framing::{self, FrameResult};
use crate::registry::{ConnGuard, ConnState};
use crate::response::Response;
use crate::service::Service;

/// Read chunk size
const CHUNK_SIZE: usize = 4 * 1024;

/// Most bytes discarded while waiting for the peer to close after an error
const LINGER_LIMIT: usize = 64 * 1024;

/// Deadlines and size limits applied to each connection.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_request_size: usize,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub work_timeout: Duration,
    pub handler_timeout: Duration,
}

impl From<&Config> for Limits {
    fn from(config: &Config) -> Self {
        Self {
            max_request_size: config.max_request_size,
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
            work_timeout: config.work_timeout,
            handler_timeout: config.handler_timeout,
        }
    }
}

/// Handle a single client connection.
///
/// The stream is dropped, and so closed, on every return path.
pub async fn handle_connection<T, S>(
    mut stream: T,
    service: &S,
    limits: &Limits,
    guard: &ConnGuard,
) -> Result<(), ConnError>
where
    T: AsyncRead + AsyncWrite + Unpin,
    S: Service,
{
    match timeout(
        limits.handler_timeout,
        serve(&mut stream, service, limits, guard),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(ConnError::HandlerTimeout(limits.handler_timeout)),
    }
}

async fn serve<T, S>(
    stream: &mut T,
    service: &S,
    limits: &Limits,
    guard: &ConnGuard,
) -> Result<(), ConnError>
where
    T: AsyncRead + AsyncWrite + Unpin,
    S: Service,
{
    let request = match read_request(stream, limits).await {
        Ok(Some(request)) => request,
        Ok(None) => {
            trace!("Connection closed by client before sending a request");
            return Ok(());
        }
        Err(e) => {
            reject(stream, &e, limits, guard).await;
            return Err(e);
        }
    };
    trace!(bytes = request.len(), "Request framed");

    guard.set_state(ConnState::Working);
    let response = match timeout(limits.work_timeout, service.call(request)).await {
        Ok(response) => response,
        Err(_) => {
            let e = ConnError::WorkTimeout(limits.work_timeout);
            reject(stream, &e, limits, guard).await;
            return Err(e);
        }
    };

    guard.set_state(ConnState::Writing);
    write_all(stream, &response, limits.write_timeout).await?;

    guard.set_state(ConnState::Closing);
    if let Err(e) = with_deadline(limits.write_timeout, stream.shutdown()).await {
        // The response is already out; nothing left to tell the peer.
        trace!(error = %e, "Shutdown after response failed");
    }
    Ok(())
}

/// Read until a request boundary, the size limit, or the read deadline.
///
/// Returns `Ok(None)` when the peer closes without sending anything.
async fn read_request<T>(stream: &mut T, limits: &Limits) -> Result<Option<Bytes>, ConnError>
where
    T: AsyncRead + Unpin,
{
    let max = limits.max_request_size;
    let mut buffer = BytesMut::with_capacity(CHUNK_SIZE.min(max.saturating_add(1)));
    let mut chunk = [0u8; CHUNK_SIZE];

    loop {
        // Known once a head has been framed.
        let expected = match framing::frame(&buffer, max) {
            FrameResult::Complete(len) => return Ok(Some(buffer.split_to(len).freeze())),
            FrameResult::TooLarge => return Err(ConnError::TooLarge { limit: max }),
            FrameResult::Malformed(reason) => return Err(ConnError::Malformed(reason)),
            FrameResult::Incomplete(expected) => expected,
        };

        // Never buffer more than one byte past the limit.
        let want = max.saturating_add(1).saturating_sub(buffer.len()).min(CHUNK_SIZE);
        let n = match timeout(limits.read_timeout, stream.read(&mut chunk[..want])).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(ConnError::Read(e)),
            Err(_) => return Err(ConnError::ReadTimeout(limits.read_timeout)),
        };

        if n == 0 {
            if expected.is_some() {
                return Err(ConnError::Malformed("truncated body"));
            }
            // Half-close before any head ends the request.
            return Ok(if buffer.is_empty() {
                None
            } else {
                Some(buffer.freeze())
            });
        }
        buffer.extend_from_slice(&chunk[..n]);
    }
}

/// Answer a failed request where the connection can still carry a reply.
async fn reject<T>(stream: &mut T, error: &ConnError, limits: &Limits, guard: &ConnGuard)
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let response = match error {
        ConnError::TooLarge { .. } => Response::too_large(),
        ConnError::Malformed(_) => Response::bad_request(),
        ConnError::ReadTimeout(_) => Response::request_timeout(),
        ConnError::WorkTimeout(_) => Response::unavailable(),
        // The stream itself failed.
        _ => return,
    };

    guard.set_state(ConnState::Writing);
    if let Err(e) = write_all(stream, &response, limits.write_timeout).await {
        debug!(error = %e, "Could not deliver error response");
        return;
    }

    guard.set_state(ConnState::Closing);
    if with_deadline(limits.write_timeout, stream.shutdown()).await.is_ok() {
        linger(stream, limits.read_timeout).await;
    }
}

/// Answer a connection that will not be handled, then close it.
pub async fn refuse<T>(mut stream: T, response: &[u8], limits: &Limits) -> Result<(), ConnError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    write_all(&mut stream, response, limits.write_timeout).await?;
    with_deadline(limits.write_timeout, stream.shutdown()).await?;
    linger(&mut stream, limits.read_timeout).await;
    Ok(())
}

/// Drain what the peer is still sending so closing does not reset the
/// connection before the response is read.
async fn linger<T>(stream: &mut T, deadline: Duration)
where
    T: AsyncRead + Unpin,
{
    let mut chunk = [0u8; CHUNK_SIZE];
    let mut discarded = 0;

    let drain = async {
        while discarded < LINGER_LIMIT {
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => discarded += n,
            }
        }
    };
    let _ = timeout(deadline, drain).await;
}

async fn write_all<T>(stream: &mut T, data: &[u8], deadline: Duration) -> Result<(), ConnError>
where
    T: AsyncWrite + Unpin,
{
    match timeout(deadline, stream.write_all(data)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ConnError::Write(e)),
        Err(_) => Err(ConnError::WriteTimeout(deadline)),
    }
}

async fn with_deadline<F>(deadline: Duration, fut: F) -> Result<(), ConnError>
where
    F: Future<Output = std::io::Result<()>>,
{
    match timeout(deadline, fut).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ConnError::Write(e)),
        Err(_) => Err(ConnError::WriteTimeout(deadline)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Connection, ConnectionRegistry};
    use crate::service::Greeter;
    use std::io;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Instant;
    use tokio_test::io::Builder;

    fn limits() -> Limits {
        Limits {
            max_request_size: 64,
            read_timeout: Duration::from_secs(1),
            write_timeout: Duration::from_secs(1),
            work_timeout: Duration::from_secs(1),
            handler_timeout: Duration::from_secs(5),
        }
    }

    fn guard() -> (Arc<ConnectionRegistry>, ConnGuard) {
        let registry = ConnectionRegistry::new(1);
        let peer = SocketAddr::from(([127, 0, 0, 1], 40000));
        let guard = registry.insert(Connection::new(peer, Instant::now())).unwrap();
        (registry, guard)
    }

    fn greeter() -> Greeter {
        Greeter::new(Duration::ZERO, "Hey Client!")
    }

    #[tokio::test]
    async fn test_request_then_response() {
        let stream = Builder::new()
            .read(b"GET / HTTP/1.1\r\n")
            .read(b"Host: x\r\n\r\n")
            .write(&Response::ok(b"Hey Client!"))
            .build();
        let (registry, guard) = guard();

        handle_connection(stream, &greeter(), &limits(), &guard)
            .await
            .unwrap();
        drop(guard);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_half_close_ends_request() {
        let (mut client, server) = tokio::io::duplex(1024);
        let (_registry, guard) = guard();

        client.write_all(b"0123456789").await.unwrap();
        client.shutdown().await.unwrap();

        handle_connection(server, &greeter(), &limits(), &guard)
            .await
            .unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, Response::ok(b"Hey Client!").to_vec());
    }

    #[tokio::test]
    async fn test_half_close_inside_declared_body_is_rejected() {
        let (mut client, server) = tokio::io::duplex(1024);
        let (_registry, guard) = guard();
        let limits = Limits {
            max_request_size: 1024,
            ..limits()
        };

        client
            .write_all(b"POST / HTTP/1.1\r\nContent-Length: 100\r\n\r\nonly-ten!!")
            .await
            .unwrap();
        client.shutdown().await.unwrap();

        let result = handle_connection(server, &greeter(), &limits, &guard).await;
        assert!(matches!(result, Err(ConnError::Malformed("truncated body"))));

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, Response::bad_request().to_vec());
    }

    #[tokio::test]
    async fn test_eof_without_request_writes_nothing() {
        let stream = Builder::new().build();
        let (_registry, guard) = guard();

        handle_connection(stream, &greeter(), &limits(), &guard)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_oversized_request_is_rejected() {
        let stream = Builder::new()
            .read(&[b'a'; 40])
            .read(&[b'a'; 40])
            .write(&Response::too_large())
            .build();
        let (_registry, guard) = guard();

        let result = handle_connection(stream, &greeter(), &limits(), &guard).await;
        assert!(matches!(result, Err(ConnError::TooLarge { limit: 64 })));
    }

    #[tokio::test]
    async fn test_malformed_request_is_rejected() {
        let stream = Builder::new()
            .read(b"POST / HTTP/1.1\r\nContent-Length: x\r\n\r\n")
            .write(&Response::bad_request())
            .build();
        let (_registry, guard) = guard();

        let result = handle_connection(stream, &greeter(), &limits(), &guard).await;
        assert!(matches!(result, Err(ConnError::Malformed(_))));
    }

    #[tokio::test]
    async fn test_read_error_writes_nothing() {
        let stream = Builder::new()
            .read(b"GET")
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let (_registry, guard) = guard();

        let result = handle_connection(stream, &greeter(), &limits(), &guard).await;
        assert!(matches!(result, Err(ConnError::Read(_))));
    }

    #[tokio::test]
    async fn test_write_error_is_reported() {
        let stream = Builder::new()
            .read(b"GET / HTTP/1.1\r\n\r\n")
            .write_error(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
            .build();
        let (_registry, guard) = guard();

        let result = handle_connection(stream, &greeter(), &limits(), &guard).await;
        assert!(matches!(result, Err(ConnError::Write(_))));
    }

    #[tokio::test]
    async fn test_refuse_answers_and_drains() {
        let stream = Builder::new()
            .write(&Response::busy())
            .read(b"GET / HTTP/1.1\r\n\r\n")
            .build();

        refuse(stream, &Response::busy(), &limits()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_work_is_cut_off() {
        let stream = Builder::new()
            .read(b"GET / HTTP/1.1\r\n\r\n")
            .write(&Response::unavailable())
            .build();
        let (_registry, guard) = guard();
        let slow = Greeter::new(Duration::from_secs(30), "late");

        let result = handle_connection(stream, &slow, &limits(), &guard).await;
        assert!(matches!(result, Err(ConnError::WorkTimeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_deadline() {
        let stream = Builder::new().read(b"GET / HTTP/1.1\r\n\r\n").build();
        let (_registry, guard) = guard();
        let slow = Greeter::new(Duration::from_secs(30), "late");
        let limits = Limits {
            work_timeout: Duration::from_secs(60),
            handler_timeout: Duration::from_secs(2),
            ..limits()
        };

        let result = handle_connection(stream, &slow, &limits, &guard).await;
        assert!(matches!(result, Err(ConnError::HandlerTimeout(_))));
    }
}
