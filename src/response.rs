//! Canned HTTP/1.1 responses.
//!
//! Every response carries `Content-Length` and `Connection: close`; the
//! server answers exactly once per connection.

use bytes::{Bytes, BytesMut};

/// Response generator
pub struct Response;

impl Response {
    /// Generate a response with the given status line and body
    pub fn build(status: u16, reason: &str, body: &[u8]) -> Bytes {
        let head = format!(
            "HTTP/1.1 {status} {reason}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );
        let mut response = BytesMut::with_capacity(head.len() + body.len());
        response.extend_from_slice(head.as_bytes());
        response.extend_from_slice(body);
        response.freeze()
    }

    /// Generate 200 OK response
    pub fn ok(body: &[u8]) -> Bytes {
        Self::build(200, "OK", body)
    }

    /// Generate 400 Bad Request response
    pub fn bad_request() -> Bytes {
        Self::build(400, "Bad Request", b"bad request\n")
    }

    /// Generate 408 Request Timeout response
    pub fn request_timeout() -> Bytes {
        Self::build(408, "Request Timeout", b"request timeout\n")
    }

    /// Generate 413 Payload Too Large response
    pub fn too_large() -> Bytes {
        Self::build(413, "Payload Too Large", b"request too large\n")
    }

    /// Generate 503 response for a saturated server
    pub fn busy() -> Bytes {
        Self::build(503, "Service Unavailable", b"server busy\n")
    }

    /// Generate 503 response for work that missed its deadline
    pub fn unavailable() -> Bytes {
        Self::build(503, "Service Unavailable", b"work timed out\n")
    }
}
