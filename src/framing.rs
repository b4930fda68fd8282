//! Request framing.
//!
//! A request ends at the first of:
//! - a complete HTTP head (`\r\n\r\n`) followed by `Content-Length` body bytes
//! - the peer half-closing its side after sending at least one byte
//!
//! The second rule lets non-HTTP clients get the canned answer by shutting
//! down their write half, which is what a single blind read used to serve.

/// Result of scanning the bytes received so far.
#[derive(Debug, PartialEq, Eq)]
pub enum FrameResult {
    /// A full request occupies the first `usize` bytes.
    Complete(usize),
    /// Need more data. `Some(n)` when the total length is already known.
    Incomplete(Option<usize>),
    /// The request is, or is declared to be, longer than the limit.
    TooLarge,
    /// The head cannot be framed.
    Malformed(&'static str),
}

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Scan `input` for a request boundary, enforcing `max_size`.
pub fn frame(input: &[u8], max_size: usize) -> FrameResult {
    let head_end = match find_head_end(input) {
        Some(pos) => pos,
        None if input.len() > max_size => return FrameResult::TooLarge,
        None => return FrameResult::Incomplete(None),
    };

    let body_len = match content_length(&input[..head_end]) {
        Ok(len) => len.unwrap_or(0),
        Err(reason) => return FrameResult::Malformed(reason),
    };

    let total = match head_end.checked_add(body_len) {
        Some(total) if total <= max_size => total,
        _ => return FrameResult::TooLarge,
    };

    if input.len() >= total {
        FrameResult::Complete(total)
    } else {
        FrameResult::Incomplete(Some(total))
    }
}

/// Position just past `\r\n\r\n`, if present.
fn find_head_end(input: &[u8]) -> Option<usize> {
    input
        .windows(HEAD_TERMINATOR.len())
        .position(|w| w == HEAD_TERMINATOR)
        .map(|pos| pos + HEAD_TERMINATOR.len())
}

/// Value of the `Content-Length` header, if any.
fn content_length(head: &[u8]) -> Result<Option<usize>, &'static str> {
    let mut found = None;

    // Skip the request line.
    for line in head.split(|&b| b == b'\n').skip(1) {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            continue;
        };
        let (name, value) = line.split_at(colon);
        if !name.trim_ascii().eq_ignore_ascii_case(b"content-length") {
            continue;
        }

        let value = std::str::from_utf8(value[1..].trim_ascii())
            .map_err(|_| "non-ascii content-length")?;
        let len: usize = value.parse().map_err(|_| "invalid content-length")?;

        match found {
            Some(prev) if prev != len => return Err("conflicting content-length"),
            _ => found = Some(len),
        }
    }

    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_head_without_body() {
        let req = b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n";
        assert_eq!(frame(req, 1024), FrameResult::Complete(req.len()));
    }

    #[test]
    fn test_incomplete_head() {
        assert_eq!(
            frame(b"GET / HTTP/1.1\r\nHost: loc", 1024),
            FrameResult::Incomplete(None)
        );
    }

    #[test]
    fn test_body_with_content_length() {
        let head = b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\n";
        let mut req = head.to_vec();
        req.extend_from_slice(b"he");
        assert_eq!(
            frame(&req, 1024),
            FrameResult::Incomplete(Some(head.len() + 5))
        );

        req.extend_from_slice(b"llo");
        assert_eq!(frame(&req, 1024), FrameResult::Complete(head.len() + 5));
    }

    #[test]
    fn test_header_name_is_case_insensitive() {
        let req = b"POST / HTTP/1.1\r\ncontent-LENGTH:  2 \r\n\r\nok";
        assert_eq!(frame(req, 1024), FrameResult::Complete(req.len()));
    }

    #[test]
    fn test_pipelined_bytes_after_frame() {
        let req = b"GET / HTTP/1.1\r\n\r\nGET /next";
        assert_eq!(frame(req, 1024), FrameResult::Complete(18));
    }

    #[test]
    fn test_too_large_without_terminator() {
        let req = vec![b'a'; 1025];
        assert_eq!(frame(&req, 1024), FrameResult::TooLarge);
    }

    #[test]
    fn test_declared_body_too_large() {
        let req = b"POST / HTTP/1.1\r\nContent-Length: 4096\r\n\r\n";
        assert_eq!(frame(req, 1024), FrameResult::TooLarge);
    }

    #[test]
    fn test_overflowing_content_length() {
        let req = format!("POST / HTTP/1.1\r\nContent-Length: {}\r\n\r\n", usize::MAX);
        assert_eq!(frame(req.as_bytes(), 1024), FrameResult::TooLarge);
    }

    #[test]
    fn test_malformed_content_length() {
        let req = b"POST / HTTP/1.1\r\nContent-Length: ten\r\n\r\n";
        assert!(matches!(frame(req, 1024), FrameResult::Malformed(_)));

        let req = b"POST / HTTP/1.1\r\nContent-Length: 1\r\nContent-Length: 2\r\n\r\n";
        assert!(matches!(frame(req, 1024), FrameResult::Malformed(_)));
    }
}
