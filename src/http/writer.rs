use crate::http::status::StatusCode;

const HTTP_VERSION: &str = "HTTP/1.1";

/// Terminates a chunked response body.
pub const CHUNK_TERMINATOR: &[u8] = b"0\r\n\r\n";

/// How the response body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    ContentLength(u64),
    Chunked,
}

/// Everything needed to serialize a response head.
pub struct ResponseHead<'a> {
    pub status: StatusCode,
    pub content_type: Option<&'a str>,
    pub framing: Framing,
    pub keep_alive: bool,
}

pub fn serialize_head(head: &ResponseHead<'_>) -> Vec<u8> {
    let mut buf = Vec::new();

    // Status line
    let status_line = format!(
        "{} {} {}\r\n",
        HTTP_VERSION,
        head.status.as_u16(),
        head.status.reason_phrase()
    );
    buf.extend_from_slice(status_line.as_bytes());

    // Headers
    if let Some(content_type) = head.content_type {
        buf.extend_from_slice(b"Content-Type: ");
        buf.extend_from_slice(content_type.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    match head.framing {
        Framing::ContentLength(len) => {
            buf.extend_from_slice(format!("Content-Length: {}\r\n", len).as_bytes());
        }
        Framing::Chunked => {
            buf.extend_from_slice(b"Transfer-Encoding: chunked\r\n");
        }
    }
    if head.keep_alive {
        buf.extend_from_slice(b"Connection: keep-alive\r\n");
    } else {
        buf.extend_from_slice(b"Connection: close\r\n");
    }

    // Header/body separator
    buf.extend_from_slice(b"\r\n");

    buf
}

/// Wraps one payload as an HTTP chunk. Empty payloads produce no bytes;
/// a zero-size chunk would read as the body terminator.
pub fn serialize_chunk(payload: &[u8]) -> Vec<u8> {
    if payload.is_empty() {
        return Vec::new();
    }

    let mut buf = Vec::with_capacity(payload.len() + 16);
    buf.extend_from_slice(format!("{:x}\r\n", payload.len()).as_bytes());
    buf.extend_from_slice(payload);
    buf.extend_from_slice(b"\r\n");
    buf
}
