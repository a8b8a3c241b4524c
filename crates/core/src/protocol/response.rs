use std::time::Duration;

use crate::error::{ParseErrorKind, Result, RetrieverError};

/// Default session timeout when the server omits `;timeout=` (RFC 2326 §12.37).
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(60);

/// An RTSP response (RFC 2326 §7).
///
/// ```text
/// RTSP/1.0 200 OK\r\n
/// CSeq: 2\r\n
/// Content-Base: rtsp://192.168.0.90/axis-media/media.amp/\r\n
/// Content-Type: application/sdp\r\n
/// Content-Length: 142\r\n
/// \r\n
/// v=0\r\n...
/// ```
///
/// The control connection reads the head up to the blank line, parses it
/// with [`parse_head`](Self::parse_head), then reads
/// [`content_length`](Self::content_length) bytes into [`body`](Self::body).
///
/// The builder half ([`new`](Self::new), [`add_header`](Self::add_header),
/// [`with_body`](Self::with_body), [`serialize`](Self::serialize)) produces
/// the same format, with `Content-Length` computed automatically.
#[derive(Debug, Clone)]
#[must_use]
pub struct RtspResponse {
    pub status_code: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RtspResponse {
    pub fn new(status_code: u16, status_text: &str) -> Self {
        RtspResponse {
            status_code,
            status_text: status_text.to_string(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// 200 OK: success (RFC 2326 §7.1.1).
    pub fn ok() -> Self {
        Self::new(200, "OK")
    }

    pub fn add_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Serialize to the RTSP wire format.
    ///
    /// If a body is present, `Content-Length` is appended automatically
    /// (RFC 2326 §12.14).
    pub fn serialize(&self) -> Vec<u8> {
        let mut head = format!("RTSP/1.0 {} {}\r\n", self.status_code, self.status_text);
        for (name, value) in &self.headers {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        if !self.body.is_empty() {
            head.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        }
        head.push_str("\r\n");

        let mut out = head.into_bytes();
        out.extend_from_slice(&self.body);
        out
    }

    /// Parse a status line and headers. The body is left empty.
    ///
    /// ```
    /// use retriever::protocol::RtspResponse;
    ///
    /// let resp = RtspResponse::parse_head("RTSP/1.0 200 OK\r\nCSeq: 4\r\nSession: 1A2B;timeout=30\r\n\r\n").unwrap();
    /// assert_eq!(resp.status_code, 200);
    /// assert_eq!(resp.cseq(), Some(4));
    /// assert_eq!(resp.session().unwrap().id, "1A2B");
    /// ```
    pub fn parse_head(raw: &str) -> Result<Self> {
        let mut lines = raw.lines();

        let status_line = lines.next().filter(|l| !l.is_empty()).ok_or(RetrieverError::Parse {
            kind: ParseErrorKind::EmptyMessage,
        })?;

        let mut parts = status_line.splitn(3, ' ');
        let version = parts.next().unwrap_or_default();
        if !version.starts_with("RTSP/") {
            return Err(RetrieverError::Parse {
                kind: ParseErrorKind::InvalidStartLine,
            });
        }
        let status_code: u16 = parts
            .next()
            .and_then(|code| code.parse().ok())
            .ok_or(RetrieverError::Parse {
                kind: ParseErrorKind::InvalidStartLine,
            })?;
        if version != "RTSP/1.0" {
            tracing::debug!(version, "server answered with non-RTSP/1.0 version");
        }

        Ok(RtspResponse {
            status_code,
            status_text: parts.next().unwrap_or_default().trim().to_string(),
            headers: super::parse_headers(lines)?,
            body: Vec::new(),
        })
    }

    /// Look up a header value by name (case-insensitive, per RFC 2326 §4.2).
    pub fn get_header(&self, name: &str) -> Option<&str> {
        super::find_header(&self.headers, name)
    }

    /// All values of a repeatable header, in order.
    pub fn get_headers<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn cseq(&self) -> Option<u32> {
        self.get_header("CSeq")?.trim().parse().ok()
    }

    /// Body length announced by `Content-Length`; zero when absent.
    pub fn content_length(&self) -> Result<usize> {
        match self.get_header("Content-Length") {
            None => Ok(0),
            Some(value) => value.trim().parse().map_err(|_| RetrieverError::Parse {
                kind: ParseErrorKind::InvalidContentLength,
            }),
        }
    }

    /// The `Session` header (RFC 2326 §12.37), if present.
    pub fn session(&self) -> Option<SessionHeader> {
        self.get_header("Session").map(SessionHeader::parse)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// Parsed `Session` header: `<id>[;timeout=<seconds>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHeader {
    pub id: String,
    pub timeout: Duration,
}

impl SessionHeader {
    pub fn parse(value: &str) -> Self {
        let mut parts = value.split(';');
        let id = parts.next().unwrap_or_default().trim().to_string();
        let timeout = parts
            .filter_map(|p| p.trim().strip_prefix("timeout="))
            .find_map(|secs| secs.trim().parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_SESSION_TIMEOUT);
        SessionHeader { id, timeout }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_no_body() {
        let resp = RtspResponse::ok()
            .add_header("CSeq", "1")
            .add_header("Public", "OPTIONS, DESCRIBE");
        let s = String::from_utf8(resp.serialize()).unwrap();
        assert!(s.starts_with("RTSP/1.0 200 OK\r\n"));
        assert!(s.contains("CSeq: 1\r\n"));
        assert!(!s.contains("Content-Length"));
        assert!(s.ends_with("\r\n\r\n"));
    }

    #[test]
    fn serialize_with_body() {
        let resp = RtspResponse::ok()
            .add_header("CSeq", "2")
            .with_body("v=0\r\n");
        let s = String::from_utf8(resp.serialize()).unwrap();
        assert!(s.contains("Content-Length: 5\r\n"));
        assert!(s.ends_with("\r\n\r\nv=0\r\n"));
    }

    #[test]
    fn parse_serialized_head() {
        let raw = RtspResponse::new(401, "Unauthorized")
            .add_header("CSeq", "2")
            .add_header("WWW-Authenticate", "Basic realm=\"AXIS\"")
            .add_header("WWW-Authenticate", "Digest realm=\"AXIS\", nonce=\"abc\"")
            .serialize();
        let resp = RtspResponse::parse_head(std::str::from_utf8(&raw).unwrap()).unwrap();
        assert_eq!(resp.status_code, 401);
        assert_eq!(resp.status_text, "Unauthorized");
        assert!(!resp.is_success());
        assert_eq!(resp.get_headers("www-authenticate").count(), 2);
        assert_eq!(resp.content_length().unwrap(), 0);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(RtspResponse::parse_head("").is_err());
        assert!(RtspResponse::parse_head("HTTP/1.1 200 OK\r\n\r\n").is_err());
        assert!(RtspResponse::parse_head("RTSP/1.0 abc OK\r\n\r\n").is_err());
        assert!(RtspResponse::parse_head("RTSP/1.0 200 OK\r\nno colon here\r\n\r\n").is_err());
    }

    #[test]
    fn bad_content_length() {
        let resp =
            RtspResponse::parse_head("RTSP/1.0 200 OK\r\nContent-Length: many\r\n\r\n").unwrap();
        assert!(resp.content_length().is_err());
    }

    #[test]
    fn session_header_timeout() {
        assert_eq!(
            SessionHeader::parse("12345678;timeout=30"),
            SessionHeader {
                id: "12345678".into(),
                timeout: Duration::from_secs(30)
            }
        );
        assert_eq!(SessionHeader::parse("ABCD").timeout, DEFAULT_SESSION_TIMEOUT);
        assert_eq!(SessionHeader::parse("ABCD;timeout=0").timeout, DEFAULT_SESSION_TIMEOUT);
    }
}
