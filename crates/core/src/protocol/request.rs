use std::fmt;

use crate::error::{ParseErrorKind, RetrieverError};

/// RTSP methods issued by the client (RFC 2326 §10).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Options,
    Describe,
    Setup,
    Play,
    GetParameter,
    Teardown,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Options => "OPTIONS",
            Self::Describe => "DESCRIBE",
            Self::Setup => "SETUP",
            Self::Play => "PLAY",
            Self::GetParameter => "GET_PARAMETER",
            Self::Teardown => "TEARDOWN",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An RTSP request (RFC 2326 §6).
///
/// RTSP requests follow HTTP/1.1 syntax:
///
/// ```text
/// Method SP Request-URI SP RTSP-Version CRLF
/// *(Header: Value CRLF)
/// CRLF
/// ```
///
/// Built by the negotiator with [`new`](Self::new) and
/// [`add_header`](Self::add_header), then written with
/// [`serialize`](Self::serialize), which stamps the `CSeq`.
/// [`parse`](Self::parse) reads the same format back; header lookup is
/// case-insensitive per RFC 2326 §4.2.
#[derive(Debug, Clone)]
#[must_use]
pub struct RtspRequest {
    /// RTSP method name (`DESCRIBE`, `SETUP`, ...).
    pub method: String,
    /// Request-URI (e.g. `rtsp://host/axis-media/media.amp/trackID=1`).
    pub uri: String,
    /// Headers as ordered (name, value) pairs.
    pub headers: Vec<(String, String)>,
}

impl RtspRequest {
    pub fn new(method: Method, uri: &str) -> Self {
        Self {
            method: method.as_str().to_string(),
            uri: uri.to_string(),
            headers: Vec::new(),
        }
    }

    pub fn add_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Serialize to the RTSP text wire format with the given sequence number.
    pub fn serialize(&self, cseq: u32) -> String {
        let mut request = format!("{} {} RTSP/1.0\r\nCSeq: {cseq}\r\n", self.method, self.uri);
        for (name, value) in &self.headers {
            request.push_str(&format!("{name}: {value}\r\n"));
        }
        request.push_str("\r\n");
        request
    }

    /// Parse an RTSP request from its text representation.
    ///
    /// Expects a complete request head: request line, headers, and trailing
    /// blank line. Returns [`RetrieverError::Parse`] on malformed input.
    pub fn parse(raw: &str) -> crate::error::Result<Self> {
        let mut lines = raw.lines();

        let request_line = lines.next().filter(|l| !l.is_empty()).ok_or(RetrieverError::Parse {
            kind: ParseErrorKind::EmptyMessage,
        })?;

        let parts: Vec<&str> = request_line.split_whitespace().collect();
        if parts.len() != 3 {
            return Err(RetrieverError::Parse {
                kind: ParseErrorKind::InvalidStartLine,
            });
        }

        Ok(Self {
            method: parts[0].to_string(),
            uri: parts[1].to_string(),
            headers: super::parse_headers(lines)?,
        })
    }

    /// Look up a header value by name (case-insensitive, per RFC 2326 §4.2).
    pub fn get_header(&self, name: &str) -> Option<&str> {
        super::find_header(&self.headers, name)
    }

    /// Returns the CSeq header value (RFC 2326 §12.17).
    pub fn cseq(&self) -> Option<&str> {
        self.get_header("CSeq")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_describe() {
        let req = RtspRequest::new(Method::Describe, "rtsp://cam/axis-media/media.amp")
            .add_header("Accept", "application/sdp");
        assert_eq!(
            req.serialize(2),
            "DESCRIBE rtsp://cam/axis-media/media.amp RTSP/1.0\r\nCSeq: 2\r\nAccept: application/sdp\r\n\r\n"
        );
    }

    #[test]
    fn serialized_request_parses_back() {
        let raw = RtspRequest::new(Method::Setup, "rtsp://cam/media.amp/trackID=1")
            .add_header("Transport", "RTP/AVP/TCP;unicast;interleaved=0-1")
            .serialize(3);
        let req = RtspRequest::parse(&raw).unwrap();
        assert_eq!(req.method, "SETUP");
        assert_eq!(req.cseq(), Some("3"));
        assert_eq!(
            req.get_header("transport"),
            Some("RTP/AVP/TCP;unicast;interleaved=0-1")
        );
    }

    #[test]
    fn parse_empty_request() {
        assert!(RtspRequest::parse("").is_err());
    }

    #[test]
    fn parse_invalid_request_line() {
        assert!(RtspRequest::parse("JUST_A_METHOD\r\n\r\n").is_err());
    }

    #[test]
    fn method_names() {
        assert_eq!(Method::GetParameter.to_string(), "GET_PARAMETER");
        assert_eq!(Method::Teardown.as_str(), "TEARDOWN");
    }
}
