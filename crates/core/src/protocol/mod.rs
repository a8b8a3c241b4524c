//! RTSP client protocol (RFC 2326).
//!
//! This module handles the text-based RTSP signaling protocol: building
//! requests, parsing responses and SDP, and answering auth challenges.
//!
//! ## RTSP message format (RFC 2326 §4)
//!
//! RTSP messages follow HTTP/1.1 syntax with a different method set:
//!
//! ```text
//! DESCRIBE rtsp://192.168.0.90/axis-media/media.amp?camera=1 RTSP/1.0\r\n
//! CSeq: 2\r\n
//! Accept: application/sdp\r\n
//! \r\n
//! ```
//!
//! Key differences from HTTP:
//! - Stateful: sessions persist across requests (RFC 2326 §3).
//! - Session header carries a server-assigned ID (RFC 2326 §12.37).
//! - Interleaved RTP shares the TCP connection with responses (RFC 2326 §10.12).
//!
//! ## Methods issued
//!
//! | Method | RFC section | Purpose |
//! |--------|-------------|---------|
//! | DESCRIBE | §10.2 | Retrieve SDP session description |
//! | SETUP | §10.4 | Negotiate one transport per stream |
//! | PLAY | §10.5 | Start media delivery |
//! | GET_PARAMETER | §10.8 | Keepalive |
//! | TEARDOWN | §10.7 | Destroy session |

pub mod auth;
pub mod request;
pub mod response;
pub mod sdp;

pub use auth::{Authenticator, Challenge};
pub use request::{Method, RtspRequest};
pub use response::{RtspResponse, SessionHeader};
pub use sdp::{MediaDescription, SessionDescription};

use crate::error::{ParseErrorKind, Result, RetrieverError};

/// Parse `Name: value` lines up to the first blank line.
fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> Result<Vec<(String, String)>> {
    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let colon_pos = line.find(':').ok_or(RetrieverError::Parse {
            kind: ParseErrorKind::InvalidHeader,
        })?;
        headers.push((
            line[..colon_pos].trim().to_string(),
            line[colon_pos + 1..].trim().to_string(),
        ));
    }
    Ok(headers)
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}
