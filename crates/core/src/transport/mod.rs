//! Network transport layer for RTSP signaling and RTP media reception.
//!
//! RTSP uses a split transport model:
//!
//! - **TCP** ([`tcp`]): carries RTSP request/response signaling. With
//!   interleaved transport (RFC 2326 §10.12, the default) RTP and RTCP
//!   share the same connection, framed as `$ <channel> <length> <data>`.
//!
//! - **UDP** ([`udp`]): one socket pair per stream when the session is
//!   negotiated with `client_port`.
//!
//! Both implement [`MediaSource`], so the session's read loop is the same
//! for either transport.

pub mod tcp;
pub mod udp;

pub use tcp::ControlConnection;
pub use udp::UdpMediaSource;

use crate::error::Result;

/// Result of one bounded read from a media source.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// One RTP or RTCP packet. `channel` follows the interleaved numbering:
    /// even for RTP, odd for RTCP.
    Packet { channel: u8, data: Vec<u8> },
    /// Nothing arrived within the read timeout.
    Timeout,
    /// The peer closed the connection.
    Closed,
}

/// A source of media packets with a bounded read.
///
/// `read` must return within the configured read timeout so the caller can
/// observe cancellation. The source is closed when dropped.
pub trait MediaSource: Send {
    fn read(&mut self) -> Result<ReadOutcome>;
}

/// Whether an I/O error is a read timeout (platforms differ in the kind).
pub(crate) fn is_timeout(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}
