//! Error types for the retriever engine.

use std::fmt;
use std::time::Duration;

use crate::media::MediaKind;

/// Errors that can occur while building URLs, negotiating a session, or
/// receiving media.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Input**: [`InvalidParameter`](Self::InvalidParameter),
///   [`InvalidUrl`](Self::InvalidUrl): rejected before any network I/O.
/// - **Session**: [`Connection`](Self::Connection),
///   [`NegotiationTimeout`](Self::NegotiationTimeout),
///   [`TransportSetup`](Self::TransportSetup), [`Protocol`](Self::Protocol),
///   [`StreamTimeout`](Self::StreamTimeout).
/// - **Packet**: [`Parse`](Self::Parse), [`MalformedPacket`](Self::MalformedPacket)
///   are absorbed into diagnostics, never surfaced through the error callback.
/// - **Facade**: [`AlreadyStarted`](Self::AlreadyStarted),
///   [`Cancelled`](Self::Cancelled), [`Callback`](Self::Callback).
#[derive(Debug, thiserror::Error)]
pub enum RetrieverError {
    /// Bad input to the URL builder or configuration.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The RTSP URL could not be parsed (scheme, host or port).
    #[error("invalid RTSP URL: {0}")]
    InvalidUrl(String),

    /// The control connection could not be opened, or was lost.
    #[error("connection error ({addr}): {source}")]
    Connection {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// A negotiation step did not complete within the configured bound.
    #[error("negotiation timed out during {step} after {after:?}")]
    NegotiationTimeout { step: String, after: Duration },

    /// A requested media transport could not be established.
    #[error("transport setup failed for {media} stream: {reason}")]
    TransportSetup { media: MediaKind, reason: String },

    /// The server answered a request with a non-success status.
    #[error("{method} rejected with {status} {reason}")]
    Protocol {
        method: String,
        status: u16,
        reason: String,
    },

    /// No media arrived on any stream for the configured idle period.
    #[error("no media received for {0:?}")]
    StreamTimeout(Duration),

    /// Failed to parse an RTSP response or SDP body.
    #[error("RTSP parse error: {kind}")]
    Parse { kind: ParseErrorKind },

    /// An RTP/RTCP packet violated RFC 3550 framing.
    #[error("malformed packet: {0}")]
    MalformedPacket(MalformedPacketKind),

    /// [`Retriever::start`](crate::Retriever::start) was called while a session is active.
    #[error("retriever already started")]
    AlreadyStarted,

    /// [`Retriever::stop`](crate::Retriever::stop) was called before negotiation finished.
    #[error("session cancelled before playback started")]
    Cancelled,

    /// A host callback panicked during delivery.
    #[error("{callback} callback panicked: {message}")]
    Callback {
        callback: &'static str,
        message: String,
    },

    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RetrieverError {
    /// Stable code reported in [`ErrorEvent`](crate::ErrorEvent)s.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidParameter(_) => ErrorCode::InvalidParameter,
            Self::InvalidUrl(_) => ErrorCode::InvalidUrl,
            Self::Connection { .. } | Self::Io(_) => ErrorCode::Connection,
            Self::NegotiationTimeout { .. } => ErrorCode::NegotiationTimeout,
            Self::TransportSetup { .. } => ErrorCode::TransportSetup,
            Self::Protocol { .. } | Self::Parse { .. } => ErrorCode::Protocol,
            Self::StreamTimeout(_) => ErrorCode::StreamTimeout,
            Self::MalformedPacket(_) => ErrorCode::MalformedPacket,
            Self::AlreadyStarted => ErrorCode::AlreadyStarted,
            Self::Cancelled => ErrorCode::Cancelled,
            Self::Callback { .. } => ErrorCode::Callback,
        }
    }
}

/// Stable, machine-readable error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InvalidParameter,
    InvalidUrl,
    Connection,
    NegotiationTimeout,
    TransportSetup,
    Protocol,
    StreamTimeout,
    MalformedPacket,
    AlreadyStarted,
    Cancelled,
    Callback,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidParameter => "invalid_parameter",
            Self::InvalidUrl => "invalid_url",
            Self::Connection => "connection_error",
            Self::NegotiationTimeout => "negotiation_timeout",
            Self::TransportSetup => "transport_setup_error",
            Self::Protocol => "protocol_error",
            Self::StreamTimeout => "stream_timeout",
            Self::MalformedPacket => "malformed_packet",
            Self::AlreadyStarted => "already_started",
            Self::Cancelled => "cancelled",
            Self::Callback => "callback_error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Specific kind of RTSP/SDP parse failure.
#[derive(Debug)]
pub enum ParseErrorKind {
    /// Input was empty (no start line).
    EmptyMessage,
    /// Request or status line did not have the expected three-part format.
    InvalidStartLine,
    /// A header line did not contain a colon separator.
    InvalidHeader,
    /// `Content-Length` was not a number.
    InvalidContentLength,
    /// A required header was missing from a response.
    MissingHeader(&'static str),
    /// The SDP body did not contain a usable media description.
    InvalidSdp,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyMessage => write!(f, "empty message"),
            Self::InvalidStartLine => write!(f, "invalid start line"),
            Self::InvalidHeader => write!(f, "invalid header"),
            Self::InvalidContentLength => write!(f, "invalid Content-Length"),
            Self::MissingHeader(name) => write!(f, "missing {name} header"),
            Self::InvalidSdp => write!(f, "invalid session description"),
        }
    }
}

/// Why an RTP or RTCP packet was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedPacketKind {
    /// Shorter than the 12-byte fixed header (or 8-byte RTCP header).
    TooShort,
    /// Version field was not 2.
    BadVersion,
    /// CSRC list or header extension runs past the end of the packet.
    Truncated,
    /// Padding count exceeds the available payload.
    BadPadding,
    /// Payload type does not match the negotiated stream.
    UnexpectedPayloadType(u8),
}

impl fmt::Display for MalformedPacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort => write!(f, "too short"),
            Self::BadVersion => write!(f, "unsupported version"),
            Self::Truncated => write!(f, "truncated header"),
            Self::BadPadding => write!(f, "invalid padding"),
            Self::UnexpectedPayloadType(pt) => write!(f, "unexpected payload type {pt}"),
        }
    }
}

/// Convenience alias for `Result<T, RetrieverError>`.
pub type Result<T> = std::result::Result<T, RetrieverError>;
