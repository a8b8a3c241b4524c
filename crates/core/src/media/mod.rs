//! Media streams, RTP parsing and payload reassembly.
//!
//! This module turns raw RTP packets received on a negotiated transport into
//! [`AssembledUnit`]s handed to the host application.
//!
//! ## RTP overview (RFC 3550)
//!
//! Every RTP packet carries a 12-byte fixed header ([`rtp::RtpPacket`])
//! containing:
//!
//! - **Sequence number** (16-bit, wrapping): for loss detection.
//! - **Timestamp** (32-bit): media clock, typically 90 kHz for video.
//! - **Marker bit**: set on the last packet of an access unit (frame).
//! - **Extension bit**: a header extension follows the CSRC list; Axis
//!   cameras use it for the ONVIF replay timestamp ([`extension`]).
//!
//! ## Media kinds
//!
//! | Kind | Reassembly | Depayloader |
//! |------|------------|-------------|
//! | Video | fragments sharing one timestamp, completed by the marker bit | [`h264`] for H.264, raw concatenation otherwise |
//! | Application | one unit per packet | none |

pub mod demux;
pub mod diagnostics;
pub mod extension;
pub mod h264;
pub mod rtp;

use std::fmt;

pub use demux::{AssembledUnit, RtpInfo, StreamDemuxer};
pub use diagnostics::{DiagnosticsSnapshot, DiagnosticsTracker};
pub use extension::{ExtensionLayout, ExtensionRecord, NtpTimestamp, VendorFlags};

/// The kind of media carried by one negotiated stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    /// Encoded video (fragmentable across RTP packets).
    Video,
    /// Scene/analytics metadata (`m=application` in SDP).
    Application,
}

impl MediaKind {
    /// Parse the media field of an SDP `m=` line.
    pub fn from_sdp(media: &str) -> Option<Self> {
        if media.eq_ignore_ascii_case("video") {
            Some(Self::Video)
        } else if media.eq_ignore_ascii_case("application") {
            Some(Self::Application)
        } else {
            None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Application => "application",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pixel dimensions advertised for a video stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameGeometry {
    pub width: u32,
    pub height: u32,
}

/// One negotiated media stream (RFC 2326 §10.4).
///
/// Created by the session negotiator once SETUP succeeds and never mutated
/// afterwards. The demultiplexer holds a clone for payload-type validation
/// and clock conversions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDescriptor {
    pub media_kind: MediaKind,
    /// Index of the transport within the session (0-based, SETUP order).
    pub transport_id: usize,
    /// RTP clock rate in Hz (from `a=rtpmap`).
    pub clock_rate: u32,
    /// Negotiated RTP payload type.
    pub payload_type: u8,
    /// Encoding name from `a=rtpmap` (e.g. `H264`, `vnd.onvif.metadata`).
    pub encoding: String,
    /// Absolute control URL used for SETUP.
    pub control: String,
    /// Frame size advertised in SDP, when present.
    pub geometry: Option<FrameGeometry>,
}

/// Codec-specific RTP depayloader.
///
/// Converts the payload of each RTP packet belonging to one access unit into
/// bytes appended to the unit buffer. Packets arrive in order; on loss the
/// assembler calls [`reset`](Self::reset) and discards the partial unit.
pub trait Depayloader: Send {
    /// Append the depayloaded form of `payload` to `unit`.
    fn depayload(&mut self, payload: &[u8], unit: &mut Vec<u8>);

    /// Finalize a completed unit (e.g. inject parameter sets).
    fn finish(&mut self, _unit: &mut Vec<u8>) {}

    /// Drop any fragment state carried between packets.
    fn reset(&mut self) {}
}

/// Depayloader for encodings without fragmentation headers: payloads are
/// concatenated as received.
#[derive(Debug, Default)]
pub struct RawDepayloader;

impl Depayloader for RawDepayloader {
    fn depayload(&mut self, payload: &[u8], unit: &mut Vec<u8>) {
        unit.extend_from_slice(payload);
    }
}

/// Select a depayloader for an `a=rtpmap` encoding name.
///
/// `fmtp` is the parameter list of the matching `a=fmtp` line, used to pick
/// up out-of-band parameter sets.
pub fn depayloader_for(encoding: &str, fmtp: Option<&str>) -> Box<dyn Depayloader> {
    if encoding.eq_ignore_ascii_case("H264") {
        Box::new(h264::H264Depayloader::from_fmtp(fmtp))
    } else {
        Box::new(RawDepayloader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_kind_from_sdp() {
        assert_eq!(MediaKind::from_sdp("video"), Some(MediaKind::Video));
        assert_eq!(MediaKind::from_sdp("Application"), Some(MediaKind::Application));
        assert_eq!(MediaKind::from_sdp("audio"), None);
    }

    #[test]
    fn raw_depayloader_concatenates() {
        let mut d = RawDepayloader;
        let mut unit = Vec::new();
        d.depayload(b"<a>", &mut unit);
        d.depayload(b"</a>", &mut unit);
        assert_eq!(unit, b"<a></a>");
    }
}
