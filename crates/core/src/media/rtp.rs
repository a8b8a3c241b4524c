use crate::error::{MalformedPacketKind, Result, RetrieverError};

/// Length of the RTP fixed header (RFC 3550 §5.1).
pub const RTP_HEADER_LEN: usize = 12;

/// A parsed RTP packet (RFC 3550 §5.1).
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                             SSRC                              |
/// +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
/// |                  CSRC list (CC x 32 bits)                     |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |      profile (if X)           |     length in 32-bit words    |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// The packet borrows the receive buffer; it is consumed by the
/// demultiplexer immediately and never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket<'a> {
    pub sequence_number: u16,
    pub timestamp: u32,
    pub marker: bool,
    pub payload_type: u8,
    pub ssrc: u32,
    /// Header extension block, when the X bit is set (RFC 3550 §5.3.1).
    pub extension: Option<HeaderExtension<'a>>,
    /// Payload with CSRCs, extension and padding removed.
    pub payload: &'a [u8],
}

/// A raw RTP header extension: 16-bit profile identifier plus data words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderExtension<'a> {
    pub profile: u16,
    pub data: &'a [u8],
}

impl<'a> RtpPacket<'a> {
    /// Parse and validate an RTP packet.
    ///
    /// Returns [`RetrieverError::MalformedPacket`] when the buffer is shorter
    /// than the fixed header, the version is not 2, the CSRC list or
    /// extension runs past the end, or the padding count is invalid.
    ///
    /// ```
    /// use retriever::media::rtp::RtpPacket;
    ///
    /// let raw = [0x80, 0xE0, 0x00, 0x07, 0, 0, 0x0B, 0xB8, 0, 0, 0, 1, 0xAA];
    /// let pkt = RtpPacket::parse(&raw).unwrap();
    /// assert_eq!(pkt.sequence_number, 7);
    /// assert_eq!(pkt.timestamp, 3000);
    /// assert!(pkt.marker);
    /// assert_eq!(pkt.payload_type, 96);
    /// assert_eq!(pkt.payload, &[0xAA]);
    /// ```
    pub fn parse(buf: &'a [u8]) -> Result<Self> {
        if buf.len() < RTP_HEADER_LEN {
            return Err(malformed(MalformedPacketKind::TooShort));
        }
        if buf[0] >> 6 != 2 {
            return Err(malformed(MalformedPacketKind::BadVersion));
        }

        let padding = buf[0] & 0x20 != 0;
        let has_extension = buf[0] & 0x10 != 0;
        let csrc_count = (buf[0] & 0x0f) as usize;
        let marker = buf[1] & 0x80 != 0;
        let payload_type = buf[1] & 0x7f;
        let sequence_number = u16::from_be_bytes([buf[2], buf[3]]);
        let timestamp = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let ssrc = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);

        let mut offset = RTP_HEADER_LEN + csrc_count * 4;
        if buf.len() < offset {
            return Err(malformed(MalformedPacketKind::Truncated));
        }

        let extension = if has_extension {
            if buf.len() < offset + 4 {
                return Err(malformed(MalformedPacketKind::Truncated));
            }
            let profile = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
            let words = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]) as usize;
            let start = offset + 4;
            let end = start + words * 4;
            if buf.len() < end {
                return Err(malformed(MalformedPacketKind::Truncated));
            }
            offset = end;
            Some(HeaderExtension {
                profile,
                data: &buf[start..end],
            })
        } else {
            None
        };

        let mut end = buf.len();
        if padding {
            let pad = buf[buf.len() - 1] as usize;
            if pad == 0 || offset + pad > buf.len() {
                return Err(malformed(MalformedPacketKind::BadPadding));
            }
            end -= pad;
        }

        Ok(RtpPacket {
            sequence_number,
            timestamp,
            marker,
            payload_type,
            ssrc,
            extension,
            payload: &buf[offset..end],
        })
    }
}

/// Validate the common RTCP header of a compound packet (RFC 3550 §6.4).
///
/// Returns the packet type of the first report (e.g. 200 for SR, 201 for RR).
pub fn validate_rtcp(buf: &[u8]) -> Result<u8> {
    if buf.len() < 8 {
        return Err(malformed(MalformedPacketKind::TooShort));
    }
    if buf[0] >> 6 != 2 {
        return Err(malformed(MalformedPacketKind::BadVersion));
    }
    let words = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    if buf.len() < (words + 1) * 4 {
        return Err(malformed(MalformedPacketKind::Truncated));
    }
    Ok(buf[1])
}

fn malformed(kind: MalformedPacketKind) -> RetrieverError {
    RetrieverError::MalformedPacket(kind)
}

/// RTP fixed header writer (RFC 3550 §5.1).
///
/// Produces the packets a camera would send; used to drive the
/// demultiplexer from simulated senders. It manages:
/// - **Sequence number**: 16-bit, wrapping, incremented on every packet.
/// - **Timestamp**: stored as u64 internally; the lower 32 bits are written to the wire.
/// - **SSRC**: randomly generated per RFC 3550 §8.1 to avoid collisions.
#[derive(Debug)]
pub struct RtpHeader {
    /// RTP payload type (7-bit, RFC 3551).
    pub pt: u8,
    /// Synchronization source identifier (RFC 3550 §8.1).
    pub ssrc: u32,
    sequence: u16,
    timestamp: u64,
}

impl RtpHeader {
    /// Create a new RTP header state with explicit SSRC.
    pub fn new(pt: u8, ssrc: u32) -> Self {
        Self {
            pt,
            ssrc,
            sequence: 0,
            timestamp: 0,
        }
    }

    /// Create with a random SSRC.
    pub fn with_random_ssrc(pt: u8) -> Self {
        let ssrc = rand::random::<u32>();
        Self::new(pt, ssrc)
    }

    /// Current sequence number (before the next [`write`](Self::write) call).
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    /// Jump to an arbitrary sequence number (e.g. to simulate loss).
    pub fn set_sequence(&mut self, sequence: u16) {
        self.sequence = sequence;
    }

    /// Current timestamp (internal u64 representation).
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Serialize a 12-byte RTP fixed header and advance the sequence number.
    pub fn write(&mut self, marker: bool) -> [u8; RTP_HEADER_LEN] {
        let first_byte: u8 = 2 << 6;
        let second_byte: u8 = ((marker as u8) << 7) | self.pt;

        let mut header = [0u8; RTP_HEADER_LEN];
        header[0] = first_byte;
        header[1] = second_byte;
        header[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        header[4..8].copy_from_slice(&(self.timestamp as u32).to_be_bytes());
        header[8..12].copy_from_slice(&self.ssrc.to_be_bytes());

        self.sequence = self.sequence.wrapping_add(1);
        header
    }

    /// Build a complete packet: header, optional extension block, payload.
    ///
    /// `extension` data is zero-padded to a whole number of 32-bit words.
    pub fn packet(
        &mut self,
        marker: bool,
        extension: Option<(u16, &[u8])>,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut packet = Vec::with_capacity(RTP_HEADER_LEN + payload.len() + 16);
        packet.extend_from_slice(&self.write(marker));
        if let Some((profile, data)) = extension {
            packet[0] |= 0x10;
            let words = data.len().div_ceil(4);
            packet.extend_from_slice(&profile.to_be_bytes());
            packet.extend_from_slice(&(words as u16).to_be_bytes());
            packet.extend_from_slice(data);
            packet.resize(packet.len() + (words * 4 - data.len()), 0);
        }
        packet.extend_from_slice(payload);
        packet
    }

    /// Advance the RTP timestamp by the given increment.
    pub fn advance_timestamp(&mut self, increment: u32) {
        self.timestamp = self.timestamp.wrapping_add(increment as u64);
    }
}
