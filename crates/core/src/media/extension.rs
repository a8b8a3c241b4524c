//! Vendor RTP header extension decoding.
//!
//! Axis cameras requested with `onvifreplayext=1` attach the ONVIF replay
//! extension (profile `0xABAC`) to video packets:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |            0xABAC             |           length=3            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                  NTP timestamp (seconds)                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                  NTP timestamp (fraction)                     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |C|E|D|T|        reserved                       |    CSeq       |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Field offsets differ between firmware generations, so the layout is a
//! value ([`ExtensionLayout`]) rather than hard-coded constants.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::rtp::HeaderExtension;

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// Byte layout of a vendor timing extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtensionLayout {
    /// Expected 16-bit profile identifier; other profiles are ignored.
    pub profile: u16,
    /// Offset of the 32-bit NTP seconds word.
    pub ntp_seconds_offset: usize,
    /// Offset of the 32-bit NTP fraction word.
    pub ntp_fraction_offset: usize,
    /// Offset of the 32-bit flags word (flag bits high, counter low byte).
    pub flags_offset: usize,
    /// Blocks shorter than this are reported as unavailable.
    pub min_len: usize,
}

impl ExtensionLayout {
    /// ONVIF replay extension as sent by Axis firmware.
    pub const ONVIF_REPLAY: Self = Self {
        profile: 0xABAC,
        ntp_seconds_offset: 0,
        ntp_fraction_offset: 4,
        flags_offset: 8,
        min_len: 12,
    };

    /// Decode an extension block.
    ///
    /// Returns `None` ("unavailable") when the block is absent, carries a
    /// different profile, or is shorter than the layout requires. Malformed
    /// vendor data is never an error.
    pub fn decode(&self, ext: Option<&HeaderExtension<'_>>) -> Option<ExtensionRecord> {
        let ext = ext?;
        if ext.profile != self.profile {
            return None;
        }
        self.decode_block(ext.data)
    }

    /// Decode the data words of an extension, ignoring the profile.
    pub fn decode_block(&self, data: &[u8]) -> Option<ExtensionRecord> {
        let needed = self
            .min_len
            .max(self.ntp_seconds_offset + 4)
            .max(self.ntp_fraction_offset + 4)
            .max(self.flags_offset + 4);
        if data.len() < needed {
            tracing::trace!(len = data.len(), needed, "extension block too short");
            return None;
        }

        let seconds = read_u32(data, self.ntp_seconds_offset);
        let fraction = read_u32(data, self.ntp_fraction_offset);
        let flags = read_u32(data, self.flags_offset);

        Some(ExtensionRecord {
            ntp_timestamp: NtpTimestamp { seconds, fraction },
            frame_counter: (flags & 0xff) as u8,
            vendor_flags: VendorFlags {
                clean_point: (flags >> 31) & 1 == 1,
                end_of_contiguous: (flags >> 30) & 1 == 1,
                discontinuity: (flags >> 29) & 1 == 1,
                terminal: (flags >> 28) & 1 == 1,
            },
        })
    }
}

impl Default for ExtensionLayout {
    fn default() -> Self {
        Self::ONVIF_REPLAY
    }
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

/// Decoded vendor timing extension of one RTP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtensionRecord {
    /// Capture time as reported by the camera.
    pub ntp_timestamp: NtpTimestamp,
    /// Low byte of the flags word (the RTSP CSeq of the PLAY that started the stream).
    pub frame_counter: u8,
    pub vendor_flags: VendorFlags,
}

/// Flag bits of the ONVIF replay extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VendorFlags {
    /// C: the packet starts a clean point (keyframe).
    pub clean_point: bool,
    /// E: last packet of a contiguous section.
    pub end_of_contiguous: bool,
    /// D: discontinuity before this packet.
    pub discontinuity: bool,
    /// T: end of the recording.
    pub terminal: bool,
}

/// 64-bit NTP timestamp (RFC 5905 §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct NtpTimestamp {
    pub seconds: u32,
    pub fraction: u32,
}

impl NtpTimestamp {
    /// Convert to wall-clock time. Returns `None` for instants before 1970.
    pub fn to_system_time(self) -> Option<SystemTime> {
        let secs = (self.seconds as u64).checked_sub(NTP_UNIX_OFFSET)?;
        let nanos = ((self.fraction as u64 * 1_000_000_000) >> 32) as u32;
        UNIX_EPOCH.checked_add(Duration::new(secs, nanos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(seconds: u32, fraction: u32, flags: u32) -> Vec<u8> {
        let mut b = Vec::new();
        b.extend_from_slice(&seconds.to_be_bytes());
        b.extend_from_slice(&fraction.to_be_bytes());
        b.extend_from_slice(&flags.to_be_bytes());
        b
    }

    #[test]
    fn decodes_onvif_replay_block() {
        let data = block(3_913_056_000, 0x8000_0000, 0xA000_0007);
        let ext = HeaderExtension {
            profile: 0xABAC,
            data: &data,
        };
        let rec = ExtensionLayout::ONVIF_REPLAY.decode(Some(&ext)).unwrap();
        assert_eq!(rec.ntp_timestamp.seconds, 3_913_056_000);
        assert_eq!(rec.frame_counter, 7);
        assert!(rec.vendor_flags.clean_point);
        assert!(!rec.vendor_flags.end_of_contiguous);
        assert!(rec.vendor_flags.discontinuity);
        assert!(!rec.vendor_flags.terminal);
    }

    #[test]
    fn absent_block_is_unavailable() {
        assert!(ExtensionLayout::default().decode(None).is_none());
    }

    #[test]
    fn other_profile_is_unavailable() {
        let data = block(1, 2, 3);
        let ext = HeaderExtension {
            profile: 0xBEDE,
            data: &data,
        };
        assert!(ExtensionLayout::default().decode(Some(&ext)).is_none());
    }

    #[test]
    fn custom_layout_offsets() {
        let layout = ExtensionLayout {
            profile: 0x1000,
            ntp_seconds_offset: 4,
            ntp_fraction_offset: 8,
            flags_offset: 0,
            min_len: 12,
        };
        let data = block(0x1000_0002, 10, 20);
        let rec = layout.decode_block(&data).unwrap();
        assert_eq!(rec.ntp_timestamp, NtpTimestamp { seconds: 10, fraction: 20 });
        assert_eq!(rec.frame_counter, 2);
        assert!(rec.vendor_flags.terminal);
    }

    #[test]
    fn ntp_to_system_time() {
        let ts = NtpTimestamp {
            seconds: NTP_UNIX_OFFSET as u32 + 10,
            fraction: 0x8000_0000,
        };
        let t = ts.to_system_time().unwrap();
        assert_eq!(t.duration_since(UNIX_EPOCH).unwrap(), Duration::from_millis(10_500));
        assert!(NtpTimestamp { seconds: 5, fraction: 0 }.to_system_time().is_none());
    }

    mod properties {
        use super::super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn short_blocks_are_unavailable(data in proptest::collection::vec(any::<u8>(), 0..12)) {
                let ext = HeaderExtension { profile: 0xABAC, data: &data };
                prop_assert!(ExtensionLayout::ONVIF_REPLAY.decode(Some(&ext)).is_none());
            }

            #[test]
            fn full_blocks_decode(data in proptest::collection::vec(any::<u8>(), 12..64)) {
                let ext = HeaderExtension { profile: 0xABAC, data: &data };
                prop_assert!(ExtensionLayout::ONVIF_REPLAY.decode(Some(&ext)).is_some());
            }
        }
    }
}
