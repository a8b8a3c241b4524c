//! Per-stream RTP demultiplexing and unit assembly.
//!
//! A [`StreamDemuxer`] owns everything one negotiated stream needs between
//! the socket and the host: packet validation, sequence tracking, payload
//! reassembly and extension decoding. It is driven by a single reader and
//! never blocks.
//!
//! ## Video assembly
//!
//! ```text
//! seq:     1    2    3M | 4    5    6    7M | 8    9  | 10   11   12M
//! ts:      0    0    0  | 3k   3k   3k   3k | 6k   6k | 9k   9k   9k
//!                     ▲                    ▲        ▲              ▲
//!                  emit                  emit    drop           emit
//! ```
//!
//! Fragments sharing a timestamp accumulate until a packet with the marker
//! bit completes the unit. A new timestamp before the marker discards the
//! partial unit: a late, incomplete frame is worth less than the next one.
//! A sequence gap inside a unit discards it as well, together with the
//! remaining packets of its timestamp.

use std::time::{Instant, SystemTime};

use super::diagnostics::{DiagnosticsSnapshot, DiagnosticsTracker};
use super::extension::{ExtensionLayout, ExtensionRecord};
use super::rtp::{RtpPacket, validate_rtcp};
use super::{Depayloader, FrameGeometry, MediaKind, StreamDescriptor};
use crate::error::{MalformedPacketKind, RetrieverError};

/// RTP-level metadata of an assembled unit.
#[derive(Debug, Clone, PartialEq)]
pub struct RtpInfo {
    /// Sequence number of the packet that completed the unit.
    pub sequence: u16,
    pub timestamp: u32,
    /// Vendor extension of the unit's first packet carrying one.
    pub extension: Option<ExtensionRecord>,
    /// Wall-clock arrival of the unit's first packet.
    pub arrival: SystemTime,
}

/// One complete video frame or metadata packet, ready for the host.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledUnit {
    pub media_kind: MediaKind,
    pub payload: Vec<u8>,
    pub rtp_info: RtpInfo,
    /// Frame size from SDP; `None` for application data.
    pub geometry: Option<FrameGeometry>,
    pub diagnostics: DiagnosticsSnapshot,
}

struct PendingUnit {
    timestamp: u32,
    extension: Option<ExtensionRecord>,
    arrival: SystemTime,
    payload: Vec<u8>,
}

/// Demultiplexer for one negotiated stream.
pub struct StreamDemuxer {
    descriptor: StreamDescriptor,
    layout: ExtensionLayout,
    depayloader: Box<dyn Depayloader>,
    diagnostics: DiagnosticsTracker,
    pending: Option<PendingUnit>,
    /// Timestamp of a unit damaged by loss; its remaining packets are skipped.
    damaged: Option<u32>,
}

impl StreamDemuxer {
    pub fn new(
        descriptor: StreamDescriptor,
        depayloader: Box<dyn Depayloader>,
        layout: ExtensionLayout,
    ) -> Self {
        let diagnostics = DiagnosticsTracker::new(descriptor.clock_rate);
        Self {
            descriptor,
            layout,
            depayloader,
            diagnostics,
            pending: None,
            damaged: None,
        }
    }

    pub fn descriptor(&self) -> &StreamDescriptor {
        &self.descriptor
    }

    pub fn media_kind(&self) -> MediaKind {
        self.descriptor.media_kind
    }

    pub fn diagnostics(&self) -> &DiagnosticsTracker {
        &self.diagnostics
    }

    pub fn diagnostics_mut(&mut self) -> &mut DiagnosticsTracker {
        &mut self.diagnostics
    }

    /// Feed one RTP packet received now.
    pub fn push_rtp(&mut self, buf: &[u8]) -> Option<AssembledUnit> {
        self.push_rtp_at(buf, Instant::now(), SystemTime::now())
    }

    /// Feed one RTP packet with explicit arrival times.
    ///
    /// Returns the unit this packet completed, if any. Malformed packets and
    /// packets of another payload type are counted and dropped.
    pub fn push_rtp_at(
        &mut self,
        buf: &[u8],
        arrival: Instant,
        wall_clock: SystemTime,
    ) -> Option<AssembledUnit> {
        let packet = match self.validate(buf) {
            Ok(packet) => packet,
            Err(e) => {
                self.diagnostics.record_malformed();
                tracing::warn!(
                    media = %self.descriptor.media_kind,
                    len = buf.len(),
                    error = %e,
                    "dropping RTP packet"
                );
                return None;
            }
        };

        let gap = self
            .diagnostics
            .record_packet(packet.sequence_number, packet.timestamp, arrival);
        if gap {
            self.depayloader.reset();
            if let Some(partial) = self.pending.take() {
                tracing::debug!(
                    partial_ts = partial.timestamp,
                    seq = packet.sequence_number,
                    "packet loss inside unit, discarding partial unit"
                );
                self.damaged = Some(partial.timestamp);
                self.diagnostics.record_dropped_unit();
            }
        }

        let extension = self.layout.decode(packet.extension.as_ref());
        tracing::trace!(
            media = %self.descriptor.media_kind,
            seq = packet.sequence_number,
            ts = packet.timestamp,
            marker = packet.marker,
            len = packet.payload.len(),
            "rtp packet"
        );

        match self.descriptor.media_kind {
            MediaKind::Application => Some(self.emit(
                packet.payload.to_vec(),
                RtpInfo {
                    sequence: packet.sequence_number,
                    timestamp: packet.timestamp,
                    extension,
                    arrival: wall_clock,
                },
            )),
            MediaKind::Video => self.assemble(&packet, extension, wall_clock),
        }
    }

    fn validate<'a>(&self, buf: &'a [u8]) -> crate::Result<RtpPacket<'a>> {
        let packet = RtpPacket::parse(buf)?;
        if packet.payload_type != self.descriptor.payload_type {
            return Err(RetrieverError::MalformedPacket(
                MalformedPacketKind::UnexpectedPayloadType(packet.payload_type),
            ));
        }
        Ok(packet)
    }

    fn assemble(
        &mut self,
        packet: &RtpPacket<'_>,
        extension: Option<ExtensionRecord>,
        wall_clock: SystemTime,
    ) -> Option<AssembledUnit> {
        if let Some(damaged) = self.damaged {
            if damaged == packet.timestamp {
                if packet.marker {
                    self.damaged = None;
                }
                return None;
            }
            self.damaged = None;
        }

        if let Some(pending) = &self.pending
            && pending.timestamp != packet.timestamp
        {
            tracing::debug!(
                partial_ts = pending.timestamp,
                new_ts = packet.timestamp,
                "timestamp changed before marker, discarding partial unit"
            );
            self.pending = None;
            self.depayloader.reset();
            self.diagnostics.record_dropped_unit();
        }

        let pending = self.pending.get_or_insert_with(|| PendingUnit {
            timestamp: packet.timestamp,
            extension: None,
            arrival: wall_clock,
            payload: Vec::new(),
        });
        if pending.extension.is_none() {
            pending.extension = extension;
        }
        self.depayloader.depayload(packet.payload, &mut pending.payload);

        if !packet.marker {
            return None;
        }

        let mut pending = self.pending.take()?;
        self.depayloader.finish(&mut pending.payload);
        if pending.payload.is_empty() {
            self.diagnostics.record_dropped_unit();
            return None;
        }

        Some(self.emit(
            pending.payload,
            RtpInfo {
                sequence: packet.sequence_number,
                timestamp: pending.timestamp,
                extension: pending.extension,
                arrival: pending.arrival,
            },
        ))
    }

    fn emit(&mut self, payload: Vec<u8>, rtp_info: RtpInfo) -> AssembledUnit {
        AssembledUnit {
            media_kind: self.descriptor.media_kind,
            payload,
            rtp_info,
            geometry: self.descriptor.geometry,
            diagnostics: self.diagnostics.unit_emitted(),
        }
    }

    /// Feed one RTCP packet (odd interleaved channel or RTCP port).
    pub fn push_rtcp(&mut self, buf: &[u8]) {
        match validate_rtcp(buf) {
            Ok(packet_type) => {
                self.diagnostics.record_rtcp();
                tracing::trace!(media = %self.descriptor.media_kind, packet_type, "rtcp packet");
            }
            Err(e) => {
                self.diagnostics.record_malformed();
                tracing::warn!(
                    media = %self.descriptor.media_kind,
                    error = %e,
                    "dropping RTCP packet"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::RawDepayloader;
    use crate::media::h264::H264Depayloader;
    use crate::media::rtp::RtpHeader;

    fn descriptor(kind: MediaKind) -> StreamDescriptor {
        StreamDescriptor {
            media_kind: kind,
            transport_id: 0,
            clock_rate: 90_000,
            payload_type: 96,
            encoding: "raw".into(),
            control: "rtsp://cam/axis-media/media.amp/trackID=1".into(),
            geometry: (kind == MediaKind::Video).then_some(FrameGeometry {
                width: 1920,
                height: 1080,
            }),
        }
    }

    fn demuxer(kind: MediaKind) -> StreamDemuxer {
        StreamDemuxer::new(descriptor(kind), Box::new(RawDepayloader), ExtensionLayout::default())
    }

    /// Packets 1..=12; markers at 3, 7 and 12; the group started at 8 is
    /// interrupted by a new timestamp at 10.
    fn interrupted_sequence() -> Vec<Vec<u8>> {
        let mut header = RtpHeader::new(96, 1);
        header.set_sequence(1);
        let mut packets = Vec::new();
        for position in 1u8..=12 {
            if matches!(position, 4 | 8 | 10) {
                header.advance_timestamp(3000);
            }
            let marker = matches!(position, 3 | 7 | 12);
            packets.push(header.packet(marker, None, &[position]));
        }
        packets
    }

    #[test]
    fn marker_completes_units_and_timestamp_change_drops_partial() {
        let mut d = demuxer(MediaKind::Video);
        let units: Vec<_> = interrupted_sequence()
            .iter()
            .filter_map(|p| d.push_rtp(p))
            .collect();

        let payloads: Vec<_> = units.iter().map(|u| u.payload.clone()).collect();
        assert_eq!(payloads, vec![vec![1, 2, 3], vec![4, 5, 6, 7], vec![10, 11, 12]]);
        assert_eq!(units[1].rtp_info.sequence, 7);
        assert_eq!(units[2].rtp_info.timestamp, 9000);

        let snap = d.diagnostics().snapshot();
        assert_eq!(snap.dropped_units, 1);
        assert_eq!(snap.units_emitted, 3);
        assert_eq!(snap.gap_count, 0);
    }

    #[test]
    fn lost_fragment_discards_the_frame() {
        let mut d = StreamDemuxer::new(
            descriptor(MediaKind::Video),
            Box::new(H264Depayloader::new()),
            ExtensionLayout::default(),
        );
        let mut header = RtpHeader::new(96, 1);
        header.set_sequence(1);
        // IDR 0x65 split in three FU-A fragments; the middle one never arrives.
        let start = header.packet(false, None, &[0x7C, 0x85, 1, 1, 1]);
        let _lost = header.packet(false, None, &[0x7C, 0x05, 2, 2, 2]);
        let end = header.packet(true, None, &[0x7C, 0x45, 3, 3, 3]);
        header.advance_timestamp(3000);
        let next = header.packet(true, None, &[0x41, 9]);

        assert!(d.push_rtp(&start).is_none());
        assert!(d.push_rtp(&end).is_none());
        let unit = d.push_rtp(&next).expect("next frame is delivered");
        assert_eq!(unit.payload, vec![0, 0, 0, 1, 0x41, 9]);
        assert!(unit.diagnostics.discontinuity);

        let snap = d.diagnostics().snapshot();
        assert_eq!(snap.dropped_units, 1);
        assert_eq!(snap.units_emitted, 1);
    }

    #[test]
    fn no_unit_before_first_marker() {
        let mut d = demuxer(MediaKind::Video);
        let packets = interrupted_sequence();
        assert!(d.push_rtp(&packets[0]).is_none());
        assert!(d.push_rtp(&packets[1]).is_none());
        assert!(d.push_rtp(&packets[2]).is_some());
    }

    #[test]
    fn gap_does_not_stall_delivery() {
        let mut d = demuxer(MediaKind::Application);
        let mut header = RtpHeader::new(96, 1);
        let mut delivered = Vec::new();
        for seq in [1u16, 2, 4, 5] {
            header.set_sequence(seq);
            let packet = header.packet(true, None, b"<tt:MetadataStream/>");
            delivered.push(d.push_rtp(&packet).expect("application packet yields a unit"));
        }

        assert_eq!(delivered.len(), 4);
        assert_eq!(d.diagnostics().snapshot().gap_count, 1);
        assert!(!delivered[1].diagnostics.discontinuity);
        assert!(delivered[2].diagnostics.discontinuity);
        assert!(!delivered[3].diagnostics.discontinuity);
        assert_eq!(delivered[3].rtp_info.sequence, 5);
    }

    #[test]
    fn application_units_have_no_geometry() {
        let mut d = demuxer(MediaKind::Application);
        let packet = RtpHeader::new(96, 1).packet(false, None, b"x");
        let unit = d.push_rtp(&packet).unwrap();
        assert_eq!(unit.media_kind, MediaKind::Application);
        assert!(unit.geometry.is_none());
    }

    #[test]
    fn video_units_carry_geometry() {
        let mut d = demuxer(MediaKind::Video);
        let packet = RtpHeader::new(96, 1).packet(true, None, b"x");
        let unit = d.push_rtp(&packet).unwrap();
        assert_eq!(unit.geometry, Some(FrameGeometry { width: 1920, height: 1080 }));
    }

    #[test]
    fn extension_is_attached() {
        let mut d = demuxer(MediaKind::Video);
        let mut ext = Vec::new();
        ext.extend_from_slice(&3_913_056_000u32.to_be_bytes());
        ext.extend_from_slice(&0u32.to_be_bytes());
        ext.extend_from_slice(&0x8000_0002u32.to_be_bytes());
        let mut header = RtpHeader::new(96, 1);
        let first = header.packet(false, Some((0xABAC, &ext)), b"a");
        let last = header.packet(true, None, b"b");

        assert!(d.push_rtp(&first).is_none());
        let unit = d.push_rtp(&last).unwrap();
        let rec = unit.rtp_info.extension.expect("extension decoded");
        assert_eq!(rec.frame_counter, 2);
        assert!(rec.vendor_flags.clean_point);
    }

    #[test]
    fn missing_extension_is_unavailable() {
        let mut d = demuxer(MediaKind::Application);
        let packet = RtpHeader::new(96, 1).packet(false, Some((0xABAC, &[0u8; 4])), b"x");
        let unit = d.push_rtp(&packet).unwrap();
        assert!(unit.rtp_info.extension.is_none());
    }

    #[test]
    fn malformed_and_foreign_packets_are_counted() {
        let mut d = demuxer(MediaKind::Application);
        assert!(d.push_rtp(&[0x80, 0x60]).is_none());
        let foreign = RtpHeader::new(97, 1).packet(false, None, b"x");
        assert!(d.push_rtp(&foreign).is_none());

        let snap = d.diagnostics().snapshot();
        assert_eq!(snap.malformed_packets, 2);
        assert_eq!(snap.packets_received, 0);
    }

    #[test]
    fn rtcp_is_counted() {
        let mut d = demuxer(MediaKind::Video);
        d.push_rtcp(&[0x80, 200, 0x00, 0x01, 0, 0, 0, 1]);
        d.push_rtcp(&[0x00]);
        let snap = d.diagnostics().snapshot();
        assert_eq!(snap.rtcp_packets, 1);
        assert_eq!(snap.malformed_packets, 1);
    }

    #[test]
    fn snapshots_are_copies() {
        let mut d = demuxer(MediaKind::Application);
        let mut header = RtpHeader::new(96, 1);
        let first = d.push_rtp(&header.packet(false, None, b"a")).unwrap();
        d.push_rtp(&header.packet(false, None, b"b")).unwrap();
        assert_eq!(first.diagnostics.packets_received, 1);
        assert_eq!(d.diagnostics().snapshot().packets_received, 2);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn arbitrary_bytes_never_panic(data in proptest::collection::vec(any::<u8>(), 0..256)) {
                let mut video = demuxer(MediaKind::Video);
                let mut app = demuxer(MediaKind::Application);
                video.push_rtp(&data);
                app.push_rtp(&data);
                app.push_rtcp(&data);
            }

            #[test]
            fn every_application_packet_is_delivered(count in 1usize..64) {
                let mut d = demuxer(MediaKind::Application);
                let mut header = RtpHeader::new(96, 7);
                let delivered = (0..count)
                    .filter_map(|_| d.push_rtp(&header.packet(false, None, b"m")))
                    .count();
                prop_assert_eq!(delivered, count);
            }
        }
    }
}
