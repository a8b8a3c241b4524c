//! Per-stream reception statistics.
//!
//! Sequence numbers are 16-bit and wrap (RFC 3550 §A.1), so the distance
//! between the expected and the observed number is computed as a signed
//! 16-bit difference: `65535 → 0` is in order, `10 → 13` loses two packets,
//! `13 → 10` is a late (reordered or duplicated) packet.

use std::time::{Duration, Instant};

/// Immutable copy of a stream's diagnostics at one instant.
///
/// Attached to every [`AssembledUnit`](super::AssembledUnit); later packets
/// never change a snapshot already handed out.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DiagnosticsSnapshot {
    /// Sequence number the next packet should carry.
    pub expected_sequence: Option<u16>,
    /// Sequence number of the most recent packet.
    pub observed_sequence: Option<u16>,
    /// Number of sequence discontinuities seen so far.
    pub gap_count: u64,
    /// Packets skipped by forward sequence jumps.
    pub lost_packets: u64,
    /// A discontinuity happened since the previously delivered unit.
    pub discontinuity: bool,
    /// Time between the two most recent packet arrivals.
    pub last_arrival_delta: Option<Duration>,
    pub packets_received: u64,
    pub malformed_packets: u64,
    /// Partial units discarded because a new timestamp began before the marker.
    pub dropped_units: u64,
    pub units_emitted: u64,
    /// Units replaced in the handoff before the host consumed them.
    pub superseded_units: u64,
    pub rtcp_packets: u64,
    /// Media clock minus wall clock since the first packet, in seconds.
    /// Positive when the sender's clock runs fast.
    pub clock_drift: Option<f64>,
    /// Time since the tracker was created.
    pub uptime: Duration,
}

/// Mutable statistics owned by one stream's demultiplexer.
#[derive(Debug)]
pub struct DiagnosticsTracker {
    clock_rate: u32,
    created: Instant,
    expected: Option<u16>,
    observed: Option<u16>,
    gap_count: u64,
    lost_packets: u64,
    pending_discontinuity: bool,
    last_arrival: Option<Instant>,
    last_arrival_delta: Option<Duration>,
    packets_received: u64,
    malformed_packets: u64,
    dropped_units: u64,
    units_emitted: u64,
    superseded_units: u64,
    rtcp_packets: u64,
    clock: Option<ClockReference>,
}

#[derive(Debug)]
struct ClockReference {
    first_arrival: Instant,
    last_timestamp: u32,
    /// RTP ticks elapsed since the first packet, unwrapped.
    elapsed_ticks: i64,
}

impl DiagnosticsTracker {
    pub fn new(clock_rate: u32) -> Self {
        Self {
            clock_rate,
            created: Instant::now(),
            expected: None,
            observed: None,
            gap_count: 0,
            lost_packets: 0,
            pending_discontinuity: false,
            last_arrival: None,
            last_arrival_delta: None,
            packets_received: 0,
            malformed_packets: 0,
            dropped_units: 0,
            units_emitted: 0,
            superseded_units: 0,
            rtcp_packets: 0,
            clock: None,
        }
    }

    /// Record a well-formed RTP packet. Returns `true` when its sequence
    /// number did not match the expected one.
    pub fn record_packet(&mut self, sequence: u16, timestamp: u32, arrival: Instant) -> bool {
        self.packets_received += 1;

        if let Some(last) = self.last_arrival {
            self.last_arrival_delta = Some(arrival.saturating_duration_since(last));
        }
        self.last_arrival = Some(arrival.max(self.last_arrival.unwrap_or(arrival)));

        let gap = match self.expected {
            Some(expected) if expected != sequence => {
                let distance = sequence.wrapping_sub(expected) as i16;
                if distance > 0 {
                    self.lost_packets += distance as u64;
                }
                self.gap_count += 1;
                self.pending_discontinuity = true;
                tracing::trace!(expected, observed = sequence, distance, "sequence discontinuity");
                true
            }
            _ => false,
        };
        self.expected = Some(sequence.wrapping_add(1));
        self.observed = Some(sequence);

        self.track_clock(timestamp, arrival);
        gap
    }

    fn track_clock(&mut self, timestamp: u32, arrival: Instant) {
        match &mut self.clock {
            Some(clock) => {
                clock.elapsed_ticks += timestamp.wrapping_sub(clock.last_timestamp) as i32 as i64;
                clock.last_timestamp = timestamp;
            }
            None => {
                self.clock = Some(ClockReference {
                    first_arrival: arrival,
                    last_timestamp: timestamp,
                    elapsed_ticks: 0,
                });
            }
        }
    }

    pub fn record_malformed(&mut self) {
        self.malformed_packets += 1;
    }

    pub fn record_dropped_unit(&mut self) {
        self.dropped_units += 1;
    }

    pub fn record_superseded(&mut self) {
        self.superseded_units += 1;
    }

    pub fn record_rtcp(&mut self) {
        self.rtcp_packets += 1;
    }

    /// Count a delivered unit and return the snapshot to attach to it.
    ///
    /// The discontinuity flag is cleared afterwards, so it is raised on
    /// exactly one unit per gap.
    pub fn unit_emitted(&mut self) -> DiagnosticsSnapshot {
        self.units_emitted += 1;
        let snapshot = self.snapshot();
        self.pending_discontinuity = false;
        snapshot
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            expected_sequence: self.expected,
            observed_sequence: self.observed,
            gap_count: self.gap_count,
            lost_packets: self.lost_packets,
            discontinuity: self.pending_discontinuity,
            last_arrival_delta: self.last_arrival_delta,
            packets_received: self.packets_received,
            malformed_packets: self.malformed_packets,
            dropped_units: self.dropped_units,
            units_emitted: self.units_emitted,
            superseded_units: self.superseded_units,
            rtcp_packets: self.rtcp_packets,
            clock_drift: self.clock_drift(),
            uptime: self.created.elapsed(),
        }
    }

    fn clock_drift(&self) -> Option<f64> {
        let clock = self.clock.as_ref()?;
        if self.clock_rate == 0 {
            return None;
        }
        let last = self.last_arrival?;
        let media = clock.elapsed_ticks as f64 / self.clock_rate as f64;
        let wall = last.saturating_duration_since(clock.first_arrival).as_secs_f64();
        Some(media - wall)
    }
}
