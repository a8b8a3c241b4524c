use base64::prelude::{BASE64_STANDARD, Engine as _};

use super::Depayloader;

/// Annex B start code prepended to every NAL unit written to a frame.
const START_CODE: [u8; 4] = [0, 0, 0, 1];

const NAL_SPS: u8 = 7;
const NAL_PPS: u8 = 8;
const NAL_IDR: u8 = 5;
const STAP_A: u8 = 24;
const FU_A: u8 = 28;

/// H.264 RTP depayloader (RFC 6184).
///
/// Rebuilds an Annex B access unit from the RTP payloads of one frame.
/// Supports the payload structures cameras send in packetization-mode 1:
///
/// - **Single NAL Unit** (§5.6): types 1–23, written as-is after a start code.
///
/// - **STAP-A** (§5.7.1): several small NALs aggregated in one packet, each
///   prefixed by a 16-bit size.
///
/// - **FU-A Fragmentation** (§5.8): one NAL split across packets. Each
///   fragment carries a 2-byte FU header before the NAL payload:
///
///   ```text
///   FU indicator:  [F|NRI|Type=28]     (1 byte)
///   FU header:     [S|E|R|NAL_Type]    (1 byte)
///   Fragment data: [...]
///   ```
///
///   The original NAL header is rebuilt from the indicator's F/NRI bits and
///   the FU header's type when the start (S) fragment arrives. Fragments whose
///   start was lost are dropped.
///
/// ## Parameter sets
///
/// SPS/PPS from the SDP `sprop-parameter-sets` fmtp parameter (RFC 6184 §8.1)
/// are injected ahead of IDR frames that do not carry their own, so each
/// keyframe is independently decodable.
#[derive(Debug, Default)]
pub struct H264Depayloader {
    sps: Option<Vec<u8>>,
    pps: Option<Vec<u8>>,
    fragment_active: bool,
}

impl H264Depayloader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create from the parameter list of an `a=fmtp` line, e.g.
    /// `packetization-mode=1;profile-level-id=4d0029;sprop-parameter-sets=Z00AKZpkA8ARPyzUBAQFAAADA+gAAOpgBA==,aO48gA==`.
    pub fn from_fmtp(fmtp: Option<&str>) -> Self {
        let mut depayloader = Self::new();
        let Some(sets) = fmtp.and_then(sprop_parameter_sets) else {
            return depayloader;
        };

        for encoded in sets.split(',') {
            let nal = match BASE64_STANDARD.decode(encoded.trim()) {
                Ok(nal) if !nal.is_empty() => nal,
                _ => {
                    tracing::warn!(encoded, "ignoring undecodable sprop-parameter-set");
                    continue;
                }
            };
            match nal[0] & 0x1f {
                NAL_SPS => depayloader.sps = Some(nal),
                NAL_PPS => depayloader.pps = Some(nal),
                other => {
                    tracing::debug!(nal_type = other, "unexpected NAL in sprop-parameter-sets")
                }
            }
        }

        tracing::debug!(
            sps = depayloader.sps.is_some(),
            pps = depayloader.pps.is_some(),
            "H.264 parameter sets from SDP"
        );
        depayloader
    }

    fn push_nal(unit: &mut Vec<u8>, nal: &[u8]) {
        unit.extend_from_slice(&START_CODE);
        unit.extend_from_slice(nal);
    }

    fn depayload_stap_a(payload: &[u8], unit: &mut Vec<u8>) {
        let mut offset = 1usize;
        while offset + 2 <= payload.len() {
            let size = u16::from_be_bytes([payload[offset], payload[offset + 1]]) as usize;
            offset += 2;
            if size == 0 || offset + size > payload.len() {
                tracing::trace!(size, remaining = payload.len() - offset, "truncated STAP-A entry");
                return;
            }
            Self::push_nal(unit, &payload[offset..offset + size]);
            offset += size;
        }
    }

    fn depayload_fu_a(&mut self, payload: &[u8], unit: &mut Vec<u8>) {
        if payload.len() < 2 {
            return;
        }
        let fu_header = payload[1];
        let start = fu_header & 0x80 != 0;
        let end = fu_header & 0x40 != 0;

        if start {
            let nal_header = (payload[0] & 0xe0) | (fu_header & 0x1f);
            unit.extend_from_slice(&START_CODE);
            unit.push(nal_header);
            self.fragment_active = true;
        } else if !self.fragment_active {
            tracing::trace!("FU-A fragment without start, dropped");
            return;
        }

        unit.extend_from_slice(&payload[2..]);
        if end {
            self.fragment_active = false;
        }
    }

    /// Extract NAL units from an H.264 Annex B bitstream.
    ///
    /// Scans for start codes (both 4-byte `00 00 00 01` and 3-byte
    /// `00 00 01`) and returns the NAL data between them, excluding
    /// the start codes themselves.
    ///
    /// The start code length is tracked per-NAL to ensure boundaries
    /// between adjacent NALs are computed correctly when mixed 3-byte
    /// and 4-byte start codes appear.
    pub fn extract_nal_units(data: &[u8]) -> Vec<&[u8]> {
        let mut nal_units = Vec::new();
        let mut i = 0usize;

        // (nal_data_start_index, start_code_length)
        let mut start_entries: Vec<(usize, usize)> = Vec::new();

        while i < data.len() {
            if i + 3 < data.len() && data[i..i + 4] == [0, 0, 0, 1] {
                start_entries.push((i + 4, 4));
                i += 4;
            } else if i + 2 < data.len() && data[i..i + 3] == [0, 0, 1] {
                start_entries.push((i + 3, 3));
                i += 3;
            } else {
                i += 1;
            }
        }

        for (idx, &(start, _)) in start_entries.iter().enumerate() {
            let end = if idx + 1 < start_entries.len() {
                let (next_start, next_sc_len) = start_entries[idx + 1];
                next_start - next_sc_len
            } else {
                data.len()
            };

            if start < end {
                nal_units.push(&data[start..end]);
            }
        }

        nal_units
    }
}

impl Depayloader for H264Depayloader {
    fn depayload(&mut self, payload: &[u8], unit: &mut Vec<u8>) {
        let Some(&first) = payload.first() else {
            return;
        };
        match first & 0x1f {
            1..=23 => Self::push_nal(unit, payload),
            STAP_A => Self::depayload_stap_a(payload, unit),
            FU_A => self.depayload_fu_a(payload, unit),
            other => tracing::trace!(nal_type = other, "unsupported H.264 payload structure"),
        }
    }

    fn finish(&mut self, unit: &mut Vec<u8>) {
        self.fragment_active = false;

        let (Some(sps), Some(pps)) = (&self.sps, &self.pps) else {
            return;
        };
        let types: Vec<u8> = Self::extract_nal_units(unit)
            .iter()
            .filter_map(|nal| nal.first().map(|b| b & 0x1f))
            .collect();
        if !types.contains(&NAL_IDR) || types.contains(&NAL_SPS) {
            return;
        }

        let mut prefixed = Vec::with_capacity(unit.len() + sps.len() + pps.len() + 8);
        Self::push_nal(&mut prefixed, sps);
        Self::push_nal(&mut prefixed, pps);
        prefixed.append(unit);
        *unit = prefixed;
        tracing::trace!("parameter sets injected ahead of IDR frame");
    }

    fn reset(&mut self) {
        self.fragment_active = false;
    }
}

fn sprop_parameter_sets(fmtp: &str) -> Option<&str> {
    fmtp.split(';')
        .map(str::trim)
        .find_map(|param| param.strip_prefix("sprop-parameter-sets="))
}
