//! H.264 access-unit assembly for the Matroska sink: Annex-B splitting,
//! AVCC length-prefixing, codec-private synthesis from SDP
//! `sprop-parameter-sets`, and SPS/PPS injection for senders that never
//! repeat parameter sets in-band.

use std::mem;
use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use byteorder::{BigEndian, ByteOrder};
use tracing::{trace, warn};

pub(crate) mod nal_type {
    pub const NAL_SLICE_IDR: u8 = 5;
    pub const NAL_SPS: u8 = 7;
    pub const NAL_PPS: u8 = 8;
}

use nal_type::{NAL_PPS, NAL_SLICE_IDR, NAL_SPS};

/// Find the next Annex-B start code at or after `from`, returning its
/// offset and length (3 or 4).
fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 {
            if data[i + 2] == 1 {
                return Some((i, 3));
            }
            if i + 4 <= data.len() && data[i + 2] == 0 && data[i + 3] == 1 {
                return Some((i, 4));
            }
        }
        i += 1;
    }
    None
}

fn frame_has_nal_type(data: &[u8], wanted: u8, scan_limit: usize) -> bool {
    let limit = data.len().min(scan_limit);
    let mut from = 0;
    while let Some((pos, sc)) = find_start_code(&data[..limit], from) {
        let idx = pos + sc;
        if idx < data.len() && data[idx] & 0x1F == wanted {
            return true;
        }
        from = pos + sc;
    }
    false
}

/// One complete access unit, ready to be written as a SimpleBlock.
#[derive(Debug)]
pub struct AccessUnit {
    /// Concatenation of `u32be(len) ‖ NAL` records, in arrival order.
    pub payload: Vec<u8>,
    /// Presentation time of the first NAL in the unit.
    pub pts: Duration,
    /// Whether the unit contains an IDR slice (NAL type 5).
    pub is_idr: bool,
}

/// Accumulates NAL units until the RTP marker bit signals the end of the
/// access unit. Created lazily on the first H.264 frame of a subsession.
#[derive(Debug, Default)]
pub struct PendingAccessUnit {
    data: Vec<u8>,
    pts: Duration,
    started: bool,
}

impl PendingAccessUnit {
    /// Open the unit if it is not already open; the first NAL's
    /// presentation time becomes the unit's.
    pub fn begin(&mut self, pts: Duration) {
        if !self.started {
            self.started = true;
            self.pts = pts;
            self.data.clear();
        }
    }

    /// Append a framer delivery. Annex-B input is split along its start
    /// codes (anything before the first code is dropped); input without a
    /// start code is taken as a single raw NAL.
    pub fn push_frame(&mut self, data: &[u8]) {
        let Some((pos, sc)) = find_start_code(data, 0) else {
            self.push_nal(data);
            return;
        };
        let mut start = pos + sc;
        while let Some((next, sc2)) = find_start_code(data, start) {
            if next > start {
                self.push_nal(&data[start..next]);
            }
            start = next + sc2;
        }
        if data.len() > start {
            self.push_nal(&data[start..]);
        }
    }

    fn push_nal(&mut self, nal: &[u8]) {
        self.data.extend_from_slice(&(nal.len() as u32).to_be_bytes());
        self.data.extend_from_slice(nal);
    }

    pub fn has_data(&self) -> bool {
        self.started && !self.data.is_empty()
    }

    /// Close the unit and hand it out; the buffer is reset for the next
    /// one.
    pub fn take(&mut self) -> Option<AccessUnit> {
        if !self.has_data() {
            self.started = false;
            return None;
        }
        self.started = false;
        let payload = mem::take(&mut self.data);
        Some(AccessUnit {
            is_idr: contains_idr(&payload),
            pts: self.pts,
            payload,
        })
    }
}

/// Walk the length-prefixed records of an assembled unit looking for an
/// IDR slice.
fn contains_idr(payload: &[u8]) -> bool {
    let mut off = 0;
    while off + 5 <= payload.len() {
        let len = BigEndian::read_u32(&payload[off..]) as usize;
        if len == 0 || off + 4 + len > payload.len() {
            break;
        }
        if payload[off + 4] & 0x1F == NAL_SLICE_IDR {
            return true;
        }
        off += 4 + len;
    }
    false
}

/// Decode the comma-separated base64 records of an SDP
/// `sprop-parameter-sets` value. Records that fail to decode are skipped.
pub fn parse_sprop_parameter_sets(sprop: &str) -> Vec<Vec<u8>> {
    sprop
        .split(',')
        .filter_map(|record| general_purpose::STANDARD.decode(record.trim()).ok())
        .filter(|nal| !nal.is_empty())
        .collect()
}

/// Partition the sprop records into (SPS, PPS) by NAL type.
pub fn sprop_sps_pps(sprop: &str) -> Option<(Vec<u8>, Vec<u8>)> {
    let mut sps = None;
    let mut pps = None;
    for nal in parse_sprop_parameter_sets(sprop) {
        match nal[0] & 0x1F {
            NAL_SPS => sps = Some(nal),
            NAL_PPS => pps = Some(nal),
            _ => {}
        }
    }
    Some((sps?, pps?))
}

/// Build the AVCDecoderConfigurationRecord from SDP parameter sets.
///
/// Returns `None` when either set is missing or the SPS is too short to
/// carry profile/level bytes; the track is then written without
/// CodecPrivate.
pub fn avcc_codec_private(sprop: &str) -> Option<Vec<u8>> {
    let (sps, pps) = sprop_sps_pps(sprop)?;
    if sps.len() < 4 {
        warn!(
            "SPS from sprop-parameter-sets is only {} bytes; leaving codec private empty",
            sps.len()
        );
        return None;
    }

    let mut out = Vec::with_capacity(11 + sps.len() + pps.len());
    out.push(1); // configurationVersion
    out.push(sps[1]); // profile_idc
    out.push(sps[2]); // profile_compatibility
    out.push(sps[3]); // level_idc
    out.push(0xFF); // lengthSizeMinusOne = 3, reserved bits set
    out.push(0xE1); // one SPS, reserved bits set
    out.extend_from_slice(&(sps.len() as u16).to_be_bytes());
    out.extend_from_slice(&sps);
    out.push(1); // one PPS
    out.extend_from_slice(&(pps.len() as u16).to_be_bytes());
    out.extend_from_slice(&pps);
    Some(out)
}

/// Prepends cached SPS/PPS to Annex-B IDR frames that do not already carry
/// parameter sets, so a recording started mid-stream stays decodable.
#[derive(Debug, Clone)]
pub struct ParameterSetInjector {
    sps: Vec<u8>,
    pps: Vec<u8>,
}

impl ParameterSetInjector {
    pub fn new(sps: Vec<u8>, pps: Vec<u8>) -> Self {
        Self { sps, pps }
    }

    pub fn inject(&self, data: &[u8]) -> Vec<u8> {
        if !frame_has_nal_type(data, NAL_SLICE_IDR, data.len()) {
            return data.to_vec();
        }
        // Parameter sets, when present, sit ahead of the slice data.
        if frame_has_nal_type(data, NAL_SPS, 1024) && frame_has_nal_type(data, NAL_PPS, 1024) {
            return data.to_vec();
        }

        let mut out = Vec::with_capacity(8 + self.sps.len() + self.pps.len() + data.len());
        out.extend_from_slice(&[0, 0, 0, 1]);
        out.extend_from_slice(&self.sps);
        out.extend_from_slice(&[0, 0, 0, 1]);
        out.extend_from_slice(&self.pps);
        out.extend_from_slice(data);
        trace!("injected SPS/PPS ahead of IDR frame");
        out
    }
}
