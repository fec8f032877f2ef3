//! RTP-facing codec plumbing: depacketizers that feed the recording sink
//! and packetizer-side helpers for the streaming path.

pub mod opus;

use anyhow::Result;
use webrtc::rtp::packet::Packet;

/// Unified RTP parser facade so different codecs share one shape.
///
/// `Output` is the parsed unit; for audio `(payload, rtp_timestamp)`. The
/// method returns `Ok(Some(_))` when a full unit is ready and `Ok(None)`
/// when the packet was consumed without producing one.
pub trait RtpParser {
    type Output;
    fn push_packet(&mut self, pkt: &Packet) -> Result<Option<Self::Output>>;
}
