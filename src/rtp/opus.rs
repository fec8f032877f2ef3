//! Opus over RTP (RFC 7587). The payload format has no payload header:
//! the RTP payload is the Opus packet verbatim, one packet per payload.
//! The depacketizer is a passthrough that records what the TOC byte says;
//! the sink side enforces the one-packet rule and synthesizes the fmtp
//! attribute.

use anyhow::Result;
use bytes::Bytes;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use webrtc::rtp::packet::Packet;

use super::RtpParser;

/// RTP timestamps for Opus always tick at 48 kHz, whatever the encoder's
/// actual sampling rate.
pub const OPUS_TIMESTAMP_RATE: u32 = 48_000;

/// Frame durations in samples at 48 kHz, indexed by the TOC configuration
/// number.
#[rustfmt::skip]
const FRAME_DURATIONS: [u32; 32] = [
    120,  240,  480,  960,  // 2.5, 5, 10, 20 ms
    1920, 2880, 120,  240,  // 40, 60, 2.5, 5 ms
    480,  960,  1920, 2880, // 10, 20, 40, 60 ms
    120,  240,  480,  960,  // 2.5, 5, 10, 20 ms
    1920, 2880, 120,  240,  // 40, 60, 2.5, 5 ms
    480,  960,  1920, 2880, // 10, 20, 40, 60 ms
    120,  240,  480,  960,  // 2.5, 5, 10, 20 ms
    1920, 2880, 960,  960,  // 40, 60, 20, 20 ms (default)
];

/// Passthrough RTP parser for Opus. Each packet carries one complete
/// sample; the caller derives durations from timestamp deltas or
/// [`OpusDepacketizer::frame_duration`].
#[derive(Debug, Default)]
pub struct OpusDepacketizer {
    configuration: u8,
    is_stereo: bool,
    is_dtx: bool,
    has_fec: bool,
}

impl OpusDepacketizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push one RTP packet, returning the payload and its RTP timestamp.
    ///
    /// A zero-length payload is a DTX silence indication and is consumed;
    /// a leading null byte also flags DTX but the packet is still
    /// forwarded.
    pub fn push_packet(&mut self, pkt: &Packet) -> Result<Option<(Bytes, u32)>> {
        let payload = &pkt.payload;
        if payload.is_empty() {
            self.is_dtx = true;
            return Ok(None);
        }
        self.is_dtx = payload[0] == 0;
        self.configuration = payload[0] & 0x1F;
        self.is_stereo = payload[0] & 0x04 != 0;
        if payload.len() > 1 {
            // Recorded only; no reconstruction is attempted here.
            self.has_fec = payload[1] & 0x80 != 0;
        }
        Ok(Some((payload.clone(), pkt.header.timestamp)))
    }

    pub fn mime_type(&self) -> &'static str {
        "audio/opus"
    }

    /// Configuration number (0..=31) of the most recent packet.
    pub fn configuration(&self) -> u8 {
        self.configuration
    }

    pub fn is_stereo(&self) -> bool {
        self.is_stereo
    }

    pub fn is_dtx(&self) -> bool {
        self.is_dtx
    }

    pub fn has_fec(&self) -> bool {
        self.has_fec
    }

    /// Frame duration in samples at 48 kHz for a configuration number.
    pub fn frame_duration(configuration: u8) -> u32 {
        FRAME_DURATIONS
            .get(configuration as usize)
            .copied()
            .unwrap_or(960)
    }

    /// Convert an RTP timestamp from a foreign clock rate to 48 kHz.
    pub fn to_48khz(timestamp: u32, original_rate: u32) -> u32 {
        if original_rate == OPUS_TIMESTAMP_RATE || original_rate == 0 {
            return timestamp;
        }
        (timestamp as u64 * OPUS_TIMESTAMP_RATE as u64 / original_rate as u64) as u32
    }
}

impl RtpParser for OpusDepacketizer {
    type Output = (Bytes, u32);

    fn push_packet(&mut self, pkt: &Packet) -> Result<Option<Self::Output>> {
        OpusDepacketizer::push_packet(self, pkt)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpusSinkConfig {
    #[serde(default = "default_payload_type")]
    pub payload_type: u8,
    #[serde(default = "default_rate")]
    pub timestamp_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u16,
    #[serde(default)]
    pub enable_fec: bool,
    #[serde(default)]
    pub enable_dtx: bool,
    #[serde(default = "default_rate")]
    pub max_playback_rate: u32,
    /// Bits per second; 0 omits the attribute.
    #[serde(default)]
    pub max_average_bitrate: u32,
}

fn default_payload_type() -> u8 {
    96
}
fn default_rate() -> u32 {
    OPUS_TIMESTAMP_RATE
}
fn default_channels() -> u16 {
    2
}

impl Default for OpusSinkConfig {
    fn default() -> Self {
        Self {
            payload_type: default_payload_type(),
            timestamp_rate: default_rate(),
            channels: default_channels(),
            enable_fec: false,
            enable_dtx: false,
            max_playback_rate: default_rate(),
            max_average_bitrate: 0,
        }
    }
}

/// Packetizer-side policy for Opus: one packet per RTP payload, no special
/// header, and the `a=fmtp` SDP attribute.
pub struct OpusRtpSink {
    config: OpusSinkConfig,
    fmtp_line: OnceCell<String>,
}

impl OpusRtpSink {
    pub fn new(config: OpusSinkConfig) -> Self {
        Self {
            config,
            fmtp_line: OnceCell::new(),
        }
    }

    /// RFC 7587: an RTP payload MUST contain exactly one Opus packet, so a
    /// frame may never start mid-payload.
    pub fn frame_can_appear_after_packet_start(&self) -> bool {
        false
    }

    pub fn special_header_size(&self) -> usize {
        0
    }

    pub fn payload_type(&self) -> u8 {
        self.config.payload_type
    }

    pub fn timestamp_rate(&self) -> u32 {
        self.config.timestamp_rate
    }

    /// Cheap sanity check on an outgoing frame. Zero-length frames pass
    /// only when DTX is enabled.
    pub fn is_opus_frame(&self, frame: &[u8]) -> bool {
        match frame.first() {
            None => self.config.enable_dtx,
            // The TOC configuration number is five bits, so any non-empty
            // frame yields a value within the RFC's 0..=31 bound.
            Some(first) => first & 0x1F <= 31,
        }
    }

    /// The `a=fmtp:<pt> ...` SDP attribute, built once and cached.
    pub fn fmtp_sdp_line(&self) -> &str {
        self.fmtp_line.get_or_init(|| {
            let cfg = &self.config;
            let mut line = format!("a=fmtp:{}", cfg.payload_type);
            if cfg.max_playback_rate != default_rate() {
                line.push_str(&format!(" maxplaybackrate={}", cfg.max_playback_rate));
            }
            line.push_str(&format!(
                " stereo={}",
                if cfg.channels > 1 { 1 } else { 0 }
            ));
            if cfg.enable_fec {
                line.push_str(" useinbandfec=1");
            }
            if cfg.enable_dtx {
                line.push_str(" usedtx=1");
            }
            if cfg.max_average_bitrate > 0 {
                line.push_str(&format!(" maxaveragebitrate={}", cfg.max_average_bitrate));
            }
            line.push_str("\r\n");
            line
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(payload: &'static [u8], timestamp: u32) -> Packet {
        let mut pkt = Packet::default();
        pkt.header.timestamp = timestamp;
        pkt.payload = Bytes::from_static(payload);
        pkt
    }

    #[test]
    fn payload_passes_through_unchanged() {
        let mut parser = OpusDepacketizer::new();
        let (out, ts) = parser
            .push_packet(&packet(&[0x78, 0x01, 0x02, 0x03], 960))
            .unwrap()
            .unwrap();
        assert_eq!(ts, 960);
        assert_eq!(out.as_ref(), &[0x78, 0x01, 0x02, 0x03]);
        assert!(!parser.is_dtx());
    }

    #[test]
    fn empty_payload_is_dtx_silence() {
        let mut parser = OpusDepacketizer::new();
        assert!(parser.push_packet(&packet(&[], 0)).unwrap().is_none());
        assert!(parser.is_dtx());

        // The flag resets on the next real packet.
        parser.push_packet(&packet(&[0x78], 960)).unwrap();
        assert!(!parser.is_dtx());
    }

    #[test]
    fn null_leading_byte_flags_dtx_but_forwards() {
        let mut parser = OpusDepacketizer::new();
        let out = parser.push_packet(&packet(&[0x00, 0x11], 0)).unwrap();
        assert!(out.is_some());
        assert!(parser.is_dtx());
        assert_eq!(parser.configuration(), 0);
    }

    #[test]
    fn toc_byte_introspection() {
        let mut parser = OpusDepacketizer::new();
        // 0x0F: configuration 15, stereo bit (0x04) set.
        parser.push_packet(&packet(&[0x0F, 0x80], 0)).unwrap();
        assert_eq!(parser.configuration(), 15);
        assert!(parser.is_stereo());
        assert!(parser.has_fec());
        assert_eq!(parser.mime_type(), "audio/opus");

        // 0x78: configuration 24, mono.
        parser.push_packet(&packet(&[0x78, 0x00], 0)).unwrap();
        assert_eq!(parser.configuration(), 24);
        assert!(!parser.is_stereo());
        assert!(!parser.has_fec());
    }

    #[test]
    fn frame_duration_table() {
        assert_eq!(OpusDepacketizer::frame_duration(0), 120);
        assert_eq!(OpusDepacketizer::frame_duration(3), 960);
        assert_eq!(OpusDepacketizer::frame_duration(5), 2880);
        assert_eq!(OpusDepacketizer::frame_duration(30), 960);
        assert_eq!(OpusDepacketizer::frame_duration(31), 960);
        // Out of range falls back to 20 ms.
        assert_eq!(OpusDepacketizer::frame_duration(32), 960);
    }

    #[test]
    fn timestamp_conversion_to_48khz() {
        assert_eq!(OpusDepacketizer::to_48khz(960, 48_000), 960);
        assert_eq!(OpusDepacketizer::to_48khz(80, 8_000), 480);
        assert_eq!(OpusDepacketizer::to_48khz(441, 44_100), 480);
        assert_eq!(OpusDepacketizer::to_48khz(123, 0), 123);
    }

    #[test]
    fn one_packet_per_payload() {
        let sink = OpusRtpSink::new(OpusSinkConfig::default());
        assert!(!sink.frame_can_appear_after_packet_start());
        assert_eq!(sink.special_header_size(), 0);
    }

    #[test]
    fn frame_validation() {
        let strict = OpusRtpSink::new(OpusSinkConfig::default());
        assert!(!strict.is_opus_frame(&[]));
        assert!(strict.is_opus_frame(&[0xFF, 0x01]));

        let dtx = OpusRtpSink::new(OpusSinkConfig {
            enable_dtx: true,
            ..Default::default()
        });
        assert!(dtx.is_opus_frame(&[]));
    }

    #[test]
    fn fmtp_line_for_recording_profile() {
        let sink = OpusRtpSink::new(OpusSinkConfig {
            payload_type: 96,
            channels: 1,
            enable_fec: true,
            max_average_bitrate: 128_000,
            ..Default::default()
        });
        assert_eq!(
            sink.fmtp_sdp_line(),
            "a=fmtp:96 stereo=0 useinbandfec=1 maxaveragebitrate=128000\r\n"
        );
        // Cached: same pointer on the second query.
        assert!(std::ptr::eq(sink.fmtp_sdp_line(), sink.fmtp_sdp_line()));
    }

    #[test]
    fn fmtp_line_option_permutations() {
        let sink = OpusRtpSink::new(OpusSinkConfig {
            payload_type: 111,
            channels: 2,
            enable_dtx: true,
            max_playback_rate: 16_000,
            ..Default::default()
        });
        assert_eq!(
            sink.fmtp_sdp_line(),
            "a=fmtp:111 maxplaybackrate=16000 stereo=1 usedtx=1\r\n"
        );

        let bare = OpusRtpSink::new(OpusSinkConfig {
            channels: 1,
            ..Default::default()
        });
        assert_eq!(bare.fmtp_sdp_line(), "a=fmtp:96 stereo=0\r\n");
    }
}
