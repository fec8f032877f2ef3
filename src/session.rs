//! Description of a media session as produced by the SDP/RTSP layer, and
//! the framed-source contract the recording sink pulls from.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::sink::h264::ParameterSetInjector;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Medium {
    Video,
    Audio,
}

impl Medium {
    pub fn as_str(&self) -> &'static str {
        match self {
            Medium::Video => "video",
            Medium::Audio => "audio",
        }
    }
}

/// One subsession of a media session. The descriptive fields come straight
/// from SDP and stay immutable; the sink takes ownership of `source` when
/// it is created.
pub struct Subsession {
    pub medium: Medium,
    /// Upper-case SDP codec name, e.g. "H264", "OPUS", "VORBIS".
    pub codec: String,
    pub rtp_timestamp_frequency: u32,
    pub num_channels: u16,
    /// Frames per second from SDP, 0 when absent.
    pub video_fps: u32,
    /// `sprop-parameter-sets` from the fmtp line, H.264 only.
    pub sprop_parameter_sets: Option<String>,
    /// `None` means the subsession was never set up; the sink skips it.
    pub source: Option<Box<dyn FrameSource>>,
}

pub struct MediaSession {
    pub subsessions: Vec<Subsession>,
}

/// Outcome of one frame request against a source.
#[derive(Debug)]
pub enum FrameRead {
    /// `len` bytes were written into the destination buffer. `truncated` is
    /// the number of trailing bytes that did not fit and were dropped.
    Frame {
        len: usize,
        truncated: usize,
        pts: Duration,
    },
    /// The source has ended; no more frames will be delivered.
    Closed,
    /// The source failed in a way that will not recover.
    Fatal(String),
}

/// A source of timestamped media frames, typically fed by an RTP
/// depacketizer or a stream framer.
#[async_trait]
pub trait FrameSource: Send {
    /// Deliver the next frame into `buf`.
    ///
    /// Must be cancel-safe: the sink races reads across all subsessions and
    /// drops the futures that lose, so a cancelled call must not consume a
    /// frame.
    async fn next_frame(&mut self, buf: &mut [u8]) -> FrameRead;

    /// RTP marker bit of the packet that completed the most recent frame.
    /// Consulted for H.264 access-unit boundaries (RFC 6184); sources that
    /// deliver whole access units can keep the default.
    fn marker_bit(&self) -> bool {
        true
    }

    /// Hand the source SPS/PPS from SDP so the stream stays decodable even
    /// when the sender never repeats them in-band. Default: ignored.
    fn prime_parameter_sets(&mut self, _sps: &[u8], _pps: &[u8]) {}
}

/// A frame queued into a [`ChannelSource`].
#[derive(Debug, Clone)]
pub struct SourceFrame {
    pub data: Bytes,
    pub pts: Duration,
    pub marker: bool,
}

/// [`FrameSource`] backed by an mpsc channel; the bridge between an
/// external RTP transport task and the sink. Dropping the sender closes
/// the subsession.
pub struct ChannelSource {
    rx: mpsc::Receiver<SourceFrame>,
    marker: bool,
    injector: Option<ParameterSetInjector>,
}

impl ChannelSource {
    pub fn channel(capacity: usize) -> (mpsc::Sender<SourceFrame>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            tx,
            Self {
                rx,
                marker: false,
                injector: None,
            },
        )
    }
}

#[async_trait]
impl FrameSource for ChannelSource {
    async fn next_frame(&mut self, buf: &mut [u8]) -> FrameRead {
        // mpsc::Receiver::recv is cancel-safe; everything past it is
        // synchronous.
        let Some(frame) = self.rx.recv().await else {
            return FrameRead::Closed;
        };
        self.marker = frame.marker;

        let data = match &self.injector {
            Some(injector) => injector.inject(&frame.data),
            None => frame.data.to_vec(),
        };
        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        FrameRead::Frame {
            len,
            truncated: data.len() - len,
            pts: frame.pts,
        }
    }

    fn marker_bit(&self) -> bool {
        self.marker
    }

    fn prime_parameter_sets(&mut self, sps: &[u8], pps: &[u8]) {
        self.injector = Some(ParameterSetInjector::new(sps.to_vec(), pps.to_vec()));
    }
}
