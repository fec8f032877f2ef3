//! Record live RTSP media subsessions (H.264 video, Opus and friends for
//! audio) into a streamable Matroska file, plus the Opus RTP
//! depacketizer/packetizer pair (RFC 7587) used on the streaming path.
//!
//! The output is written front to back: the Segment and every Cluster use
//! unknown-size markers, and Cues/SeekHead stay empty, so the file is
//! playable while it is still being written.

pub mod ebml;
pub mod log;
pub mod rtp;
pub mod session;
pub mod sink;

pub use session::{
    ChannelSource, FrameRead, FrameSource, MediaSession, Medium, SourceFrame, Subsession,
};
pub use sink::{MatroskaSink, SinkConfig};
