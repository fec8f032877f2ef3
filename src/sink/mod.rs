//! The Matroska recording sink: owns the output file, one I/O state per
//! subsession, and the cooperative pull loop that turns incoming frames
//! into Clusters and SimpleBlocks.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures_util::future::select_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

use crate::session::{FrameRead, FrameSource, MediaSession, Medium};

pub mod h264;
pub mod mkv;

use h264::PendingAccessUnit;
use mkv::{audio_codec_id, video_codec_id, AudioTrack, MkvWriter, VideoTrack, FLAG_KEYFRAME};

pub const VIDEO_TRACK_NUMBER: u64 = 1;
pub const AUDIO_TRACK_NUMBER: u64 = 2;

const MIN_VIDEO_BUFFER: usize = 4 * 1024 * 1024;
const MIN_AUDIO_BUFFER: usize = 256 * 1024;
const GROW_HEADROOM: usize = 128 * 1024;
const GROW_ALIGN: usize = 64 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Requested per-subsession input buffer size; raised to the medium's
    /// floor (4 MiB video, 256 KiB audio).
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_width")]
    pub width: u16,
    #[serde(default = "default_height")]
    pub height: u16,
    /// Fallback frame rate; an SDP fps hint takes precedence.
    #[serde(default = "default_fps")]
    pub fps: u32,
    /// Reserved; accepted but not acted on.
    #[serde(default)]
    pub packet_loss_compensate: bool,
    /// Reserved; accepted but not acted on.
    #[serde(default)]
    pub sync_streams: bool,
}

fn default_buffer_size() -> usize {
    20_000
}
fn default_width() -> u16 {
    240
}
fn default_height() -> u16 {
    180
}
fn default_fps() -> u32 {
    15
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            width: default_width(),
            height: default_height(),
            fps: default_fps(),
            packet_loss_compensate: false,
            sync_streams: false,
        }
    }
}

struct SubsessionState {
    medium: Medium,
    is_h264: bool,
    track_number: u64,
    buffer: Vec<u8>,
    source: Box<dyn FrameSource>,
    active: bool,
    prev_pts: Duration,
    /// Created on the first H.264 frame, reset by every flush.
    pending_au: Option<PendingAccessUnit>,
}

/// Cluster lifecycle and the anchor start time. All block timecodes are
/// milliseconds relative to the presentation time of the first frame
/// written to any track.
struct ClusterState {
    start_time: Option<Duration>,
    cluster_offset: u64,
    cluster_ms: u64,
    need_new_cluster: bool,
}

impl ClusterState {
    fn new() -> Self {
        Self {
            start_time: None,
            cluster_offset: 0,
            cluster_ms: 0,
            need_new_cluster: true,
        }
    }

    /// Milliseconds of `pts` relative to the anchor; the first caller
    /// becomes the anchor.
    fn timecode_ms(&mut self, pts: Duration) -> i64 {
        let start = *self.start_time.get_or_insert(pts);
        pts.as_millis() as i64 - start.as_millis() as i64
    }

    fn write_block<W: Write>(
        &mut self,
        writer: &mut MkvWriter<W>,
        track: u64,
        pts: Duration,
        flags: u8,
        payload: &[u8],
    ) -> io::Result<()> {
        if !self.need_new_cluster {
            // A SimpleBlock's relative timecode is signed 16-bit; roll the
            // cluster rather than let it wrap.
            let relative = self.timecode_ms(pts) - self.cluster_ms as i64;
            if i16::try_from(relative).is_err() {
                self.need_new_cluster = true;
            }
        }
        if self.need_new_cluster {
            self.cluster_offset = writer.position();
            self.cluster_ms = self.timecode_ms(pts).max(0) as u64;
            self.need_new_cluster = false;
            debug!(
                "starting cluster at {} ms (offset {})",
                self.cluster_ms, self.cluster_offset
            );
            writer.begin_cluster(self.cluster_ms)?;
        }
        let relative = (self.timecode_ms(pts) - self.cluster_ms as i64) as i16;
        writer.write_simple_block(track, relative, flags, payload)
    }
}

/// Records every subsession of a media session into one Matroska file.
///
/// Create it with [`MatroskaSink::create`], then await [`MatroskaSink::run`];
/// the future resolves once every source has closed and the file has been
/// finalized. Dropping the sink finalizes the file if `run` never got
/// there.
pub struct MatroskaSink {
    writer: MkvWriter<BufWriter<File>>,
    video: Option<VideoTrack>,
    audio: Option<AudioTrack>,
    subsessions: Vec<SubsessionState>,
    cluster: ClusterState,
    segment_data_offset: u64,
    playing: bool,
    completed: bool,
}

impl MatroskaSink {
    pub fn create(
        session: MediaSession,
        output_path: impl AsRef<Path>,
        config: SinkConfig,
    ) -> Result<Self> {
        let path = output_path.as_ref();
        let file = File::create(path)
            .with_context(|| format!("failed to open output file {}", path.display()))?;
        let mut writer = MkvWriter::new(BufWriter::new(file));

        // Track parameters come from the first subsession of each medium.
        let mut video: Option<VideoTrack> = None;
        let mut audio: Option<AudioTrack> = None;
        for sub in &session.subsessions {
            info!(
                "found subsession: medium {} codec {}",
                sub.medium.as_str(),
                sub.codec
            );
            match sub.medium {
                Medium::Video if video.is_none() => {
                    let codec_private = if sub.codec == "H264" {
                        sub.sprop_parameter_sets
                            .as_deref()
                            .and_then(h264::avcc_codec_private)
                    } else {
                        None
                    };
                    video = Some(VideoTrack {
                        number: VIDEO_TRACK_NUMBER,
                        codec_id: video_codec_id(&sub.codec),
                        codec_private,
                        width: config.width,
                        height: config.height,
                        fps: if sub.video_fps > 0 {
                            sub.video_fps
                        } else {
                            config.fps
                        },
                    });
                }
                Medium::Audio if audio.is_none() => {
                    let (sampling_frequency, channels) = match sub.codec.as_str() {
                        // RFC 7587 mandates advertising "/2" in SDP no
                        // matter what is encoded; the capture pipeline is
                        // mono, and storing the real channel count keeps
                        // decoders from upmixing.
                        "OPUS" => (sub.rtp_timestamp_frequency as f32, 1),
                        "VORBIS" | "MPEG4-GENERIC" => (
                            sub.rtp_timestamp_frequency as f32,
                            sub.num_channels.min(255) as u8,
                        ),
                        _ => (48_000.0, 2),
                    };
                    audio = Some(AudioTrack {
                        number: AUDIO_TRACK_NUMBER,
                        codec_id: audio_codec_id(&sub.codec),
                        sampling_frequency,
                        channels,
                    });
                }
                _ => {}
            }
        }
        info!(
            "track summary: video {} audio {}",
            if video.is_some() { "yes" } else { "no" },
            if audio.is_some() { "yes" } else { "no" },
        );

        let mut subsessions = Vec::new();
        let mut video_assigned = false;
        let mut audio_assigned = false;
        let mut next_track = AUDIO_TRACK_NUMBER + 1;
        for mut sub in session.subsessions {
            let Some(mut source) = sub.source.take() else {
                debug!(
                    "skipping {} subsession without an initiated source",
                    sub.medium.as_str()
                );
                continue;
            };
            let track_number = match sub.medium {
                Medium::Video if !video_assigned => {
                    video_assigned = true;
                    VIDEO_TRACK_NUMBER
                }
                Medium::Audio if !audio_assigned => {
                    audio_assigned = true;
                    AUDIO_TRACK_NUMBER
                }
                _ => {
                    let t = next_track;
                    next_track += 1;
                    t
                }
            };

            let is_h264 = sub.medium == Medium::Video && sub.codec == "H264";
            if is_h264 {
                if let Some((sps, pps)) = sub
                    .sprop_parameter_sets
                    .as_deref()
                    .and_then(h264::sprop_sps_pps)
                {
                    source.prime_parameter_sets(&sps, &pps);
                }
            }

            let floor = match sub.medium {
                Medium::Video => MIN_VIDEO_BUFFER,
                Medium::Audio => MIN_AUDIO_BUFFER,
            };
            let capacity = config.buffer_size.max(floor);
            debug!(
                "track {}: initial {} input buffer of {} bytes",
                track_number,
                sub.medium.as_str(),
                capacity
            );
            subsessions.push(SubsessionState {
                medium: sub.medium,
                is_h264,
                track_number,
                buffer: vec![0; capacity],
                source,
                active: true,
                prev_pts: Duration::ZERO,
                pending_au: None,
            });
        }

        writer.write_ebml_header()?;
        let segment_data_offset = writer.begin_segment()?;

        Ok(Self {
            writer,
            video,
            audio,
            subsessions,
            cluster: ClusterState::new(),
            segment_data_offset,
            playing: false,
            completed: false,
        })
    }

    /// Pull frames from every active subsession until all of them close,
    /// then finalize the file.
    ///
    /// Fails immediately when nothing is active, leaving the file with
    /// headers only.
    pub async fn run(&mut self) -> Result<()> {
        self.ensure_headers()?;
        if !self.subsessions.iter().any(|s| s.active) {
            bail!("no subsessions are currently active");
        }
        while self.subsessions.iter().any(|s| s.active) {
            let (idx, read) = self.next_completed_read().await;
            match read {
                FrameRead::Frame {
                    len,
                    truncated,
                    pts,
                } => {
                    if truncated > 0 {
                        self.grow_buffer(idx, len + truncated, truncated);
                    }
                    if len == 0 {
                        self.close_subsession(idx)?;
                    } else {
                        self.use_frame(idx, len, pts)?;
                    }
                }
                FrameRead::Closed => self.close_subsession(idx)?,
                FrameRead::Fatal(msg) => {
                    error!(
                        "source on track {} failed: {msg}",
                        self.subsessions[idx].track_number
                    );
                    self.close_subsession(idx)?;
                }
            }
        }
        self.finish()
    }

    /// Race one `next_frame` across every active subsession; blocks are
    /// written in frame-arrival order.
    async fn next_completed_read(&mut self) -> (usize, FrameRead) {
        let reads = self
            .subsessions
            .iter_mut()
            .enumerate()
            .filter(|(_, s)| s.active)
            .map(|(idx, s)| {
                let SubsessionState { source, buffer, .. } = s;
                Box::pin(async move { (idx, source.next_frame(buffer).await) })
            })
            .collect::<Vec<_>>();
        let (result, _, _) = select_all(reads).await;
        result
    }

    fn use_frame(&mut self, idx: usize, len: usize, pts: Duration) -> Result<()> {
        let Self {
            writer,
            subsessions,
            cluster,
            ..
        } = self;
        let state = &mut subsessions[idx];
        if pts < state.prev_pts {
            trace!(
                "non-monotonic presentation time on track {}",
                state.track_number
            );
        }

        if state.is_h264 {
            let pending = state.pending_au.get_or_insert_with(PendingAccessUnit::default);
            pending.begin(pts);
            pending.push_frame(&state.buffer[..len]);
            // The marker bit of the packet that ended this delivery is the
            // access-unit boundary (RFC 6184).
            if state.source.marker_bit() {
                if let Some(unit) = pending.take() {
                    let flags = if unit.is_idr { FLAG_KEYFRAME } else { 0 };
                    cluster.write_block(writer, state.track_number, unit.pts, flags, &unit.payload)?;
                }
            }
        } else {
            let flags = if state.medium == Medium::Audio {
                FLAG_KEYFRAME
            } else {
                0
            };
            cluster.write_block(writer, state.track_number, pts, flags, &state.buffer[..len])?;
        }
        state.prev_pts = pts;
        Ok(())
    }

    fn close_subsession(&mut self, idx: usize) -> Result<()> {
        let Self {
            writer,
            subsessions,
            cluster,
            ..
        } = self;
        let state = &mut subsessions[idx];
        if !state.active {
            return Ok(());
        }
        // Flush a partially assembled access unit before letting go.
        if let Some(unit) = state.pending_au.as_mut().and_then(|p| p.take()) {
            let flags = if unit.is_idr { FLAG_KEYFRAME } else { 0 };
            cluster.write_block(writer, state.track_number, unit.pts, flags, &unit.payload)?;
        }
        state.active = false;
        let track_number = state.track_number;
        let still_active = subsessions.iter().filter(|s| s.active).count();
        debug!("track {track_number} source closed ({still_active} subsession(s) still active)");
        Ok(())
    }

    fn grow_buffer(&mut self, idx: usize, needed: usize, truncated: usize) {
        let state = &mut self.subsessions[idx];
        warn!(
            "input frame too large for the {} byte buffer on track {}: {truncated} trailing bytes dropped",
            state.buffer.len(),
            state.track_number,
        );
        let target = grow_target(needed, state.buffer.len());
        match state.buffer.try_reserve_exact(target - state.buffer.len()) {
            Ok(()) => {
                state.buffer.resize(target, 0);
                info!(
                    "grew input buffer on track {} to {} bytes",
                    state.track_number, target
                );
            }
            Err(e) => warn!(
                "failed to grow input buffer on track {} to {} bytes: {e}",
                state.track_number, target
            ),
        }
    }

    fn ensure_headers(&mut self) -> Result<()> {
        if self.playing {
            return Ok(());
        }
        self.playing = true;
        self.writer.write_seek_head()?;
        self.writer.write_segment_info()?;
        self.writer
            .write_tracks(self.video.as_ref(), self.audio.as_ref())?;
        Ok(())
    }

    /// Write the closing Cues placeholder and flush. Idempotent; called by
    /// `run` on completion and by `Drop` as a fallback.
    pub fn finish(&mut self) -> Result<()> {
        if self.completed {
            return Ok(());
        }
        self.ensure_headers()?;
        self.writer.write_cues()?;
        self.writer.flush()?;
        self.completed = true;
        debug!("output finalized at {} bytes", self.writer.position());
        Ok(())
    }

    pub fn num_active_subsessions(&self) -> usize {
        self.subsessions.iter().filter(|s| s.active).count()
    }

    /// File offset of the Segment's first data byte.
    pub fn segment_data_offset(&self) -> u64 {
        self.segment_data_offset
    }
}

impl Drop for MatroskaSink {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            warn!("failed to finalize output file: {e}");
        }
    }
}

/// New capacity after a truncated delivery: `needed` plus headroom,
/// rounded up to a 64 KiB multiple; at least double the current size.
fn grow_target(needed: usize, current: usize) -> usize {
    let aligned = (needed + GROW_HEADROOM + GROW_ALIGN - 1) & !(GROW_ALIGN - 1);
    if aligned <= current {
        current * 2
    } else {
        aligned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grow_target_rounds_to_64k_with_headroom() {
        // 1 MiB frame: 1 MiB + 128 KiB is already 64 KiB-aligned.
        assert_eq!(grow_target(1 << 20, 256 * 1024), (1 << 20) + 128 * 1024);
        // Unaligned request rounds up.
        assert_eq!(grow_target(100_000, 20_000), 262_144);
        // A target no larger than the current buffer falls back to doubling.
        assert_eq!(grow_target(1_000, 256 * 1024), 512 * 1024);
    }

    #[test]
    fn config_defaults() {
        let cfg = SinkConfig::default();
        assert_eq!(cfg.buffer_size, 20_000);
        assert_eq!((cfg.width, cfg.height), (240, 180));
        assert_eq!(cfg.fps, 15);
        assert!(!cfg.packet_loss_compensate);
        assert!(!cfg.sync_streams);

        let parsed: SinkConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(parsed.buffer_size, cfg.buffer_size);
    }

    #[test]
    fn cluster_rolls_when_relative_timecode_overflows() {
        let mut writer = MkvWriter::new(Vec::new());
        let mut cluster = ClusterState::new();

        cluster
            .write_block(&mut writer, 2, Duration::ZERO, FLAG_KEYFRAME, &[0xAA])
            .unwrap();
        let first_cluster_end = writer.position();
        cluster
            .write_block(
                &mut writer,
                2,
                Duration::from_secs(40),
                FLAG_KEYFRAME,
                &[0xBB],
            )
            .unwrap();

        // 40 000 ms does not fit in i16, so a second cluster must have been
        // opened right where the first one ended.
        assert_eq!(cluster.cluster_offset, first_cluster_end);
        assert_eq!(cluster.cluster_ms, 40_000);
    }

    #[test]
    fn anchor_is_first_written_frame() {
        let mut writer = MkvWriter::new(Vec::new());
        let mut cluster = ClusterState::new();

        cluster
            .write_block(&mut writer, 1, Duration::from_secs(100), 0, &[0x01])
            .unwrap();
        assert_eq!(cluster.start_time, Some(Duration::from_secs(100)));
        assert_eq!(cluster.cluster_ms, 0);

        // A later frame from another track that predates the anchor gets a
        // negative relative timecode, not a new anchor.
        cluster
            .write_block(
                &mut writer,
                2,
                Duration::from_millis(99_950),
                FLAG_KEYFRAME,
                &[0x02],
            )
            .unwrap();
        assert_eq!(cluster.start_time, Some(Duration::from_secs(100)));
    }
}
