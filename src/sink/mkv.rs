// mkv.rs – streamable Matroska bitstream writer. Every element body is
// assembled in memory first so sizes are exact at emission time; the
// Segment and each Cluster carry unknown-size markers and are never
// revisited, which keeps the file valid while it is still being written.

use std::io::{self, Write};

use crate::ebml::{
    element, float_element, put_id, put_unknown_size, put_vint, string_element, uint_element,
    vint_len,
};

pub const ID_EBML: u32 = 0x1A45_DFA3;
const ID_DOC_TYPE: u32 = 0x4282;
const ID_DOC_TYPE_VERSION: u32 = 0x4287;
const ID_DOC_TYPE_READ_VERSION: u32 = 0x4285;
const ID_EBML_MAX_ID_LENGTH: u32 = 0x42F2;
const ID_EBML_MAX_SIZE_LENGTH: u32 = 0x42F3;

pub const ID_SEGMENT: u32 = 0x1853_8067;
pub const ID_SEEK_HEAD: u32 = 0x114D_9B74;
pub const ID_INFO: u32 = 0x1549_A966;
const ID_TIMECODE_SCALE: u32 = 0x2AD7B1;
const ID_MUXING_APP: u32 = 0x4D80;
const ID_WRITING_APP: u32 = 0x5741;

pub const ID_TRACKS: u32 = 0x1654_AE6B;
const ID_TRACK_ENTRY: u32 = 0xAE;
const ID_TRACK_NUMBER: u32 = 0xD7;
const ID_TRACK_TYPE: u32 = 0x83;
const ID_CODEC: u32 = 0x86;
const ID_CODEC_PRIVATE: u32 = 0x63A2;
const ID_DEFAULT_DURATION: u32 = 0x23E383;
const ID_VIDEO: u32 = 0xE0;
const ID_PIXEL_WIDTH: u32 = 0xB0;
const ID_PIXEL_HEIGHT: u32 = 0xBA;
const ID_AUDIO: u32 = 0xE1;
const ID_SAMPLING_FREQUENCY: u32 = 0xB5;
const ID_CHANNELS: u32 = 0x9F;

pub const ID_CLUSTER: u32 = 0x1F43_B675;
pub const ID_TIMECODE: u32 = 0xE7;
pub const ID_SIMPLE_BLOCK: u32 = 0xA3;
pub const ID_CUES: u32 = 0x1C53_BB6B;

/// Block timecodes are milliseconds: 1 000 000 ns per tick.
pub const TIMECODE_SCALE: u32 = 1_000_000;

/// SimpleBlock flags bit for a keyframe.
pub const FLAG_KEYFRAME: u8 = 0x80;

const MUXING_APP: &str = "livemkv";
const WRITING_APP: &str = "livemkv";

/// Map an SDP video codec name to a Matroska CodecID.
pub fn video_codec_id(codec: &str) -> &'static str {
    match codec {
        "H264" => "V_MPEG4/ISO/AVC",
        "H265" => "V_MPEGH/ISO/HEVC",
        _ => "V_UNCOMPRESSED",
    }
}

/// Map an SDP audio codec name to a Matroska CodecID.
pub fn audio_codec_id(codec: &str) -> &'static str {
    match codec {
        "OPUS" => "A_OPUS",
        "VORBIS" => "A_VORBIS",
        "MPEG4-GENERIC" => "A_AAC",
        _ => "A_PCM/INT/LIT",
    }
}

#[derive(Debug, Clone)]
pub struct VideoTrack {
    pub number: u64,
    pub codec_id: &'static str,
    pub codec_private: Option<Vec<u8>>,
    pub width: u16,
    pub height: u16,
    /// Frames per second; 0 omits DefaultDuration.
    pub fps: u32,
}

#[derive(Debug, Clone)]
pub struct AudioTrack {
    pub number: u64,
    pub codec_id: &'static str,
    pub sampling_frequency: f32,
    pub channels: u8,
}

pub struct MkvWriter<W: Write> {
    out: W,
    position: u64,
}

impl<W: Write> MkvWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out, position: 0 }
    }

    /// Bytes written so far; the file offset for everything emitted next.
    pub fn position(&self) -> u64 {
        self.position
    }

    fn put(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.out.write_all(bytes)?;
        self.position += bytes.len() as u64;
        Ok(())
    }

    pub fn write_ebml_header(&mut self) -> io::Result<()> {
        let mut body = Vec::new();
        body.extend(string_element(ID_DOC_TYPE, "matroska"));
        body.extend(uint_element(ID_DOC_TYPE_VERSION, 4));
        body.extend(uint_element(ID_DOC_TYPE_READ_VERSION, 2));
        body.extend(uint_element(ID_EBML_MAX_ID_LENGTH, 4));
        body.extend(uint_element(ID_EBML_MAX_SIZE_LENGTH, 8));
        self.put(&element(ID_EBML, &body))
    }

    /// Open the Segment with an unknown size and return the offset of its
    /// first data byte.
    pub fn begin_segment(&mut self) -> io::Result<u64> {
        let mut buf = Vec::new();
        put_id(&mut buf, ID_SEGMENT);
        put_unknown_size(&mut buf, 8);
        self.put(&buf)?;
        Ok(self.position)
    }

    /// Empty SeekHead placeholder; never filled in (streamable output).
    pub fn write_seek_head(&mut self) -> io::Result<()> {
        self.put(&element(ID_SEEK_HEAD, &[]))
    }

    pub fn write_segment_info(&mut self) -> io::Result<()> {
        let mut body = Vec::new();
        body.extend(element(ID_TIMECODE_SCALE, &TIMECODE_SCALE.to_be_bytes()));
        body.extend(string_element(ID_MUXING_APP, MUXING_APP));
        body.extend(string_element(ID_WRITING_APP, WRITING_APP));
        self.put(&element(ID_INFO, &body))
    }

    pub fn write_tracks(
        &mut self,
        video: Option<&VideoTrack>,
        audio: Option<&AudioTrack>,
    ) -> io::Result<()> {
        let mut body = Vec::new();
        if let Some(v) = video {
            let mut entry = Vec::new();
            entry.extend(uint_element(ID_TRACK_NUMBER, v.number));
            entry.extend(uint_element(ID_TRACK_TYPE, 1));
            entry.extend(string_element(ID_CODEC, v.codec_id));
            if let Some(private) = &v.codec_private {
                entry.extend(element(ID_CODEC_PRIVATE, private));
            }
            if v.fps > 0 {
                let default_duration = (1_000_000_000u64 / v.fps as u64) as u32;
                entry.extend(element(ID_DEFAULT_DURATION, &default_duration.to_be_bytes()));
            }
            let mut settings = Vec::new();
            settings.extend(element(ID_PIXEL_WIDTH, &v.width.to_be_bytes()));
            settings.extend(element(ID_PIXEL_HEIGHT, &v.height.to_be_bytes()));
            entry.extend(element(ID_VIDEO, &settings));
            body.extend(element(ID_TRACK_ENTRY, &entry));
        }
        if let Some(a) = audio {
            let mut entry = Vec::new();
            entry.extend(uint_element(ID_TRACK_NUMBER, a.number));
            entry.extend(uint_element(ID_TRACK_TYPE, 2));
            entry.extend(string_element(ID_CODEC, a.codec_id));
            let mut settings = Vec::new();
            settings.extend(float_element(ID_SAMPLING_FREQUENCY, a.sampling_frequency));
            settings.extend(uint_element(ID_CHANNELS, a.channels as u64));
            entry.extend(element(ID_AUDIO, &settings));
            body.extend(element(ID_TRACK_ENTRY, &entry));
        }
        self.put(&element(ID_TRACKS, &body))
    }

    /// Open a Cluster with an unknown size and the given absolute timecode
    /// in milliseconds.
    pub fn begin_cluster(&mut self, timecode_ms: u64) -> io::Result<()> {
        let mut buf = Vec::new();
        put_id(&mut buf, ID_CLUSTER);
        put_unknown_size(&mut buf, 8);
        buf.extend(uint_element(ID_TIMECODE, timecode_ms));
        self.put(&buf)
    }

    /// `VINT(track) ‖ i16be(relative timecode) ‖ flags ‖ payload`.
    pub fn write_simple_block(
        &mut self,
        track: u64,
        relative_timecode: i16,
        flags: u8,
        payload: &[u8],
    ) -> io::Result<()> {
        let mut head = Vec::new();
        put_id(&mut head, ID_SIMPLE_BLOCK);
        put_vint(&mut head, (vint_len(track) + 2 + 1 + payload.len()) as u64);
        put_vint(&mut head, track);
        head.extend_from_slice(&relative_timecode.to_be_bytes());
        head.push(flags);
        self.put(&head)?;
        self.put(payload)
    }

    /// Empty Cues placeholder, written once at finalization.
    pub fn write_cues(&mut self) -> io::Result<()> {
        self.put(&element(ID_CUES, &[]))
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn writer() -> MkvWriter<Vec<u8>> {
        MkvWriter::new(Vec::new())
    }

    #[test]
    fn ebml_header_bytes() {
        let mut w = writer();
        w.write_ebml_header().unwrap();
        #[rustfmt::skip]
        let expected: &[u8] = &[
            0x1A, 0x45, 0xDF, 0xA3, 0x9B, // EBML, size 27
            0x42, 0x82, 0x88, b'm', b'a', b't', b'r', b'o', b's', b'k', b'a',
            0x42, 0x87, 0x81, 0x04, // DocTypeVersion 4
            0x42, 0x85, 0x81, 0x02, // DocTypeReadVersion 2
            0x42, 0xF2, 0x81, 0x04, // EBMLMaxIDLength 4
            0x42, 0xF3, 0x81, 0x08, // EBMLMaxSizeLength 8
        ];
        assert_eq!(w.out, expected);
        assert_eq!(w.position(), expected.len() as u64);
    }

    #[test]
    fn segment_is_unknown_size() {
        let mut w = writer();
        let data_offset = w.begin_segment().unwrap();
        assert_eq!(
            w.out,
            [0x18, 0x53, 0x80, 0x67, 0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]
        );
        assert_eq!(data_offset, 12);
    }

    #[test]
    fn segment_info_literals() {
        let mut w = writer();
        w.write_segment_info().unwrap();
        let mut expected = vec![0x15, 0x49, 0xA9, 0x66, 0x80 | 28];
        expected.extend_from_slice(&[0x2A, 0xD7, 0xB1, 0x84, 0x00, 0x0F, 0x42, 0x40]);
        expected.extend_from_slice(&[0x4D, 0x80, 0x87]);
        expected.extend_from_slice(b"livemkv");
        expected.extend_from_slice(&[0x57, 0x41, 0x87]);
        expected.extend_from_slice(b"livemkv");
        assert_eq!(w.out, expected);
    }

    #[test]
    fn audio_track_entry_layout() {
        let mut w = writer();
        w.write_tracks(
            None,
            Some(&AudioTrack {
                number: 2,
                codec_id: "A_OPUS",
                sampling_frequency: 48_000.0,
                channels: 1,
            }),
        )
        .unwrap();

        #[rustfmt::skip]
        let entry: &[u8] = &[
            0xAE, 0x80 | 25,
            0xD7, 0x81, 0x02, // TrackNumber 2
            0x83, 0x81, 0x02, // TrackType audio
            0x86, 0x86, b'A', b'_', b'O', b'P', b'U', b'S',
            0xE1, 0x80 | 9,
            0xB5, 0x84, 0x47, 0x3B, 0x80, 0x00, // 48000.0
            0x9F, 0x81, 0x01, // Channels 1
        ];
        let mut expected = vec![0x16, 0x54, 0xAE, 0x6B, 0x80 | entry.len() as u8];
        expected.extend_from_slice(entry);
        assert_eq!(w.out, expected);
    }

    #[test]
    fn video_track_entry_layout() {
        let mut w = writer();
        let private = vec![0x01, 0x42, 0x00, 0x1E, 0xFF, 0xE1];
        w.write_tracks(
            Some(&VideoTrack {
                number: 1,
                codec_id: "V_MPEG4/ISO/AVC",
                codec_private: Some(private.clone()),
                width: 240,
                height: 180,
                fps: 15,
            }),
            None,
        )
        .unwrap();

        let mut entry = Vec::new();
        entry.extend_from_slice(&[0xD7, 0x81, 0x01]);
        entry.extend_from_slice(&[0x83, 0x81, 0x01]);
        entry.extend_from_slice(&[0x86, 0x8F]);
        entry.extend_from_slice(b"V_MPEG4/ISO/AVC");
        entry.extend_from_slice(&[0x63, 0xA2, 0x86]);
        entry.extend_from_slice(&private);
        // 10^9 / 15 = 66_666_666 ns
        entry.extend_from_slice(&[0x23, 0xE3, 0x83, 0x84, 0x03, 0xF9, 0x40, 0xAA]);
        entry.extend_from_slice(&[0xE0, 0x88]);
        entry.extend_from_slice(&[0xB0, 0x82, 0x00, 0xF0]); // PixelWidth 240
        entry.extend_from_slice(&[0xBA, 0x82, 0x00, 0xB4]); // PixelHeight 180

        let mut expected = vec![0x16, 0x54, 0xAE, 0x6B];
        put_vint(&mut expected, (entry.len() + 2) as u64);
        expected.extend_from_slice(&[0xAE, 0x80 | entry.len() as u8]);
        expected.extend_from_slice(&entry);
        assert_eq!(w.out, expected);
    }

    #[test]
    fn cluster_header_and_timecode_width() {
        let mut w = writer();
        w.begin_cluster(0).unwrap();
        assert_eq!(
            w.out,
            [
                0x1F, 0x43, 0xB6, 0x75, // Cluster
                0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, // unknown size
                0xE7, 0x81, 0x00, // Timecode 0
            ]
        );

        let mut w = writer();
        w.begin_cluster(40_000).unwrap();
        assert_eq!(&w.out[12..], [0xE7, 0x82, 0x9C, 0x40]);
    }

    #[test]
    fn simple_block_encoding() {
        let mut w = writer();
        w.write_simple_block(2, 20, FLAG_KEYFRAME, &[0xDE, 0xAD]).unwrap();
        assert_eq!(
            w.out,
            [
                0xA3, 0x80 | 6, // SimpleBlock, size = 1 + 2 + 1 + 2
                0x82, // track 2
                0x00, 0x14, // +20 ms
                0x80, // keyframe
                0xDE, 0xAD,
            ]
        );

        let mut w = writer();
        w.write_simple_block(1, -5, 0x00, &[0x01]).unwrap();
        assert_eq!(w.out, [0xA3, 0x85, 0x81, 0xFF, 0xFB, 0x00, 0x01]);
    }

    #[test]
    fn codec_mapping() {
        assert_eq!(video_codec_id("H264"), "V_MPEG4/ISO/AVC");
        assert_eq!(video_codec_id("H265"), "V_MPEGH/ISO/HEVC");
        assert_eq!(video_codec_id("JPEG"), "V_UNCOMPRESSED");
        assert_eq!(audio_codec_id("OPUS"), "A_OPUS");
        assert_eq!(audio_codec_id("VORBIS"), "A_VORBIS");
        assert_eq!(audio_codec_id("MPEG4-GENERIC"), "A_AAC");
        assert_eq!(audio_codec_id("L16"), "A_PCM/INT/LIT");
    }
}
