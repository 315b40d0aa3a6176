//! Per-path MPEG-TS formatter
//!
//! Multiplexes the elementary tracks of one stream into segmented TS
//! files. The writer stack is built once per recording session:
//! a swappable sink at the bottom, a 64 KiB buffered writer above it
//! (flushed at part boundaries to bound latency for consumers watching
//! partial segments), and the TS multiplexer on top.

use std::io::{BufWriter, Write};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::watch;

use super::h264;
use super::h265;
use super::segment::{DynamicSink, Segment};
use super::timing::DtsExtractor;
use super::RecorderError;
use crate::config::PathConf;
use crate::logger::LimitedLogger;
use crate::protocols::mpegts::{
    duration_to_ts, AudioSpecificConfig, TrackCodec, Writer as TsWriter,
};
use crate::stream::{CodecParams, Payload, StreamDesc, Unit};

const MPEGTS_MAX_BUFFER_SIZE: usize = 64 * 1024;

const AC3_SAMPLES_PER_FRAME: f64 = 1536.0;

const MPEG4_GOV_START_CODE: [u8; 4] = [0x00, 0x00, 0x01, 0xB3];
const MPEG1_GOP_START_CODE: [u8; 4] = [0x00, 0x00, 0x01, 0xB8];

/// Per-track recorder state; the DTS extractor lives here so ownership
/// is explicit rather than captured in a closure
enum TrackState {
    H264 { dts_extractor: Option<DtsExtractor> },
    H265 { dts_extractor: Option<DtsExtractor> },
    Mpeg4Video { last_pts: Option<Duration> },
    Mpeg1Video { last_pts: Option<Duration> },
    Audio,
    Ac3 { sample_rate: u32 },
}

/// The formatter for one recording session
pub(crate) struct FormatMpegts {
    path_name: String,
    conf: watch::Receiver<Arc<PathConf>>,
    sink: DynamicSink,
    mw: TsWriter<BufWriter<DynamicSink>>,
    tracks: Vec<TrackState>,
    has_video: bool,
    current_segment: Option<Segment>,
    sequence: u64,
    err_logger: Arc<LimitedLogger>,
}

impl FormatMpegts {
    pub fn new(
        path_name: &str,
        desc: &StreamDesc,
        conf: watch::Receiver<Arc<PathConf>>,
    ) -> Result<Self, RecorderError> {
        let mut codecs = Vec::with_capacity(desc.tracks.len());
        let mut tracks = Vec::with_capacity(desc.tracks.len());

        for track in &desc.tracks {
            let (codec, state) = match &track.params {
                CodecParams::H264 => (
                    TrackCodec::H264,
                    TrackState::H264 {
                        dts_extractor: None,
                    },
                ),
                CodecParams::H265 => (
                    TrackCodec::H265,
                    TrackState::H265 {
                        dts_extractor: None,
                    },
                ),
                CodecParams::Mpeg4Video => (
                    TrackCodec::Mpeg4Video,
                    TrackState::Mpeg4Video { last_pts: None },
                ),
                CodecParams::Mpeg1Video => (
                    TrackCodec::Mpeg1Video,
                    TrackState::Mpeg1Video { last_pts: None },
                ),
                CodecParams::Opus { is_stereo } => (
                    TrackCodec::Opus {
                        channel_count: if *is_stereo { 2 } else { 1 },
                    },
                    TrackState::Audio,
                ),
                CodecParams::Mpeg4Audio { config } => {
                    let config = AudioSpecificConfig::parse(config).ok_or_else(|| {
                        RecorderError::Track(format!(
                            "track {}: unparseable MPEG-4 Audio configuration",
                            track.id
                        ))
                    })?;
                    (TrackCodec::Mpeg4Audio { config }, TrackState::Audio)
                }
                CodecParams::Mpeg1Audio => (TrackCodec::Mpeg1Audio, TrackState::Audio),
                CodecParams::Ac3 { sample_rate, .. } => (
                    TrackCodec::Ac3,
                    TrackState::Ac3 {
                        sample_rate: *sample_rate,
                    },
                ),
            };
            codecs.push(codec);
            tracks.push(state);
        }

        let sink = DynamicSink::new();
        let bw = BufWriter::with_capacity(MPEGTS_MAX_BUFFER_SIZE, sink.clone());
        let mw = TsWriter::new(bw, codecs);

        Ok(Self {
            path_name: path_name.to_string(),
            conf,
            sink,
            mw,
            tracks,
            has_video: false,
            current_segment: None,
            sequence: 0,
            err_logger: Arc::new(LimitedLogger::new()),
        })
    }

    /// Handle one unit, applying the session's failure policy: timing
    /// errors drop the unit, I/O errors discard the current segment and
    /// let the next unit open a fresh one
    pub fn process_unit(&mut self, track_id: usize, unit: &Unit) {
        if unit.payload.is_empty() {
            return;
        }
        match self.on_unit(track_id, unit) {
            Ok(()) => {}
            Err(RecorderError::Timing(msg)) => {
                self.err_logger.warn(&self.path_name, &msg);
            }
            Err(RecorderError::Io(e)) => {
                tracing::error!(
                    path = %self.path_name,
                    error = %e,
                    "write failed, discarding current segment"
                );
                self.discard_segment();
            }
            Err(e) => {
                tracing::error!(path = %self.path_name, error = %e, "recorder error");
            }
        }
    }

    fn on_unit(&mut self, track_id: usize, unit: &Unit) -> Result<(), RecorderError> {
        match (&mut self.tracks[track_id], &unit.payload) {
            (TrackState::H264 { dts_extractor }, Payload::H264 { au }) => {
                let random_access = h264::idr_present(au);
                if dts_extractor.is_none() {
                    if !random_access {
                        return Ok(());
                    }
                    *dts_extractor = Some(DtsExtractor::new());
                }
                let dts = dts_extractor
                    .as_mut()
                    .unwrap()
                    .extract(unit.pts)?;
                let au = au.clone();
                self.record_h26x(track_id, unit.pts, dts, unit.ntp, random_access, &au)
            }

            (TrackState::H265 { dts_extractor }, Payload::H265 { au }) => {
                let random_access = h265::is_random_access(au);
                if dts_extractor.is_none() {
                    if !random_access {
                        return Ok(());
                    }
                    *dts_extractor = Some(DtsExtractor::new());
                }
                let dts = dts_extractor
                    .as_mut()
                    .unwrap()
                    .extract(unit.pts)?;
                let au = au.clone();
                self.record_h26x(track_id, unit.pts, dts, unit.ntp, random_access, &au)
            }

            (TrackState::Mpeg4Video { last_pts }, Payload::Mpeg4Video { frame }) => {
                if matches!(*last_pts, Some(last) if unit.pts < last) {
                    return Err(RecorderError::Timing(
                        "MPEG-4 Video streams with B-frames are not supported".to_string(),
                    ));
                }
                *last_pts = Some(unit.pts);

                let random_access = contains_code(frame, &MPEG4_GOV_START_CODE);
                let frame = frame.clone();
                self.has_video = true;
                self.setup_segment(unit.pts, unit.ntp, true, random_access)?;
                self.mw.write_mpeg4_video(
                    track_id,
                    duration_to_ts(unit.pts),
                    random_access,
                    &frame,
                )?;
                Ok(())
            }

            (TrackState::Mpeg1Video { last_pts }, Payload::Mpeg1Video { frame }) => {
                if matches!(*last_pts, Some(last) if unit.pts < last) {
                    return Err(RecorderError::Timing(
                        "MPEG-1 Video streams with B-frames are not supported".to_string(),
                    ));
                }
                *last_pts = Some(unit.pts);

                let random_access = contains_code(frame, &MPEG1_GOP_START_CODE);
                let frame = frame.clone();
                self.has_video = true;
                self.setup_segment(unit.pts, unit.ntp, true, random_access)?;
                self.mw.write_mpeg1_video(
                    track_id,
                    duration_to_ts(unit.pts),
                    random_access,
                    &frame,
                )?;
                Ok(())
            }

            (TrackState::Audio, Payload::Opus { packets }) => {
                let packets = packets.clone();
                self.setup_segment(unit.pts, unit.ntp, false, true)?;
                self.mw
                    .write_opus(track_id, duration_to_ts(unit.pts), &packets)?;
                Ok(())
            }

            (TrackState::Audio, Payload::Mpeg4Audio { aus }) => {
                let aus = aus.clone();
                self.setup_segment(unit.pts, unit.ntp, false, true)?;
                self.mw
                    .write_mpeg4_audio(track_id, duration_to_ts(unit.pts), &aus)?;
                Ok(())
            }

            (TrackState::Audio, Payload::Mpeg1Audio { frames }) => {
                let frames = frames.clone();
                self.setup_segment(unit.pts, unit.ntp, false, true)?;
                self.mw
                    .write_mpeg1_audio(track_id, duration_to_ts(unit.pts), &frames)?;
                Ok(())
            }

            // AC-3 frames never drive segmentation
            (TrackState::Ac3 { sample_rate }, Payload::Ac3 { frames }) => {
                let sample_rate = *sample_rate;
                let frames = frames.clone();
                for (i, frame) in frames.iter().enumerate() {
                    let frame_pts = unit.pts
                        + Duration::from_secs_f64(
                            i as f64 * AC3_SAMPLES_PER_FRAME / sample_rate as f64,
                        );
                    self.mw
                        .write_ac3(track_id, duration_to_ts(frame_pts), frame)?;
                }
                Ok(())
            }

            // payload kind does not match the registered track
            _ => Ok(()),
        }
    }

    fn record_h26x(
        &mut self,
        track_id: usize,
        pts: Duration,
        dts: Duration,
        ntp: DateTime<Utc>,
        random_access: bool,
        au: &[Bytes],
    ) -> Result<(), RecorderError> {
        self.has_video = true;
        self.setup_segment(dts, ntp, true, random_access)?;
        self.mw.write_h26x(
            track_id,
            duration_to_ts(pts),
            duration_to_ts(dts),
            random_access,
            au,
        )?;
        Ok(())
    }

    /// Segment boundary decision, run once per encoded frame/packet
    fn setup_segment(
        &mut self,
        dts: Duration,
        ntp: DateTime<Utc>,
        is_video: bool,
        random_access: bool,
    ) -> Result<(), RecorderError> {
        let conf = self.conf.borrow().clone();

        enum Action {
            Open,
            Rotate,
            Flush,
            Nothing,
        }

        let action = match &self.current_segment {
            None => Action::Open,
            Some(seg)
                if (!self.has_video || is_video)
                    && random_access
                    && dts.saturating_sub(seg.start_dts) >= conf.segment_duration() =>
            {
                Action::Rotate
            }
            Some(seg) if dts.saturating_sub(seg.last_flush) >= conf.part_duration() => {
                Action::Flush
            }
            _ => Action::Nothing,
        };

        match action {
            Action::Open => self.open_segment(&conf, dts, ntp),
            Action::Rotate => {
                self.close_segment()?;
                self.open_segment(&conf, dts, ntp)
            }
            Action::Flush => {
                self.mw.get_mut().flush()?;
                if let Some(seg) = &mut self.current_segment {
                    seg.last_flush = dts;
                }
                Ok(())
            }
            Action::Nothing => Ok(()),
        }
    }

    fn open_segment(
        &mut self,
        conf: &PathConf,
        dts: Duration,
        ntp: DateTime<Utc>,
    ) -> Result<(), RecorderError> {
        let (segment, file) = Segment::create(
            &conf.record_path,
            &self.path_name,
            ntp,
            dts,
            self.sequence,
        )?;
        self.sequence += 1;

        tracing::debug!(
            path = %self.path_name,
            file = %segment.final_path.display(),
            "creating segment"
        );

        self.current_segment = Some(segment);
        self.sink.set_file(file);
        self.mw.write_tables()?;
        Ok(())
    }

    fn close_segment(&mut self) -> Result<(), RecorderError> {
        let segment = match self.current_segment.take() {
            Some(s) => s,
            None => return Ok(()),
        };

        match self.mw.get_mut().flush() {
            Ok(()) => {
                drop(self.sink.take_file());
                segment.commit()?;
                tracing::debug!(
                    path = %self.path_name,
                    file = %segment.final_path.display(),
                    "segment closed"
                );
                Ok(())
            }
            Err(e) => {
                // drain leftover buffered bytes so they cannot leak into
                // the next segment
                self.sink.set_discard();
                let _ = self.mw.get_mut().flush();
                self.sink.take_file();
                segment.discard();
                Err(e.into())
            }
        }
    }

    /// Drop the active segment after an I/O error; the next unit opens a
    /// fresh one
    fn discard_segment(&mut self) {
        if let Some(segment) = self.current_segment.take() {
            self.sink.set_discard();
            let _ = self.mw.get_mut().flush();
            self.sink.take_file();
            segment.discard();
        }
    }

    /// Flush and close the active segment; called on session teardown
    pub fn close(&mut self) {
        if let Err(e) = self.close_segment() {
            tracing::warn!(path = %self.path_name, error = %e, "closing segment failed");
        }
    }
}

fn contains_code(frame: &[u8], code: &[u8; 4]) -> bool {
    frame.windows(code.len()).any(|w| w == code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::TrackDesc;
    use std::path::Path;

    fn conf_channel(dir: &Path, segment_secs: u64, part_secs: f64) -> watch::Receiver<Arc<PathConf>> {
        let conf = PathConf {
            record: true,
            record_path: format!("{}/%path/%s", dir.display()),
            segment_duration_seconds: segment_secs,
            part_duration_seconds: part_secs,
            ..PathConf::default()
        };
        // receivers keep serving the last value after the sender drops
        let (_tx, rx) = watch::channel(Arc::new(conf));
        rx
    }

    fn video_desc() -> StreamDesc {
        StreamDesc {
            tracks: vec![TrackDesc {
                id: 0,
                params: CodecParams::H264,
            }],
        }
    }

    fn idr_unit(ms: u64) -> Unit {
        Unit {
            pts: Duration::from_millis(ms),
            ntp: Utc::now(),
            payload: Payload::H264 {
                au: vec![Bytes::from_static(&[0x65, 0x88])],
            },
        }
    }

    fn non_idr_unit(ms: u64) -> Unit {
        Unit {
            pts: Duration::from_millis(ms),
            ntp: Utc::now(),
            payload: Payload::H264 {
                au: vec![Bytes::from_static(&[0x41, 0x9A])],
            },
        }
    }

    fn list_files(dir: &Path) -> Vec<String> {
        let mut out = Vec::new();
        if let Ok(entries) = std::fs::read_dir(dir.join("cam")) {
            for entry in entries.flatten() {
                out.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        out.sort();
        out
    }

    #[test]
    fn test_segment_rotation_on_keyframe_and_duration() {
        let dir = tempfile::tempdir().unwrap();
        let conf = conf_channel(dir.path(), 1, 10.0);
        let mut f = FormatMpegts::new("cam", &video_desc(), conf).unwrap();

        f.process_unit(0, &idr_unit(0));
        // over the segment duration but not a keyframe: no rotation
        f.process_unit(0, &non_idr_unit(1500));
        assert_eq!(list_files(dir.path()), vec!["0.ts.tmp"]);

        // keyframe past the duration rotates
        f.process_unit(0, &idr_unit(2000));
        assert_eq!(list_files(dir.path()), vec!["0.ts", "1.ts.tmp"]);

        f.close();
        assert_eq!(list_files(dir.path()), vec!["0.ts", "1.ts"]);
    }

    #[test]
    fn test_units_before_first_keyframe_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let conf = conf_channel(dir.path(), 10, 10.0);
        let mut f = FormatMpegts::new("cam", &video_desc(), conf).unwrap();

        f.process_unit(0, &non_idr_unit(0));
        f.process_unit(0, &non_idr_unit(40));
        assert!(list_files(dir.path()).is_empty());

        f.process_unit(0, &idr_unit(80));
        assert_eq!(list_files(dir.path()), vec!["0.ts.tmp"]);
        f.close();
    }

    #[test]
    fn test_audio_only_rotates_on_duration() {
        let dir = tempfile::tempdir().unwrap();
        let conf = conf_channel(dir.path(), 1, 10.0);
        let desc = StreamDesc {
            tracks: vec![TrackDesc {
                id: 0,
                params: CodecParams::Mpeg1Audio,
            }],
        };
        let mut f = FormatMpegts::new("cam", &desc, conf).unwrap();

        for ms in [0u64, 500, 1000, 1500, 2200] {
            f.process_unit(
                0,
                &Unit {
                    pts: Duration::from_millis(ms),
                    ntp: Utc::now(),
                    payload: Payload::Mpeg1Audio {
                        frames: vec![Bytes::from_static(&[0xFF, 0xFB, 0x90, 0x00])],
                    },
                },
            );
        }
        f.close();

        // every audio packet is a random access point, so boundaries are
        // purely duration-driven: 0-1000, 1000-2200, 2200-
        assert_eq!(list_files(dir.path()), vec!["0.ts", "1.ts", "2.ts"]);
    }

    #[test]
    fn test_part_flush_exposes_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let conf = conf_channel(dir.path(), 3600, 0.2);
        let mut f = FormatMpegts::new("cam", &video_desc(), conf).unwrap();

        f.process_unit(0, &idr_unit(0));
        let tmp = dir.path().join("cam/0.ts.tmp");
        // buffered: only what the 64 KiB buffer has not absorbed yet
        let before = std::fs::metadata(&tmp).unwrap().len();

        f.process_unit(0, &non_idr_unit(300));
        let after = std::fs::metadata(&tmp).unwrap().len();
        assert!(after > before);
        assert_eq!(after % 188, 0);
        f.close();
    }

    #[test]
    fn test_b_frame_rejection_keeps_session_alive() {
        let dir = tempfile::tempdir().unwrap();
        let conf = conf_channel(dir.path(), 3600, 10.0);
        let desc = StreamDesc {
            tracks: vec![TrackDesc {
                id: 0,
                params: CodecParams::Mpeg4Video,
            }],
        };
        let mut f = FormatMpegts::new("cam", &desc, conf).unwrap();

        let frame = |ms: u64, ra: bool| Unit {
            pts: Duration::from_millis(ms),
            ntp: Utc::now(),
            payload: Payload::Mpeg4Video {
                frame: if ra {
                    Bytes::from_static(&[0x00, 0x00, 0x01, 0xB3, 0x01])
                } else {
                    Bytes::from_static(&[0x00, 0x00, 0x01, 0xB6, 0x01])
                },
            },
        };

        f.process_unit(0, &frame(0, true));
        f.process_unit(0, &frame(80, false));
        // out-of-order PTS: dropped, not fatal
        f.process_unit(0, &frame(40, false));
        f.process_unit(0, &frame(120, false));
        f.close();

        assert_eq!(list_files(dir.path()), vec!["0.ts"]);
    }

    #[test]
    fn test_close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let conf = conf_channel(dir.path(), 3600, 10.0);
        let mut f = FormatMpegts::new("cam", &video_desc(), conf).unwrap();

        f.process_unit(0, &idr_unit(0));
        f.close();
        f.close();
        assert_eq!(list_files(dir.path()), vec!["0.ts"]);
    }
}
