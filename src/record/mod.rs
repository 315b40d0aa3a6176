//! Disk recording
//!
//! A [`RecorderAgent`] is created when a path becomes ready and destroyed
//! when it goes not-ready. It attaches to the path's stream as a reader
//! and runs synchronously on the delivery callback; disk backpressure
//! therefore propagates into the publisher.

mod format_mpegts;
mod h264;
mod h265;
pub mod segment;
mod timing;

use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use crate::config::PathConf;
use crate::stream::{ReaderHandle, Stream};
use format_mpegts::FormatMpegts;

pub use segment::expand_path_template;

/// Recorder errors
#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    /// DTS extraction failure or reordered frames; the unit is dropped
    #[error("timing error: {0}")]
    Timing(String),

    /// Disk failure; the current segment is discarded
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A track cannot be recorded as described
    #[error("invalid track configuration: {0}")]
    Track(String),
}

/// Per-path recorder; owns the formatter and its stream registration
pub struct RecorderAgent {
    path_name: String,
    stream: Arc<Stream>,
    handle: ReaderHandle,
    format: Arc<Mutex<FormatMpegts>>,
}

impl RecorderAgent {
    /// Attach a recorder to a ready stream
    ///
    /// Segment and part durations are re-read from the config channel on
    /// every unit, so a reload takes effect at the next unit.
    pub fn new(
        path_name: &str,
        stream: Arc<Stream>,
        conf: watch::Receiver<Arc<PathConf>>,
    ) -> Result<Self, RecorderError> {
        let format = Arc::new(Mutex::new(FormatMpegts::new(
            path_name,
            stream.desc(),
            conf,
        )?));

        let handle = stream.add_reader();
        for track in &stream.desc().tracks {
            let format = format.clone();
            let track_id = track.id;
            stream.set_track_callback(
                handle,
                track_id,
                Box::new(move |unit| {
                    format.lock().unwrap().process_unit(track_id, unit);
                }),
            );
        }

        tracing::info!(
            path = %path_name,
            codecs = %stream.desc().codec_names(),
            "recording"
        );

        Ok(Self {
            path_name: path_name.to_string(),
            stream,
            handle,
            format,
        })
    }

    /// Detach from the stream and close the active segment
    pub fn close(&self) {
        self.stream.remove_reader(self.handle);
        self.format.lock().unwrap().close();
        tracing::info!(path = %self.path_name, "recording stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PathConf;
    use crate::stream::{CodecParams, Payload, StreamDesc, Unit};
    use bytes::Bytes;
    use chrono::Utc;
    use std::time::Duration;

    #[test]
    fn test_agent_records_via_stream() {
        let dir = tempfile::tempdir().unwrap();
        let conf = PathConf {
            record: true,
            record_path: format!("{}/%path/%s", dir.path().display()),
            segment_duration_seconds: 3600,
            part_duration_seconds: 1.0,
            ..PathConf::default()
        };
        let (_tx, rx) = watch::channel(Arc::new(conf));

        let stream = Arc::new(Stream::new(StreamDesc::new(vec![CodecParams::H264])));
        let agent = RecorderAgent::new("cam", stream.clone(), rx).unwrap();
        assert_eq!(stream.reader_count(), 1);

        stream.write_unit(
            0,
            &Unit {
                pts: Duration::ZERO,
                ntp: Utc::now(),
                payload: Payload::H264 {
                    au: vec![Bytes::from_static(&[0x65, 0x88])],
                },
            },
        );

        agent.close();
        assert_eq!(stream.reader_count(), 0);

        let segment = dir.path().join("cam/0.ts");
        let data = std::fs::read(segment).unwrap();
        assert!(!data.is_empty());
        assert_eq!(data.len() % 188, 0);
    }
}
