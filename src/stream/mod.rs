//! Per-path stream fabric
//!
//! A [`Stream`] carries the elementary tracks of one path from a single
//! producer (the source) to any number of readers (one of them being the
//! recorder). Units are delivered synchronously on the producer's thread;
//! backpressure in a reader therefore propagates into the publisher.

pub mod unit;

use std::collections::HashMap;
use std::sync::Mutex;

use bytes::Bytes;

pub use unit::{Payload, Unit};

/// Codec descriptor of one track
#[derive(Debug, Clone, PartialEq)]
pub enum CodecParams {
    H264,
    H265,
    Mpeg4Video,
    Mpeg1Video,
    Opus {
        is_stereo: bool,
    },
    Mpeg4Audio {
        /// AudioSpecificConfig bytes
        config: Bytes,
    },
    Mpeg1Audio,
    Ac3 {
        sample_rate: u32,
        channels: u8,
    },
}

impl CodecParams {
    pub fn is_video(&self) -> bool {
        matches!(
            self,
            CodecParams::H264
                | CodecParams::H265
                | CodecParams::Mpeg4Video
                | CodecParams::Mpeg1Video
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            CodecParams::H264 => "H264",
            CodecParams::H265 => "H265",
            CodecParams::Mpeg4Video => "MPEG-4 Video",
            CodecParams::Mpeg1Video => "MPEG-1 Video",
            CodecParams::Opus { .. } => "Opus",
            CodecParams::Mpeg4Audio { .. } => "MPEG-4 Audio",
            CodecParams::Mpeg1Audio => "MPEG-1 Audio",
            CodecParams::Ac3 { .. } => "AC-3",
        }
    }
}

/// Description of one track inside a stream
#[derive(Debug, Clone)]
pub struct TrackDesc {
    /// Track index, stable for the life of the stream
    pub id: usize,
    pub params: CodecParams,
}

/// Description of a stream: its set of elementary tracks
#[derive(Debug, Clone, Default)]
pub struct StreamDesc {
    pub tracks: Vec<TrackDesc>,
}

impl StreamDesc {
    pub fn new(params: Vec<CodecParams>) -> Self {
        Self {
            tracks: params
                .into_iter()
                .enumerate()
                .map(|(id, params)| TrackDesc { id, params })
                .collect(),
        }
    }

    /// Human-readable codec list, used for "recording [...]"-style logs
    pub fn codec_names(&self) -> String {
        let names: Vec<&str> = self.tracks.iter().map(|t| t.params.name()).collect();
        format!("[{}]", names.join(", "))
    }

    pub fn has_video(&self) -> bool {
        self.tracks.iter().any(|t| t.params.is_video())
    }
}

/// Callback invoked for every unit of one track
pub type ReaderFn = Box<dyn FnMut(&Unit) + Send>;

/// Identifies one registered reader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderHandle(u64);

struct ReaderEntry {
    id: u64,
    callbacks: HashMap<usize, ReaderFn>,
}

#[derive(Default)]
struct ReaderTable {
    next_id: u64,
    entries: Vec<ReaderEntry>,
}

/// The stream fabric for one path
pub struct Stream {
    desc: StreamDesc,
    readers: Mutex<ReaderTable>,
}

impl Stream {
    pub fn new(desc: StreamDesc) -> Self {
        Self {
            desc,
            readers: Mutex::new(ReaderTable::default()),
        }
    }

    pub fn desc(&self) -> &StreamDesc {
        &self.desc
    }

    /// Register a reader; track callbacks are attached afterwards
    pub fn add_reader(&self) -> ReaderHandle {
        let mut table = self.readers.lock().unwrap();
        table.next_id += 1;
        let id = table.next_id;
        table.entries.push(ReaderEntry {
            id,
            callbacks: HashMap::new(),
        });
        ReaderHandle(id)
    }

    /// Attach a per-track callback to a registered reader
    pub fn set_track_callback(&self, handle: ReaderHandle, track_id: usize, cb: ReaderFn) {
        let mut table = self.readers.lock().unwrap();
        if let Some(entry) = table.entries.iter_mut().find(|e| e.id == handle.0) {
            entry.callbacks.insert(track_id, cb);
        }
    }

    /// Detach a reader and all its callbacks
    pub fn remove_reader(&self, handle: ReaderHandle) {
        let mut table = self.readers.lock().unwrap();
        table.entries.retain(|e| e.id != handle.0);
    }

    pub fn reader_count(&self) -> usize {
        self.readers.lock().unwrap().entries.len()
    }

    /// Deliver a unit to every reader of the track, synchronously
    pub fn write_unit(&self, track_id: usize, unit: &Unit) {
        let mut table = self.readers.lock().unwrap();
        for entry in table.entries.iter_mut() {
            if let Some(cb) = entry.callbacks.get_mut(&track_id) {
                cb(unit);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn h264_unit(pts_ms: u64) -> Unit {
        Unit {
            pts: Duration::from_millis(pts_ms),
            ntp: Utc::now(),
            payload: Payload::H264 {
                au: vec![Bytes::from_static(&[0x65, 0x00])],
            },
        }
    }

    #[test]
    fn test_desc() {
        let desc = StreamDesc::new(vec![
            CodecParams::H264,
            CodecParams::Mpeg4Audio {
                config: Bytes::from_static(&[0x12, 0x10]),
            },
        ]);
        assert_eq!(desc.tracks.len(), 2);
        assert_eq!(desc.tracks[0].id, 0);
        assert!(desc.has_video());
        assert_eq!(desc.codec_names(), "[H264, MPEG-4 Audio]");
    }

    #[test]
    fn test_units_reach_track_readers_in_order() {
        let stream = Stream::new(StreamDesc::new(vec![CodecParams::H264]));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let handle = stream.add_reader();
        let seen_cb = seen.clone();
        stream.set_track_callback(
            handle,
            0,
            Box::new(move |u| {
                seen_cb.lock().unwrap().push(u.pts);
            }),
        );

        for pts in [0, 40, 80] {
            stream.write_unit(0, &h264_unit(pts));
        }

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                Duration::from_millis(0),
                Duration::from_millis(40),
                Duration::from_millis(80)
            ]
        );
    }

    #[test]
    fn test_reader_only_sees_its_track() {
        let stream = Stream::new(StreamDesc::new(vec![
            CodecParams::H264,
            CodecParams::Mpeg1Audio,
        ]));

        let count = Arc::new(AtomicUsize::new(0));
        let handle = stream.add_reader();
        let count_cb = count.clone();
        stream.set_track_callback(
            handle,
            1,
            Box::new(move |_| {
                count_cb.fetch_add(1, Ordering::SeqCst);
            }),
        );

        stream.write_unit(0, &h264_unit(0));
        assert_eq!(count.load(Ordering::SeqCst), 0);

        stream.write_unit(1, &h264_unit(0));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_reader() {
        let stream = Stream::new(StreamDesc::new(vec![CodecParams::H264]));

        let count = Arc::new(AtomicUsize::new(0));
        let handle = stream.add_reader();
        let count_cb = count.clone();
        stream.set_track_callback(
            handle,
            0,
            Box::new(move |_| {
                count_cb.fetch_add(1, Ordering::SeqCst);
            }),
        );

        stream.write_unit(0, &h264_unit(0));
        stream.remove_reader(handle);
        stream.write_unit(0, &h264_unit(40));

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(stream.reader_count(), 0);
    }
}
