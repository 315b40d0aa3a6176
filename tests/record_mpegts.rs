//! End-to-end recorder tests
//!
//! Drive units through the stream fabric into the recorder, then read
//! the produced segments back with the TS demultiplexer and check that
//! the track set, ordering and timestamps survive the round trip.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use tokio::sync::watch;

use streamgate::config::PathConf;
use streamgate::protocols::mpegts::{Reader, ReaderEvent};
use streamgate::record::RecorderAgent;
use streamgate::stream::{CodecParams, Payload, Stream, StreamDesc, TrackDesc, Unit};

const TICK: Duration = Duration::from_micros(12); // just above 1/90000 s

fn conf_rx(dir: &std::path::Path, segment_secs: u64, part_secs: f64) -> watch::Receiver<Arc<PathConf>> {
    let conf = PathConf {
        record: true,
        record_path: format!("{}/%path/%s", dir.display()),
        segment_duration_seconds: segment_secs,
        part_duration_seconds: part_secs,
        ..PathConf::default()
    };
    let (_tx, rx) = watch::channel(Arc::new(conf));
    rx
}

fn h264_unit(ms: u64, idr: bool) -> Unit {
    let au = if idr {
        vec![
            Bytes::from_static(&[0x67, 0x42, 0x00, 0x1F]),
            Bytes::from_static(&[0x68, 0xCE, 0x38, 0x80]),
            Bytes::from_static(&[0x65, 0x88, 0x84, 0x21, 0xFF]),
        ]
    } else {
        vec![Bytes::from_static(&[0x41, 0x9A, 0x02, 0x05])]
    };
    Unit {
        pts: Duration::from_millis(ms),
        ntp: Utc::now(),
        payload: Payload::H264 { au },
    }
}

fn aac_unit(ms: u64) -> Unit {
    Unit {
        pts: Duration::from_millis(ms),
        ntp: Utc::now(),
        payload: Payload::Mpeg4Audio {
            aus: vec![Bytes::from_static(&[0x21, 0x10, 0x04, 0x60])],
        },
    }
}

fn parse_segment(path: &std::path::Path) -> Vec<ReaderEvent> {
    let data = std::fs::read(path).unwrap();
    assert!(!data.is_empty());
    assert_eq!(data.len() % 188, 0, "segment is not packet aligned");
    for packet in data.chunks(188) {
        assert_eq!(packet[0], 0x47, "lost sync inside segment");
    }

    let mut reader = Reader::new();
    let mut events = reader.push(&data);
    events.extend(reader.finish());
    events
}

fn units_of(events: &[ReaderEvent]) -> Vec<(usize, Duration, Payload)> {
    events
        .iter()
        .filter_map(|e| match e {
            ReaderEvent::Unit {
                track_id,
                pts,
                payload,
            } => Some((*track_id, *pts, payload.clone())),
            _ => None,
        })
        .collect()
}

fn close_to(a: Duration, b: Duration) -> bool {
    let diff = if a > b { a - b } else { b - a };
    diff <= TICK
}

#[test]
fn test_video_audio_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let rx = conf_rx(dir.path(), 3600, 1.0);

    // AAC-LC 48 kHz stereo AudioSpecificConfig
    let desc = StreamDesc::new(vec![
        CodecParams::H264,
        CodecParams::Mpeg4Audio {
            config: Bytes::from_static(&[0x11, 0x90]),
        },
    ]);
    let stream = Arc::new(Stream::new(desc));
    let agent = RecorderAgent::new("cam", stream.clone(), rx).unwrap();

    stream.write_unit(0, &h264_unit(0, true));
    stream.write_unit(1, &aac_unit(0));
    stream.write_unit(0, &h264_unit(40, false));
    stream.write_unit(1, &aac_unit(21));
    stream.write_unit(0, &h264_unit(80, false));
    agent.close();

    let events = parse_segment(&dir.path().join("cam/0.ts"));

    // track set survives
    let tracks = events
        .iter()
        .find_map(|e| match e {
            ReaderEvent::Tracks(t) => Some(t.clone()),
            _ => None,
        })
        .expect("tracks");
    assert_eq!(tracks.len(), 2);
    assert_eq!(tracks[0].params, CodecParams::H264);
    assert_eq!(
        tracks[1].params,
        CodecParams::Mpeg4Audio {
            config: Bytes::from_static(&[0x11, 0x90]),
        }
    );

    let units = units_of(&events);
    assert_eq!(units.len(), 5);

    // per-track PTS order and values within one tick
    let video: Vec<_> = units.iter().filter(|u| u.0 == 0).collect();
    assert_eq!(video.len(), 3);
    for (unit, expected_ms) in video.iter().zip([0u64, 40, 80]) {
        assert!(
            close_to(unit.1, Duration::from_millis(expected_ms)),
            "video pts {:?} vs {expected_ms}ms",
            unit.1
        );
    }
    let audio: Vec<_> = units.iter().filter(|u| u.0 == 1).collect();
    assert_eq!(audio.len(), 2);
    assert!(close_to(audio[1].1, Duration::from_millis(21)));

    // the first video unit of the segment is a random access point
    match &video[0].2 {
        Payload::H264 { au } => {
            assert!(au.iter().any(|n| n[0] & 0x1F == 5));
        }
        other => panic!("unexpected payload {other:?}"),
    }

    // payload content survives
    match &audio[0].2 {
        Payload::Mpeg4Audio { aus } => {
            assert_eq!(aus[0], Bytes::from_static(&[0x21, 0x10, 0x04, 0x60]));
        }
        other => panic!("unexpected payload {other:?}"),
    }
}

#[test]
fn test_segment_boundaries_on_keyframes() {
    let dir = tempfile::tempdir().unwrap();
    let rx = conf_rx(dir.path(), 1, 10.0);

    let stream = Arc::new(Stream::new(StreamDesc::new(vec![CodecParams::H264])));
    let agent = RecorderAgent::new("cam", stream.clone(), rx).unwrap();

    // 0..2s of frames, keyframe every 500 ms
    for ms in (0..=2000u64).step_by(100) {
        stream.write_unit(0, &h264_unit(ms, ms % 500 == 0));
    }
    agent.close();

    let seg_dir = dir.path().join("cam");
    let mut names: Vec<String> = std::fs::read_dir(&seg_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    // rotations at 1000 ms and 2000 ms
    assert_eq!(names, vec!["0.ts", "1.ts", "2.ts"]);

    // every segment starts with an IDR access unit
    for name in names {
        let events = parse_segment(&seg_dir.join(name));
        let units = units_of(&events);
        match &units.first().expect("segment has units").2 {
            Payload::H264 { au } => {
                assert!(
                    au.iter().any(|n| n[0] & 0x1F == 5),
                    "segment does not start on a keyframe"
                );
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }
}

#[test]
fn test_teardown_commits_active_segment() {
    let dir = tempfile::tempdir().unwrap();
    let rx = conf_rx(dir.path(), 3600, 1.0);

    let stream = Arc::new(Stream::new(StreamDesc::new(vec![CodecParams::H264])));
    let agent = RecorderAgent::new("cam", stream.clone(), rx).unwrap();

    stream.write_unit(0, &h264_unit(0, true));

    let seg_dir = dir.path().join("cam");
    assert!(seg_dir.join("0.ts.tmp").exists());
    assert!(!seg_dir.join("0.ts").exists());

    agent.close();

    // temp name gone, final name present: the close was atomic
    assert!(!seg_dir.join("0.ts.tmp").exists());
    assert!(seg_dir.join("0.ts").exists());

    // closing again must not disturb the committed segment
    agent.close();
    assert!(seg_dir.join("0.ts").exists());
}

#[test]
fn test_opus_roundtrip_through_recorder() {
    let dir = tempfile::tempdir().unwrap();
    let rx = conf_rx(dir.path(), 3600, 1.0);

    let stream = Arc::new(Stream::new(StreamDesc {
        tracks: vec![TrackDesc {
            id: 0,
            params: CodecParams::Opus { is_stereo: true },
        }],
    }));
    let agent = RecorderAgent::new("mic", stream.clone(), rx).unwrap();

    let packets = vec![Bytes::from_static(&[0xFC, 0x01, 0x02, 0x03])];
    stream.write_unit(
        0,
        &Unit {
            pts: Duration::from_millis(20),
            ntp: Utc::now(),
            payload: Payload::Opus {
                packets: packets.clone(),
            },
        },
    );
    agent.close();

    let events = parse_segment(&dir.path().join("mic/0.ts"));
    let units = units_of(&events);
    assert_eq!(units.len(), 1);
    match &units[0].2 {
        Payload::Opus { packets: got } => assert_eq!(*got, packets),
        other => panic!("unexpected payload {other:?}"),
    }
}
