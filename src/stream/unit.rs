//! Media units flowing through the stream fabric

use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};

/// Codec-specific payload of one unit
#[derive(Debug, Clone)]
pub enum Payload {
    /// H.264 access unit, one NAL unit per entry
    H264 { au: Vec<Bytes> },

    /// H.265 access unit, one NAL unit per entry
    H265 { au: Vec<Bytes> },

    /// MPEG-4 Visual frame
    Mpeg4Video { frame: Bytes },

    /// MPEG-1/2 Video frame
    Mpeg1Video { frame: Bytes },

    /// Opus packets sharing one timestamp
    Opus { packets: Vec<Bytes> },

    /// MPEG-4 Audio (AAC) access units
    Mpeg4Audio { aus: Vec<Bytes> },

    /// MPEG-1 Audio frames
    Mpeg1Audio { frames: Vec<Bytes> },

    /// AC-3 sync frames
    Ac3 { frames: Vec<Bytes> },
}

impl Payload {
    /// Whether the payload carries no data; empty units are skipped by
    /// readers
    pub fn is_empty(&self) -> bool {
        match self {
            Payload::H264 { au } => au.is_empty(),
            Payload::H265 { au } => au.is_empty(),
            Payload::Mpeg4Video { frame } => frame.is_empty(),
            Payload::Mpeg1Video { frame } => frame.is_empty(),
            Payload::Opus { packets } => packets.is_empty(),
            Payload::Mpeg4Audio { aus } => aus.is_empty(),
            Payload::Mpeg1Audio { frames } => frames.is_empty(),
            Payload::Ac3 { frames } => frames.is_empty(),
        }
    }
}

/// A time-stamped payload for one elementary track
#[derive(Debug, Clone)]
pub struct Unit {
    /// Presentation timestamp, relative to the session start
    pub pts: Duration,

    /// Wall-clock time the unit was received
    pub ntp: DateTime<Utc>,

    pub payload: Payload,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_is_empty() {
        assert!(Payload::H264 { au: vec![] }.is_empty());
        assert!(!Payload::H264 {
            au: vec![Bytes::from_static(&[0x65])]
        }
        .is_empty());
        assert!(Payload::Mpeg4Video {
            frame: Bytes::new()
        }
        .is_empty());
    }
}
