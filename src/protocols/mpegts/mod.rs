//! MPEG transport stream reading and writing
//!
//! The writer produces standard 188-byte TS packets with one PAT/PMT pair
//! per segment and PIDs assigned in track-registration order starting at
//! 256. The reader is the counterpart used by the SRT source: it parses
//! PAT/PMT, assembles PES packets and hands out codec-level payloads.

pub mod reader;
pub mod writer;

use std::time::Duration;

pub use reader::{Reader, ReaderEvent, ReaderTrack};
pub use writer::{TrackCodec, Writer};

pub(crate) const PACKET_SIZE: usize = 188;
pub(crate) const SYNC_BYTE: u8 = 0x47;
pub(crate) const PAT_PID: u16 = 0x0000;
pub(crate) const PMT_PID: u16 = 0x1000;

/// Track PIDs are assigned from here, in registration order
pub(crate) const FIRST_TRACK_PID: u16 = 256;

pub(crate) const STREAM_TYPE_MPEG1_VIDEO: u8 = 0x01;
pub(crate) const STREAM_TYPE_MPEG1_AUDIO: u8 = 0x03;
pub(crate) const STREAM_TYPE_MPEG4_VIDEO: u8 = 0x10;
pub(crate) const STREAM_TYPE_MPEG4_AUDIO: u8 = 0x0F;
pub(crate) const STREAM_TYPE_H264: u8 = 0x1B;
pub(crate) const STREAM_TYPE_H265: u8 = 0x24;
pub(crate) const STREAM_TYPE_PRIVATE: u8 = 0x06;

pub(crate) const DESCRIPTOR_REGISTRATION: u8 = 0x05;
pub(crate) const DESCRIPTOR_DVB_AC3: u8 = 0x6A;
pub(crate) const DESCRIPTOR_DVB_EXTENSION: u8 = 0x7F;
pub(crate) const DVB_EXTENSION_OPUS: u8 = 0x80;

/// Convert a duration to 90 kHz TS ticks
pub fn duration_to_ts(d: Duration) -> i64 {
    (d.as_secs_f64() * 90000.0).round() as i64
}

/// Convert 90 kHz TS ticks to a duration
pub fn ts_to_duration(ticks: i64) -> Duration {
    Duration::from_secs_f64(ticks.max(0) as f64 / 90000.0)
}

/// CRC-32/MPEG-2: polynomial 0x04C11DB7, initial 0xFFFFFFFF, no
/// reflection, no final xor
pub(crate) fn crc32_mpeg(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in data {
        crc ^= (byte as u32) << 24;
        for _ in 0..8 {
            if crc & 0x8000_0000 != 0 {
                crc = (crc << 1) ^ 0x04C1_1DB7;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// ADTS / AudioSpecificConfig sampling frequency table
pub(crate) const SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// The two-byte MPEG-4 AudioSpecificConfig carried in track descriptors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioSpecificConfig {
    pub object_type: u8,
    pub sampling_frequency_index: u8,
    pub channel_config: u8,
}

impl AudioSpecificConfig {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 2 {
            return None;
        }
        let object_type = data[0] >> 3;
        let sampling_frequency_index = ((data[0] & 0x07) << 1) | (data[1] >> 7);
        let channel_config = (data[1] >> 3) & 0x0F;
        if object_type == 0 || sampling_frequency_index as usize >= SAMPLE_RATES.len() {
            return None;
        }
        Some(Self {
            object_type,
            sampling_frequency_index,
            channel_config,
        })
    }

    pub fn marshal(&self) -> [u8; 2] {
        [
            (self.object_type << 3) | (self.sampling_frequency_index >> 1),
            ((self.sampling_frequency_index & 0x01) << 7) | (self.channel_config << 3),
        ]
    }

    pub fn sample_rate(&self) -> u32 {
        SAMPLE_RATES[self.sampling_frequency_index as usize]
    }
}
