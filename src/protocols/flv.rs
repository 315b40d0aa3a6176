//! FLV tag depacketization
//!
//! RTMP carries media as FLV tag bodies. These depacketizers turn video
//! tags (AVC sequence headers + AVCC access units) and audio tags (AAC
//! sequence headers + raw frames, or MP3 frames) into the elementary
//! payloads the stream fabric carries.

use std::time::Duration;

use bytes::Bytes;

pub const VIDEO_CODEC_AVC: u8 = 7;
pub const AUDIO_FORMAT_MP3: u8 = 2;
pub const AUDIO_FORMAT_AAC: u8 = 10;

/// FLV depacketization errors
#[derive(Debug, thiserror::Error)]
pub enum FlvError {
    #[error("truncated FLV tag")]
    Truncated,

    #[error("unsupported video codec id {0}")]
    UnsupportedVideoCodec(u8),

    #[error("unsupported audio format {0}")]
    UnsupportedAudioFormat(u8),

    #[error("malformed AVC decoder configuration")]
    MalformedAvcConfig,
}

/// Output of the video depacketizer
#[derive(Debug)]
pub enum VideoTag {
    /// Sequence header processed; SPS/PPS now known
    Config,

    /// One access unit
    Au {
        pts: Duration,
        au: Vec<Bytes>,
        keyframe: bool,
    },

    /// End-of-sequence or empty tag
    Skip,
}

/// Output of the audio depacketizer
#[derive(Debug)]
pub enum AudioTag {
    /// AAC AudioSpecificConfig
    AacConfig(Bytes),

    /// One AAC access unit
    AacAu { pts: Duration, au: Bytes },

    /// One MP3 frame
    Mp3Frame { pts: Duration, frame: Bytes },

    Skip,
}

/// Stateful AVC video tag depacketizer
///
/// Keeps the parameter sets from the sequence header and the NALU length
/// size, and prepends SPS/PPS to keyframe access units that lack them.
#[derive(Default)]
pub struct VideoDepacketizer {
    sps: Vec<Bytes>,
    pps: Vec<Bytes>,
    nalu_length_size: usize,
}

impl VideoDepacketizer {
    pub fn new() -> Self {
        Self {
            sps: Vec::new(),
            pps: Vec::new(),
            nalu_length_size: 4,
        }
    }

    /// Process one FLV video tag body
    pub fn parse_tag(&mut self, data: &[u8], timestamp_ms: u32) -> Result<VideoTag, FlvError> {
        if data.len() < 5 {
            return Ok(VideoTag::Skip);
        }
        let frame_type = data[0] >> 4;
        let codec_id = data[0] & 0x0F;
        if codec_id != VIDEO_CODEC_AVC {
            return Err(FlvError::UnsupportedVideoCodec(codec_id));
        }

        let packet_type = data[1];
        match packet_type {
            0 => {
                self.parse_avc_config(&data[5..])?;
                Ok(VideoTag::Config)
            }
            1 => {
                let composition_ms = i32::from_be_bytes([0, data[2], data[3], data[4]]) << 8 >> 8;
                let pts_ms = timestamp_ms as i64 + composition_ms as i64;
                let pts = Duration::from_millis(pts_ms.max(0) as u64);

                let mut au = self.split_avcc(&data[5..])?;
                if au.is_empty() {
                    return Ok(VideoTag::Skip);
                }

                let keyframe = frame_type == 1;
                if keyframe && !au.iter().any(|n| !n.is_empty() && n[0] & 0x1F == 7) {
                    let mut with_ps: Vec<Bytes> =
                        self.sps.iter().chain(self.pps.iter()).cloned().collect();
                    with_ps.append(&mut au);
                    au = with_ps;
                }
                Ok(VideoTag::Au { pts, au, keyframe })
            }
            _ => Ok(VideoTag::Skip),
        }
    }

    /// Parse an AVCDecoderConfigurationRecord
    fn parse_avc_config(&mut self, data: &[u8]) -> Result<(), FlvError> {
        if data.len() < 7 {
            return Err(FlvError::MalformedAvcConfig);
        }
        self.nalu_length_size = (data[4] & 0x03) as usize + 1;

        let mut sps = Vec::new();
        let mut pps = Vec::new();
        let mut pos = 6;
        let sps_count = data[5] & 0x1F;
        for _ in 0..sps_count {
            let len = read_u16(data, pos).ok_or(FlvError::MalformedAvcConfig)? as usize;
            let body = data
                .get(pos + 2..pos + 2 + len)
                .ok_or(FlvError::MalformedAvcConfig)?;
            sps.push(Bytes::copy_from_slice(body));
            pos += 2 + len;
        }
        let pps_count = *data.get(pos).ok_or(FlvError::MalformedAvcConfig)?;
        pos += 1;
        for _ in 0..pps_count {
            let len = read_u16(data, pos).ok_or(FlvError::MalformedAvcConfig)? as usize;
            let body = data
                .get(pos + 2..pos + 2 + len)
                .ok_or(FlvError::MalformedAvcConfig)?;
            pps.push(Bytes::copy_from_slice(body));
            pos += 2 + len;
        }

        self.sps = sps;
        self.pps = pps;
        Ok(())
    }

    /// Split length-prefixed AVCC data into NAL units
    fn split_avcc(&self, mut data: &[u8]) -> Result<Vec<Bytes>, FlvError> {
        let mut nalus = Vec::new();
        while !data.is_empty() {
            if data.len() < self.nalu_length_size {
                return Err(FlvError::Truncated);
            }
            let mut len = 0usize;
            for &b in &data[..self.nalu_length_size] {
                len = (len << 8) | b as usize;
            }
            let body = data
                .get(self.nalu_length_size..self.nalu_length_size + len)
                .ok_or(FlvError::Truncated)?;
            if !body.is_empty() {
                nalus.push(Bytes::copy_from_slice(body));
            }
            data = &data[self.nalu_length_size + len..];
        }
        Ok(nalus)
    }
}

/// Stateless audio tag depacketizer
pub struct AudioDepacketizer;

impl AudioDepacketizer {
    /// Process one FLV audio tag body
    pub fn parse_tag(data: &[u8], timestamp_ms: u32) -> Result<AudioTag, FlvError> {
        if data.len() < 2 {
            return Ok(AudioTag::Skip);
        }
        let format = data[0] >> 4;
        let pts = Duration::from_millis(timestamp_ms as u64);

        match format {
            AUDIO_FORMAT_AAC => match data[1] {
                0 => Ok(AudioTag::AacConfig(Bytes::copy_from_slice(&data[2..]))),
                1 => Ok(AudioTag::AacAu {
                    pts,
                    au: Bytes::copy_from_slice(&data[2..]),
                }),
                _ => Ok(AudioTag::Skip),
            },
            AUDIO_FORMAT_MP3 => Ok(AudioTag::Mp3Frame {
                pts,
                frame: Bytes::copy_from_slice(&data[1..]),
            }),
            other => Err(FlvError::UnsupportedAudioFormat(other)),
        }
    }
}

fn read_u16(data: &[u8], pos: usize) -> Option<u16> {
    Some(((*data.get(pos)? as u16) << 8) | *data.get(pos + 1)? as u16)
}
