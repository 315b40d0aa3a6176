//! MPEG-TS demultiplexer
//!
//! Push-based counterpart of the writer, used by the SRT source to
//! enumerate tracks from PAT/PMT and to turn PES packets into stream
//! units. Tracks whose parameters live in the elementary stream itself
//! (ADTS AAC, AC-3) are announced once their first frame has been seen.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;

use super::*;
use crate::stream::{CodecParams, Payload};

/// One elementary track found in the PMT
#[derive(Debug, Clone)]
pub struct ReaderTrack {
    pub id: usize,
    pub pid: u16,
    pub params: CodecParams,
}

/// Events produced while feeding data to the reader
#[derive(Debug)]
pub enum ReaderEvent {
    /// Track set, emitted exactly once when every track is described
    Tracks(Vec<ReaderTrack>),

    /// One decoded unit; `pts` is relative to the first unit seen
    Unit {
        track_id: usize,
        pts: Duration,
        payload: Payload,
    },

    /// A malformed portion of the stream was skipped
    DecodeError(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum TrackKind {
    H264,
    H265,
    Mpeg4Video,
    Mpeg1Video,
    Mpeg4Audio,
    Mpeg1Audio,
    Opus { channels: u8 },
    Ac3,
}

struct TrackState {
    pid: u16,
    kind: TrackKind,
    params: Option<CodecParams>,
}

/// The demultiplexer
pub struct Reader {
    buf: Vec<u8>,
    pmt_pid: Option<u16>,
    tracks: Vec<TrackState>,
    tracks_emitted: bool,
    pes: HashMap<u16, Vec<u8>>,
    pending_units: Vec<(usize, i64, Payload)>,
    base_pts: Option<i64>,
    out_of_sync: bool,
}

impl Default for Reader {
    fn default() -> Self {
        Self::new()
    }
}

impl Reader {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            pmt_pid: None,
            tracks: Vec::new(),
            tracks_emitted: false,
            pes: HashMap::new(),
            pending_units: Vec::new(),
            base_pts: None,
            out_of_sync: false,
        }
    }

    /// Feed raw bytes; returns the events they produced
    pub fn push(&mut self, data: &[u8]) -> Vec<ReaderEvent> {
        self.buf.extend_from_slice(data);

        let mut events = Vec::new();
        while self.buf.len() >= PACKET_SIZE {
            if self.buf[0] != SYNC_BYTE {
                if !self.out_of_sync {
                    self.out_of_sync = true;
                    events.push(ReaderEvent::DecodeError(
                        "lost packet synchronization".to_string(),
                    ));
                }
                let skip = self
                    .buf
                    .iter()
                    .position(|&b| b == SYNC_BYTE)
                    .unwrap_or(self.buf.len());
                self.buf.drain(..skip);
                continue;
            }
            self.out_of_sync = false;
            let packet: Vec<u8> = self.buf.drain(..PACKET_SIZE).collect();
            self.process_packet(&packet, &mut events);
        }

        self.maybe_emit_tracks(&mut events);
        events
    }

    /// Flush PES packets still being assembled; call at end of stream
    pub fn finish(&mut self) -> Vec<ReaderEvent> {
        let mut events = Vec::new();
        // deterministic track order
        let pids: Vec<u16> = self.tracks.iter().map(|t| t.pid).collect();
        for pid in pids {
            if let Some(buffered) = self.pes.remove(&pid) {
                self.flush_pes(pid, &buffered, &mut events);
            }
        }
        self.maybe_emit_tracks(&mut events);
        events
    }

    fn process_packet(&mut self, packet: &[u8], events: &mut Vec<ReaderEvent>) {
        let pid = ((packet[1] as u16 & 0x1F) << 8) | packet[2] as u16;
        let pusi = packet[1] & 0x40 != 0;
        let adaptation = packet[3] & 0x20 != 0;
        let has_payload = packet[3] & 0x10 != 0;

        if !has_payload {
            return;
        }

        let mut offset = 4;
        if adaptation {
            let af_len = packet[4] as usize;
            offset += 1 + af_len;
            if offset >= PACKET_SIZE {
                events.push(ReaderEvent::DecodeError(
                    "adaptation field overflows packet".to_string(),
                ));
                return;
            }
        }
        let payload = &packet[offset..];

        if pid == PAT_PID {
            if self.pmt_pid.is_none() {
                self.parse_pat(payload, events);
            }
            return;
        }
        if Some(pid) == self.pmt_pid {
            if self.tracks.is_empty() {
                self.parse_pmt(payload, events);
            }
            return;
        }

        if self.tracks.iter().any(|t| t.pid == pid) {
            if pusi {
                if let Some(buffered) = self.pes.remove(&pid) {
                    self.flush_pes(pid, &buffered, events);
                }
                self.pes.insert(pid, payload.to_vec());
            } else if let Some(buffered) = self.pes.get_mut(&pid) {
                buffered.extend_from_slice(payload);
            }
        }
    }

    fn parse_pat(&mut self, payload: &[u8], events: &mut Vec<ReaderEvent>) {
        let section = match psi_section(payload) {
            Some(s) if s.len() >= 12 => s,
            _ => {
                events.push(ReaderEvent::DecodeError("malformed PAT".to_string()));
                return;
            }
        };
        // entries follow the 8-byte section header, CRC at the end
        let entries = &section[8..section.len() - 4];
        for entry in entries.chunks_exact(4) {
            let program = ((entry[0] as u16) << 8) | entry[1] as u16;
            if program != 0 {
                self.pmt_pid = Some(((entry[2] as u16 & 0x1F) << 8) | entry[3] as u16);
                return;
            }
        }
    }

    fn parse_pmt(&mut self, payload: &[u8], events: &mut Vec<ReaderEvent>) {
        let section = match psi_section(payload) {
            Some(s) => s,
            None => {
                events.push(ReaderEvent::DecodeError("malformed PMT".to_string()));
                return;
            }
        };
        if section.len() < 16 {
            events.push(ReaderEvent::DecodeError("truncated PMT".to_string()));
            return;
        }

        let program_info_len = (((section[10] as usize) & 0x0F) << 8) | section[11] as usize;
        let mut pos = 12 + program_info_len;
        let end = section.len() - 4;

        while pos + 5 <= end {
            let stream_type = section[pos];
            let pid = ((section[pos + 1] as u16 & 0x1F) << 8) | section[pos + 2] as u16;
            let es_info_len =
                (((section[pos + 3] as usize) & 0x0F) << 8) | section[pos + 4] as usize;
            let descriptors = &section[pos + 5..(pos + 5 + es_info_len).min(end)];
            pos += 5 + es_info_len;

            let kind = match stream_type {
                STREAM_TYPE_H264 => Some(TrackKind::H264),
                STREAM_TYPE_H265 => Some(TrackKind::H265),
                STREAM_TYPE_MPEG4_VIDEO => Some(TrackKind::Mpeg4Video),
                STREAM_TYPE_MPEG1_VIDEO | 0x02 => Some(TrackKind::Mpeg1Video),
                STREAM_TYPE_MPEG4_AUDIO => Some(TrackKind::Mpeg4Audio),
                STREAM_TYPE_MPEG1_AUDIO | 0x04 => Some(TrackKind::Mpeg1Audio),
                STREAM_TYPE_PRIVATE => classify_private(descriptors),
                _ => None,
            };

            match kind {
                Some(kind) => {
                    let params = initial_params(kind);
                    self.tracks.push(TrackState { pid, kind, params });
                }
                None => {
                    events.push(ReaderEvent::DecodeError(format!(
                        "unsupported stream type 0x{stream_type:02X} on PID {pid}"
                    )));
                }
            }
        }
    }

    fn flush_pes(&mut self, pid: u16, pes: &[u8], events: &mut Vec<ReaderEvent>) {
        if pes.len() < 9 || pes[0] != 0x00 || pes[1] != 0x00 || pes[2] != 0x01 {
            events.push(ReaderEvent::DecodeError(format!(
                "malformed PES on PID {pid}"
            )));
            return;
        }
        let header_data_len = pes[8] as usize;
        let flags = pes[7] >> 6;
        if flags & 0x2 == 0 || header_data_len < 5 || pes.len() < 9 + header_data_len {
            events.push(ReaderEvent::DecodeError(format!(
                "PES without PTS on PID {pid}"
            )));
            return;
        }
        let pts = decode_timestamp(&pes[9..14]);
        let es = &pes[9 + header_data_len..];

        let track_idx = match self.tracks.iter().position(|t| t.pid == pid) {
            Some(i) => i,
            None => return,
        };
        let kind = self.tracks[track_idx].kind;

        // the AAC configuration sits in the ADTS header, read it before
        // the headers are stripped
        if kind == TrackKind::Mpeg4Audio && self.tracks[track_idx].params.is_none() {
            if let Some(config) = adts_config(es) {
                self.tracks[track_idx].params = Some(CodecParams::Mpeg4Audio {
                    config: Bytes::copy_from_slice(&config.marshal()),
                });
            }
        }

        let payload = match convert_payload(kind, es) {
            Ok(p) => p,
            Err(e) => {
                events.push(ReaderEvent::DecodeError(e));
                return;
            }
        };
        if payload.is_empty() {
            return;
        }

        if kind == TrackKind::Ac3 && self.tracks[track_idx].params.is_none() {
            if let Payload::Ac3 { frames } = &payload {
                self.tracks[track_idx].params =
                    frames.first().and_then(|f| parse_ac3_params(f));
            }
        }

        let base = *self.base_pts.get_or_insert(pts);
        let rel = pts - base;

        if self.tracks_emitted {
            events.push(ReaderEvent::Unit {
                track_id: track_idx,
                pts: ts_to_duration(rel),
                payload,
            });
        } else {
            self.pending_units.push((track_idx, rel, payload));
        }
    }

    fn maybe_emit_tracks(&mut self, events: &mut Vec<ReaderEvent>) {
        if self.tracks_emitted
            || self.tracks.is_empty()
            || self.tracks.iter().any(|t| t.params.is_none())
        {
            return;
        }
        self.tracks_emitted = true;

        let tracks = self
            .tracks
            .iter()
            .enumerate()
            .map(|(id, t)| ReaderTrack {
                id,
                pid: t.pid,
                params: t.params.clone().unwrap(),
            })
            .collect();
        events.push(ReaderEvent::Tracks(tracks));

        for (track_id, rel, payload) in self.pending_units.drain(..) {
            events.push(ReaderEvent::Unit {
                track_id,
                pts: ts_to_duration(rel),
                payload,
            });
        }
    }
}

/// Strip the pointer field and bound the section by its length field
fn psi_section(payload: &[u8]) -> Option<&[u8]> {
    if payload.is_empty() {
        return None;
    }
    let pointer = payload[0] as usize;
    let section = payload.get(1 + pointer..)?;
    if section.len() < 3 {
        return None;
    }
    let section_length = (((section[1] as usize) & 0x0F) << 8) | section[2] as usize;
    section.get(..3 + section_length)
}

fn classify_private(descriptors: &[u8]) -> Option<TrackKind> {
    let mut pos = 0;
    let mut is_opus = false;
    let mut channels = 2u8;
    let mut is_ac3 = false;

    while pos + 2 <= descriptors.len() {
        let tag = descriptors[pos];
        let len = descriptors[pos + 1] as usize;
        let body = descriptors.get(pos + 2..pos + 2 + len)?;
        match tag {
            DESCRIPTOR_REGISTRATION if body == b"Opus" => is_opus = true,
            DESCRIPTOR_DVB_EXTENSION if body.first() == Some(&DVB_EXTENSION_OPUS) => {
                if let Some(&c) = body.get(1) {
                    channels = c;
                }
            }
            DESCRIPTOR_DVB_AC3 => is_ac3 = true,
            _ => {}
        }
        pos += 2 + len;
    }

    if is_opus {
        Some(TrackKind::Opus { channels })
    } else if is_ac3 {
        Some(TrackKind::Ac3)
    } else {
        None
    }
}

/// Parameters known from the PMT alone; None when the first frame is needed
fn initial_params(kind: TrackKind) -> Option<CodecParams> {
    match kind {
        TrackKind::H264 => Some(CodecParams::H264),
        TrackKind::H265 => Some(CodecParams::H265),
        TrackKind::Mpeg4Video => Some(CodecParams::Mpeg4Video),
        TrackKind::Mpeg1Video => Some(CodecParams::Mpeg1Video),
        TrackKind::Mpeg1Audio => Some(CodecParams::Mpeg1Audio),
        TrackKind::Opus { channels } => Some(CodecParams::Opus {
            is_stereo: channels >= 2,
        }),
        TrackKind::Mpeg4Audio | TrackKind::Ac3 => None,
    }
}

fn convert_payload(kind: TrackKind, es: &[u8]) -> Result<Payload, String> {
    match kind {
        TrackKind::H264 => Ok(Payload::H264 {
            au: split_annexb(es, |n| n & 0x1F == 9),
        }),
        TrackKind::H265 => Ok(Payload::H265 {
            au: split_annexb(es, |n| (n >> 1) & 0x3F == 35),
        }),
        TrackKind::Mpeg4Video => Ok(Payload::Mpeg4Video {
            frame: Bytes::copy_from_slice(es),
        }),
        TrackKind::Mpeg1Video => Ok(Payload::Mpeg1Video {
            frame: Bytes::copy_from_slice(es),
        }),
        TrackKind::Mpeg1Audio => Ok(Payload::Mpeg1Audio {
            frames: vec![Bytes::copy_from_slice(es)],
        }),
        TrackKind::Ac3 => Ok(Payload::Ac3 {
            frames: vec![Bytes::copy_from_slice(es)],
        }),
        TrackKind::Opus { .. } => parse_opus_packets(es),
        TrackKind::Mpeg4Audio => parse_adts(es).map(|aus| Payload::Mpeg4Audio { aus }),
    }
}

/// Split an Annex B byte stream into NAL units, dropping access unit
/// delimiters (the writer re-inserts them)
fn split_annexb(es: &[u8], is_aud: fn(u8) -> bool) -> Vec<Bytes> {
    let starts: Vec<usize> = {
        let mut v = Vec::new();
        let mut i = 0;
        while i + 3 <= es.len() {
            if es[i] == 0 && es[i + 1] == 0 && es[i + 2] == 1 {
                v.push(i + 3);
                i += 3;
            } else {
                i += 1;
            }
        }
        v
    };

    let mut nalus = Vec::new();
    for (n, &start) in starts.iter().enumerate() {
        let mut end = match starts.get(n + 1) {
            Some(&next) => {
                // a four-byte start code owns the zero before "00 00 01"
                let mut e = next - 3;
                if e > start && es[e - 1] == 0 {
                    e -= 1;
                }
                e
            }
            None => es.len(),
        };
        if end < start {
            end = start;
        }
        if end > start && !is_aud(es[start]) {
            nalus.push(Bytes::copy_from_slice(&es[start..end]));
        }
    }
    nalus
}

/// Split ADTS frames into raw access units
fn parse_adts(mut es: &[u8]) -> Result<Vec<Bytes>, String> {
    let mut aus = Vec::new();
    while !es.is_empty() {
        if es.len() < 7 {
            return Err("truncated ADTS header".to_string());
        }
        if es[0] != 0xFF || es[1] & 0xF0 != 0xF0 {
            return Err("invalid ADTS sync word".to_string());
        }
        let protection_absent = es[1] & 0x01 != 0;
        let header_len = if protection_absent { 7 } else { 9 };
        let frame_len = (((es[3] as usize) & 0x03) << 11)
            | ((es[4] as usize) << 3)
            | ((es[5] as usize) >> 5);
        if frame_len < header_len || frame_len > es.len() {
            return Err("invalid ADTS frame length".to_string());
        }
        aus.push(Bytes::copy_from_slice(&es[header_len..frame_len]));
        es = &es[frame_len..];
    }
    Ok(aus)
}

/// Read the AudioSpecificConfig out of the first ADTS header
pub(crate) fn adts_config(es: &[u8]) -> Option<AudioSpecificConfig> {
    if es.len() < 7 || es[0] != 0xFF || es[1] & 0xF0 != 0xF0 {
        return None;
    }
    let object_type = ((es[2] >> 6) & 0x03) + 1;
    let sampling_frequency_index = (es[2] >> 2) & 0x0F;
    let channel_config = ((es[2] & 0x01) << 2) | (es[3] >> 6);
    if sampling_frequency_index as usize >= SAMPLE_RATES.len() {
        return None;
    }
    Some(AudioSpecificConfig {
        object_type,
        sampling_frequency_index,
        channel_config,
    })
}

fn parse_opus_packets(mut es: &[u8]) -> Result<Payload, String> {
    let mut packets = Vec::new();
    while !es.is_empty() {
        if es.len() < 3 || es[0] != 0x7F || es[1] & 0xE0 != 0xE0 {
            return Err("invalid Opus control header".to_string());
        }
        let mut size = 0usize;
        let mut pos = 2;
        loop {
            let b = *es.get(pos).ok_or("truncated Opus control header")?;
            pos += 1;
            size += b as usize;
            if b != 0xFF {
                break;
            }
        }
        let packet = es.get(pos..pos + size).ok_or("truncated Opus packet")?;
        packets.push(Bytes::copy_from_slice(packet));
        es = &es[pos + size..];
    }
    Ok(Payload::Opus { packets })
}

/// Derive track parameters from an AC-3 sync frame header
fn parse_ac3_params(frame: &[u8]) -> Option<CodecParams> {
    if frame.len() < 7 || frame[0] != 0x0B || frame[1] != 0x77 {
        return None;
    }
    let sample_rate = match frame[4] >> 6 {
        0 => 48000,
        1 => 44100,
        2 => 32000,
        _ => return None,
    };
    let acmod = frame[6] >> 5;
    let channels = [2u8, 1, 2, 3, 3, 4, 4, 5][acmod as usize];
    Some(CodecParams::Ac3 {
        sample_rate,
        channels,
    })
}

fn decode_timestamp(b: &[u8]) -> i64 {
    (((b[0] >> 1) & 0x07) as i64) << 30
        | (b[1] as i64) << 22
        | (((b[2] >> 1) & 0x7F) as i64) << 15
        | (b[3] as i64) << 7
        | ((b[4] >> 1) & 0x7F) as i64
}
