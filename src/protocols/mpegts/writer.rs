//! MPEG-TS multiplexer
//!
//! Writes TS packets for a fixed set of tracks registered at construction
//! time. PAT/PMT are emitted on demand (the recorder writes one pair at
//! the start of every segment); elementary streams are packetized into
//! PES with PTS/DTS at 90 kHz, PCR on the clock track, and
//! random-access indicators on keyframes.

use std::io::{self, Write};

use bytes::Bytes;

use super::*;

/// Codec bound to one multiplexer track
#[derive(Debug, Clone, PartialEq)]
pub enum TrackCodec {
    H264,
    H265,
    Mpeg4Video,
    Mpeg1Video,
    Opus { channel_count: u8 },
    Mpeg4Audio { config: AudioSpecificConfig },
    Mpeg1Audio,
    Ac3,
}

impl TrackCodec {
    fn stream_type(&self) -> u8 {
        match self {
            TrackCodec::H264 => STREAM_TYPE_H264,
            TrackCodec::H265 => STREAM_TYPE_H265,
            TrackCodec::Mpeg4Video => STREAM_TYPE_MPEG4_VIDEO,
            TrackCodec::Mpeg1Video => STREAM_TYPE_MPEG1_VIDEO,
            TrackCodec::Mpeg4Audio { .. } => STREAM_TYPE_MPEG4_AUDIO,
            TrackCodec::Mpeg1Audio => STREAM_TYPE_MPEG1_AUDIO,
            TrackCodec::Opus { .. } | TrackCodec::Ac3 => STREAM_TYPE_PRIVATE,
        }
    }

    fn stream_id(&self) -> u8 {
        match self {
            TrackCodec::H264
            | TrackCodec::H265
            | TrackCodec::Mpeg4Video
            | TrackCodec::Mpeg1Video => 0xE0,
            TrackCodec::Mpeg4Audio { .. } | TrackCodec::Mpeg1Audio => 0xC0,
            // private_stream_1
            TrackCodec::Opus { .. } | TrackCodec::Ac3 => 0xBD,
        }
    }

    fn is_video(&self) -> bool {
        matches!(
            self,
            TrackCodec::H264
                | TrackCodec::H265
                | TrackCodec::Mpeg4Video
                | TrackCodec::Mpeg1Video
        )
    }

    fn descriptors(&self) -> Vec<u8> {
        match self {
            TrackCodec::Opus { channel_count } => vec![
                DESCRIPTOR_REGISTRATION,
                0x04,
                b'O',
                b'p',
                b'u',
                b's',
                DESCRIPTOR_DVB_EXTENSION,
                0x02,
                DVB_EXTENSION_OPUS,
                *channel_count,
            ],
            TrackCodec::Ac3 => vec![DESCRIPTOR_DVB_AC3, 0x01, 0x00],
            _ => Vec::new(),
        }
    }
}

struct TrackEntry {
    codec: TrackCodec,
    pid: u16,
    cc: u8,
}

/// The multiplexer; generic over its output so the recorder can stack it
/// on a buffered writer over a swappable sink
pub struct Writer<W: Write> {
    w: W,
    tracks: Vec<TrackEntry>,
    pcr_pid: u16,
    pat_cc: u8,
    pmt_cc: u8,
}

impl<W: Write> Writer<W> {
    /// Build a writer for a fixed set of tracks
    ///
    /// PIDs are assigned in registration order starting at 256; the PCR
    /// carrier is the first video track, or the first track overall.
    pub fn new(w: W, codecs: Vec<TrackCodec>) -> Self {
        let tracks: Vec<TrackEntry> = codecs
            .into_iter()
            .enumerate()
            .map(|(i, codec)| TrackEntry {
                codec,
                pid: FIRST_TRACK_PID + i as u16,
                cc: 0,
            })
            .collect();

        let pcr_pid = tracks
            .iter()
            .find(|t| t.codec.is_video())
            .or(tracks.first())
            .map(|t| t.pid)
            .unwrap_or(FIRST_TRACK_PID);

        Self {
            w,
            tracks,
            pcr_pid,
            pat_cc: 0,
            pmt_cc: 0,
        }
    }

    /// Access the underlying writer (used to flush the buffer below)
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.w
    }

    /// Emit PAT and PMT for the registered tracks
    pub fn write_tables(&mut self) -> io::Result<()> {
        let pat = build_section(
            0x00,
            0x0001,
            &[0x00, 0x01, 0xE0 | (PMT_PID >> 8) as u8, (PMT_PID & 0xFF) as u8],
        );
        let cc = self.pat_cc;
        self.pat_cc = (self.pat_cc + 1) & 0x0F;
        self.write_psi(PAT_PID, cc, &pat)?;

        let mut body = vec![
            0xE0 | (self.pcr_pid >> 8) as u8,
            (self.pcr_pid & 0xFF) as u8,
            0xF0,
            0x00,
        ];
        for track in &self.tracks {
            let descriptors = track.codec.descriptors();
            body.push(track.codec.stream_type());
            body.push(0xE0 | (track.pid >> 8) as u8);
            body.push((track.pid & 0xFF) as u8);
            body.push(0xF0 | ((descriptors.len() >> 8) & 0x0F) as u8);
            body.push((descriptors.len() & 0xFF) as u8);
            body.extend_from_slice(&descriptors);
        }
        let pmt = build_section(0x02, 0x0001, &body);
        let cc = self.pmt_cc;
        self.pmt_cc = (self.pmt_cc + 1) & 0x0F;
        self.write_psi(PMT_PID, cc, &pmt)
    }

    /// Write an H.264 or H.265 access unit
    pub fn write_h26x(
        &mut self,
        track: usize,
        pts: i64,
        dts: i64,
        random_access: bool,
        au: &[Bytes],
    ) -> io::Result<()> {
        let is_h265 = matches!(self.tracks[track].codec, TrackCodec::H265);
        let payload = annexb_with_aud(au, is_h265);
        self.write_frame(track, pts, Some(dts), random_access, &payload)
    }

    /// Write an MPEG-4 Visual frame
    pub fn write_mpeg4_video(
        &mut self,
        track: usize,
        pts: i64,
        random_access: bool,
        frame: &[u8],
    ) -> io::Result<()> {
        self.write_frame(track, pts, None, random_access, frame)
    }

    /// Write an MPEG-1/2 Video frame
    pub fn write_mpeg1_video(
        &mut self,
        track: usize,
        pts: i64,
        random_access: bool,
        frame: &[u8],
    ) -> io::Result<()> {
        self.write_frame(track, pts, None, random_access, frame)
    }

    /// Write Opus packets sharing one timestamp
    pub fn write_opus(&mut self, track: usize, pts: i64, packets: &[Bytes]) -> io::Result<()> {
        let mut payload = Vec::new();
        for packet in packets {
            // control header: prefix, no trimming, 0xFF-escaped size
            payload.push(0x7F);
            payload.push(0xE0);
            let mut size = packet.len();
            while size >= 255 {
                payload.push(0xFF);
                size -= 255;
            }
            payload.push(size as u8);
            payload.extend_from_slice(packet);
        }
        self.write_frame(track, pts, None, true, &payload)
    }

    /// Write MPEG-4 Audio access units, wrapping each in ADTS
    pub fn write_mpeg4_audio(&mut self, track: usize, pts: i64, aus: &[Bytes]) -> io::Result<()> {
        let config = match &self.tracks[track].codec {
            TrackCodec::Mpeg4Audio { config } => *config,
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "track is not MPEG-4 Audio",
                ))
            }
        };

        let mut payload = Vec::new();
        for au in aus {
            let frame_len = au.len() + 7;
            let profile = config.object_type.saturating_sub(1) & 0x03;
            payload.push(0xFF);
            payload.push(0xF1);
            payload.push(
                (profile << 6)
                    | (config.sampling_frequency_index << 2)
                    | ((config.channel_config >> 2) & 0x01),
            );
            payload.push(((config.channel_config & 0x03) << 6) | ((frame_len >> 11) & 0x03) as u8);
            payload.push(((frame_len >> 3) & 0xFF) as u8);
            payload.push((((frame_len & 0x07) << 5) | 0x1F) as u8);
            payload.push(0xFC);
            payload.extend_from_slice(au);
        }
        self.write_frame(track, pts, None, true, &payload)
    }

    /// Write MPEG-1 Audio frames
    pub fn write_mpeg1_audio(&mut self, track: usize, pts: i64, frames: &[Bytes]) -> io::Result<()> {
        let payload: Vec<u8> = frames.iter().flat_map(|f| f.iter().copied()).collect();
        self.write_frame(track, pts, None, true, &payload)
    }

    /// Write a single AC-3 sync frame
    pub fn write_ac3(&mut self, track: usize, pts: i64, frame: &[u8]) -> io::Result<()> {
        self.write_frame(track, pts, None, true, frame)
    }

    fn write_frame(
        &mut self,
        track: usize,
        pts: i64,
        dts: Option<i64>,
        random_access: bool,
        payload: &[u8],
    ) -> io::Result<()> {
        let entry = &self.tracks[track];
        let pid = entry.pid;
        let stream_id = entry.codec.stream_id();
        let is_video = entry.codec.is_video();

        let pes = build_pes(stream_id, pts, dts, is_video, payload);
        let pcr = if pid == self.pcr_pid {
            Some(dts.unwrap_or(pts))
        } else {
            None
        };
        self.write_pes(track, &pes, random_access, pcr)
    }

    fn write_pes(
        &mut self,
        track: usize,
        pes: &[u8],
        random_access: bool,
        pcr: Option<i64>,
    ) -> io::Result<()> {
        let pid = self.tracks[track].pid;
        let mut remaining = pes;
        let mut first = true;

        while first || !remaining.is_empty() {
            let mut af_content: Vec<u8> = Vec::new();
            let mut af_present = false;

            if first {
                let mut flags = 0u8;
                if random_access {
                    flags |= 0x40;
                }
                if pcr.is_some() {
                    flags |= 0x10;
                }
                if flags != 0 {
                    af_content.push(flags);
                    if let Some(base) = pcr {
                        af_content.extend_from_slice(&encode_pcr(base));
                    }
                    af_present = true;
                }
            }

            let mut payload_space = if af_present {
                183 - af_content.len()
            } else {
                184
            };

            if remaining.len() < payload_space {
                let deficit = payload_space - remaining.len();
                if !af_present {
                    af_present = true;
                    if deficit > 1 {
                        af_content.push(0x00);
                        af_content.resize(deficit - 1, 0xFF);
                    }
                } else {
                    let target = af_content.len() + deficit;
                    af_content.resize(target, 0xFF);
                }
                payload_space = 183 - af_content.len();
            }

            let chunk = remaining.len().min(payload_space);

            let cc = self.tracks[track].cc;
            self.tracks[track].cc = (cc + 1) & 0x0F;

            let mut packet = Vec::with_capacity(PACKET_SIZE);
            packet.push(SYNC_BYTE);
            packet.push(if first { 0x40 } else { 0x00 } | ((pid >> 8) & 0x1F) as u8);
            packet.push((pid & 0xFF) as u8);
            packet.push(if af_present { 0x30 } else { 0x10 } | cc);
            if af_present {
                packet.push(af_content.len() as u8);
                packet.extend_from_slice(&af_content);
            }
            packet.extend_from_slice(&remaining[..chunk]);
            debug_assert_eq!(packet.len(), PACKET_SIZE);

            self.w.write_all(&packet)?;
            remaining = &remaining[chunk..];
            first = false;
        }

        Ok(())
    }

    fn write_psi(&mut self, pid: u16, cc: u8, section: &[u8]) -> io::Result<()> {
        let mut packet = Vec::with_capacity(PACKET_SIZE);
        packet.push(SYNC_BYTE);
        packet.push(0x40 | ((pid >> 8) & 0x1F) as u8);
        packet.push((pid & 0xFF) as u8);
        packet.push(0x10 | cc);
        packet.push(0x00); // pointer_field
        packet.extend_from_slice(section);
        packet.resize(PACKET_SIZE, 0xFF);
        self.w.write_all(&packet)
    }
}

/// Build a PSI section: header, body, CRC
fn build_section(table_id: u8, table_id_extension: u16, body: &[u8]) -> Vec<u8> {
    let section_length = 5 + body.len() + 4;
    let mut section = vec![
        table_id,
        0xB0 | ((section_length >> 8) & 0x0F) as u8,
        (section_length & 0xFF) as u8,
        (table_id_extension >> 8) as u8,
        (table_id_extension & 0xFF) as u8,
        0xC1, // version 0, current
        0x00,
        0x00,
    ];
    section.extend_from_slice(body);
    let crc = crc32_mpeg(&section);
    section.extend_from_slice(&crc.to_be_bytes());
    section
}

fn build_pes(stream_id: u8, pts: i64, dts: Option<i64>, is_video: bool, payload: &[u8]) -> Vec<u8> {
    let write_dts = matches!(dts, Some(d) if d != pts);
    let header_data_len: usize = if write_dts { 10 } else { 5 };

    let body_len = 3 + header_data_len + payload.len();
    let len_field = if is_video || body_len > 0xFFFF {
        0
    } else {
        body_len as u16
    };

    let mut pes = Vec::with_capacity(9 + header_data_len + payload.len());
    pes.extend_from_slice(&[0x00, 0x00, 0x01, stream_id]);
    pes.extend_from_slice(&len_field.to_be_bytes());
    pes.push(0x80);
    pes.push(if write_dts { 0xC0 } else { 0x80 });
    pes.push(header_data_len as u8);
    if write_dts {
        pes.extend_from_slice(&encode_timestamp(0x3, pts));
        pes.extend_from_slice(&encode_timestamp(0x1, dts.unwrap_or(pts)));
    } else {
        pes.extend_from_slice(&encode_timestamp(0x2, pts));
    }
    pes.extend_from_slice(payload);
    pes
}

fn encode_timestamp(prefix: u8, v: i64) -> [u8; 5] {
    let v = (v as u64) & 0x1_FFFF_FFFF;
    [
        (prefix << 4) | (((v >> 30) & 0x07) as u8) << 1 | 1,
        ((v >> 22) & 0xFF) as u8,
        ((((v >> 15) & 0x7F) as u8) << 1) | 1,
        ((v >> 7) & 0xFF) as u8,
        (((v & 0x7F) as u8) << 1) | 1,
    ]
}

fn encode_pcr(base: i64) -> [u8; 6] {
    let base = (base as u64) & 0x1_FFFF_FFFF;
    [
        ((base >> 25) & 0xFF) as u8,
        ((base >> 17) & 0xFF) as u8,
        ((base >> 9) & 0xFF) as u8,
        ((base >> 1) & 0xFF) as u8,
        (((base & 0x01) as u8) << 7) | 0x7E,
        0x00,
    ]
}

/// Join NAL units with start codes, prepending an access unit delimiter
/// when the AU does not already start with one
fn annexb_with_aud(au: &[Bytes], is_h265: bool) -> Vec<u8> {
    let has_aud = au.first().map_or(false, |nalu| {
        if nalu.is_empty() {
            return false;
        }
        if is_h265 {
            (nalu[0] >> 1) & 0x3F == 35
        } else {
            nalu[0] & 0x1F == 9
        }
    });

    let mut out = Vec::new();
    if !has_aud {
        out.extend_from_slice(&[0x00, 0x00, 0x00, 0x01]);
        if is_h265 {
            out.extend_from_slice(&[0x46, 0x01, 0x50]);
        } else {
            out.extend_from_slice(&[0x09, 0xF0]);
        }
    }
    for nalu in au {
        out.extend_from_slice(&[0x00, 0x00, 0x00, 0x01]);
        out.extend_from_slice(nalu);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h264_writer() -> Writer<Vec<u8>> {
        Writer::new(
            Vec::new(),
            vec![
                TrackCodec::H264,
                TrackCodec::Mpeg4Audio {
                    config: AudioSpecificConfig {
                        object_type: 2,
                        sampling_frequency_index: 3,
                        channel_config: 2,
                    },
                },
            ],
        )
    }

    #[test]
    fn test_pid_assignment() {
        let w = h264_writer();
        assert_eq!(w.tracks[0].pid, 256);
        assert_eq!(w.tracks[1].pid, 257);
        assert_eq!(w.pcr_pid, 256);
    }

    #[test]
    fn test_pcr_falls_back_to_first_track_without_video() {
        let w = Writer::new(Vec::new(), vec![TrackCodec::Mpeg1Audio]);
        assert_eq!(w.pcr_pid, FIRST_TRACK_PID);
    }

    #[test]
    fn test_output_is_packet_aligned() {
        let mut w = h264_writer();
        w.write_tables().unwrap();
        w.write_h26x(0, 0, 0, true, &[Bytes::from_static(&[0x65, 0x88, 0x84])])
            .unwrap();
        w.write_mpeg4_audio(1, 0, &[Bytes::from_static(&[0x21, 0x10])])
            .unwrap();

        let out = w.get_mut();
        assert!(!out.is_empty());
        assert_eq!(out.len() % PACKET_SIZE, 0);
        for packet in out.chunks(PACKET_SIZE) {
            assert_eq!(packet[0], SYNC_BYTE);
        }
    }

    #[test]
    fn test_tables_structure() {
        let mut w = h264_writer();
        w.write_tables().unwrap();
        let out = w.get_mut().clone();

        // first packet: PAT on PID 0 with PUSI
        let pat = &out[0..PACKET_SIZE];
        assert_eq!(pat[1] & 0x40, 0x40);
        assert_eq!(((pat[1] as u16 & 0x1F) << 8) | pat[2] as u16, PAT_PID);
        // pointer_field then table_id 0
        assert_eq!(pat[4], 0x00);
        assert_eq!(pat[5], 0x00);

        // second packet: PMT on its PID, table_id 2
        let pmt = &out[PACKET_SIZE..2 * PACKET_SIZE];
        assert_eq!(((pmt[1] as u16 & 0x1F) << 8) | pmt[2] as u16, PMT_PID);
        assert_eq!(pmt[5], 0x02);
    }

    #[test]
    fn test_section_crc_is_valid() {
        let section = build_section(0x00, 1, &[0x00, 0x01, 0xF0, 0x00]);
        // CRC over the whole section including the trailing CRC is zero
        // only for reflected variants; for MPEG-2 recompute and compare
        let (body, crc) = section.split_at(section.len() - 4);
        assert_eq!(crc32_mpeg(body).to_be_bytes(), crc);
    }

    #[test]
    fn test_timestamp_encoding() {
        let ts = encode_timestamp(0x2, 90000);
        // marker bits present
        assert_eq!(ts[0] & 0x01, 1);
        assert_eq!(ts[2] & 0x01, 1);
        assert_eq!(ts[4] & 0x01, 1);
        assert_eq!(ts[0] >> 4, 0x2);

        // decode back
        let v = (((ts[0] >> 1) & 0x07) as i64) << 30
            | (ts[1] as i64) << 22
            | (((ts[2] >> 1) & 0x7F) as i64) << 15
            | (ts[3] as i64) << 7
            | ((ts[4] >> 1) & 0x7F) as i64;
        assert_eq!(v, 90000);
    }

    #[test]
    fn test_continuity_counters_increment() {
        let mut w = h264_writer();
        let payload = Bytes::from(vec![0x65; 1000]); // spans several packets
        w.write_h26x(0, 0, 0, true, &[payload.clone()]).unwrap();
        w.write_h26x(0, 3600, 3600, false, &[payload]).unwrap();

        let out = w.get_mut().clone();
        let mut expected = 0u8;
        for packet in out.chunks(PACKET_SIZE) {
            let pid = ((packet[1] as u16 & 0x1F) << 8) | packet[2] as u16;
            if pid == 256 {
                assert_eq!(packet[3] & 0x0F, expected);
                expected = (expected + 1) & 0x0F;
            }
        }
        assert!(expected > 0);
    }

    #[test]
    fn test_aud_inserted_once() {
        let au = [Bytes::from_static(&[0x65, 0x00])];
        let joined = annexb_with_aud(&au, false);
        assert_eq!(&joined[..6], &[0x00, 0x00, 0x00, 0x01, 0x09, 0xF0]);

        // already delimited: left alone
        let au = [Bytes::from_static(&[0x09, 0xF0]), Bytes::from_static(&[0x65])];
        let joined = annexb_with_aud(&au, false);
        assert_eq!(&joined[..4], &[0x00, 0x00, 0x00, 0x01]);
        assert_eq!(joined[4], 0x09);
        assert_eq!(joined.len(), 4 + 2 + 4 + 1);
    }
}
