//! RTMP static source
//!
//! Dials the publisher over RTMP or RTMPS (with pinned-certificate
//! verification when a fingerprint is configured), plays the stream and
//! feeds the decoded access units into the path's stream. Track layout
//! is probed from the first media tags; codecs outside H.264/AAC/MP3
//! fail after the connection is open so the path is marked not-ready
//! cleanly.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{
    supervise, NotReadyGuard, RunParams, SetReadyParams, SourceDescription, SourceError,
    StaticSource, StaticSourceParent,
};
use crate::logger::LimitedLogger;
use crate::protocols::flv::{AudioDepacketizer, AudioTag, FlvError, VideoDepacketizer, VideoTag};
use crate::protocols::rtmp::{RtmpClient, RtmpEvent};
use crate::protocols::tls;
use crate::stream::{CodecParams, Payload, Stream, StreamDesc, Unit};

const DEFAULT_PORT_RTMP: u16 = 1935;
const DEFAULT_PORT_RTMPS: u16 = 1936;

/// How long to watch the stream for track layout before giving up on
/// additional tracks
const TRACK_PROBE_WINDOW: Duration = Duration::from_secs(1);

/// An RTMP static source
pub struct RtmpSource {
    pub resolved_source: String,
    pub parent: Arc<dyn StaticSourceParent>,
}

impl StaticSource for RtmpSource {
    async fn run(&self, params: RunParams) -> Result<(), SourceError> {
        tracing::debug!(source = %self.resolved_source, "connecting");

        let url = Url::parse(&self.resolved_source)
            .map_err(|e| SourceError::Upstream(e.to_string()))?;
        let host = url
            .host_str()
            .ok_or_else(|| SourceError::Upstream("source URL has no host".to_string()))?
            .to_string();
        let scheme = url.scheme().to_string();
        let port = url.port().unwrap_or(match scheme.as_str() {
            "rtmp" => DEFAULT_PORT_RTMP,
            _ => DEFAULT_PORT_RTMPS,
        });

        let path = url.path().trim_matches('/');
        let (app, stream_key) = match path.rsplit_once('/') {
            Some((app, key)) => (app.to_string(), key.to_string()),
            None => (path.to_string(), String::new()),
        };

        let read_timeout = params.conf.read_timeout();
        let addr = format!("{host}:{port}");
        let tcp = timeout(read_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| SourceError::Timeout)?
            .map_err(|e| SourceError::Upstream(e.to_string()))?;

        match scheme.as_str() {
            "rtmp" => self.run_conn(tcp, app, stream_key, params).await,
            "rtmps" => {
                let config = tls::config_for_fingerprint(&params.conf.source_fingerprint)
                    .map_err(|e| SourceError::Protocol(e.to_string()))?;
                let connector = tokio_rustls::TlsConnector::from(config);
                let server_name = rustls::pki_types::ServerName::try_from(host.clone())
                    .map_err(|e| SourceError::Upstream(e.to_string()))?;
                let tls_stream = timeout(read_timeout, connector.connect(server_name, tcp))
                    .await
                    .map_err(|_| SourceError::Timeout)?
                    .map_err(|e| SourceError::Upstream(e.to_string()))?;
                self.run_conn(tls_stream, app, stream_key, params).await
            }
            other => Err(SourceError::Protocol(format!(
                "unsupported scheme '{other}'"
            ))),
        }
    }

    fn describe(&self) -> SourceDescription {
        SourceDescription {
            kind: "rtmpSource",
            id: String::new(),
        }
    }
}

/// Track layout discovered during the probe phase
struct ProbedTracks {
    video_dp: VideoDepacketizer,
    has_video: bool,
    aac_config: Option<Bytes>,
    has_aac_frames: bool,
    has_mp3: bool,
}

impl RtmpSource {
    async fn run_conn<S>(
        &self,
        conn: S,
        app: String,
        stream_key: String,
        params: RunParams,
    ) -> Result<(), SourceError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let read_timeout = params.conf.read_timeout();
        let mut client = RtmpClient::connect(conn, app, stream_key, read_timeout).await?;

        let probed = probe_tracks(&mut client, read_timeout).await?;

        let mut tracks = Vec::new();
        let mut video_track: Option<usize> = None;
        let mut audio_track: Option<usize> = None;
        let mut audio_is_aac = false;

        if probed.has_video {
            video_track = Some(tracks.len());
            tracks.push(CodecParams::H264);
        }
        if let Some(config) = &probed.aac_config {
            audio_track = Some(tracks.len());
            audio_is_aac = true;
            tracks.push(CodecParams::Mpeg4Audio {
                config: config.clone(),
            });
        } else if probed.has_aac_frames {
            return Err(SourceError::UnsupportedCodec(
                "MPEG-4 Audio track without configuration".to_string(),
            ));
        } else if probed.has_mp3 {
            audio_track = Some(tracks.len());
            tracks.push(CodecParams::Mpeg1Audio);
        }
        if tracks.is_empty() {
            return Err(SourceError::Upstream(
                "no supported tracks found".to_string(),
            ));
        }

        let desc = StreamDesc::new(tracks);
        tracing::debug!(tracks = %desc.codec_names(), "tracks found");

        let stream = self.parent.set_ready(SetReadyParams {
            desc,
            generate_rtp_packets: true,
        })?;
        let not_ready = NotReadyGuard::new(self.parent.clone());

        let reader = tokio::spawn(run_reader(ReaderState {
            client,
            stream,
            video_dp: probed.video_dp,
            video_track,
            audio_track,
            audio_is_aac,
            token: params.token.clone(),
            read_timeout,
            _not_ready: not_ready,
        }));

        supervise(reader, params.reload).await
    }
}

/// Watch the first tags to learn which tracks the stream carries
async fn probe_tracks<S>(
    client: &mut RtmpClient<S>,
    read_timeout: Duration,
) -> Result<ProbedTracks, SourceError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut probed = ProbedTracks {
        video_dp: VideoDepacketizer::new(),
        has_video: false,
        aac_config: None,
        has_aac_frames: false,
        has_mp3: false,
    };

    let mut deadline: Option<Instant> = None;
    loop {
        if let Some(d) = deadline {
            if Instant::now() >= d {
                break;
            }
            // both track kinds known: no reason to keep probing
            if probed.has_video && (probed.aac_config.is_some() || probed.has_mp3) {
                break;
            }
        }

        let event = timeout(read_timeout, client.read_event())
            .await
            .map_err(|_| SourceError::Timeout)??;
        deadline.get_or_insert_with(|| Instant::now() + TRACK_PROBE_WINDOW);

        match event {
            RtmpEvent::Video { data, timestamp_ms } => {
                match probed.video_dp.parse_tag(&data, timestamp_ms) {
                    Ok(VideoTag::Config) | Ok(VideoTag::Au { .. }) => probed.has_video = true,
                    Ok(VideoTag::Skip) => {}
                    Err(FlvError::UnsupportedVideoCodec(id)) => {
                        return Err(SourceError::UnsupportedCodec(format!(
                            "unsupported video codec id {id}"
                        )));
                    }
                    Err(_) => {}
                }
            }
            RtmpEvent::Audio { data, timestamp_ms } => {
                match AudioDepacketizer::parse_tag(&data, timestamp_ms) {
                    Ok(AudioTag::AacConfig(config)) => probed.aac_config = Some(config),
                    Ok(AudioTag::AacAu { .. }) => probed.has_aac_frames = true,
                    Ok(AudioTag::Mp3Frame { .. }) => probed.has_mp3 = true,
                    Ok(AudioTag::Skip) => {}
                    Err(FlvError::UnsupportedAudioFormat(id)) => {
                        return Err(SourceError::UnsupportedCodec(format!(
                            "unsupported audio format {id}"
                        )));
                    }
                    Err(_) => {}
                }
            }
        }
    }

    Ok(probed)
}

struct ReaderState<S> {
    client: RtmpClient<S>,
    stream: Arc<Stream>,
    video_dp: VideoDepacketizer,
    video_track: Option<usize>,
    audio_track: Option<usize>,
    audio_is_aac: bool,
    token: CancellationToken,
    read_timeout: Duration,
    _not_ready: NotReadyGuard,
}

async fn run_reader<S>(mut state: ReaderState<S>) -> Result<(), SourceError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let decode_err_logger = LimitedLogger::new();

    loop {
        let event = tokio::select! {
            // dropping the client closes the connection
            _ = state.token.cancelled() => return Ok(()),
            res = timeout(state.read_timeout, state.client.read_event()) => match res {
                Err(_) => return Err(SourceError::Timeout),
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok(event)) => event,
            },
        };

        match event {
            RtmpEvent::Video { data, timestamp_ms } => {
                let track = match state.video_track {
                    Some(t) => t,
                    None => continue,
                };
                match state.video_dp.parse_tag(&data, timestamp_ms) {
                    Ok(VideoTag::Au { pts, au, .. }) => {
                        state.stream.write_unit(
                            track,
                            &Unit {
                                pts,
                                ntp: Utc::now(),
                                payload: Payload::H264 { au },
                            },
                        );
                    }
                    Ok(VideoTag::Config) | Ok(VideoTag::Skip) => {}
                    Err(FlvError::UnsupportedVideoCodec(id)) => {
                        return Err(SourceError::UnsupportedCodec(format!(
                            "unsupported video codec id {id}"
                        )));
                    }
                    Err(e) => decode_err_logger.warn("rtmp source", &e.to_string()),
                }
            }
            RtmpEvent::Audio { data, timestamp_ms } => {
                let track = match state.audio_track {
                    Some(t) => t,
                    None => continue,
                };
                match AudioDepacketizer::parse_tag(&data, timestamp_ms) {
                    Ok(AudioTag::AacAu { pts, au }) if state.audio_is_aac => {
                        state.stream.write_unit(
                            track,
                            &Unit {
                                pts,
                                ntp: Utc::now(),
                                payload: Payload::Mpeg4Audio { aus: vec![au] },
                            },
                        );
                    }
                    Ok(AudioTag::Mp3Frame { pts, frame }) if !state.audio_is_aac => {
                        state.stream.write_unit(
                            track,
                            &Unit {
                                pts,
                                ntp: Utc::now(),
                                payload: Payload::Mpeg1Audio {
                                    frames: vec![frame],
                                },
                            },
                        );
                    }
                    Ok(_) => {}
                    Err(e) => decode_err_logger.warn("rtmp source", &e.to_string()),
                }
            }
        }
    }
}
