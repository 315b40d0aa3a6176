//! SRT static source
//!
//! Dials the publisher over SRT and demultiplexes the carried MPEG-TS
//! into the path's stream. The read deadline rolls with every received
//! packet; decode errors go through the rate-limited logger.

use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use srt_tokio::SrtSocket;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{
    supervise, NotReadyGuard, RunParams, SetReadyParams, SourceDescription, SourceError,
    StaticSource, StaticSourceParent,
};
use crate::logger::LimitedLogger;
use crate::protocols::mpegts::{Reader as TsReader, ReaderEvent};
use crate::stream::{Stream, StreamDesc, TrackDesc, Unit};

/// An SRT static source
pub struct SrtSource {
    pub resolved_source: String,
    pub parent: Arc<dyn StaticSourceParent>,
}

impl StaticSource for SrtSource {
    async fn run(&self, params: RunParams) -> Result<(), SourceError> {
        tracing::debug!(source = %self.resolved_source, "connecting");

        let url = Url::parse(&self.resolved_source)
            .map_err(|e| SourceError::Upstream(e.to_string()))?;
        let host = url
            .host_str()
            .ok_or_else(|| SourceError::Upstream("source URL has no host".to_string()))?;
        // the library requires the port in the URL
        let port = url
            .port()
            .ok_or_else(|| SourceError::Protocol("srt source requires an explicit port".to_string()))?;
        let streamid = url
            .query_pairs()
            .find(|(k, _)| k == "streamid")
            .map(|(_, v)| v.to_string());

        let read_timeout = params.conf.read_timeout();
        let addr = format!("{host}:{port}");

        let socket = timeout(
            read_timeout,
            SrtSocket::builder().call(addr.as_str(), streamid.as_deref()),
        )
        .await
        .map_err(|_| SourceError::Timeout)?
        .map_err(|e| SourceError::Upstream(e.to_string()))?;

        let reader = tokio::spawn(run_reader(
            socket,
            self.parent.clone(),
            params.token.clone(),
            read_timeout,
        ));

        supervise(reader, params.reload).await
    }

    fn describe(&self) -> SourceDescription {
        SourceDescription {
            kind: "srtSource",
            id: String::new(),
        }
    }
}

async fn run_reader(
    mut socket: SrtSocket,
    parent: Arc<dyn StaticSourceParent>,
    token: CancellationToken,
    read_timeout: std::time::Duration,
) -> Result<(), SourceError> {
    let mut ts_reader = TsReader::new();
    let decode_err_logger = LimitedLogger::new();
    let mut stream: Option<Arc<Stream>> = None;
    let mut _not_ready: Option<NotReadyGuard> = None;

    loop {
        let data = tokio::select! {
            // dropping the socket closes the connection
            _ = token.cancelled() => return Ok(()),
            res = timeout(read_timeout, socket.next()) => match res {
                Err(_) => return Err(SourceError::Timeout),
                Ok(None) => return Err(SourceError::Upstream("connection closed".to_string())),
                Ok(Some(Err(e))) => return Err(SourceError::Io(e)),
                Ok(Some(Ok((_, data)))) => data,
            },
        };

        let events = ts_reader.push(&data);

        // skipped PMT entries are reported before the track set is
        // announced, so resolve the announcement first
        if stream.is_none() {
            for event in &events {
                if let ReaderEvent::Tracks(tracks) = event {
                    let desc = StreamDesc {
                        tracks: tracks
                            .iter()
                            .map(|t| TrackDesc {
                                id: t.id,
                                params: t.params.clone(),
                            })
                            .collect(),
                    };
                    tracing::debug!(tracks = %desc.codec_names(), "tracks found");

                    let s = parent.set_ready(SetReadyParams {
                        desc,
                        generate_rtp_packets: true,
                    })?;
                    _not_ready = Some(NotReadyGuard::new(parent.clone()));
                    stream = Some(s);
                    break;
                }
            }
        }

        for event in events {
            match event {
                ReaderEvent::Tracks(_) => {}
                ReaderEvent::Unit {
                    track_id,
                    pts,
                    payload,
                } => {
                    if let Some(stream) = &stream {
                        stream.write_unit(
                            track_id,
                            &Unit {
                                pts,
                                ntp: Utc::now(),
                                payload,
                            },
                        );
                    }
                }
                ReaderEvent::DecodeError(msg) => {
                    if stream.is_none() && msg.starts_with("unsupported stream type") {
                        return Err(SourceError::UnsupportedCodec(msg));
                    }
                    decode_err_logger.warn("srt source", &msg);
                }
            }
        }
    }
}
