//! RTMP client connection
//!
//! A thin asynchronous wrapper over the `rml_rtmp` handshake and client
//! session state machines. The wire protocol (chunking, AMF command
//! flows, acknowledgements) lives entirely in that crate; this module
//! pumps bytes between it and the socket and surfaces media events.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use rml_rtmp::handshake::{Handshake, HandshakeProcessResult, PeerType};
use rml_rtmp::sessions::{
    ClientSession, ClientSessionConfig, ClientSessionEvent, ClientSessionResult,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

/// RTMP client errors
#[derive(Debug, thiserror::Error)]
pub enum RtmpError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("session error: {0}")]
    Session(String),

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("read timed out")]
    Timeout,

    #[error("connection closed by peer")]
    Closed,
}

/// Media event read from the peer
#[derive(Debug)]
pub enum RtmpEvent {
    /// FLV video tag body
    Video { data: Bytes, timestamp_ms: u32 },

    /// FLV audio tag body
    Audio { data: Bytes, timestamp_ms: u32 },
}

/// An established playback session
pub struct RtmpClient<S> {
    stream: S,
    session: ClientSession,
    read_timeout: Duration,
    raised: VecDeque<ClientSessionEvent>,
    pending: VecDeque<RtmpEvent>,
    buf: Vec<u8>,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> RtmpClient<S> {
    /// Perform the handshake, connect to the application and request
    /// playback of the stream key
    pub async fn connect(
        mut stream: S,
        app: String,
        stream_key: String,
        read_timeout: Duration,
    ) -> Result<Self, RtmpError> {
        // handshake
        let mut handshake = Handshake::new(PeerType::Client);
        let p0_and_p1 = handshake
            .generate_outbound_p0_and_p1()
            .map_err(|e| RtmpError::Handshake(format!("{e:?}")))?;
        stream.write_all(&p0_and_p1).await?;

        let mut buf = vec![0u8; 4096];
        let leftover = loop {
            let n = timeout(read_timeout, stream.read(&mut buf))
                .await
                .map_err(|_| RtmpError::Timeout)??;
            if n == 0 {
                return Err(RtmpError::Closed);
            }
            match handshake
                .process_bytes(&buf[..n])
                .map_err(|e| RtmpError::Handshake(format!("{e:?}")))?
            {
                HandshakeProcessResult::InProgress { response_bytes } => {
                    if !response_bytes.is_empty() {
                        stream.write_all(&response_bytes).await?;
                    }
                }
                HandshakeProcessResult::Completed {
                    response_bytes,
                    remaining_bytes,
                } => {
                    if !response_bytes.is_empty() {
                        stream.write_all(&response_bytes).await?;
                    }
                    break remaining_bytes;
                }
            }
        };

        let config = ClientSessionConfig::new();
        let (session, initial_results) = ClientSession::new(config)
            .map_err(|e| RtmpError::Session(format!("{e:?}")))?;

        let mut client = Self {
            stream,
            session,
            read_timeout,
            raised: VecDeque::new(),
            pending: VecDeque::new(),
            buf,
        };

        client.handle_results(initial_results).await?;
        if !leftover.is_empty() {
            let results = client
                .session
                .handle_input(&leftover)
                .map_err(|e| RtmpError::Session(format!("{e:?}")))?;
            client.handle_results(results).await?;
        }

        // connect to the application
        let result = client
            .session
            .request_connection(app)
            .map_err(|e| RtmpError::Session(format!("{e:?}")))?;
        client.handle_results(vec![result]).await?;
        client
            .wait_for(|event| match event {
                ClientSessionEvent::ConnectionRequestAccepted => Some(Ok(())),
                ClientSessionEvent::ConnectionRequestRejected { description } => {
                    Some(Err(RtmpError::Rejected(description.clone())))
                }
                _ => None,
            })
            .await?;

        // start playback
        let result = client
            .session
            .request_playback(stream_key)
            .map_err(|e| RtmpError::Session(format!("{e:?}")))?;
        client.handle_results(vec![result]).await?;
        client
            .wait_for(|event| match event {
                ClientSessionEvent::PlaybackRequestAccepted => Some(Ok(())),
                _ => None,
            })
            .await?;

        Ok(client)
    }

    /// Read until the next media event
    ///
    /// Outbound plumbing (acknowledgements, ping responses) raised by the
    /// session is written out as a side effect.
    pub async fn read_event(&mut self) -> Result<RtmpEvent, RtmpError> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(event);
            }
            while let Some(event) = self.raised.pop_front() {
                self.queue_media(event);
            }
            if !self.pending.is_empty() {
                continue;
            }
            self.pump().await?;
        }
    }

    /// Read one chunk of bytes from the socket and run it through the
    /// session, queueing media events
    async fn pump(&mut self) -> Result<(), RtmpError> {
        let n = timeout(self.read_timeout, self.stream.read(&mut self.buf))
            .await
            .map_err(|_| RtmpError::Timeout)??;
        if n == 0 {
            return Err(RtmpError::Closed);
        }
        let input: Vec<u8> = self.buf[..n].to_vec();
        let results = self
            .session
            .handle_input(&input)
            .map_err(|e| RtmpError::Session(format!("{e:?}")))?;
        self.handle_results(results).await
    }

    /// Wait for a specific session event, queueing media seen on the way
    async fn wait_for<T>(
        &mut self,
        mut check: impl FnMut(&ClientSessionEvent) -> Option<Result<T, RtmpError>>,
    ) -> Result<T, RtmpError> {
        loop {
            while let Some(event) = self.raised.pop_front() {
                if let Some(result) = check(&event) {
                    return result;
                }
                self.queue_media(event);
            }
            self.pump().await?;
        }
    }

    async fn handle_results(
        &mut self,
        results: Vec<ClientSessionResult>,
    ) -> Result<(), RtmpError> {
        for result in results {
            match result {
                ClientSessionResult::OutboundResponse(packet) => {
                    self.stream.write_all(&packet.bytes).await?;
                }
                ClientSessionResult::RaisedEvent(event) => {
                    self.raised.push_back(event);
                }
                ClientSessionResult::UnhandleableMessageReceived(_) => {}
            }
        }
        Ok(())
    }

    fn queue_media(&mut self, event: ClientSessionEvent) {
        match event {
            ClientSessionEvent::VideoDataReceived { data, timestamp } => {
                self.pending.push_back(RtmpEvent::Video {
                    data: Bytes::copy_from_slice(&data),
                    timestamp_ms: timestamp.value,
                });
            }
            ClientSessionEvent::AudioDataReceived { data, timestamp } => {
                self.pending.push_back(RtmpEvent::Audio {
                    data: Bytes::copy_from_slice(&data),
                    timestamp_ms: timestamp.value,
                });
            }
            other => {
                tracing::trace!(event = ?other, "rtmp session event");
            }
        }
    }
}
