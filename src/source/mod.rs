//! Static sources
//!
//! A static source is a pull-mode ingester: the server dials the
//! publisher, decodes its tracks and feeds them into the path's stream.
//! Each source runs under a supervisor select that reacts to reader
//! completion, configuration reloads and cancellation.

pub mod rtmp;
pub mod srt;

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::PathConf;
use crate::stream::{Stream, StreamDesc};

pub use rtmp::RtmpSource;
pub use srt::SrtSource;

/// Identity of a source, for the API surface and logs
#[derive(Debug, Clone)]
pub struct SourceDescription {
    pub kind: &'static str,
    pub id: String,
}

/// Arguments of a `set_ready` call
pub struct SetReadyParams {
    pub desc: StreamDesc,

    /// Whether the fabric should synthesize RTP packets for RTSP readers
    pub generate_rtp_packets: bool,
}

/// The parent a static source reports into
pub trait StaticSourceParent: Send + Sync {
    /// The path becomes ready; returns the stream to write units into
    fn set_ready(&self, params: SetReadyParams) -> Result<Arc<Stream>, SourceError>;

    /// The path is no longer producing
    fn set_not_ready(&self);
}

/// Parameters of one source run
pub struct RunParams {
    pub token: CancellationToken,
    pub conf: Arc<PathConf>,

    /// Carries the new path config on reloads. Sources acknowledge the
    /// reload but do not re-dial; the recorder picks new durations up on
    /// its own.
    pub reload: watch::Receiver<Arc<PathConf>>,
}

/// Contract implemented by every static source
pub trait StaticSource {
    /// Run until a fatal error or cancellation (which is Ok)
    fn run(
        &self,
        params: RunParams,
    ) -> impl std::future::Future<Output = Result<(), SourceError>> + Send;

    fn describe(&self) -> SourceDescription;
}

/// Static source errors
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// Dial or handshake failure; the path supervisor retries
    #[error("upstream unavailable: {0}")]
    Upstream(String),

    /// Track enumeration found a codec this server does not handle
    #[error("unsupported codec: {0}")]
    UnsupportedCodec(String),

    #[error("read timed out")]
    Timeout,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Protocol(String),
}

impl From<crate::protocols::rtmp::RtmpError> for SourceError {
    fn from(e: crate::protocols::rtmp::RtmpError) -> Self {
        use crate::protocols::rtmp::RtmpError;
        match e {
            RtmpError::Timeout => SourceError::Timeout,
            RtmpError::Io(e) => SourceError::Io(e),
            other => SourceError::Protocol(other.to_string()),
        }
    }
}

/// Guard that reports not-ready exactly once, on drop
///
/// Created only after a successful `set_ready`, so the pairing invariant
/// holds on every exit path.
pub(crate) struct NotReadyGuard {
    parent: Arc<dyn StaticSourceParent>,
}

impl NotReadyGuard {
    pub fn new(parent: Arc<dyn StaticSourceParent>) -> Self {
        Self { parent }
    }
}

impl Drop for NotReadyGuard {
    fn drop(&mut self) {
        self.parent.set_not_ready();
    }
}

/// Supervisor select shared by the static sources: wait for the reader
/// task, acknowledging configuration reloads on the way
///
/// A reload deliberately does not restart the ingester; the recorder
/// re-reads its durations on its own.
pub(crate) async fn supervise(
    mut reader: tokio::task::JoinHandle<Result<(), SourceError>>,
    mut reload: watch::Receiver<Arc<PathConf>>,
) -> Result<(), SourceError> {
    let mut reload_open = true;
    loop {
        tokio::select! {
            res = &mut reader => {
                return match res {
                    Ok(r) => r,
                    Err(e) => Err(SourceError::Protocol(format!("reader task failed: {e}"))),
                };
            }
            changed = reload.changed(), if reload_open => {
                match changed {
                    Ok(()) => tracing::debug!("configuration reload acknowledged"),
                    Err(_) => reload_open = false,
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// Parent that records the ready/not-ready sequence
    #[derive(Default)]
    pub struct RecordingParent {
        pub events: Mutex<Vec<&'static str>>,
        pub stream: Mutex<Option<Arc<Stream>>>,
    }

    impl StaticSourceParent for RecordingParent {
        fn set_ready(&self, params: SetReadyParams) -> Result<Arc<Stream>, SourceError> {
            let stream = Arc::new(Stream::new(params.desc));
            self.events.lock().unwrap().push("ready");
            *self.stream.lock().unwrap() = Some(stream.clone());
            Ok(stream)
        }

        fn set_not_ready(&self) {
            self.events.lock().unwrap().push("not_ready");
        }
    }

    #[test]
    fn test_not_ready_guard_fires_once() {
        let parent = Arc::new(RecordingParent::default());
        parent
            .set_ready(SetReadyParams {
                desc: StreamDesc::default(),
                generate_rtp_packets: true,
            })
            .unwrap();
        {
            let _guard = NotReadyGuard::new(parent.clone());
        }
        assert_eq!(*parent.events.lock().unwrap(), vec!["ready", "not_ready"]);
    }
}
