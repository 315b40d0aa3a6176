//! Core wiring
//!
//! Hosts one worker per configured path: the worker builds the static
//! source for the path, runs it under cancellation, retries on upstream
//! failures, and wires the recorder to the stream whenever the source
//! reports ready. Configuration reloads are fanned out over per-path
//! watch channels; the authentication manager is shared by all
//! protocol frontends.

pub mod saved_paths;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::auth::{self, AuthError};
use crate::config::{Config, ConfigError, PathConf};
use crate::record::RecorderAgent;
use crate::source::{
    RtmpSource, RunParams, SetReadyParams, SourceError, SrtSource, StaticSource,
    StaticSourceParent,
};
use crate::stream::Stream;

/// Pause between attempts to restart a failed static source
const SOURCE_RETRY_PAUSE: Duration = Duration::from_secs(5);

/// Startup errors
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

/// The running instance
pub struct Core {
    auth: Arc<auth::Manager>,
    paths: Vec<PathHandle>,
}

struct PathHandle {
    name: String,
    conf_tx: watch::Sender<Arc<PathConf>>,
    task: Option<JoinHandle<()>>,
}

impl Core {
    /// Validate the configuration, build the auth manager and spawn one
    /// worker per path with a pull source
    pub fn new(config: Config, token: CancellationToken) -> Result<Self, CoreError> {
        config.validate()?;
        let auth = Arc::new(auth::Manager::new(&config.auth)?);

        let mut paths = Vec::new();
        for (name, conf) in &config.paths {
            let (conf_tx, conf_rx) = watch::channel(Arc::new(conf.clone()));
            let task = if conf.source.is_some() {
                Some(tokio::spawn(path_worker(
                    name.clone(),
                    conf_rx,
                    token.child_token(),
                )))
            } else {
                // paths without a source are fed by inbound publishers
                None
            };
            paths.push(PathHandle {
                name: name.clone(),
                conf_tx,
                task,
            });
        }

        Ok(Self { auth, paths })
    }

    /// The shared authentication manager
    pub fn auth(&self) -> Arc<auth::Manager> {
        self.auth.clone()
    }

    /// Push a new configuration to a path
    ///
    /// Sources are notified but keep their connection; the recorder
    /// re-reads segment/part durations on the next unit.
    pub fn reload_path(&self, name: &str, conf: PathConf) -> bool {
        match self.paths.iter().find(|p| p.name == name) {
            Some(path) => {
                let _ = path.conf_tx.send(Arc::new(conf));
                true
            }
            None => false,
        }
    }

    /// Wait for all path workers to finish; call after cancelling the
    /// token handed to [`Core::new`]
    pub async fn wait(self) {
        for path in self.paths {
            if let Some(task) = path.task {
                let _ = task.await;
            }
        }
    }
}

enum AnySource {
    Rtmp(RtmpSource),
    Srt(SrtSource),
}

/// Build the source for a path; an unknown scheme is fatal here
fn build_source(
    conf: &PathConf,
    parent: Arc<dyn StaticSourceParent>,
) -> Result<Option<AnySource>, SourceError> {
    let resolved_source = match &conf.source {
        Some(s) => s.clone(),
        None => return Ok(None),
    };
    let url = Url::parse(&resolved_source)
        .map_err(|e| SourceError::Protocol(format!("invalid source URL: {e}")))?;

    match url.scheme() {
        "rtmp" | "rtmps" => Ok(Some(AnySource::Rtmp(RtmpSource {
            resolved_source,
            parent,
        }))),
        "srt" => Ok(Some(AnySource::Srt(SrtSource {
            resolved_source,
            parent,
        }))),
        other => Err(SourceError::Protocol(format!(
            "unsupported source scheme '{other}'"
        ))),
    }
}

async fn path_worker(
    name: String,
    conf_rx: watch::Receiver<Arc<PathConf>>,
    token: CancellationToken,
) {
    let parent: Arc<dyn StaticSourceParent> =
        Arc::new(PathState::new(name.clone(), conf_rx.clone()));

    let conf = conf_rx.borrow().clone();
    let source = match build_source(&conf, parent) {
        Ok(Some(source)) => source,
        Ok(None) => return,
        Err(e) => {
            tracing::error!(path = %name, error = %e, "cannot create static source");
            return;
        }
    };

    loop {
        let conf = conf_rx.borrow().clone();
        let params = RunParams {
            token: token.clone(),
            conf,
            reload: conf_rx.clone(),
        };

        let result = match &source {
            AnySource::Rtmp(s) => s.run(params).await,
            AnySource::Srt(s) => s.run(params).await,
        };

        if token.is_cancelled() {
            return;
        }
        match result {
            Ok(()) => return,
            Err(e) => {
                tracing::warn!(
                    path = %name,
                    error = %e,
                    retry_secs = SOURCE_RETRY_PAUSE.as_secs(),
                    "static source failed, retrying"
                );
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(SOURCE_RETRY_PAUSE) => {}
                }
            }
        }
    }
}

struct ReadyState {
    stream: Arc<Stream>,
    recorder: Option<RecorderAgent>,
}

/// Per-path parent state: owns the stream and the recorder agent while
/// the source is ready
struct PathState {
    name: String,
    conf: watch::Receiver<Arc<PathConf>>,
    ready: Mutex<Option<ReadyState>>,
}

impl PathState {
    fn new(name: String, conf: watch::Receiver<Arc<PathConf>>) -> Self {
        Self {
            name,
            conf,
            ready: Mutex::new(None),
        }
    }
}

impl StaticSourceParent for PathState {
    fn set_ready(&self, params: SetReadyParams) -> Result<Arc<Stream>, SourceError> {
        let stream = Arc::new(Stream::new(params.desc));

        let conf = self.conf.borrow().clone();
        let recorder = if conf.record {
            Some(
                RecorderAgent::new(&self.name, stream.clone(), self.conf.clone())
                    .map_err(|e| SourceError::Protocol(e.to_string()))?,
            )
        } else {
            None
        };

        *self.ready.lock().unwrap() = Some(ReadyState {
            stream: stream.clone(),
            recorder,
        });
        tracing::info!(path = %self.name, "path is ready");
        Ok(stream)
    }

    fn set_not_ready(&self) {
        if let Some(ready) = self.ready.lock().unwrap().take() {
            if let Some(recorder) = ready.recorder {
                recorder.close();
            }
        }
        tracing::info!(path = %self.name, "path is not ready");
    }
}
