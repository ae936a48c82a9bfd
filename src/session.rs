use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::camera_directory::CameraTarget;
use crate::config::{OutputSpec, StreamingConfig, TranscodingConfig};
use crate::demux::{Frame, FrameDemuxer};
use crate::errors::{Result, StreamError};
use crate::transcoder::{ProcessHandle, ProcessSpawner, SpawnOptions, Transcoder, TranscoderEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    WebSocket,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Http => write!(f, "http"),
            Protocol::WebSocket => write!(f, "ws"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Starting,
    Streaming,
    Closed,
}

/// Why a session ended. Delivered once to the sink and to `wait_ready`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CloseReason {
    #[error("Client disconnected")]
    ClientDisconnected,

    #[error("Stream process exited (code {code:?})")]
    ProcessExited { code: Option<i32> },

    #[error("Failed to start stream process: {message}")]
    ProcessFailed { message: String },

    #[error("No frame received before the start timeout")]
    StartTimeout,

    #[error("Client too slow ({pending} frames pending)")]
    SlowClient { pending: usize },

    #[error("Client channel error: {message}")]
    Sink { message: String },

    #[error("Server shutting down")]
    Shutdown,
}

impl CloseReason {
    pub fn is_error(&self) -> bool {
        !matches!(
            self,
            CloseReason::ClientDisconnected | CloseReason::ProcessExited { code: Some(0) }
        )
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("client queue is full ({pending} frames pending)")]
    Full { pending: usize },

    #[error("client is gone")]
    Closed,

    #[error("{message}")]
    Other { message: String },
}

/// Protocol-specific delivery of frames to one client.
///
/// `send` must not block: a client that cannot keep up reports
/// [`SinkError::Full`] and the session closes instead of buffering.
pub trait FrameSink: Send + 'static {
    fn send(&mut self, frame: &Frame) -> std::result::Result<(), SinkError>;

    /// Resolves once the client side has gone away.
    fn closed(&self) -> BoxFuture<'static, ()>;

    fn on_close(&mut self, reason: &CloseReason);
}

/// Something that can start the subprocess for a session
pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, name: &str, source_url: &str, output: &OutputSpec) -> (ProcessHandle, mpsc::Receiver<TranscoderEvent>);
}

impl ProcessLauncher for Transcoder {
    fn launch(&self, name: &str, source_url: &str, output: &OutputSpec) -> (ProcessHandle, mpsc::Receiver<TranscoderEvent>) {
        self.start(name, source_url, output)
    }
}

/// Shared bookkeeping for one live session, listed by `/api/sessions`
struct SessionInfo {
    id: Uuid,
    camera_id: String,
    protocol: Protocol,
    started_at: DateTime<Utc>,
    pid: Option<u32>,
    frames_sent: AtomicU64,
    bytes_sent: AtomicU64,
    state: watch::Receiver<SessionState>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: Uuid,
    pub camera_id: String,
    pub protocol: Protocol,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    pub pid: Option<u32>,
    pub frames_sent: u64,
    pub bytes_sent: u64,
}

impl SessionInfo {
    fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id,
            camera_id: self.camera_id.clone(),
            protocol: self.protocol,
            state: *self.state.borrow(),
            started_at: self.started_at,
            pid: self.pid,
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }
}

/// Owner-side view of a running session. Dropping it ends the session.
pub struct SessionHandle {
    id: Uuid,
    state: watch::Receiver<SessionState>,
    cancel: Option<oneshot::Sender<()>>,
    ready: Option<oneshot::Receiver<std::result::Result<(), CloseReason>>>,
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.state() != SessionState::Closed
    }

    /// Resolves once the first frame has reached the sink, or with the
    /// reason the session closed before that.
    pub async fn wait_ready(&mut self) -> std::result::Result<(), CloseReason> {
        match self.ready.take() {
            Some(ready) => ready.await.unwrap_or(Err(CloseReason::ClientDisconnected)),
            None if self.is_active() => Ok(()),
            None => Err(CloseReason::ClientDisconnected),
        }
    }

    /// Ask the session to stop. The session task does the teardown.
    pub fn close(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
    }

    /// Wait until the session has fully closed.
    pub async fn closed(&mut self) {
        let _ = self.state.wait_for(|state| *state == SessionState::Closed).await;
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.close();
    }
}

struct ManagerInner {
    launcher: Arc<dyn ProcessLauncher>,
    transcoding: TranscodingConfig,
    streaming: StreamingConfig,
    sessions: RwLock<HashMap<Uuid, Arc<SessionInfo>>>,
    shutdown: watch::Sender<bool>,
}

/// Arena of live stream sessions, indexed by session id
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    pub fn new(transcoding: TranscodingConfig, streaming: StreamingConfig) -> Self {
        let spawner = ProcessSpawner::new(SpawnOptions {
            chunk_read_size: transcoding.chunk_read_size,
            event_buffer: streaming.event_buffer,
            stop_timeout: streaming.stop_timeout,
            log_stderr: transcoding.log_stderr,
        });
        let transcoder = Transcoder::new(transcoding.clone(), spawner);
        Self::with_launcher(Arc::new(transcoder), transcoding, streaming)
    }

    pub fn with_launcher(
        launcher: Arc<dyn ProcessLauncher>,
        transcoding: TranscodingConfig,
        streaming: StreamingConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                launcher,
                transcoding,
                streaming,
                sessions: RwLock::new(HashMap::new()),
                shutdown: watch::channel(false).0,
            }),
        }
    }

    /// Close every session and refuse new ones.
    pub fn shutdown(&self) {
        info!("Closing all stream sessions");
        self.inner.shutdown.send_replace(true);
    }

    pub async fn count(&self) -> usize {
        self.inner.sessions.read().await.len()
    }

    pub async fn list(&self) -> Vec<SessionSummary> {
        let sessions = self.inner.sessions.read().await;
        let mut list: Vec<SessionSummary> = sessions.values().map(|info| info.summary()).collect();
        list.sort_by_key(|s| s.started_at);
        list
    }

    /// Start a session streaming `target` into `sink`.
    ///
    /// Spawn failures are not returned here; they close the session and show
    /// up through [`SessionHandle::wait_ready`] and [`FrameSink::on_close`].
    pub async fn start<S: FrameSink>(&self, target: CameraTarget, protocol: Protocol, sink: S) -> Result<SessionHandle> {
        let stopping = *self.inner.shutdown.borrow();
        if stopping {
            return Err(StreamError::stream_closed("Server is shutting down"));
        }
        let source_url = target.rtsp_url(&self.inner.transcoding.rtsp_path)?;
        let output = match protocol {
            Protocol::Http => &self.inner.transcoding.http,
            Protocol::WebSocket => &self.inner.transcoding.websocket,
        };

        let id = Uuid::new_v4();
        let name = format!("{}-{}-{}", protocol, target.id, &id.simple().to_string()[..8]);
        let (state_tx, state_rx) = watch::channel(SessionState::Starting);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        let mut sessions = self.inner.sessions.write().await;
        let max = self.inner.streaming.max_sessions;
        if sessions.len() >= max {
            warn!("[{}] Rejecting stream for camera {}: {} sessions active", name, target.id, sessions.len());
            return Err(StreamError::SessionLimit { max });
        }

        let (process, events) = self.inner.launcher.launch(&name, &source_url, output);
        let info = Arc::new(SessionInfo {
            id,
            camera_id: target.id.clone(),
            protocol,
            started_at: Utc::now(),
            pid: process.pid(),
            frames_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            state: state_rx.clone(),
        });
        sessions.insert(id, info.clone());
        drop(sessions);

        info!("[{}] Session started for camera {}", name, target.id);

        let session = StreamSession {
            name,
            info,
            manager: self.clone(),
            demuxer: FrameDemuxer::new(self.inner.streaming.max_frame_bytes),
            process,
            sink,
            state: state_tx,
            ready: Some(ready_tx),
            garbage_warn_bytes: self.inner.streaming.garbage_warn_bytes,
            next_garbage_warning: self.inner.streaming.garbage_warn_bytes,
        };
        tokio::spawn(session.run(events, cancel_rx, self.inner.streaming.start_timeout));

        Ok(SessionHandle {
            id,
            state: state_rx,
            cancel: Some(cancel_tx),
            ready: Some(ready_rx),
        })
    }

    async fn remove(&self, id: &Uuid) {
        self.inner.sessions.write().await.remove(id);
    }
}

/// The session task. Owns the demuxer, the process and the sink.
struct StreamSession<S: FrameSink> {
    name: String,
    info: Arc<SessionInfo>,
    manager: SessionManager,
    demuxer: FrameDemuxer,
    process: ProcessHandle,
    sink: S,
    state: watch::Sender<SessionState>,
    ready: Option<oneshot::Sender<std::result::Result<(), CloseReason>>>,
    garbage_warn_bytes: u64,
    next_garbage_warning: u64,
}

impl<S: FrameSink> StreamSession<S> {
    async fn run(
        mut self,
        mut events: mpsc::Receiver<TranscoderEvent>,
        mut cancel: oneshot::Receiver<()>,
        start_timeout: std::time::Duration,
    ) {
        let sink_closed = self.sink.closed();
        tokio::pin!(sink_closed);
        let start_deadline = tokio::time::sleep(start_timeout);
        tokio::pin!(start_deadline);
        let mut shutdown = self.manager.inner.shutdown.subscribe();
        let stopping = *shutdown.borrow_and_update();
        if stopping {
            self.close(CloseReason::Shutdown).await;
            return;
        }

        let reason = loop {
            let waiting_for_first_frame = self.ready.is_some();
            tokio::select! {
                biased;
                // Fires on close() and when the handle is dropped.
                _ = &mut cancel => break CloseReason::ClientDisconnected,
                _ = &mut sink_closed => break CloseReason::ClientDisconnected,
                // Only ever flips to true.
                _ = shutdown.changed() => break CloseReason::Shutdown,
                _ = &mut start_deadline, if waiting_for_first_frame => break CloseReason::StartTimeout,
                event = events.recv() => match event {
                    Some(TranscoderEvent::Data(chunk)) => {
                        if let Some(reason) = self.on_data(&chunk) {
                            break reason;
                        }
                    }
                    Some(TranscoderEvent::Stderr(_)) => {}
                    Some(TranscoderEvent::Exited { code, .. }) => break CloseReason::ProcessExited { code },
                    Some(TranscoderEvent::Failed { message }) => break CloseReason::ProcessFailed { message },
                    None => break CloseReason::ProcessExited { code: None },
                },
            }
        };

        self.close(reason).await;
    }

    fn on_data(&mut self, chunk: &[u8]) -> Option<CloseReason> {
        if *self.state.borrow() == SessionState::Starting {
            debug!("[{}] First data from stream process", self.name);
            let _ = self.state.send(SessionState::Streaming);
        }

        for frame in self.demuxer.push(chunk) {
            debug_assert!(!frame.is_empty());
            match self.sink.send(&frame) {
                Ok(()) => {
                    self.info.frames_sent.fetch_add(1, Ordering::Relaxed);
                    self.info.bytes_sent.fetch_add(frame.len() as u64, Ordering::Relaxed);
                    if let Some(ready) = self.ready.take() {
                        let _ = ready.send(Ok(()));
                    }
                }
                Err(SinkError::Full { pending }) => return Some(CloseReason::SlowClient { pending }),
                Err(SinkError::Closed) => return Some(CloseReason::ClientDisconnected),
                Err(SinkError::Other { message }) => return Some(CloseReason::Sink { message }),
            }
        }

        let discarded = self.demuxer.discarded_bytes();
        if self.garbage_warn_bytes > 0 && discarded >= self.next_garbage_warning {
            warn!("[{}] Discarded {} bytes of non-frame data so far", self.name, discarded);
            while self.next_garbage_warning <= discarded {
                self.next_garbage_warning += self.garbage_warn_bytes;
            }
        }
        None
    }

    async fn close(mut self, reason: CloseReason) {
        let signalled = self.process.stop();
        let stats = format!(
            "{} frames sent, {} demuxed, {} bytes discarded",
            self.info.frames_sent.load(Ordering::Relaxed),
            self.demuxer.frames_extracted(),
            self.demuxer.discarded_bytes()
        );
        self.demuxer.reset();

        match &reason {
            CloseReason::SlowClient { .. } => warn!("[{}] Closing session: {} ({})", self.name, reason, stats),
            _ if reason.is_error() => warn!("[{}] Session ended: {} ({})", self.name, reason, stats),
            _ => info!("[{}] Session ended: {} ({})", self.name, reason, stats),
        }
        if signalled {
            debug!("[{}] Stream process signalled", self.name);
        }

        self.sink.on_close(&reason);
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(Err(reason));
        }

        self.manager.remove(&self.info.id).await;
        let _ = self.state.send(SessionState::Closed);
    }
}
