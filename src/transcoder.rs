use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::config::{OutputSpec, TranscodingConfig};
use crate::utils::mask_credentials;

/// Everything the session hears from its subprocess, in order.
#[derive(Debug)]
pub enum TranscoderEvent {
    /// A chunk of stdout. Never sent after `Exited`.
    Data(Bytes),
    /// One line of stderr, diagnostic only.
    Stderr(String),
    /// The process ended. Always the last event.
    Exited { code: Option<i32>, was_error: bool },
    /// The process could not be spawned. The only event in that case.
    Failed { message: String },
}

/// Tuning for the supervisor task that owns the child process
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    pub chunk_read_size: usize,
    pub event_buffer: usize,
    pub stop_timeout: Duration,
    pub log_stderr: bool,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            chunk_read_size: 8192,
            event_buffer: 16,
            stop_timeout: Duration::from_secs(3),
            log_stderr: false,
        }
    }
}

/// Handle to one supervised OS process.
///
/// `stop()` only signals; the supervisor task reaps the child and escalates to
/// SIGKILL if it ignores SIGTERM for longer than `stop_timeout`. Dropping the
/// handle stops the process.
pub struct ProcessHandle {
    name: String,
    pid: Option<u32>,
    alive: Arc<AtomicBool>,
    stop_tx: Option<oneshot::Sender<()>>,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the OS process is still running (not yet reaped).
    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Request termination. Returns true if this call sent the signal.
    ///
    /// Safe to call any number of times, and after the process already exited.
    pub fn stop(&mut self) -> bool {
        let Some(stop_tx) = self.stop_tx.take() else {
            return false;
        };

        if !self.alive.load(Ordering::SeqCst) {
            debug!("[{}] stop requested after process exit", self.name);
            return false;
        }

        #[cfg(unix)]
        if let Some(pid) = self.pid {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) => debug!("[{}] Sent SIGTERM to pid {}", self.name, pid),
                Err(e) => debug!("[{}] SIGTERM to pid {} failed: {}", self.name, pid, e),
            }
        }

        // The supervisor stops forwarding output and reaps the child.
        let _ = stop_tx.send(());
        true
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Spawns arbitrary programs under a supervisor task that turns their stdout,
/// stderr and exit status into [`TranscoderEvent`]s.
#[derive(Debug, Clone, Default)]
pub struct ProcessSpawner {
    options: SpawnOptions,
}

impl ProcessSpawner {
    pub fn new(options: SpawnOptions) -> Self {
        Self { options }
    }

    pub fn spawn(&self, name: &str, program: &str, args: &[String]) -> (ProcessHandle, mpsc::Receiver<TranscoderEvent>) {
        let (event_tx, event_rx) = mpsc::channel(self.options.event_buffer.max(1));
        let alive = Arc::new(AtomicBool::new(false));

        let spawned = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                let message = format!("{}: {}", program, e);
                error!("[{}] Failed to spawn process: {}", name, message);
                // Fresh channel, so the single event always fits.
                let _ = event_tx.try_send(TranscoderEvent::Failed { message });
                let handle = ProcessHandle {
                    name: name.to_string(),
                    pid: None,
                    alive,
                    stop_tx: None,
                };
                return (handle, event_rx);
            }
        };

        let pid = child.id();
        alive.store(true, Ordering::SeqCst);
        info!("[{}] Process started (pid {:?})", name, pid);

        let (stop_tx, stop_rx) = oneshot::channel();
        let supervisor = Supervisor {
            name: name.to_string(),
            options: self.options.clone(),
            alive: alive.clone(),
            events: event_tx,
        };

        match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => {
                tokio::spawn(supervisor.run(child, stdout, stderr, stop_rx));
            }
            _ => {
                // Both pipes were requested above; treat a missing one as a
                // failed start and make sure the child goes away.
                error!("[{}] Process started without stdout/stderr pipes", name);
                tokio::spawn(supervisor.abort(child));
            }
        }

        let handle = ProcessHandle {
            name: name.to_string(),
            pid,
            alive,
            stop_tx: Some(stop_tx),
        };
        (handle, event_rx)
    }
}

struct Supervisor {
    name: String,
    options: SpawnOptions,
    alive: Arc<AtomicBool>,
    events: mpsc::Sender<TranscoderEvent>,
}

impl Supervisor {
    async fn run(
        self,
        mut child: Child,
        mut stdout: tokio::process::ChildStdout,
        stderr: tokio::process::ChildStderr,
        mut stop_rx: oneshot::Receiver<()>,
    ) {
        let mut stderr_lines = StderrLines::new(stderr);
        let mut stderr_open = true;
        let mut buf = BytesMut::with_capacity(self.options.chunk_read_size);
        let mut bytes_read = 0u64;

        let stop_requested = loop {
            if buf.capacity() < self.options.chunk_read_size {
                buf.reserve(self.options.chunk_read_size);
            }

            tokio::select! {
                biased;
                // Resolves on an explicit stop and when the handle is dropped.
                _ = &mut stop_rx => break true,
                read = stdout.read_buf(&mut buf) => match read {
                    Ok(0) => break false,
                    Ok(n) => {
                        bytes_read += n as u64;
                        let chunk = buf.split().freeze();
                        // Awaiting capacity here is what throttles ffmpeg when
                        // the session falls behind.
                        if self.events.send(TranscoderEvent::Data(chunk)).await.is_err() {
                            debug!("[{}] Event receiver dropped, stopping", self.name);
                            break true;
                        }
                    }
                    Err(e) => {
                        warn!("[{}] Error reading stdout: {}", self.name, e);
                        break false;
                    }
                },
                line = stderr_lines.next_line(), if stderr_open => match line {
                    Ok(Some(line)) => {
                        if self.options.log_stderr {
                            info!("[{}] stderr: {}", self.name, line);
                        } else {
                            debug!("[{}] stderr: {}", self.name, line);
                        }
                        let _ = self.events.try_send(TranscoderEvent::Stderr(line));
                    }
                    Ok(None) => stderr_open = false,
                    Err(e) => {
                        debug!("[{}] Error reading stderr: {}", self.name, e);
                        stderr_open = false;
                    }
                },
            }
        };

        if stop_requested {
            self.terminate(&mut child).await;
            return;
        }

        let status = child.wait().await;
        self.alive.store(false, Ordering::SeqCst);
        let (code, was_error) = match status {
            Ok(status) => (status.code(), !status.success()),
            Err(e) => {
                error!("[{}] Failed to wait for process: {}", self.name, e);
                (None, true)
            }
        };

        if was_error {
            warn!("[{}] Process exited with code {:?} after {} bytes", self.name, code, bytes_read);
        } else {
            info!("[{}] Process exited cleanly after {} bytes", self.name, bytes_read);
        }
        let _ = self.events.send(TranscoderEvent::Exited { code, was_error }).await;
    }

    /// SIGTERM was already sent by the handle; wait, then force-kill.
    async fn terminate(&self, child: &mut Child) {
        #[cfg(not(unix))]
        let _ = child.start_kill();

        match tokio::time::timeout(self.options.stop_timeout, child.wait()).await {
            Ok(Ok(status)) => {
                debug!("[{}] Process terminated with {:?}", self.name, status.code());
            }
            Ok(Err(e)) => {
                error!("[{}] Error waiting for process: {}", self.name, e);
            }
            Err(_) => {
                warn!(
                    "[{}] Process did not exit within {:?}, forcing kill",
                    self.name, self.options.stop_timeout
                );
                if let Err(e) = child.kill().await {
                    error!("[{}] Failed to kill process: {}", self.name, e);
                }
            }
        }
        self.alive.store(false, Ordering::SeqCst);
    }

    async fn abort(self, mut child: Child) {
        let _ = child.kill().await;
        self.alive.store(false, Ordering::SeqCst);
        let _ = self.events.send(TranscoderEvent::Exited { code: None, was_error: true }).await;
    }
}

const MAX_STDERR_LINE: usize = 4096;

/// Splits a diagnostic stream into lines on `\n` or `\r` (ffmpeg progress
/// output only uses `\r`). Lines are decoded lossily and cut at
/// `MAX_STDERR_LINE` bytes, so any byte sequence keeps the pipe draining.
struct StderrLines<R> {
    reader: BufReader<R>,
    line: Vec<u8>,
}

impl<R: AsyncRead + Unpin> StderrLines<R> {
    fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            line: Vec::new(),
        }
    }

    /// Next non-empty line, `None` at EOF.
    ///
    /// Cancel safe: a partial line stays buffered until the next call.
    async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                if self.line.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(self.take_line()));
            }

            let room = MAX_STDERR_LINE - self.line.len();
            let (take, used, complete) = match available.iter().position(|b| matches!(b, b'\n' | b'\r')) {
                Some(end) if end <= room => (end, end + 1, true),
                _ => {
                    let n = available.len().min(room);
                    (n, n, false)
                }
            };
            self.line.extend_from_slice(&available[..take]);
            self.reader.consume(used);

            if complete || self.line.len() >= MAX_STDERR_LINE {
                if self.line.is_empty() {
                    continue;
                }
                return Ok(Some(self.take_line()));
            }
        }
    }

    fn take_line(&mut self) -> String {
        let line = String::from_utf8_lossy(&self.line).into_owned();
        self.line.clear();
        line
    }
}

/// Builds ffmpeg invocations that turn an RTSP source into an MJPEG byte stream.
#[derive(Debug, Clone)]
pub struct Transcoder {
    config: TranscodingConfig,
    spawner: ProcessSpawner,
}

impl Transcoder {
    pub fn new(config: TranscodingConfig, spawner: ProcessSpawner) -> Self {
        Self { config, spawner }
    }

    pub fn start(&self, name: &str, source_url: &str, output: &OutputSpec) -> (ProcessHandle, mpsc::Receiver<TranscoderEvent>) {
        let args = self.build_args(source_url, output);
        info!(
            "[{}] Starting {} for {} ({} @ {} fps, q={})",
            name,
            self.config.ffmpeg_path,
            mask_credentials(source_url),
            output.resolution(),
            output.framerate,
            output.quality
        );
        self.spawner.spawn(name, &self.config.ffmpeg_path, &args)
    }

    pub fn build_args(&self, source_url: &str, output: &OutputSpec) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-loglevel".into(), self.config.loglevel.clone(),
            "-rtsp_transport".into(), self.config.rtsp_transport.clone(),
        ];
        if self.config.rtsp_transport == "tcp" {
            args.extend(["-rtsp_flags".to_string(), "prefer_tcp".to_string()]);
        }
        args.extend(["-rw_timeout".to_string(), self.config.rw_timeout_us.to_string()]);
        args.extend(self.config.extra_input_args.iter().cloned());

        args.extend([
            "-i".to_string(), source_url.to_string(),
            "-f".to_string(), output.format.clone(),
            "-q:v".to_string(), output.quality.to_string(),
            "-r".to_string(), output.framerate.to_string(),
            "-s".to_string(), output.resolution(),
            "-an".to_string(),
        ]);
        args.extend(self.config.extra_output_args.iter().cloned());
        args.push("-".to_string());
        args
    }
}
