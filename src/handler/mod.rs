//! The Assistant Handler: owns one child process of the assistant CLI, mediates
//! its stdin/stdout/stderr, and exposes streaming and single-shot execution.
//!
//! Grounded on the session-state shape in `ai-session`'s core module and the
//! broadcast-plus-ring-buffer streaming pattern the teacher's monitoring system
//! uses to fan output out to subscribers while bounding memory.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AssistantConfig;
use crate::error::HandlerError;

/// A marker the assistant CLI may print to signal it is done with a turn and
/// ready for the next prompt. Not every build of every assistant CLI emits
/// this; when absent, completion falls back to the idle-quiet-window heuristic.
pub const PROMPT_READY_MARKER: &str = "\u{2726} ready";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Idle,
    Starting,
    Running,
    Processing,
    Terminating,
    Terminated,
    Error,
}

/// One unit of output delivered to stream/execute subscribers.
#[derive(Debug, Clone)]
pub enum Chunk {
    Text(String),
    /// A `stream-json` object reporting the assistant's own session id.
    ExternalSessionId(String),
    /// The handler reached a completion marker or went idle after output.
    TurnComplete,
    /// The underlying process exited; no more chunks will follow.
    End,
}

#[derive(Debug, Clone)]
pub struct HandlerHealth {
    pub running: bool,
    pub exit_code: Option<i32>,
    pub uptime: Duration,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub external_session_id: Option<String>,
}

struct RingBuffer {
    lines: VecDeque<String>,
    cap: usize,
}

impl RingBuffer {
    fn new(cap: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(cap.min(64)),
            cap: cap.max(1),
        }
    }

    fn push(&mut self, line: String) {
        if self.lines.len() >= self.cap {
            // Coalesce instead of dropping: merge the two oldest entries so
            // history shrinks without losing any bytes.
            if let (Some(a), Some(b)) = (self.lines.pop_front(), self.lines.pop_front()) {
                self.lines.push_front(format!("{a}{b}"));
            }
        }
        self.lines.push_back(line);
    }
}

pub struct AssistantHandler {
    state: RwLock<HandlerState>,
    config: AssistantConfig,
    project_dir: PathBuf,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<tokio::process::ChildStdin>>,
    chunk_tx: broadcast::Sender<Chunk>,
    history: Mutex<RingBuffer>,
    stderr_tail: Mutex<String>,
    cancel: CancellationToken,
    reader_tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    started_at: Instant,
    exit_code: AtomicI32,
    exited: AtomicBool,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    external_session_id: RwLock<Option<String>>,
}

const NO_EXIT_CODE: i32 = i32::MIN;

impl AssistantHandler {
    /// Spawn the assistant CLI in `project_dir`. Fails with `StartupError` if
    /// the executable or directory is missing, or the process exits within a
    /// short startup probe window.
    pub async fn start(
        config: AssistantConfig,
        project_dir: PathBuf,
        resume_id: Option<String>,
        continue_last: bool,
        model: Option<String>,
    ) -> Result<Arc<Self>, HandlerError> {
        if !project_dir.exists() {
            return Err(HandlerError::StartupError(format!(
                "project directory does not exist: {}",
                project_dir.display()
            )));
        }

        let mut cmd = Command::new(&config.executable);
        cmd.args(&config.default_args)
            .current_dir(&project_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if config.output_format != "text" {
            cmd.arg("--output-format").arg(&config.output_format);
        }
        if let Some(model) = &model {
            cmd.arg("--model").arg(model);
        }
        match (&resume_id, continue_last) {
            (Some(id), _) => {
                cmd.arg("--resume").arg(id);
            }
            (None, true) => {
                cmd.arg("--continue");
            }
            _ => {}
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| HandlerError::StartupError(e.to_string()))?;

        // Startup probe: give the process a short window to prove it did not
        // immediately exit (missing dependency, bad arguments, etc.).
        tokio::select! {
            status = child.wait() => {
                let code = status.map(|s| s.code()).unwrap_or(None);
                return Err(HandlerError::StartupError(format!(
                    "process exited immediately with code {code:?}"
                )));
            }
            _ = tokio::time::sleep(config.startup_probe) => {}
        }

        let stdin = child.stdin.take();
        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        let (chunk_tx, _rx) = broadcast::channel(config.output_buffer_cap.max(16));

        let handler = Arc::new(Self {
            state: RwLock::new(HandlerState::Running),
            config: config.clone(),
            project_dir,
            child: Mutex::new(Some(child)),
            stdin: Mutex::new(stdin),
            chunk_tx,
            history: Mutex::new(RingBuffer::new(config.output_buffer_cap)),
            stderr_tail: Mutex::new(String::new()),
            cancel: CancellationToken::new(),
            reader_tasks: Mutex::new(Vec::new()),
            started_at: Instant::now(),
            exit_code: AtomicI32::new(NO_EXIT_CODE),
            exited: AtomicBool::new(false),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            external_session_id: RwLock::new(None),
        });

        let stdout_task = tokio::spawn(Self::read_stdout(handler.clone(), stdout));
        let stderr_task = tokio::spawn(Self::read_stderr(handler.clone(), stderr));
        handler
            .reader_tasks
            .lock()
            .await
            .extend([stdout_task, stderr_task]);

        info!(project = %handler.project_dir.display(), "assistant handler started");
        Ok(handler)
    }

    async fn read_stdout(self: Arc<Self>, stdout: tokio::process::ChildStdout) {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            self.bytes_out.fetch_add(line.len() as u64 + 1, Ordering::Relaxed);
                            self.on_stdout_line(line).await;
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(error = %e, "error reading assistant stdout");
                            break;
                        }
                    }
                }
            }
        }
        self.reap().await;
        let _ = self.chunk_tx.send(Chunk::End);
        debug!("stdout reader task finished");
    }

    async fn on_stdout_line(&self, line: String) {
        if line == PROMPT_READY_MARKER {
            let _ = self.chunk_tx.send(Chunk::TurnComplete);
            return;
        }
        if self.config.output_format == "stream-json" {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(&line) {
                if let Some(id) = value.get("session_id").and_then(|v| v.as_str()) {
                    *self.external_session_id.write().await = Some(id.to_string());
                    let _ = self.chunk_tx.send(Chunk::ExternalSessionId(id.to_string()));
                }
            } else {
                debug!(%line, "non-JSON line in stream-json mode, passing through");
            }
        }
        self.history.lock().await.push(line.clone());
        let _ = self.chunk_tx.send(Chunk::Text(line));
    }

    async fn read_stderr(self: Arc<Self>, stderr: tokio::process::ChildStderr) {
        const MAX_STDERR_TAIL: usize = 64 * 1024;
        let mut lines = BufReader::new(stderr).lines();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            let mut tail = self.stderr_tail.lock().await;
                            tail.push_str(&line);
                            tail.push('\n');
                            if tail.len() > MAX_STDERR_TAIL {
                                let excess = tail.len() - MAX_STDERR_TAIL;
                                tail.drain(0..excess);
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(error = %e, "error reading assistant stderr");
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn reap(&self) {
        if self.exited.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            if let Ok(Some(status)) = child.try_wait() {
                self.exit_code
                    .store(status.code().unwrap_or(NO_EXIT_CODE), Ordering::SeqCst);
            }
        }
        let mut state = self.state.write().await;
        if *state == HandlerState::Running || *state == HandlerState::Processing {
            *state = HandlerState::Error;
            error!("assistant process exited unexpectedly");
        }
    }

    /// Write `text` followed by a newline to stdin. Requires the handler to be
    /// `Running`.
    pub async fn send(&self, text: &str) -> Result<(), HandlerError> {
        if text.len() > self.config.max_input_len {
            return Err(HandlerError::InputTooLarge {
                len: text.len(),
                max: self.config.max_input_len,
            });
        }
        let state = *self.state.read().await;
        if state != HandlerState::Running && state != HandlerState::Processing {
            return Err(HandlerError::NotRunning);
        }
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(HandlerError::NotRunning)?;
        stdin.write_all(text.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        self.bytes_in
            .fetch_add(text.len() as u64 + 1, Ordering::Relaxed);
        *self.state.write().await = HandlerState::Processing;
        Ok(())
    }

    /// Subscribe to this handler's output stream. Each subscription is
    /// independent; chunks are delivered in parse order.
    pub fn stream(&self) -> broadcast::Receiver<Chunk> {
        self.chunk_tx.subscribe()
    }

    /// Single-shot exchange: send `text`, then collect chunks until a
    /// completion marker, an idle window with no new output, or `timeout`
    /// elapses, whichever comes first.
    pub async fn execute(&self, text: &str, timeout: Duration) -> Result<String, HandlerError> {
        self.run_turn(text, timeout, None).await
    }

    /// Like `execute`, but also forwards each text chunk to `on_chunk` as it
    /// is parsed, rather than only handing back the fully collected reply
    /// once the turn ends. Callers that need to pipe output back to a chat
    /// transport incrementally (SPEC_FULL.md §4.3) should use this instead of
    /// `execute` plus a post-hoc split of the joined string.
    pub async fn execute_streaming(
        &self,
        text: &str,
        timeout: Duration,
        on_chunk: &tokio::sync::mpsc::UnboundedSender<String>,
    ) -> Result<String, HandlerError> {
        self.run_turn(text, timeout, Some(on_chunk)).await
    }

    async fn run_turn(
        &self,
        text: &str,
        timeout: Duration,
        on_chunk: Option<&tokio::sync::mpsc::UnboundedSender<String>>,
    ) -> Result<String, HandlerError> {
        let mut rx = self.stream();
        self.send(text).await?;

        let deadline = Instant::now() + timeout;
        let mut collected = String::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(HandlerError::Timeout(timeout));
            }
            let idle_wait = self.config.idle_quiet_window.min(remaining);
            match tokio::time::timeout(idle_wait, rx.recv()).await {
                Ok(Ok(Chunk::Text(line))) => {
                    if let Some(tx) = on_chunk {
                        let _ = tx.send(line.clone());
                    }
                    collected.push_str(&line);
                    collected.push('\n');
                }
                Ok(Ok(Chunk::TurnComplete)) => break,
                Ok(Ok(Chunk::End)) => break,
                Ok(Ok(Chunk::ExternalSessionId(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) => break,
                Err(_elapsed) => {
                    // idle-quiet-window fallback: no output arrived within the
                    // window; if we have collected anything, treat the turn as
                    // done rather than waiting out the full timeout.
                    if !collected.is_empty() {
                        break;
                    }
                }
            }
        }
        *self.state.write().await = HandlerState::Running;
        Ok(collected)
    }

    /// Close stdin and send a graceful termination signal; escalate to a
    /// forceful kill if the process does not exit within the configured grace
    /// window. Idempotent.
    pub async fn terminate(&self) -> Result<(), HandlerError> {
        {
            let mut state = self.state.write().await;
            if *state == HandlerState::Terminated {
                return Ok(());
            }
            *state = HandlerState::Terminating;
        }
        self.cancel.cancel();
        self.stdin.lock().await.take();

        let pid = {
            let guard = self.child.lock().await;
            guard.as_ref().and_then(|c| c.id())
        };

        if let Some(pid) = pid {
            send_graceful_signal(pid);
        }

        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            match tokio::time::timeout(self.config.grace_window, child.wait()).await {
                Ok(Ok(status)) => {
                    self.exit_code
                        .store(status.code().unwrap_or(NO_EXIT_CODE), Ordering::SeqCst);
                }
                Ok(Err(e)) => warn!(error = %e, "error waiting for assistant process exit"),
                Err(_) => {
                    warn!("grace window elapsed, killing assistant process forcefully");
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                }
            }
        }
        self.exited.store(true, Ordering::SeqCst);

        for task in self.reader_tasks.lock().await.drain(..) {
            let _ = task.await;
        }

        *self.state.write().await = HandlerState::Terminated;
        info!("assistant handler terminated");
        Ok(())
    }

    pub async fn health(&self) -> HandlerHealth {
        let running = *self.state.read().await == HandlerState::Running
            || *self.state.read().await == HandlerState::Processing;
        let code = self.exit_code.load(Ordering::SeqCst);
        HandlerHealth {
            running,
            exit_code: if code == NO_EXIT_CODE { None } else { Some(code) },
            uptime: self.started_at.elapsed(),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            external_session_id: self.external_session_id.read().await.clone(),
        }
    }

    pub async fn state(&self) -> HandlerState {
        *self.state.read().await
    }

    pub async fn stderr_tail(&self) -> String {
        self.stderr_tail.lock().await.clone()
    }
}

#[cfg(unix)]
fn send_graceful_signal(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        warn!(error = %e, pid, "failed to send SIGTERM");
    }
}

#[cfg(not(unix))]
fn send_graceful_signal(_pid: u32) {}
