//! Task Queue Manager: named FIFO queues of free-form task descriptions, driven
//! iteratively through a session, persisted to `queues.json`. Grounded on the
//! teacher's `Priority`/`Task`/`TaskResult` builder shapes (`agent/task.rs`,
//! renamed here to `QueuedTask`) and the `tokio::select!`-driven run loop in
//! `orchestrator/mod.rs`, generalized from an agent message bus to a single
//! session exchange per task.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::CoreConfig;
use crate::error::QueueError;
use crate::session::SessionRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedTask {
    pub id: String,
    pub queue: String,
    pub description: String,
    pub project: String,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub status: TaskStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub retry_count: u32,
}

impl QueuedTask {
    fn new(queue: &str, description: String, project: &str, priority: Priority) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            queue: queue.to_string(),
            description,
            project: project.to_string(),
            priority,
            created_at: Utc::now(),
            status: TaskStatus::Pending,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            retry_count: 0,
        }
    }
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<QueuedTask>,
    history: VecDeque<QueuedTask>,
    running: bool,
    cancel: Option<tokio_util::sync::CancellationToken>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub name: String,
    pub pending: usize,
    pub completed: usize,
    pub failed: usize,
    pub running: bool,
}

#[derive(Serialize, Deserialize)]
struct PersistedQueue {
    pending: Vec<QueuedTask>,
    history: Vec<QueuedTask>,
}

#[derive(Serialize, Deserialize)]
struct PersistedFile {
    version: u32,
    queues: HashMap<String, PersistedQueue>,
}

/// Owns every named queue. Per-queue runs are serialized by `QueueState.running`
/// plus the per-queue lock the `DashMap` entry API gives us; persistence writes
/// are debounced and atomic (write-temp, then rename).
pub struct TaskQueueManager {
    queues: Arc<DashMap<String, Arc<Mutex<QueueState>>>>,
    data_dir: PathBuf,
    history_cap: usize,
    max_retries: u32,
    registry: Arc<SessionRegistry>,
    debounce: Duration,
    /// Set while a debounced write is pending (sleeping or in flight); guards
    /// against `persist()` spawning a second coalescing task while one is
    /// already waiting out the quiet window for the same burst of changes.
    write_scheduled: Arc<AtomicBool>,
}

impl TaskQueueManager {
    pub fn new(config: &CoreConfig, registry: Arc<SessionRegistry>) -> Self {
        Self {
            queues: Arc::new(DashMap::new()),
            data_dir: config.data_dir.clone(),
            history_cap: config.queue.history_cap,
            max_retries: config.queue.max_retries,
            registry,
            debounce: config.queue.debounce,
            write_scheduled: Arc::new(AtomicBool::new(false)),
        }
    }

    fn entry(&self, name: &str) -> Arc<Mutex<QueueState>> {
        self.queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(QueueState::default())))
            .clone()
    }

    pub async fn add(
        &self,
        queue: &str,
        description: String,
        project: &str,
        priority: Priority,
    ) -> Result<String, QueueError> {
        if description.trim().is_empty() {
            return Err(QueueError::UnknownQueue(
                "task description must not be empty".to_string(),
            ));
        }
        let task = QueuedTask::new(queue, description, project, priority);
        let id = task.id.clone();
        let state = self.entry(queue);
        let mut state = state.lock().await;
        let insert_at = state
            .pending
            .iter()
            .position(|t| t.priority < task.priority)
            .unwrap_or(state.pending.len());
        state.pending.insert(insert_at, task);
        drop(state);
        self.persist().await;
        Ok(id)
    }

    /// Run every pending task in `queue` sequentially through a session for its
    /// project, stopping on the first unrecoverable failure. Returns the
    /// finished tasks in execution order.
    pub async fn run(&self, queue: &str) -> Result<Vec<QueuedTask>, QueueError> {
        self.run_with_progress(queue, None).await
    }

    /// Same as `run`, but emits one progress line per finished task onto
    /// `progress` as it happens, in execution order, for a caller (the router)
    /// to forward to the chat transport.
    pub async fn run_with_progress(
        &self,
        queue: &str,
        progress: Option<tokio::sync::mpsc::UnboundedSender<String>>,
    ) -> Result<Vec<QueuedTask>, QueueError> {
        let state = match self.queues.get(queue) {
            Some(entry) => entry.clone(),
            None => return Err(QueueError::UnknownQueue(queue.to_string())),
        };

        let cancel = tokio_util::sync::CancellationToken::new();
        {
            let mut guard = state.lock().await;
            if guard.running {
                return Err(QueueError::QueueBusy(queue.to_string()));
            }
            guard.running = true;
            guard.cancel = Some(cancel.clone());
        }

        let mut finished = Vec::new();
        let result = self
            .run_inner(&state, queue, &mut finished, &progress, &cancel)
            .await;

        let mut guard = state.lock().await;
        guard.running = false;
        guard.cancel = None;
        drop(guard);
        self.persist().await;
        result.map(|_| finished)
    }

    /// Cancel the in-flight run of `queue`, if any: the task currently
    /// executing is marked `Cancelled` and the queue lock is released once the
    /// in-flight session exchange returns. A no-op if `queue` has no active run.
    pub async fn cancel(&self, queue: &str) -> Result<(), QueueError> {
        let state = self
            .queues
            .get(queue)
            .map(|e| e.clone())
            .ok_or_else(|| QueueError::UnknownQueue(queue.to_string()))?;
        if let Some(token) = state.lock().await.cancel.clone() {
            token.cancel();
        }
        Ok(())
    }

    async fn run_inner(
        &self,
        state: &Arc<Mutex<QueueState>>,
        queue: &str,
        finished: &mut Vec<QueuedTask>,
        progress: &Option<tokio::sync::mpsc::UnboundedSender<String>>,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<(), QueueError> {
        loop {
            let mut task = {
                let mut guard = state.lock().await;
                match guard.pending.pop_front() {
                    Some(t) => t,
                    None => break,
                }
            };

            task.status = TaskStatus::Running;
            task.started_at = Some(Utc::now());
            info!(queue, task = %task.id, "running queued task");

            // `execute_one_shot_cancellable` races the exchange against
            // `cancel` internally and always terminates the handler it spawns
            // before returning, on every branch — so there is no outer
            // `tokio::select!` here to drop that future (and its subprocess)
            // mid-flight.
            let outcome = self
                .registry
                .execute_one_shot_cancellable(&task.project, &task.description, None, cancel)
                .await;

            task.completed_at = Some(Utc::now());

            if cancel.is_cancelled() {
                task.status = TaskStatus::Cancelled;
                warn!(queue, task = %task.id, "queue run cancelled");
                if let Some(tx) = progress {
                    let _ = tx.send(format!("[{queue}] cancelled: {}", task.description));
                }
                self.finish(state, task.clone()).await;
                finished.push(task);
                return Ok(());
            }

            match outcome {
                Ok(output) => {
                    task.status = TaskStatus::Completed;
                    task.result = Some(output);
                    if let Some(tx) = progress {
                        let _ = tx.send(format!("[{queue}] completed: {}", task.description));
                    }
                    self.finish(state, task.clone()).await;
                    finished.push(task);
                }
                Err(e) => {
                    task.error = Some(e.to_string());
                    if task.retry_count < self.max_retries {
                        task.retry_count += 1;
                        task.status = TaskStatus::Pending;
                        task.started_at = None;
                        task.completed_at = None;
                        warn!(queue, task = %task.id, retry = task.retry_count, "task failed, retrying");
                        state.lock().await.pending.push_front(task);
                        continue;
                    }
                    task.status = TaskStatus::Failed;
                    warn!(queue, task = %task.id, error = %e, "task failed, pausing queue");
                    if let Some(tx) = progress {
                        let _ = tx.send(format!("[{queue}] failed: {}", task.description));
                    }
                    self.finish(state, task.clone()).await;
                    finished.push(task);
                    return Err(QueueError::Session(e));
                }
            }
        }
        Ok(())
    }

    async fn finish(&self, state: &Arc<Mutex<QueueState>>, task: QueuedTask) {
        let mut guard = state.lock().await;
        guard.history.push_back(task);
        while guard.history.len() > self.history_cap {
            guard.history.pop_front();
        }
    }

    pub async fn status(&self, queue: &str) -> Result<QueueStatus, QueueError> {
        let state = self
            .queues
            .get(queue)
            .map(|e| e.clone())
            .ok_or_else(|| QueueError::UnknownQueue(queue.to_string()))?;
        let guard = state.lock().await;
        let completed = guard
            .history
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .count();
        let failed = guard
            .history
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .count();
        Ok(QueueStatus {
            name: queue.to_string(),
            pending: guard.pending.len(),
            completed,
            failed,
            running: guard.running,
        })
    }

    pub async fn status_all(&self) -> Vec<QueueStatus> {
        let mut out = Vec::new();
        for item in self.queues.iter() {
            if let Ok(status) = self.status(item.key()).await {
                out.push(status);
            }
        }
        out
    }

    pub async fn clear(&self, queue: &str) -> Result<(), QueueError> {
        let state = self
            .queues
            .get(queue)
            .map(|e| e.clone())
            .ok_or_else(|| QueueError::UnknownQueue(queue.to_string()))?;
        state.lock().await.pending.clear();
        self.persist().await;
        Ok(())
    }

    /// Request a write of `queues.json`. Rather than writing immediately, this
    /// schedules a single coalescing write `config.queue.debounce` from now
    /// (default ~500ms): if a write is already scheduled for the current
    /// burst of changes, this call is a no-op, and the eventual write picks up
    /// whatever state exists when it actually runs. Callers that need the
    /// write to have landed on disk before proceeding (startup/shutdown,
    /// tests) should use `flush` instead.
    pub async fn persist(&self) {
        if self.write_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let queues = self.queues.clone();
        let data_dir = self.data_dir.clone();
        let write_scheduled = self.write_scheduled.clone();
        let debounce = self.debounce;
        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            let result = write_snapshot(&queues, &data_dir).await;
            // Reset only after the write lands, so changes arriving mid-write
            // are coalesced into the *next* scheduled write instead of racing
            // it with a second one.
            write_scheduled.store(false, Ordering::SeqCst);
            if let Err(e) = result {
                warn!(error = %e, "failed to persist queue state");
            }
        });
    }

    /// Write `queues.json` immediately, bypassing the debounce window.
    pub async fn flush(&self) {
        if let Err(e) = write_snapshot(&self.queues, &self.data_dir).await {
            warn!(error = %e, "failed to persist queue state");
        }
    }

    /// Rehydrate queues from `queues.json`, if present. Any task left
    /// `Running` from a prior crash is reset to `Pending`.
    pub async fn load(&self, data_dir: &Path) -> Result<(), QueueError> {
        let path = data_dir.join("queues.json");
        if !path.exists() {
            return Ok(());
        }
        let bytes = tokio::fs::read(&path).await?;
        let payload: PersistedFile = serde_json::from_slice(&bytes)?;
        for (name, persisted) in payload.queues {
            let mut state = QueueState::default();
            for mut task in persisted.pending {
                if task.status == TaskStatus::Running {
                    task.status = TaskStatus::Pending;
                    task.started_at = None;
                }
                state.pending.push_back(task);
            }
            state.history = persisted.history.into_iter().collect();
            self.queues
                .insert(name, Arc::new(Mutex::new(state)));
        }
        Ok(())
    }
}

/// Serialize every queue's current state to `queues.json` atomically (write a
/// temp file in the same directory, then rename). Free function rather than a
/// method so `TaskQueueManager::persist`'s debounce task can run it against a
/// cloned `Arc<DashMap<..>>` without holding a reference to the manager.
async fn write_snapshot(
    queues: &DashMap<String, Arc<Mutex<QueueState>>>,
    data_dir: &Path,
) -> Result<(), QueueError> {
    let mut out = HashMap::new();
    for item in queues.iter() {
        let guard = item.value().lock().await;
        out.insert(
            item.key().clone(),
            PersistedQueue {
                pending: guard.pending.iter().cloned().collect(),
                history: guard.history.iter().cloned().collect(),
            },
        );
    }
    let payload = PersistedFile { version: 1, queues: out };
    let json = serde_json::to_vec_pretty(&payload)?;

    tokio::fs::create_dir_all(data_dir).await?;
    let final_path = data_dir.join("queues.json");
    let tmp_path = final_path.with_extension("json.tmp");
    tokio::fs::write(&tmp_path, &json).await?;
    tokio::fs::rename(&tmp_path, &final_path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProjectConfig;
    use std::collections::HashMap as StdHashMap;
    use std::path::PathBuf;

    fn test_config(dir: &std::path::Path) -> CoreConfig {
        let mut projects = StdHashMap::new();
        projects.insert(
            "proj".to_string(),
            ProjectConfig {
                path: dir.to_path_buf(),
                description: None,
            },
        );
        let mut cfg = CoreConfig {
            projects,
            data_dir: dir.to_path_buf(),
            ..Default::default()
        };
        cfg.assistant.executable = PathBuf::from("/bin/cat");
        cfg.assistant.startup_probe = Duration::from_millis(20);
        cfg
    }

    #[tokio::test]
    async fn add_orders_by_priority_then_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new(test_config(dir.path()));
        let mgr = TaskQueueManager::new(&test_config(dir.path()), registry);
        mgr.add("q", "low one".to_string(), "proj", Priority::Low)
            .await
            .unwrap();
        mgr.add("q", "high one".to_string(), "proj", Priority::High)
            .await
            .unwrap();
        mgr.add("q", "low two".to_string(), "proj", Priority::Low)
            .await
            .unwrap();

        let state = mgr.entry("q");
        let guard = state.lock().await;
        let order: Vec<&str> = guard.pending.iter().map(|t| t.description.as_str()).collect();
        assert_eq!(order, vec!["high one", "low one", "low two"]);
    }

    #[tokio::test]
    async fn status_on_unknown_queue_errors() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new(test_config(dir.path()));
        let mgr = TaskQueueManager::new(&test_config(dir.path()), registry);
        assert!(matches!(
            mgr.status("ghost").await,
            Err(QueueError::UnknownQueue(_))
        ));
    }

    #[tokio::test]
    async fn persist_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let registry = SessionRegistry::new(cfg.clone());
        let mgr = TaskQueueManager::new(&cfg, registry.clone());
        mgr.add("q", "task a".to_string(), "proj", Priority::Medium)
            .await
            .unwrap();
        // `add` already scheduled a debounced write; `flush` forces it to land
        // immediately so this test doesn't depend on the debounce window.
        mgr.flush().await;

        let mgr2 = TaskQueueManager::new(&cfg, registry);
        mgr2.load(dir.path()).await.unwrap();
        let status = mgr2.status("q").await.unwrap();
        assert_eq!(status.pending, 1);
    }

    #[tokio::test]
    async fn persist_coalesces_a_burst_into_one_debounced_write() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        cfg.queue.debounce = Duration::from_millis(50);
        let registry = SessionRegistry::new(cfg.clone());
        let mgr = TaskQueueManager::new(&cfg, registry);

        // Three state changes in quick succession should schedule a single
        // debounced write, not three immediate ones.
        mgr.add("q", "a".to_string(), "proj", Priority::Medium)
            .await
            .unwrap();
        mgr.add("q", "b".to_string(), "proj", Priority::Medium)
            .await
            .unwrap();
        mgr.add("q", "c".to_string(), "proj", Priority::Medium)
            .await
            .unwrap();

        assert!(
            !dir.path().join("queues.json").exists(),
            "write should not have landed before the debounce window elapses"
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(
            dir.path().join("queues.json").exists(),
            "debounced write should land once the quiet window elapses"
        );

        let bytes = tokio::fs::read(dir.path().join("queues.json")).await.unwrap();
        let payload: PersistedFile = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(payload.queues["q"].pending.len(), 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancel_stops_an_in_flight_run() {
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let pidfile = dir.path().join("hang.pid");
        let script = dir.path().join("hang.sh");
        let mut file = std::fs::File::create(&script).unwrap();
        // Reads one line (the queued task's text), records its own pid, then
        // `exec`s into `sleep` so the pid tokio tracks as the child process
        // is the one that must die when cancellation runs `terminate()`.
        writeln!(
            file,
            "#!/bin/sh\nread line\necho $$ > {}\nexec sleep 30",
            pidfile.display()
        )
        .unwrap();
        let mut perms = std::fs::metadata(&script).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script, perms).unwrap();

        let mut cfg = test_config(dir.path());
        cfg.assistant.executable = script;
        cfg.assistant.grace_window = Duration::from_millis(300);
        cfg.queue.task_timeout = Duration::from_secs(30);
        let registry = SessionRegistry::new(cfg.clone());
        let mgr = Arc::new(TaskQueueManager::new(&cfg, registry));
        mgr.add("q", "hang".to_string(), "proj", Priority::Medium)
            .await
            .unwrap();

        let run_handle = tokio::spawn({
            let mgr = mgr.clone();
            async move { mgr.run("q").await }
        });

        let pid: u32 = loop {
            if let Ok(contents) = tokio::fs::read_to_string(&pidfile).await {
                if let Ok(pid) = contents.trim().parse() {
                    break pid;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        };

        mgr.cancel("q").await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), run_handle)
            .await
            .expect("cancel should unblock the run promptly")
            .unwrap();
        assert!(result.is_ok());

        let status = mgr.status("q").await.unwrap();
        assert_eq!(status.pending, 0);

        use nix::sys::signal::kill;
        use nix::unistd::Pid;
        assert!(
            kill(Pid::from_raw(pid as i32), None).is_err(),
            "cancelled task's process {pid} should have been killed, not leaked"
        );
    }
}
