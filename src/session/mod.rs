//! Session Registry: owns the set of active sessions and their handlers,
//! enforces the session cap, and reaps idle sessions. Grounded on the teacher's
//! `PersistentSessionManager` (config shape, reaper loop, cap enforcement);
//! defaults are adjusted to match this crate's spec (60 minute idle timeout,
//! not the teacher's 5 minutes).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{AssistantConfig, CoreConfig};
use crate::error::SessionError;
use crate::handler::AssistantHandler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SessionId {
    type Err = uuid::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone)]
pub struct ConversationEntry {
    pub role: Role,
    pub content: String,
    pub at: DateTime<Utc>,
}

pub struct Session {
    pub id: SessionId,
    pub project_name: String,
    pub project_dir: PathBuf,
    pub created_at: DateTime<Utc>,
    pub last_activity: RwLock<DateTime<Utc>>,
    pub conversation: RwLock<Vec<ConversationEntry>>,
    pub active: std::sync::atomic::AtomicBool,
    pub handler: Arc<AssistantHandler>,
}

#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub project_name: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub active: bool,
    pub conversation_length: usize,
}

/// Owns every live session. This is the sole owner of `Session`/`AssistantHandler`
/// instances; handlers never hold a back-reference to the registry or to each
/// other (see SPEC_FULL.md §9's guidance on breaking handler<->session cycles).
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    current: RwLock<Option<SessionId>>,
    config: CoreConfig,
    /// Slots reserved or held by a live session. Incremented atomically before
    /// any await point in `create`, so the `max_sessions` cap check and the
    /// reservation happen as one step, closing the race a read-lock-then-insert
    /// sequence would leave open across the handler's startup I/O. Shared with
    /// the per-session health watcher task, so it is an `Arc`.
    active_slots: Arc<AtomicUsize>,
}

impl SessionRegistry {
    pub fn new(config: CoreConfig) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            current: RwLock::new(None),
            config,
            active_slots: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Release a reserved/held slot if `session` was still marked active,
    /// returning whether a transition happened. Shared by `terminate` and the
    /// health watcher so a session is never double-released.
    fn deactivate(active_slots: &AtomicUsize, session: &Session) -> bool {
        let was_active = session.active.swap(false, Ordering::SeqCst);
        if was_active {
            active_slots.fetch_sub(1, Ordering::SeqCst);
        }
        was_active
    }

    /// Resolve a configured project directory by name, falling back to
    /// treating `name` itself as a directory if no project set is configured.
    fn resolve_project(&self, name: &str) -> Result<PathBuf, SessionError> {
        if let Some(project) = self.config.projects.get(name) {
            return Ok(project.path.clone());
        }
        if self.config.projects.is_empty() {
            let path = PathBuf::from(name);
            if path.exists() {
                return Ok(path);
            }
        }
        Err(SessionError::InvalidProject(name.to_string()))
    }

    pub async fn create(&self, project_name: &str) -> Result<SessionId, SessionError> {
        let project_dir = self.resolve_project(project_name)?;

        // Reserve a slot with a compare-and-swap loop before any await point,
        // so two concurrent `create()` calls can never both observe room under
        // the cap and both proceed to spawn (SPEC_FULL.md §8: "max_sessions is
        // never exceeded at all times").
        loop {
            let current = self.active_slots.load(Ordering::SeqCst);
            if current >= self.config.sessions.max_sessions {
                return Err(SessionError::LimitExceeded(self.config.sessions.max_sessions));
            }
            if self
                .active_slots
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
        }

        let handler = match AssistantHandler::start(
            self.config.assistant.clone(),
            project_dir.clone(),
            None,
            false,
            None,
        )
        .await
        {
            Ok(handler) => handler,
            Err(e) => {
                self.active_slots.fetch_sub(1, Ordering::SeqCst);
                return Err(e.into());
            }
        };

        let id = SessionId::new();
        let session = Arc::new(Session {
            id,
            project_name: project_name.to_string(),
            project_dir,
            created_at: Utc::now(),
            last_activity: RwLock::new(Utc::now()),
            conversation: RwLock::new(Vec::new()),
            active: std::sync::atomic::AtomicBool::new(true),
            handler,
        });

        self.sessions.write().await.insert(id, session.clone());
        *self.current.write().await = Some(id);
        self.spawn_health_watcher(session);
        info!(%id, project = project_name, "session created");
        Ok(id)
    }

    /// Watch `session`'s handler for an unobserved transition to
    /// `HandlerState::Error` (an assistant process that exited unexpectedly,
    /// e.g. because its project directory vanished) and flip the session
    /// inactive as soon as it happens, rather than leaving it reporting
    /// `active: true` in `list()`/`@@sessions` until the idle reaper runs
    /// (SPEC_FULL.md §7).
    fn spawn_health_watcher(&self, session: Arc<Session>) {
        let active_slots = self.active_slots.clone();
        tokio::spawn(async move {
            let mut rx = session.handler.stream();
            loop {
                use tokio::sync::broadcast::error::RecvError;
                match rx.recv().await {
                    Ok(crate::handler::Chunk::End) => break,
                    Ok(_) => continue,
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
            if session.handler.state().await == crate::handler::HandlerState::Error
                && Self::deactivate(&active_slots, &session)
            {
                warn!(
                    id = %session.id,
                    "session marked inactive after assistant process exited unexpectedly"
                );
            }
        });
    }

    pub async fn switch(&self, id: SessionId) -> Result<(), SessionError> {
        let sessions = self.sessions.read().await;
        let session = sessions.get(&id).ok_or(SessionError::NoSuchSession(id.to_string()))?;
        if !session.active.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(SessionError::NoSuchSession(id.to_string()));
        }
        drop(sessions);
        *self.current.write().await = Some(id);
        Ok(())
    }

    pub async fn current(&self) -> Option<SessionId> {
        *self.current.read().await
    }

    /// Configured projects as `(name, path, description)`, sorted by name.
    pub fn projects(&self) -> Vec<(String, PathBuf, Option<String>)> {
        let mut out: Vec<_> = self
            .config
            .projects
            .iter()
            .map(|(name, p)| (name.clone(), p.path.clone(), p.description.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub async fn list(&self) -> Vec<SessionSnapshot> {
        let sessions = self.sessions.read().await;
        let mut out = Vec::with_capacity(sessions.len());
        for session in sessions.values() {
            out.push(SessionSnapshot {
                id: session.id,
                project_name: session.project_name.clone(),
                created_at: session.created_at,
                last_activity: *session.last_activity.read().await,
                active: session.active.load(std::sync::atomic::Ordering::Relaxed),
                conversation_length: session.conversation.read().await.len(),
            });
        }
        out
    }

    fn get(&self, map: &HashMap<SessionId, Arc<Session>>, id: SessionId) -> Result<Arc<Session>, SessionError> {
        map.get(&id).cloned().ok_or(SessionError::NoSuchSession(id.to_string()))
    }

    /// Send `text` to `id`'s handler, collecting its reply via `execute` and
    /// recording both sides in the conversation log.
    pub async fn send(&self, id: SessionId, text: &str) -> Result<String, SessionError> {
        self.send_inner(id, text, None).await
    }

    /// Like `send`, but forwards each chunk of the handler's reply to
    /// `on_chunk` as it is produced, so a caller can pipe it back to a chat
    /// transport incrementally instead of waiting for the whole turn.
    pub async fn send_streaming(
        &self,
        id: SessionId,
        text: &str,
        on_chunk: &tokio::sync::mpsc::UnboundedSender<String>,
    ) -> Result<String, SessionError> {
        self.send_inner(id, text, Some(on_chunk)).await
    }

    async fn send_inner(
        &self,
        id: SessionId,
        text: &str,
        on_chunk: Option<&tokio::sync::mpsc::UnboundedSender<String>>,
    ) -> Result<String, SessionError> {
        let session = {
            let sessions = self.sessions.read().await;
            self.get(&sessions, id)?
        };

        let handler_state = session.handler.state().await;
        if handler_state != crate::handler::HandlerState::Running
            && handler_state != crate::handler::HandlerState::Processing
        {
            Self::deactivate(&self.active_slots, &session);
            if !session.project_dir.exists() {
                return Err(SessionError::InvalidProject(
                    session.project_dir.display().to_string(),
                ));
            }
            return Err(SessionError::Handler(crate::error::HandlerError::NotRunning));
        }

        *session.last_activity.write().await = Utc::now();
        session.conversation.write().await.push(ConversationEntry {
            role: Role::User,
            content: text.to_string(),
            at: Utc::now(),
        });

        let reply = match on_chunk {
            Some(tx) => {
                session
                    .handler
                    .execute_streaming(text, self.config.queue.task_timeout, tx)
                    .await?
            }
            None => {
                session
                    .handler
                    .execute(text, self.config.queue.task_timeout)
                    .await?
            }
        };

        session.conversation.write().await.push(ConversationEntry {
            role: Role::Assistant,
            content: reply.clone(),
            at: Utc::now(),
        });
        Ok(reply)
    }

    pub async fn terminate(&self, id: SessionId) -> Result<(), SessionError> {
        let session = {
            let sessions = self.sessions.read().await;
            self.get(&sessions, id)?
        };
        session.handler.terminate().await?;
        Self::deactivate(&self.active_slots, &session);
        let mut current = self.current.write().await;
        if *current == Some(id) {
            *current = None;
        }
        Ok(())
    }

    /// Periodic sweep: terminate and drop sessions whose last activity is
    /// older than the configured idle timeout. Intended to be driven by a
    /// background task on `config.sessions.reap_interval`.
    pub async fn reap_idle(&self) {
        let idle_timeout = chrono::Duration::from_std(self.config.sessions.idle_timeout)
            .unwrap_or(chrono::Duration::hours(1));
        let now = Utc::now();
        let stale: Vec<SessionId> = {
            let sessions = self.sessions.read().await;
            let mut out = Vec::new();
            for session in sessions.values() {
                if !session.active.load(std::sync::atomic::Ordering::Relaxed) {
                    continue;
                }
                let last = *session.last_activity.read().await;
                if now.signed_duration_since(last) > idle_timeout {
                    out.push(session.id);
                }
            }
            out
        };
        for id in stale {
            if let Err(e) = self.terminate(id).await {
                warn!(%id, error = %e, "failed to reap idle session");
            } else {
                info!(%id, "reaped idle session");
            }
        }
    }

    /// Create a short-lived session, run a single exchange, terminate it, and
    /// return the result. Does not count against `max_sessions` beyond its own
    /// lifetime since it is torn down before returning.
    pub async fn execute_one_shot(
        &self,
        project_name: &str,
        text: &str,
        assistant_override: Option<AssistantConfig>,
    ) -> Result<String, SessionError> {
        self.execute_one_shot_cancellable(
            project_name,
            text,
            assistant_override,
            &tokio_util::sync::CancellationToken::new(),
        )
        .await
    }

    /// Same as `execute_one_shot`, but the exchange is raced against `cancel`.
    /// The spawned handler is always terminated before this function returns,
    /// on both the completed and the cancelled branch — cancellation must
    /// close stdin and kill the process promptly, not abandon it
    /// (SPEC_FULL.md §5/§9), so `handler.terminate()` runs unconditionally
    /// here rather than inside a `tokio::select!` at the caller that could
    /// drop this whole future mid-flight.
    pub async fn execute_one_shot_cancellable(
        &self,
        project_name: &str,
        text: &str,
        assistant_override: Option<AssistantConfig>,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<String, SessionError> {
        let project_dir = self.resolve_project(project_name)?;
        let cfg = assistant_override.unwrap_or_else(|| self.config.assistant.clone());
        let handler = AssistantHandler::start(cfg, project_dir, None, false, None).await?;
        let result = tokio::select! {
            r = handler.execute(text, self.config.queue.task_timeout) => r,
            _ = cancel.cancelled() => Err(crate::error::HandlerError::Timeout(self.config.queue.task_timeout)),
        };
        let _ = handler.terminate().await;
        Ok(result?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProjectConfig;
    use std::collections::HashMap;

    fn test_config(dir: &std::path::Path, max_sessions: usize) -> CoreConfig {
        let mut projects = HashMap::new();
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
        cfg.sessions.max_sessions = max_sessions;
        cfg.assistant.executable = PathBuf::from("/bin/cat");
        cfg.assistant.startup_probe = std::time::Duration::from_millis(20);
        cfg
    }

    #[tokio::test]
    async fn create_rejects_unknown_project() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new(test_config(dir.path(), 2));
        let result = registry.create("nope").await;
        assert!(matches!(result, Err(SessionError::InvalidProject(_))));
    }

    #[tokio::test]
    async fn enforces_session_cap() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new(test_config(dir.path(), 1));
        registry.create("proj").await.unwrap();
        let second = registry.create("proj").await;
        assert!(matches!(second, Err(SessionError::LimitExceeded(1))));
    }

    #[tokio::test]
    async fn switch_to_unknown_session_errors() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new(test_config(dir.path(), 2));
        let bogus = SessionId::new();
        assert!(matches!(
            registry.switch(bogus).await,
            Err(SessionError::NoSuchSession(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_create_never_exceeds_cap() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new(test_config(dir.path(), 1));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            handles.push(tokio::spawn(
                async move { registry.create("proj").await },
            ));
        }

        let mut successes = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                successes += 1;
            }
        }

        assert_eq!(successes, 1, "max_sessions=1 must admit exactly one winner");
        let active = registry
            .list()
            .await
            .into_iter()
            .filter(|s| s.active)
            .count();
        assert_eq!(active, 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn crashed_handler_marks_session_inactive() {
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("crash.sh");
        let mut file = std::fs::File::create(&script).unwrap();
        writeln!(file, "#!/bin/sh\nsleep 0.1").unwrap();
        let mut perms = std::fs::metadata(&script).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script, perms).unwrap();

        let mut cfg = test_config(dir.path(), 2);
        cfg.assistant.executable = script;
        let registry = SessionRegistry::new(cfg);
        let id = registry.create("proj").await.unwrap();

        let became_inactive = async {
            loop {
                let snapshot = registry
                    .list()
                    .await
                    .into_iter()
                    .find(|s| s.id == id)
                    .unwrap();
                if !snapshot.active {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            }
        };
        tokio::time::timeout(std::time::Duration::from_secs(5), became_inactive)
            .await
            .expect("session should be marked inactive once the process crashes");

        let err = registry.send(id, "hello").await.unwrap_err();
        assert!(matches!(err, SessionError::Handler(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn send_after_vanished_project_dir_surfaces_invalid_project() {
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;

        let root = tempfile::tempdir().unwrap();
        let project_dir = root.path().join("proj_dir");
        std::fs::create_dir(&project_dir).unwrap();
        let script = root.path().join("crash.sh");
        let mut file = std::fs::File::create(&script).unwrap();
        writeln!(file, "#!/bin/sh\nsleep 0.1").unwrap();
        let mut perms = std::fs::metadata(&script).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script, perms).unwrap();

        let mut projects = HashMap::new();
        projects.insert(
            "proj".to_string(),
            ProjectConfig {
                path: project_dir.clone(),
                description: None,
            },
        );
        let mut cfg = CoreConfig {
            projects,
            data_dir: root.path().to_path_buf(),
            ..Default::default()
        };
        cfg.assistant.executable = script;
        cfg.assistant.startup_probe = std::time::Duration::from_millis(20);

        let registry = SessionRegistry::new(cfg);
        let id = registry.create("proj").await.unwrap();
        std::fs::remove_dir_all(&project_dir).unwrap();

        let became_inactive = async {
            loop {
                let snapshot = registry
                    .list()
                    .await
                    .into_iter()
                    .find(|s| s.id == id)
                    .unwrap();
                if !snapshot.active {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            }
        };
        tokio::time::timeout(std::time::Duration::from_secs(5), became_inactive)
            .await
            .expect("session should be marked inactive once the process crashes");

        let err = registry.send(id, "hello").await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidProject(_)));
    }
}
