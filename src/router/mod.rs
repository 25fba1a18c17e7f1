//! Command Router: classifies an inbound chat line as a control command or
//! conversational text and dispatches it. Commands are a closed enum matched
//! exhaustively, per SPEC_FULL.md §9's guidance against string-keyed dispatch
//! tables (the teacher's own `cli/mod.rs` uses a `clap`-derived enum for its
//! CLI surface; this router applies the same closed-enum shape to chat input).

use std::str::FromStr;
use std::sync::Arc;

use tracing::warn;

use crate::queue::{Priority, QueueStatus, TaskQueueManager};
use crate::scheduler::CronScheduler;
use crate::session::{SessionId, SessionRegistry};

pub const CONTROL_PREFIX: &str = "@@";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Projects,
    Switch { project: String },
    New { project: String },
    Sessions,
    Quit,
    Help,
    QueueAdd { queue: String, description: String },
    QueueRun { queue: String },
    QueueStatus { queue: Option<String> },
    QueueClear { queue: String },
    Cron { pattern: String, tasks: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedLine {
    Control(Command),
    Conversation(String),
    UnknownCommand(String),
    Malformed(String),
}

/// Classify and tokenize one inbound chat line. Whitespace-separated tokens;
/// an argument starting with `"` is read until its closing quote (needed for
/// the cron pattern argument).
pub fn parse(line: &str) -> ParsedLine {
    let trimmed = line.trim_start();
    if !trimmed.starts_with(CONTROL_PREFIX) {
        return ParsedLine::Conversation(line.to_string());
    }
    let rest = &trimmed[CONTROL_PREFIX.len()..];
    let tokens = tokenize(rest);
    let Some((name, args)) = tokens.split_first() else {
        return ParsedLine::Malformed("empty command".to_string());
    };

    match name.as_str() {
        "projects" => ParsedLine::Control(Command::Projects),
        "switch" => match args.first() {
            Some(p) => ParsedLine::Control(Command::Switch { project: p.clone() }),
            None => ParsedLine::Malformed("usage: @@switch <project>".to_string()),
        },
        "new" => match args.first() {
            Some(p) => ParsedLine::Control(Command::New { project: p.clone() }),
            None => ParsedLine::Malformed("usage: @@new <project>".to_string()),
        },
        "sessions" => ParsedLine::Control(Command::Sessions),
        "quit" | "q" => ParsedLine::Control(Command::Quit),
        "help" => ParsedLine::Control(Command::Help),
        "queue_add" => {
            if args.len() < 2 {
                return ParsedLine::Malformed("usage: @@queue_add <queue> <description...>".to_string());
            }
            ParsedLine::Control(Command::QueueAdd {
                queue: args[0].clone(),
                description: args[1..].join(" "),
            })
        }
        "queue" => match args.first() {
            Some(q) => ParsedLine::Control(Command::QueueRun { queue: q.clone() }),
            None => ParsedLine::Malformed("usage: @@queue <queue>".to_string()),
        },
        "queue_status" => ParsedLine::Control(Command::QueueStatus {
            queue: args.first().cloned(),
        }),
        "queue_clear" => match args.first() {
            Some(q) => ParsedLine::Control(Command::QueueClear { queue: q.clone() }),
            None => ParsedLine::Malformed("usage: @@queue_clear <queue>".to_string()),
        },
        "cron" => {
            if args.len() < 2 {
                return ParsedLine::Malformed(
                    "usage: @@cron \"<pattern>\" <task,task,...>".to_string(),
                );
            }
            let tasks = args[1].split(',').map(|s| s.trim().to_string()).collect();
            ParsedLine::Control(Command::Cron {
                pattern: args[0].clone(),
                tasks,
            })
        }
        other => ParsedLine::UnknownCommand(other.to_string()),
    }
}

fn tokenize(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut chars = input.trim().chars().peekable();
    while chars.peek().is_some() {
        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }
        let mut token = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            for c in chars.by_ref() {
                if c == '"' {
                    break;
                }
                token.push(c);
            }
        } else {
            while matches!(chars.peek(), Some(c) if !c.is_whitespace()) {
                token.push(chars.next().unwrap());
            }
        }
        tokens.push(token);
    }
    tokens
}

/// Reply text for a dispatched line; `None` means nothing should be sent back
/// (conversational replies are streamed incrementally by the caller instead).
pub struct Router {
    registry: Arc<SessionRegistry>,
    queue: Arc<TaskQueueManager>,
    scheduler: Arc<CronScheduler>,
}

impl Router {
    pub fn new(
        registry: Arc<SessionRegistry>,
        queue: Arc<TaskQueueManager>,
        scheduler: Arc<CronScheduler>,
    ) -> Self {
        Self {
            registry,
            queue,
            scheduler,
        }
    }

    /// Handle one inbound chat line end to end, returning the text to send
    /// back to the channel. Multi-line replies (conversational streaming,
    /// queue-run progress) are joined with newlines; callers that need each
    /// line delivered as its own chat message should use `handle_streaming`.
    pub async fn handle(&self, line: &str) -> String {
        self.handle_streaming(line).await.join("\n")
    }

    /// Like `handle`, but returns each reply as a separate element in the
    /// order it must be delivered to the channel (SPEC_FULL.md §4.3, §8:
    /// the handler's stream is piped back as incremental chunks rather than
    /// collected into one message).
    pub async fn handle_streaming(&self, line: &str) -> Vec<String> {
        match parse(line) {
            ParsedLine::Conversation(text) => self.handle_conversation(&text).await,
            ParsedLine::Control(cmd) => self.dispatch(cmd).await,
            ParsedLine::UnknownCommand(name) => {
                vec![format!("unknown command: {name}. try @@help")]
            }
            ParsedLine::Malformed(msg) => vec![msg],
        }
    }

    /// Send `text` to the current session, forwarding each chunk of the
    /// handler's reply as its own element rather than waiting for the whole
    /// turn to finish and joining it into one string.
    async fn handle_conversation(&self, text: &str) -> Vec<String> {
        let Some(current) = self.registry.current().await else {
            return vec!["no active session. use @@switch <project> first".to_string()];
        };

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let registry = self.registry.clone();
        let text_owned = text.to_string();
        let send_task =
            tokio::spawn(async move { registry.send_streaming(current, &text_owned, &tx).await });

        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line);
        }

        match send_task.await {
            Ok(Ok(_reply)) => {}
            Ok(Err(e)) => {
                warn!(error = %e, "conversational send failed");
                lines.push(e.to_string());
            }
            Err(e) => lines.push(format!("conversation handler panicked: {e}")),
        }
        if lines.is_empty() {
            lines.push(String::new());
        }
        lines
    }

    async fn dispatch(&self, cmd: Command) -> Vec<String> {
        match cmd {
            Command::Projects => {
                let projects = self.registry.projects();
                if projects.is_empty() {
                    vec!["no projects configured".to_string()]
                } else {
                    projects
                        .into_iter()
                        .map(|(name, path, desc)| match desc {
                            Some(d) => format!("{name}: {} - {d}", path.display()),
                            None => format!("{name}: {}", path.display()),
                        })
                        .collect()
                }
            }
            Command::Switch { project } => vec![self.switch_or_create(&project).await],
            Command::New { project } => vec![match self.registry.create(&project).await {
                Ok(id) => format!("created session {id} for {project}"),
                Err(e) => e.to_string(),
            }],
            Command::Sessions => {
                let sessions = self.registry.list().await;
                if sessions.is_empty() {
                    vec!["no sessions".to_string()]
                } else {
                    sessions
                        .into_iter()
                        .map(|s| {
                            format!(
                                "{} project={} state={} created={} last_activity={} turns={}",
                                s.id,
                                s.project_name,
                                if s.active { "active" } else { "inactive" },
                                s.created_at.to_rfc3339(),
                                s.last_activity.to_rfc3339(),
                                s.conversation_length
                            )
                        })
                        .collect()
                }
            }
            Command::Quit => vec![match self.registry.current().await {
                Some(id) => match self.registry.terminate(id).await {
                    Ok(()) => "session terminated".to_string(),
                    Err(e) => e.to_string(),
                },
                None => "no active session".to_string(),
            }],
            Command::Help => vec![HELP_TEXT.to_string()],
            Command::QueueAdd { queue, description } => {
                let project = self.current_project_name().await.unwrap_or_default();
                vec![
                    match self
                        .queue
                        .add(&queue, description, &project, Priority::Medium)
                        .await
                    {
                        Ok(id) => format!("queued {id} in {queue}"),
                        Err(e) => e.to_string(),
                    },
                ]
            }
            Command::QueueRun { queue } => self.run_queue_with_progress(&queue).await,
            Command::QueueStatus { queue } => match queue {
                Some(q) => vec![match self.queue.status(&q).await {
                    Ok(s) => format_queue_status(&s),
                    Err(e) => e.to_string(),
                }],
                None => {
                    let all = self.queue.status_all().await;
                    if all.is_empty() {
                        vec!["no queues".to_string()]
                    } else {
                        all.iter().map(format_queue_status).collect()
                    }
                }
            },
            Command::QueueClear { queue } => vec![match self.queue.clear(&queue).await {
                Ok(()) => format!("cleared {queue}"),
                Err(e) => e.to_string(),
            }],
            Command::Cron { pattern, tasks } => {
                let project = self.current_project_name().await.unwrap_or_default();
                vec![match self.scheduler.schedule(&pattern, tasks, &project).await {
                    Ok(id) => format!("scheduled {id}"),
                    Err(e) => e.to_string(),
                }]
            }
        }
    }

    /// Run `queue`, collecting one progress line per finished task plus a
    /// trailing summary, in delivery order.
    async fn run_queue_with_progress(&self, queue: &str) -> Vec<String> {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let queue_owned = queue.to_string();
        let queue_mgr = self.queue.clone();
        let run_task = tokio::spawn(async move {
            queue_mgr.run_with_progress(&queue_owned, Some(tx)).await
        });

        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line);
        }

        match run_task.await {
            Ok(Ok(tasks)) => lines.push(format!("ran {} task(s) in {queue}", tasks.len())),
            Ok(Err(e)) => lines.push(e.to_string()),
            Err(e) => lines.push(format!("queue run panicked: {e}")),
        }
        lines
    }

    async fn switch_or_create(&self, project: &str) -> String {
        let existing = self
            .registry
            .list()
            .await
            .into_iter()
            .find(|s| s.project_name == project && s.active);
        let id = match existing {
            Some(s) => s.id,
            None => match self.registry.create(project).await {
                Ok(id) => id,
                Err(e) => return e.to_string(),
            },
        };
        match self.registry.switch(id).await {
            Ok(()) => format!("switched to {project}"),
            Err(e) => e.to_string(),
        }
    }

    async fn current_project_name(&self) -> Option<String> {
        let current = self.registry.current().await?;
        self.registry
            .list()
            .await
            .into_iter()
            .find(|s| s.id == current)
            .map(|s| s.project_name)
    }
}

const HELP_TEXT: &str = "commands: @@projects @@switch @@new @@sessions @@quit @@queue_add @@queue @@queue_status @@queue_clear @@cron";

fn format_queue_status(s: &QueueStatus) -> String {
    format!(
        "{}: {} pending, {} completed, {} failed, running={}",
        s.name, s.pending, s.completed, s.failed, s.running
    )
}

impl FromStr for Command {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match parse(s) {
            ParsedLine::Control(cmd) => Ok(cmd),
            _ => Err("not a control command".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_control_vs_conversation() {
        assert!(matches!(parse("hello there"), ParsedLine::Conversation(_)));
        assert!(matches!(
            parse("@@projects"),
            ParsedLine::Control(Command::Projects)
        ));
    }

    #[test]
    fn tokenizes_quoted_cron_pattern() {
        let parsed = parse(r#"@@cron "*/5 * * * *" run_tests,clean_code"#);
        match parsed {
            ParsedLine::Control(Command::Cron { pattern, tasks }) => {
                assert_eq!(pattern, "*/5 * * * *");
                assert_eq!(tasks, vec!["run_tests", "clean_code"]);
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn unknown_command_is_reported() {
        assert!(matches!(parse("@@bogus"), ParsedLine::UnknownCommand(_)));
    }

    #[test]
    fn malformed_switch_has_no_argument() {
        assert!(matches!(parse("@@switch"), ParsedLine::Malformed(_)));
    }

    #[test]
    fn leading_whitespace_still_classifies_as_control() {
        assert!(matches!(
            parse("   @@help"),
            ParsedLine::Control(Command::Help)
        ));
    }

    #[tokio::test]
    async fn sessions_command_emits_full_snapshot() {
        use crate::config::{CoreConfig, ProjectConfig};
        use crate::scheduler::CronScheduler;

        let dir = tempfile::tempdir().unwrap();
        let mut projects = std::collections::HashMap::new();
        projects.insert(
            "proj".to_string(),
            ProjectConfig {
                path: dir.path().to_path_buf(),
                description: None,
            },
        );
        let mut cfg = CoreConfig {
            projects,
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        cfg.assistant.executable = std::path::PathBuf::from("/bin/cat");
        cfg.assistant.startup_probe = std::time::Duration::from_millis(20);

        let registry = SessionRegistry::new(cfg.clone());
        let queue = Arc::new(TaskQueueManager::new(&cfg, registry.clone()));
        let scheduler = CronScheduler::new(queue.clone());
        let router = Router::new(registry.clone(), queue, scheduler);

        router.handle("@@switch proj").await;

        let lines = router.handle_streaming("@@sessions").await;
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("proj"));
        assert!(lines[0].contains("state=active"));
        assert!(lines[0].contains("turns=0"));
    }

    #[tokio::test]
    async fn sessions_command_reports_none_when_empty() {
        use crate::config::CoreConfig;
        use crate::scheduler::CronScheduler;

        let dir = tempfile::tempdir().unwrap();
        let cfg = CoreConfig {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let registry = SessionRegistry::new(cfg.clone());
        let queue = Arc::new(TaskQueueManager::new(&cfg, registry.clone()));
        let scheduler = CronScheduler::new(queue.clone());
        let router = Router::new(registry, queue, scheduler);

        let lines = router.handle_streaming("@@sessions").await;
        assert_eq!(lines, vec!["no sessions".to_string()]);
    }
}
