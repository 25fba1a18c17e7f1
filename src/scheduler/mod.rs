//! Cron Scheduler: wall-clock-triggered catalog task sets pushed into a named
//! queue. The teacher has no analog (ccswarm has no wall-clock cron); this
//! module is grounded on the `cron` crate as used across the wider example
//! pack (`AgentsMesh-AutoHands`, `njfio-rsBot`, `oxicrab-oxicrab` all pin
//! `cron = "0.15"`) and the subsystem-ticker shape in
//! `examples/other_examples/manifests/xcorat-araliya-bot`.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule as CronPattern;
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::ScheduleError;
use crate::queue::{Priority, TaskQueueManager};

/// Fixed catalog of task names a cron schedule may reference, each resolving
/// to a canonical description.
pub fn catalog_description(name: &str) -> Option<&'static str> {
    Some(match name {
        "clean_code" => "Clean up code style and remove dead code",
        "run_tests" => "Run the full test suite and report results",
        "code_review" => "Review recent changes for correctness and style",
        "update_deps" => "Check for and apply dependency updates",
        "security_scan" => "Run a security scan over the project",
        "performance_check" => "Check for performance regressions",
        "documentation_update" => "Update documentation to match current code",
        _ => return None,
    })
}

pub struct CronScheduleEntry {
    pub id: String,
    pub pattern: String,
    pub task_names: Vec<String>,
    pub project: String,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: DateTime<Utc>,
    pub enabled: bool,
    schedule: CronPattern,
}

enum Command {
    Add {
        pattern: String,
        task_names: Vec<String>,
        project: String,
        reply: tokio::sync::oneshot::Sender<Result<String, ScheduleError>>,
    },
    Disable(String),
    Remove(String),
}

/// Validates and stores cron schedules; a single background ticker task wakes
/// at the nearest `next_run` (capped at 60s) and enqueues catalog tasks.
pub struct CronScheduler {
    schedules: Arc<RwLock<HashMap<String, CronScheduleEntry>>>,
    commands: mpsc::Sender<Command>,
    queue: Arc<TaskQueueManager>,
}

impl CronScheduler {
    pub fn new(queue: Arc<TaskQueueManager>) -> Arc<Self> {
        let schedules: Arc<RwLock<HashMap<String, CronScheduleEntry>>> =
            Arc::new(RwLock::new(HashMap::new()));
        let (tx, rx) = mpsc::channel(32);

        let this = Arc::new(Self {
            schedules: schedules.clone(),
            commands: tx,
            queue: queue.clone(),
        });

        tokio::spawn(Self::run_loop(schedules, queue, rx));
        this
    }

    /// Fire every enabled schedule whose `next_run <= now`, advancing its
    /// `next_run`/`last_run` and enqueueing its catalog task descriptions.
    /// Exposed directly (rather than only through the background ticker) so
    /// callers can drive the scheduler deterministically with a simulated
    /// instant instead of waiting on the wall clock. Returns the ids that
    /// fired, in the order they were processed (schedule-id order, per §5).
    pub async fn tick(&self, now: DateTime<Utc>) -> Vec<String> {
        Self::tick_schedules(&self.schedules, &self.queue, now).await
    }

    async fn run_loop(
        schedules: Arc<RwLock<HashMap<String, CronScheduleEntry>>>,
        queue: Arc<TaskQueueManager>,
        mut commands: mpsc::Receiver<Command>,
    ) {
        loop {
            let wait = Self::next_wait(&schedules).await;
            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    Self::tick_schedules(&schedules, &queue, Utc::now()).await;
                }
                cmd = commands.recv() => {
                    match cmd {
                        Some(Command::Add { pattern, task_names, project, reply }) => {
                            let result = Self::insert(&schedules, pattern, task_names, project).await;
                            let _ = reply.send(result);
                        }
                        Some(Command::Disable(id)) => {
                            if let Some(entry) = schedules.write().await.get_mut(&id) {
                                entry.enabled = false;
                            }
                        }
                        Some(Command::Remove(id)) => {
                            schedules.write().await.remove(&id);
                        }
                        None => break,
                    }
                }
            }
        }
    }

    async fn next_wait(schedules: &Arc<RwLock<HashMap<String, CronScheduleEntry>>>) -> Duration {
        const CEILING: Duration = Duration::from_secs(60);
        let now = Utc::now();
        let map = schedules.read().await;
        let min = map
            .values()
            .filter(|e| e.enabled)
            .map(|e| e.next_run)
            .min();
        match min {
            Some(next) => {
                let delta = next.signed_duration_since(now);
                delta
                    .to_std()
                    .unwrap_or(Duration::from_secs(0))
                    .min(CEILING)
            }
            None => CEILING,
        }
    }

    async fn insert(
        schedules: &Arc<RwLock<HashMap<String, CronScheduleEntry>>>,
        pattern: String,
        task_names: Vec<String>,
        project: String,
    ) -> Result<String, ScheduleError> {
        for name in &task_names {
            if catalog_description(name).is_none() {
                return Err(ScheduleError::UnknownTaskName(name.clone()));
            }
        }
        let cron_schedule =
            CronPattern::from_str(&to_seven_field(&pattern)).map_err(|e| ScheduleError::InvalidPattern {
                pattern: pattern.clone(),
                reason: e.to_string(),
            })?;
        if pattern.split_whitespace().any(|f| f == "*/0") {
            return Err(ScheduleError::InvalidPattern {
                pattern: pattern.clone(),
                reason: "step of 0 is not a valid interval".to_string(),
            });
        }

        let now = Utc::now();
        let next_run = cron_schedule
            .after(&now)
            .next()
            .ok_or_else(|| ScheduleError::InvalidPattern {
                pattern: pattern.clone(),
                reason: "pattern never fires".to_string(),
            })?;

        let id = Uuid::new_v4().to_string();
        schedules.write().await.insert(
            id.clone(),
            CronScheduleEntry {
                id: id.clone(),
                pattern,
                task_names,
                project,
                last_run: None,
                next_run,
                enabled: true,
                schedule: cron_schedule,
            },
        );
        Ok(id)
    }

    async fn tick_schedules(
        schedules: &Arc<RwLock<HashMap<String, CronScheduleEntry>>>,
        queue: &Arc<TaskQueueManager>,
        now: DateTime<Utc>,
    ) -> Vec<String> {
        let ids_fired: Vec<String> = {
            let map = schedules.read().await;
            let mut ids: Vec<&CronScheduleEntry> = map
                .values()
                .filter(|e| e.enabled && e.next_run <= now)
                .collect();
            ids.sort_by(|a, b| a.id.cmp(&b.id));
            ids.into_iter().map(|e| e.id.clone()).collect()
        };

        for id in &ids_fired {
            let (project, task_names) = {
                let mut map = schedules.write().await;
                let Some(entry) = map.get_mut(id) else { continue };
                entry.last_run = Some(now);
                entry.next_run = entry
                    .schedule
                    .after(&now)
                    .next()
                    .unwrap_or_else(|| now + chrono::Duration::hours(1));
                (entry.project.clone(), entry.task_names.clone())
            };

            for name in &task_names {
                let Some(description) = catalog_description(name) else {
                    continue;
                };
                let queue_name = format!("cron:{id}");
                if let Err(e) = queue
                    .add(&queue_name, description.to_string(), &project, Priority::Medium)
                    .await
                {
                    warn!(schedule = %id, error = %e, "failed to enqueue cron task");
                }
            }
            info!(schedule = %id, project, "cron schedule fired");
        }
        ids_fired
    }

    pub async fn schedule(
        &self,
        pattern: &str,
        task_names: Vec<String>,
        project: &str,
    ) -> Result<String, ScheduleError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let _ = self
            .commands
            .send(Command::Add {
                pattern: pattern.to_string(),
                task_names,
                project: project.to_string(),
                reply: tx,
            })
            .await;
        rx.await
            .unwrap_or_else(|_| Err(ScheduleError::UnknownSchedule("scheduler stopped".into())))
    }

    pub async fn disable(&self, id: &str) {
        let _ = self.commands.send(Command::Disable(id.to_string())).await;
    }

    pub async fn remove(&self, id: &str) {
        let _ = self.commands.send(Command::Remove(id.to_string())).await;
    }

    pub async fn list(&self) -> Vec<(String, String, bool, DateTime<Utc>)> {
        self.schedules
            .read()
            .await
            .values()
            .map(|e| (e.id.clone(), e.pattern.clone(), e.enabled, e.next_run))
            .collect()
    }
}

/// The `cron` crate expects a 6 or 7-field pattern (seconds + optional year);
/// the control surface is documented as standard 5-field. Prepend `0` seconds.
fn to_seven_field(pattern: &str) -> String {
    format!("0 {pattern}")
}
