//! Thin CLI entrypoint: parses arguments, initializes logging, loads
//! configuration, wires the Session Registry / Command Router / Task Queue
//! Manager / Cron Scheduler together, and runs the development chat transport.
//! Owns no orchestration logic of its own — every decision here is a direct
//! call into the core's public API.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use assistant_core::chat::{ChatTransport, StdioTransport};
use assistant_core::config::CoreConfig;
use assistant_core::queue::TaskQueueManager;
use assistant_core::router::Router;
use assistant_core::scheduler::CronScheduler;
use assistant_core::session::SessionRegistry;

/// Bounded attempts for a single outbound chat send, per SPEC_FULL.md §6.1:
/// transient failures are retried with exponential backoff; once exhausted
/// the failure is logged and swallowed rather than crashing the core.
const SEND_RETRY_ATTEMPTS: u32 = 3;
const SEND_RETRY_BASE_DELAY: std::time::Duration = std::time::Duration::from_millis(200);

#[derive(Parser, Debug)]
#[command(name = "assistant-core", version, about = "Session and execution orchestrator")]
struct Args {
    /// Path to a YAML configuration file. Missing files are skipped; defaults
    /// and environment variables still apply.
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config = CoreConfig::load(Some(&args.config))?;
    info!(data_dir = %config.data_dir.display(), "configuration loaded");

    let registry = SessionRegistry::new(config.clone());
    let queue = Arc::new(TaskQueueManager::new(&config, registry.clone()));
    queue.load(&config.data_dir).await?;
    let scheduler = CronScheduler::new(queue.clone());
    let router = Router::new(registry.clone(), queue.clone(), scheduler.clone());

    spawn_idle_reaper(registry.clone(), config.sessions.reap_interval);

    let mut transport = StdioTransport::new();
    while let Some(message) = transport.recv().await {
        for reply in router.handle_streaming(&message.text).await {
            send_with_retry(&transport, &message.channel_id, &reply).await;
        }
    }

    Ok(())
}

/// Send one reply, retrying transient failures with exponential backoff up to
/// `SEND_RETRY_ATTEMPTS` times; a still-failing send after that is logged as a
/// permanent failure and otherwise swallowed (§7: `ChatTransportError` never
/// crashes the core).
async fn send_with_retry(transport: &impl ChatTransport, channel: &str, text: &str) {
    let mut delay = SEND_RETRY_BASE_DELAY;
    for attempt in 1..=SEND_RETRY_ATTEMPTS {
        match transport.send(channel, text).await {
            Ok(()) => return,
            Err(e) if attempt < SEND_RETRY_ATTEMPTS => {
                warn!(error = %e, attempt, "transient chat transport send failure, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => {
                warn!(error = %e, "chat transport send failed permanently, dropping reply");
            }
        }
    }
}

fn spawn_idle_reaper(registry: Arc<SessionRegistry>, interval: std::time::Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            registry.reap_idle().await;
        }
    });
}

fn init_tracing(verbosity: u8) {
    let default_level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
