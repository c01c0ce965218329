use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};

use iacd_core::{ConfigStore, LogStoreError, SyncOutcome};
use iacd_observability::{
    canonical_logs_dir_from_root, emit_event, init_process_logging, ObservabilityEvent, ProcessKind,
};
use iacd_server::{serve, AppState};

#[derive(Parser, Debug)]
#[command(name = "iacd")]
#[command(about = "Infrastructure-as-code task execution daemon")]
struct Cli {
    /// Directory holding the task store, logs and process logs.
    #[arg(long, global = true, env = "IACD_STATE_DIR", default_value = ".iacd")]
    state_dir: PathBuf,
    /// JSON config file. Defaults to `<state-dir>/config.json`.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP server and resume polling of running tasks.
    Serve {
        #[arg(long, alias = "host")]
        hostname: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Poll one running task until it finishes.
    Sync { guid: String },
    /// Print the stored log of a task.
    Log { guid: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| cli.state_dir.join("config.json"));

    match cli.command {
        Command::Serve { hostname, port } => {
            let config =
                ConfigStore::new(Some(config_path), serve_overrides(hostname, port)).await?;
            let snapshot = config.get().await;
            let logs_dir = canonical_logs_dir_from_root(&cli.state_dir);
            let (_log_guard, log_info) = init_process_logging(
                ProcessKind::Server,
                &logs_dir,
                snapshot.logging.retention_days,
            )?;
            emit_event(
                Level::INFO,
                ProcessKind::Server,
                ObservabilityEvent::new("logging.initialized", "engine.main")
                    .status("ok")
                    .detail("server jsonl logging initialized"),
            );
            info!("server logging initialized: {:?}", log_info);

            let addr: SocketAddr = format!("{}:{}", snapshot.server.hostname, snapshot.server.port)
                .parse()
                .context("invalid hostname or port")?;
            info!(
                "state dir: {} runner: {}",
                cli.state_dir.display(),
                snapshot.runner.url
            );
            let state = AppState::open(&cli.state_dir, config).await?;
            serve(addr, state).await?;
        }
        Command::Sync { guid } => {
            let config = ConfigStore::new(Some(config_path), None).await?;
            let snapshot = config.get().await;
            let logs_dir = canonical_logs_dir_from_root(&cli.state_dir);
            let (_log_guard, _) =
                init_process_logging(ProcessKind::Cli, &logs_dir, snapshot.logging.retention_days)?;
            let state = AppState::open(&cli.state_dir, config).await?;

            let cancel = CancellationToken::new();
            let ctrl_c = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    ctrl_c.cancel();
                }
            });

            let outcome = state.poller.wait_task_result(&cancel, &guid).await;
            match outcome {
                Ok(SyncOutcome::Finished(status)) => {
                    emit_event(
                        Level::INFO,
                        ProcessKind::Cli,
                        ObservabilityEvent::new("task.sync.finished", "engine.main")
                            .task(&guid)
                            .status(status.as_str()),
                    );
                    println!("{}", json!({ "taskId": guid, "status": status }));
                }
                Ok(SyncOutcome::Cancelled) => {
                    println!("{}", json!({ "taskId": guid, "cancelled": true }));
                }
                Err(err) => {
                    let detail = err.to_string();
                    emit_event(
                        Level::ERROR,
                        ProcessKind::Cli,
                        ObservabilityEvent::new("task.sync.failed", "engine.main")
                            .task(&guid)
                            .error_code(err.code())
                            .detail(&detail),
                    );
                    anyhow::bail!("sync of task {guid} failed: {detail}");
                }
            }
        }
        Command::Log { guid } => {
            let config = ConfigStore::new(Some(config_path), None).await?;
            let state = AppState::open(&cli.state_dir, config).await?;
            let task = state
                .store
                .get_task(&guid)
                .await
                .with_context(|| format!("task {guid} not found"))?;
            let log_file = task.backend_info.require_log_file()?;
            let bytes = match state.logs.read(log_file).await {
                Ok(bytes) => bytes,
                Err(LogStoreError::NotFound(_)) => Vec::new(),
                Err(err) => return Err(err.into()),
            };
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&bytes)?;
            if !bytes.is_empty() && !bytes.ends_with(b"\n") {
                stdout.write_all(b"\n")?;
            }
        }
    }

    Ok(())
}

fn serve_overrides(hostname: Option<String>, port: Option<u16>) -> Option<Value> {
    let mut server = serde_json::Map::new();
    if let Some(hostname) = hostname {
        server.insert("hostname".to_string(), Value::String(hostname));
    }
    if let Some(port) = port {
        server.insert("port".to_string(), json!(port));
    }
    if server.is_empty() {
        return None;
    }
    Some(json!({ "server": server }))
}
