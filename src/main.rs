use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;

use fieldsync::transport::{HttpRequest, HttpTransport};
use fieldsync::{logging, Config, SyncEngine};

#[derive(Parser, Debug)]
#[command(name = "fieldsync")]
#[command(about = "Offline-first sync engine for field sales clients")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/fieldsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Keep syncing in the background until Ctrl-C
  Run,
  /// Print the current status snapshot
  Status,
  /// List pending and failed mutations
  Queue,
  /// Replay pending mutations now
  Drain,
  /// Give failed mutations a fresh retry budget and replay them
  RetryFailed,
  /// Drop a queued mutation without delivering it
  Discard { id: String },
  /// Send one request through the interception layer
  Fetch {
    method: String,
    path: String,
    /// Request body (JSON)
    #[arg(long)]
    body: Option<String>,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;

  let log_dir = logging::default_log_dir().ok_or_else(|| eyre!("No data directory available"))?;
  let _log_guard = logging::init(&log_dir)?;

  let transport = HttpTransport::new(&config.server.base_url, config.timeout())
    .map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;
  let engine = SyncEngine::new(&config, Arc::new(transport), config.store_location()?);
  // One-shot commands drain explicitly, if at all
  let background_sync = matches!(args.command, Command::Run);
  engine.start_with(background_sync).await?;

  let result = run_command(&engine, args.command).await;
  engine.shutdown().await;
  result
}

async fn run_command(engine: &SyncEngine, command: Command) -> Result<()> {
  match command {
    Command::Run => {
      engine.spawn_health_probe();
      println!("fieldsync running, press Ctrl-C to stop");
      tokio::signal::ctrl_c().await?;
    }
    Command::Status => {
      engine.check_health().await;
      let snapshot = engine.refresh_status().await;
      println!("{}", serde_json::to_string_pretty(&snapshot)?);
    }
    Command::Queue => {
      let pending = engine.pending_items().await?;
      let failed = engine.failed_items().await?;
      println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
          "pending": pending,
          "failed": failed,
        }))?
      );
    }
    Command::Drain => {
      if !engine.check_health().await {
        return Err(eyre!("Server unreachable, nothing replayed"));
      }
      let report = engine.process_queue().await?;
      println!("{} delivered, {} failed", report.success, report.failed);
    }
    Command::RetryFailed => {
      if !engine.check_health().await {
        return Err(eyre!("Server unreachable, nothing replayed"));
      }
      let report = engine.retry_failed().await?;
      println!("{} delivered, {} failed", report.success, report.failed);
    }
    Command::Discard { id } => {
      if !engine.discard(&id).await? {
        return Err(eyre!("No discardable mutation with id {}", id));
      }
      println!("discarded {}", id);
    }
    Command::Fetch { method, path, body } => {
      let mut request = HttpRequest::new(&method, &path);
      if let Some(body) = body {
        request = request
          .with_header("content-type", "application/json")
          .with_body(&body);
      }
      let response = engine.fetch(request).await?;
      println!("HTTP {}", response.status);
      println!("{}", response.body);
    }
  }
  Ok(())
}
