use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;
use tokio::sync::mpsc;

use offramp::agent::{AgentControl, ProxyAgent};
use offramp::{SyncConfig, SyncEngine};

#[derive(Parser, Debug)]
#[command(name = "offramp")]
#[command(about = "Offline-tolerant sync daemon: probes connectivity, drains queued writes, serves the asset cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offramp/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Override the liveness probe endpoint
  #[arg(long)]
  liveness_url: Option<String>,

  /// Override the durable store directory
  #[arg(long)]
  data_dir: Option<PathBuf>,

  /// Install the proxy agent's asset cache but wait for an external
  /// activation message instead of activating immediately
  #[arg(long)]
  defer_activation: bool,
}

fn init_tracing(log_dir: &std::path::Path) -> Result<tracing_appender::non_blocking::WorkerGuard> {
  std::fs::create_dir_all(log_dir)?;
  let file_appender = tracing_appender::rolling::daily(log_dir, "offramp.log");
  let (writer, guard) = tracing_appender::non_blocking(file_appender);

  let filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("offramp=info"));

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let mut config = SyncConfig::load(args.config.as_deref())?;
  if let Some(url) = args.liveness_url {
    config.liveness_url = url;
  }
  if let Some(dir) = args.data_dir {
    config.data_dir = Some(dir);
  }

  let log_dir = config
    .data_dir
    .clone()
    .or_else(|| dirs::data_dir().map(|d| d.join("offramp")))
    .unwrap_or_else(|| PathBuf::from("."))
    .join("logs");
  let _guard = init_tracing(&log_dir)?;

  let engine = SyncEngine::new(config)?;
  engine.start();
  tracing::info!("sync engine started");

  // The proxy agent runs as its own context, sharing only the store and
  // the event bus with the foreground engine.
  let agent: std::sync::Arc<ProxyAgent> = engine.build_agent();
  let (control_tx, control_rx) = mpsc::channel::<AgentControl>(4);
  let agent_task = tokio::spawn(agent.run(control_rx));

  if !args.defer_activation {
    // Standalone daemon: no older agent instance to wait for.
    let _ = control_tx.send(AgentControl::Activate).await;
  }

  tokio::signal::ctrl_c().await?;
  tracing::info!("shutting down");

  engine.shutdown();
  drop(control_tx);
  agent_task.abort();

  Ok(())
}
