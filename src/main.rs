use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use issuesync::app::Services;
use issuesync::config::{Config, LoggingConfig};
use issuesync::db::{RunLog, SqliteRunLog};
use issuesync::sync::{RunOutcome, SyncState, SyncTrigger, TriggerType};

#[derive(Parser, Debug)]
#[command(name = "issuesync")]
#[command(about = "Keeps a local, always-answering cache of a GraphQL issue tracker")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./issuesync.yaml, then $XDG_CONFIG_HOME/issuesync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Team to sync, overrides upstream.team_id
  #[arg(short, long)]
  team: Option<String>,

  #[command(subcommand)]
  command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Run the HTTP server with scheduled syncs (default)
  Serve,
  /// Run one sync and print the resulting status
  Sync,
  /// Show recent sync runs
  Runs {
    #[arg(short, long, default_value_t = 20)]
    limit: usize,
  },
}

fn init_tracing(logging: &LoggingConfig) -> Option<WorkerGuard> {
  let filter = EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| EnvFilter::new(logging.filter.as_deref().unwrap_or("info")));

  let (file_layer, guard) = match &logging.directory {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, "issuesync.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false);
      (Some(layer), Some(guard))
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(filter)
    .with(tracing_subscriber::fmt::layer())
    .with(file_layer)
    .init();

  guard
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = Config::load(args.config.as_deref())?;
  if let Some(team) = args.team {
    config.upstream.team_id = Some(team);
  }

  let _guard = init_tracing(&config.logging);

  match args.command.unwrap_or(Command::Serve) {
    Command::Serve => Services::build(config)?.serve().await,
    Command::Sync => {
      let services = Services::build(config)?;
      let trigger = SyncTrigger::new(TriggerType::Manual).with_actor("cli");
      let RunOutcome::Finished(status) = services.orchestrator.run_sync(trigger).await else {
        return Err(eyre!("A sync is already running"));
      };

      println!("{}", serde_json::to_string_pretty(&status)?);
      if status.status == SyncState::Error {
        return Err(eyre!(
          "Sync failed: {}",
          status.error_code.as_deref().unwrap_or("UNKNOWN")
        ));
      }
      Ok(())
    }
    Command::Runs { limit } => {
      let run_log = SqliteRunLog::open(config.database.path.as_deref())?;
      for run in run_log.recent_runs(limit)? {
        println!(
          "#{:<5} {:<10} {:<8} {} synced={} failed={} {}{}",
          run.id,
          run.trigger_type,
          run.status.as_str(),
          run.started_at.format("%Y-%m-%d %H:%M:%S"),
          run.items_synced,
          run.items_failed,
          run
            .duration_ms()
            .map(|ms| format!("{}ms", ms))
            .unwrap_or_else(|| "-".to_string()),
          run
            .error_code
            .map(|code| format!(" [{}]", code))
            .unwrap_or_default(),
        );
      }
      Ok(())
    }
  }
}
