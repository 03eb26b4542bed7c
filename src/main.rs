use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::AsyncBufReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use pipewright_config::{PipelineDef, TriggerDef};
use pipewright_engine::{PipelineRunner, Poller};
use pipewright_runtime::{Pipeline, RuntimeConfig};
use pipewright_secrets::{EnvBackend, FileBackend, SecretsBackend};
use pipewright_storage::{FsObjectStore, ObjectStore};
use pipewright_trigger::InboundEvent;

/// Pipewright - upload-triggered build and analysis pipelines
#[derive(Parser)]
#[command(name = "pipewright")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the data directory (default: ~/.pipewright)
  #[arg(long, global = true)]
  data_dir: Option<PathBuf>,

  /// Root of the filesystem object store (default: <data-dir>/store)
  #[arg(long, global = true)]
  store_root: Option<PathBuf>,

  /// Read secrets from files in this directory instead of the environment
  #[arg(long, global = true)]
  secrets_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Run a pipeline once for the webhook payload read from stdin
  Run {
    /// Path to the pipeline file (JSON)
    pipeline_file: PathBuf,
  },

  /// Keep running: poll the watched bucket, or read one webhook payload per
  /// stdin line
  Watch {
    /// Path to the pipeline file (JSON)
    pipeline_file: PathBuf,

    /// Upper bound on runs executing at the same time (webhook mode)
    #[arg(long, default_value_t = 1)]
    max_concurrent_runs: usize,
  },

  /// Check a pipeline file without running anything
  Validate {
    /// Path to the pipeline file (JSON)
    pipeline_file: PathBuf,
  },
}

struct Env {
  data_dir: PathBuf,
  store: Arc<dyn ObjectStore>,
  secrets: Arc<dyn SecretsBackend>,
}

fn main() -> Result<ExitCode> {
  let cli = Cli::parse();

  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_writer(io::stderr)
    .init();

  let data_dir = match cli.data_dir {
    Some(dir) => dir,
    None => dirs::home_dir()
      .context("could not determine home directory")?
      .join(".pipewright"),
  };
  let store_root = cli.store_root.unwrap_or_else(|| data_dir.join("store"));
  let secrets: Arc<dyn SecretsBackend> = match cli.secrets_dir {
    Some(dir) => Arc::new(FileBackend::new(dir)),
    None => Arc::new(EnvBackend::new()),
  };
  let env = Env {
    data_dir,
    store: Arc::new(FsObjectStore::new(store_root)),
    secrets,
  };

  match cli.command {
    Some(Commands::Run { pipeline_file }) => run_pipeline(pipeline_file, env),
    Some(Commands::Watch {
      pipeline_file,
      max_concurrent_runs,
    }) => watch_pipeline(pipeline_file, max_concurrent_runs, env),
    Some(Commands::Validate { pipeline_file }) => {
      let def = load_pipeline(&pipeline_file)?;
      eprintln!(
        "Pipeline '{}' is valid: {} stages, {} trigger",
        def.pipeline_id,
        def.stages.len(),
        match def.trigger {
          TriggerDef::Webhook => "webhook",
          TriggerDef::Poll { .. } => "poll",
        }
      );
      Ok(ExitCode::SUCCESS)
    }
    None => {
      println!("pipewright - use --help to see available commands");
      Ok(ExitCode::SUCCESS)
    }
  }
}

fn load_pipeline(pipeline_file: &Path) -> Result<PipelineDef> {
  let content = std::fs::read_to_string(pipeline_file)
    .with_context(|| format!("failed to read pipeline file: {}", pipeline_file.display()))?;
  PipelineDef::from_json(&content)
    .with_context(|| format!("invalid pipeline file: {}", pipeline_file.display()))
}

fn build_pipeline(pipeline_file: &Path, env: &Env) -> Result<Pipeline> {
  let def = load_pipeline(pipeline_file)?;
  eprintln!("Loaded pipeline: {}", def.name);

  Pipeline::new(
    def,
    RuntimeConfig::from_data_dir(&env.data_dir),
    env.store.clone(),
    env.secrets.clone(),
  )
  .context("failed to create pipeline")
}

/// Cancel `token` on ctrl-c.
fn cancel_on_ctrl_c(token: CancellationToken) {
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      warn!("interrupt received, cancelling");
      token.cancel();
    }
  });
}

fn run_pipeline(pipeline_file: PathBuf, env: Env) -> Result<ExitCode> {
  let rt = tokio::runtime::Runtime::new()?;
  rt.block_on(async { run_pipeline_async(pipeline_file, env).await })
}

async fn run_pipeline_async(pipeline_file: PathBuf, env: Env) -> Result<ExitCode> {
  let pipeline = build_pipeline(&pipeline_file, &env)?;
  let payload = read_payload_from_stdin()?;

  let cancel = CancellationToken::new();
  cancel_on_ctrl_c(cancel.clone());

  let report = pipeline
    .handle(InboundEvent::Webhook(payload), cancel)
    .await
    .context("trigger event rejected")?;

  eprintln!("Run {}: {}", report.run_id, report.message);
  println!("{}", serde_json::to_string_pretty(&report)?);

  Ok(if report.is_success() {
    ExitCode::SUCCESS
  } else {
    ExitCode::FAILURE
  })
}

fn watch_pipeline(pipeline_file: PathBuf, max_concurrent_runs: usize, env: Env) -> Result<ExitCode> {
  let rt = tokio::runtime::Runtime::new()?;
  let result = rt.block_on(async { watch_pipeline_async(pipeline_file, max_concurrent_runs, env).await });
  // A pending stdin read would otherwise block shutdown.
  rt.shutdown_timeout(std::time::Duration::from_secs(1));
  result
}

async fn watch_pipeline_async(
  pipeline_file: PathBuf,
  max_concurrent_runs: usize,
  env: Env,
) -> Result<ExitCode> {
  let pipeline = Arc::new(build_pipeline(&pipeline_file, &env)?);
  let cancel = CancellationToken::new();
  cancel_on_ctrl_c(cancel.clone());

  match pipeline.def().trigger {
    TriggerDef::Poll { .. } => {
      let state = env
        .data_dir
        .join("state")
        .join(format!("{}.json", pipeline.def().pipeline_id));
      Poller::new(pipeline, env.store.clone())?
        .with_state_path(state)
        .start(cancel)
        .await?;
    }
    TriggerDef::Webhook => {
      let runner = PipelineRunner::new(pipeline).with_max_concurrent_runs(max_concurrent_runs);
      let sender = runner.sender();

      // One payload per line; end of input stops the runner once in-flight
      // runs are done.
      tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        loop {
          match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => match serde_json::from_str(&line) {
              Ok(payload) => {
                if sender.send(payload).await.is_err() {
                  break;
                }
              }
              Err(e) => warn!(error = %e, "ignoring malformed payload line"),
            },
            Ok(None) => break,
            Err(e) => {
              warn!(error = %e, "failed to read stdin");
              break;
            }
          }
        }
      });

      runner.start(cancel).await?;
    }
  }

  info!("watch stopped");
  Ok(ExitCode::SUCCESS)
}

fn read_payload_from_stdin() -> Result<serde_json::Value> {
  use std::io::IsTerminal;

  if io::stdin().is_terminal() {
    // No stdin pipe, use empty object
    Ok(serde_json::json!({}))
  } else {
    let mut input = String::new();
    io::stdin()
      .read_to_string(&mut input)
      .context("failed to read payload from stdin")?;

    if input.trim().is_empty() {
      Ok(serde_json::json!({}))
    } else {
      serde_json::from_str(&input).context("failed to parse payload JSON from stdin")
    }
  }
}
