mod app;
mod cache;
mod commands;
mod config;
mod db;
mod error;
mod event;
mod logging;
mod proxy;
mod stats;
mod store;
mod sync;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::{CacheLayer, Generations, HttpFetcher, RoutingRules, SqliteStorage};
use crate::config::{Config, OPERATOR_SETTING};
use crate::store::{
  generate_duplicates, AnalysisStatus, Duplicate, DuplicateRatio, EntityStore, SamplingStatus,
  Snapshot, Well, WellImport,
};
use crate::sync::{HttpRemote, PassOutcome, SyncEngine, SyncError};
use crate::worker::Worker;

#[derive(Parser, Debug)]
#[command(name = "wellsync")]
#[command(about = "Offline-first well sampling log with background sync")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/wellsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Entity database to use instead of the configured one
  #[arg(short, long)]
  database: Option<PathBuf>,

  /// Debug logging
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
  /// Import wells from a JSON file
  Import { file: PathBuf },
  /// Mark a well as sampled
  Sample {
    well_id: String,
    #[arg(short, long)]
    operator: Option<String>,
  },
  /// Reset a well to not sampled
  Unsample {
    well_id: String,
    #[arg(short, long)]
    operator: Option<String>,
  },
  /// List wells
  Wells {
    /// sampled or not_sampled
    #[arg(short, long)]
    status: Option<SamplingStatus>,
    /// Substring of the well id or name
    #[arg(short = 'q', long)]
    search: Option<String>,
  },
  /// Show sampling progress
  Stats {
    /// Per-day history of sampled wells
    #[arg(long)]
    daily: bool,
  },
  /// Show recent activity
  Logs {
    #[arg(short, long, default_value_t = 50)]
    limit: usize,
  },
  /// Manage duplicate samples
  Duplicates {
    #[command(subcommand)]
    action: DuplicatesCmd,
  },
  /// Push local changes to the remote once
  Sync,
  /// Write a JSON snapshot of all local data
  Export { file: Option<PathBuf> },
  /// Replace all local data with a snapshot
  Restore { file: PathBuf },
  /// Delete all local data
  Reset {
    #[arg(long)]
    yes: bool,
  },
  /// Read or write stored settings
  Settings {
    #[command(subcommand)]
    action: SettingsCmd,
  },
  /// Start the background worker, the caching proxy and the console
  Run,
}

#[derive(Subcommand, Debug)]
enum DuplicatesCmd {
  /// Create duplicates for every D-th sampled well
  Generate {
    #[arg(short, long, default_value_t = DuplicateRatio::default())]
    ratio: DuplicateRatio,
  },
  List,
  Remove { duplicate_id: String },
  /// Record that a duplicate was analyzed
  Analyzed { duplicate_id: String },
}

#[derive(Subcommand, Debug)]
enum SettingsCmd {
  Get { key: String },
  /// VALUE is stored as JSON when it parses as JSON, else as a string
  Set { key: String, value: String },
}

/// Import files are either a bare array or `{"wells": [...]}`.
#[derive(Deserialize)]
#[serde(untagged)]
enum ImportFile {
  Wells(Vec<WellImport>),
  Wrapped { wells: Vec<WellImport> },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = Config::load(args.config.as_deref())?;
  if let Some(database) = args.database {
    config.database = Some(database);
  }

  let db_path = config.database_path()?;

  // The console keeps stdout for itself
  let _guard = match args.command {
    Cmd::Run => {
      let log_dir = db_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
      Some(logging::init_file(&log_dir, args.verbose)?)
    }
    _ => {
      logging::init_stderr(args.verbose);
      None
    }
  };

  let store = EntityStore::open(&db_path)?;
  let mut out = std::io::stdout();

  match args.command {
    Cmd::Import { file } => {
      let contents = std::fs::read_to_string(&file)
        .map_err(|e| eyre!("Failed to read {}: {}", file.display(), e))?;
      let rows = match serde_json::from_str(&contents)? {
        ImportFile::Wells(rows) | ImportFile::Wrapped { wells: rows } => rows,
      };
      let summary = store.add_wells(rows).await?;
      writeln!(
        out,
        "imported {} of {} wells ({} invalid, {} already present)",
        summary.added, summary.attempted, summary.invalid, summary.conflicts
      )?;
    }
    Cmd::Sample { well_id, operator } => {
      let operator = resolve_operator(&config, &store, operator).await?;
      let well = app::sample_well(&store, &well_id, &operator).await?;
      writeln!(out, "{} ({}) sampled by {}", well.well_id, well.well_name, operator)?;
    }
    Cmd::Unsample { well_id, operator } => {
      let operator = resolve_operator(&config, &store, operator).await?;
      let well = app::unsample_well(&store, &well_id, &operator).await?;
      writeln!(out, "{} ({}) reset", well.well_id, well.well_name)?;
    }
    Cmd::Wells { status, search } => {
      let mut wells = match &search {
        Some(query) => store.search_wells(query).await?,
        None => match status {
          Some(status) => store.get_by_index::<Well>("status", status).await?,
          None => store.get_all::<Well>().await?,
        },
      };
      if let (Some(_), Some(status)) = (&search, status) {
        wells.retain(|w| w.sampling_status == status);
      }
      for well in &wells {
        writeln!(
          out,
          "{:<16} {:<24} {:<12} {}{}",
          well.well_id,
          well.well_name,
          well.sampling_status.as_str(),
          well.sampled_by.as_deref().unwrap_or("-"),
          if well.dirty { "  *" } else { "" }
        )?;
      }
      writeln!(out, "{} wells", wells.len())?;
    }
    Cmd::Stats { daily } => {
      writeln!(out, "{}", stats::Statistics::compute(&store).await?)?;
      if daily {
        for day in stats::DayProgress::history(&store).await? {
          writeln!(out, "{}", day)?;
        }
      }
    }
    Cmd::Logs { limit } => {
      for entry in store.logs(Some(limit)).await? {
        writeln!(
          out,
          "{}  {:<8} {} ({}) by {}",
          entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
          entry.action,
          entry.well_id,
          entry.well_name,
          entry.operator
        )?;
      }
    }
    Cmd::Duplicates { action } => match action {
      DuplicatesCmd::Generate { ratio } => {
        let summary = generate_duplicates(&store, ratio).await?;
        writeln!(
          out,
          "created {} duplicates at {} ({} already existed)",
          summary.added, ratio, summary.conflicts
        )?;
      }
      DuplicatesCmd::List => {
        for dup in store.get_all::<Duplicate>().await? {
          writeln!(
            out,
            "{:<24} {:<16} {:<6} {}",
            dup.duplicate_id,
            dup.original_sample_id,
            dup.duplicate_ratio,
            dup.analysis_status.as_str()
          )?;
        }
      }
      DuplicatesCmd::Remove { duplicate_id } => {
        if store.delete::<Duplicate>(&duplicate_id).await? {
          writeln!(out, "removed {}", duplicate_id)?;
        } else {
          return Err(eyre!("No duplicate named {}", duplicate_id));
        }
      }
      DuplicatesCmd::Analyzed { duplicate_id } => {
        let dup = store
          .set_analysis_status(&duplicate_id, AnalysisStatus::Analyzed)
          .await?;
        writeln!(out, "{} analyzed", dup.duplicate_id)?;
      }
    },
    Cmd::Sync => {
      let engine = SyncEngine::new(store.clone(), HttpRemote::new(&config.remote)?);
      report_sync(&mut out, engine.sync_all().await)?;
    }
    Cmd::Export { file } => {
      let snapshot = store.export_snapshot().await?;
      let json = serde_json::to_string_pretty(&snapshot)?;
      match file {
        Some(path) => {
          std::fs::write(&path, json)
            .map_err(|e| eyre!("Failed to write {}: {}", path.display(), e))?;
          writeln!(
            out,
            "exported {} wells and {} duplicates to {}",
            snapshot.wells.len(),
            snapshot.duplicates.len(),
            path.display()
          )?;
        }
        None => writeln!(out, "{}", json)?,
      }
    }
    Cmd::Restore { file } => {
      let contents = std::fs::read_to_string(&file)
        .map_err(|e| eyre!("Failed to read {}: {}", file.display(), e))?;
      let snapshot: Snapshot = serde_json::from_str(&contents)?;
      let summary = store.import_snapshot(snapshot).await?;
      writeln!(
        out,
        "restored {} of {} records, all pending sync",
        summary.added, summary.attempted
      )?;
    }
    Cmd::Reset { yes } => {
      if !yes {
        return Err(eyre!("Refusing to delete all local data without --yes"));
      }
      store.clear_all().await?;
      writeln!(out, "local data deleted")?;
    }
    Cmd::Settings { action } => match action {
      SettingsCmd::Get { key } => match store.setting(&key).await? {
        Some(value) => writeln!(out, "{}", value)?,
        None => writeln!(out, "{} is not set", key)?,
      },
      SettingsCmd::Set { key, value } => {
        let value = serde_json::from_str(&value).unwrap_or(serde_json::Value::String(value));
        store.set_setting(&key, &value).await?;
      }
    },
    Cmd::Run => return run(config, store, &db_path).await,
  }

  Ok(())
}

/// Print every pass result, then fail with the first error if any pass failed.
fn report_sync(
  out: &mut impl Write,
  outcomes: Vec<Result<PassOutcome, SyncError>>,
) -> Result<()> {
  let mut first_error = None;
  for outcome in outcomes {
    match outcome {
      Ok(PassOutcome::Completed(report)) => writeln!(
        out,
        "{}: {} pushed, {} failed",
        report.kind, report.pushed, report.failed
      )?,
      Ok(PassOutcome::Skipped(kind)) => writeln!(out, "{}: already syncing", kind)?,
      Err(e) => {
        writeln!(out, "sync pass failed: {}", e)?;
        first_error.get_or_insert(e);
      }
    }
  }
  match first_error {
    Some(e) => Err(e.into()),
    None => Ok(()),
  }
}

async fn resolve_operator(
  config: &Config,
  store: &EntityStore,
  explicit: Option<String>,
) -> Result<String> {
  match explicit {
    Some(name) => Ok(name),
    None => config.operator(store).await,
  }
}

/// Long-running mode: worker and proxy in the background, console in front.
async fn run(config: Config, console_store: EntityStore, db_path: &Path) -> Result<()> {
  // The worker gets its own connection to the same database
  let worker_store = EntityStore::open(db_path)?;
  let operator = config.operator(&console_store).await?;
  if console_store.setting(OPERATOR_SETTING).await?.is_none() {
    console_store
      .set_setting(OPERATOR_SETTING, &serde_json::Value::String(operator.clone()))
      .await?;
  }

  let worker_config = &config.worker;
  let origin = Url::parse(&worker_config.origin)
    .map_err(|e| eyre!("Invalid origin '{}': {}", worker_config.origin, e))?;
  let precache = worker_config
    .precache
    .iter()
    .map(|path| origin.join(path))
    .collect::<Result<Vec<_>, _>>()
    .map_err(|e| eyre!("Invalid precache path: {}", e))?;

  let fetch_timeout = Duration::from_secs(worker_config.fetch_timeout_secs);
  let rules = RoutingRules {
    api_prefix: worker_config.api_prefix.clone(),
    excluded_paths: worker_config.excluded_paths.clone(),
    ..Default::default()
  };
  let cache = CacheLayer::new(
    SqliteStorage::open(&config.cache_path()?)?,
    HttpFetcher::new(fetch_timeout)?,
    rules,
    Generations::new(&worker_config.cache_version),
  );

  let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
  let proxy = match &worker_config.listen {
    Some(listen) => {
      let state = proxy::ProxyState::new(cache.clone(), &worker_config.origin, fetch_timeout)?;
      let listen = listen.clone();
      Some(tokio::spawn(async move {
        let shutdown = async {
          let _ = shutdown_rx.await;
        };
        if let Err(e) = proxy::serve(&listen, state, shutdown).await {
          tracing::error!(error = %e, "proxy stopped");
        }
      }))
    }
    None => None,
  };

  let engine = SyncEngine::new(worker_store, HttpRemote::new(&config.remote)?);
  let worker = Worker::new(engine, cache, precache, worker_config);
  let mut events = event::EventHandler::new(
    tokio::io::BufReader::new(tokio::io::stdin()),
    worker.subscribe(),
  );
  let handle = worker.spawn();

  let mut console = app::App::new(console_store, operator, handle.control(), std::io::stdout());
  let result = console.run(&mut events).await;

  handle.shutdown().await;
  let _ = shutdown_tx.send(());
  if let Some(proxy) = proxy {
    let _ = proxy.await;
  }
  result
}
