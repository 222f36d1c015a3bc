use crate::commands::{self, COMMANDS};
use crate::error::StoreError;
use crate::event::{Event, EventHandler};
use crate::stats::{DayProgress, Statistics};
use crate::store::{Duplicate, EntityStore, SamplingStatus, Well};
use crate::worker::{ClientMessage, WorkerMessage};
use color_eyre::{eyre::eyre, Result};
use std::io::Write;
use tokio::sync::mpsc;

/// Log action recorded for every sample
pub const SCAN_ACTION: &str = "scan";
pub const UNSAMPLE_ACTION: &str = "unsample";

const DEFAULT_LOG_LIMIT: usize = 20;

/// Mark a well sampled and append the audit entry.
pub async fn sample_well(store: &EntityStore, well_id: &str, operator: &str) -> Result<Well, StoreError> {
  let well = store
    .update_status(well_id, SamplingStatus::Sampled, operator)
    .await?;
  store
    .add_log(&well.well_id, &well.well_name, operator, SCAN_ACTION)
    .await?;
  Ok(well)
}

pub async fn unsample_well(store: &EntityStore, well_id: &str, operator: &str) -> Result<Well, StoreError> {
  let well = store
    .update_status(well_id, SamplingStatus::NotSampled, operator)
    .await?;
  store
    .add_log(&well.well_id, &well.well_name, operator, UNSAMPLE_ACTION)
    .await?;
  Ok(well)
}

/// Interactive console session
pub struct App<W: Write> {
  store: EntityStore,
  operator: String,
  control: mpsc::Sender<WorkerMessage>,
  out: W,
  /// Cache version installed and waiting for `activate`
  waiting: Option<String>,
  should_quit: bool,
}

impl<W: Write> App<W> {
  pub fn new(
    store: EntityStore,
    operator: String,
    control: mpsc::Sender<WorkerMessage>,
    out: W,
  ) -> Self {
    Self {
      store,
      operator,
      control,
      out,
      waiting: None,
      should_quit: false,
    }
  }

  pub async fn run(&mut self, events: &mut EventHandler) -> Result<()> {
    writeln!(
      self.out,
      "wellsync console, operator {}. Type `help` for commands.",
      self.operator
    )?;
    self.show_stats().await?;

    while !self.should_quit() {
      match events.next().await {
        Some(event) => self.handle_event(event).await?,
        None => break,
      }
    }
    Ok(())
  }

  async fn handle_event(&mut self, event: Event) -> Result<()> {
    match event {
      Event::Line(line) => self.execute(&line).await,
      Event::Worker(message) => self.handle_worker_message(message),
      Event::Eof => {
        self.should_quit = true;
        Ok(())
      }
    }
  }

  fn handle_worker_message(&mut self, message: ClientMessage) -> Result<()> {
    match message {
      ClientMessage::SyncComplete { kind, attempted } => {
        if attempted > 0 {
          writeln!(self.out, "{} sync finished, {} attempted", kind, attempted)?;
        }
      }
      ClientMessage::Waiting { version } => {
        writeln!(
          self.out,
          "cache version {} installed, type `activate` to switch",
          version
        )?;
        self.waiting = Some(version);
      }
      ClientMessage::Activated { version } => {
        writeln!(self.out, "cache version {} active", version)?;
        self.waiting = None;
      }
    }
    Ok(())
  }

  /// Run one console line. Store errors are reported, not fatal.
  pub async fn execute(&mut self, line: &str) -> Result<()> {
    if line.trim().is_empty() {
      return Ok(());
    }
    let Some((cmd, args)) = commands::parse(line) else {
      writeln!(self.out, "unknown command: {}", line.trim())?;
      return Ok(());
    };

    let result = match cmd.name {
      "sample" | "unsample" => match args.first() {
        Some(well_id) => self.set_status(cmd.name, well_id).await,
        None => Err(eyre!("usage: {}", cmd.usage)),
      },
      "stats" => match args.first().copied() {
        None => self.show_stats().await,
        Some("daily") => self.show_daily().await,
        Some(_) => Err(eyre!("usage: {}", cmd.usage)),
      },
      "logs" => match args.first().map(|raw| raw.parse::<usize>()) {
        Some(Err(_)) => Err(eyre!("usage: {}", cmd.usage)),
        Some(Ok(limit)) => self.show_logs(limit).await,
        None => self.show_logs(DEFAULT_LOG_LIMIT).await,
      },
      "pending" => self.show_pending().await,
      "sync" => self.send(WorkerMessage::SyncNow, "sync requested").await,
      "activate" => match self.waiting.clone() {
        Some(version) => {
          self
            .send(
              WorkerMessage::SkipWaiting,
              &format!("activating cache version {}", version),
            )
            .await
        }
        None => writeln!(self.out, "no cache version is waiting").map_err(Into::into),
      },
      "help" => self.show_help(),
      "quit" => {
        self.should_quit = true;
        Ok(())
      }
      other => Err(eyre!("unhandled command: {}", other)),
    };

    if let Err(e) = result {
      writeln!(self.out, "error: {}", e)?;
    }
    Ok(())
  }

  async fn set_status(&mut self, command: &str, well_id: &str) -> Result<()> {
    let well = if command == "sample" {
      sample_well(&self.store, well_id, &self.operator).await?
    } else {
      unsample_well(&self.store, well_id, &self.operator).await?
    };
    writeln!(
      self.out,
      "{} ({}) {}",
      well.well_id,
      well.well_name,
      well.sampling_status.as_str()
    )?;
    Ok(())
  }

  async fn show_stats(&mut self) -> Result<()> {
    let stats = Statistics::compute(&self.store).await?;
    writeln!(self.out, "{}", stats)?;
    Ok(())
  }

  async fn show_daily(&mut self) -> Result<()> {
    let days = DayProgress::history(&self.store).await?;
    if days.is_empty() {
      writeln!(self.out, "no wells sampled yet")?;
    }
    for day in days {
      writeln!(self.out, "{}", day)?;
    }
    Ok(())
  }

  async fn show_logs(&mut self, limit: usize) -> Result<()> {
    let entries = self.store.logs(Some(limit)).await?;
    if entries.is_empty() {
      writeln!(self.out, "no activity yet")?;
    }
    for entry in entries {
      writeln!(
        self.out,
        "{}  {:<8} {} ({}) by {}",
        entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
        entry.action,
        entry.well_id,
        entry.well_name,
        entry.operator
      )?;
    }
    Ok(())
  }

  async fn show_pending(&mut self) -> Result<()> {
    let wells = self.store.dirty::<Well>().await?;
    let duplicates = self.store.dirty::<Duplicate>().await?;
    writeln!(
      self.out,
      "{} wells and {} duplicates waiting to sync",
      wells.len(),
      duplicates.len()
    )?;
    for well in wells {
      writeln!(self.out, "  {} {}", well.well_id, well.sampling_status.as_str())?;
    }
    Ok(())
  }

  fn show_help(&mut self) -> Result<()> {
    for cmd in COMMANDS {
      writeln!(self.out, "  {:<20} {}", cmd.usage, cmd.description)?;
    }
    Ok(())
  }

  async fn send(&mut self, message: WorkerMessage, confirmation: &str) -> Result<()> {
    self
      .control
      .send(message)
      .await
      .map_err(|_| eyre!("background worker is not running"))?;
    writeln!(self.out, "{}", confirmation)?;
    Ok(())
  }

  pub fn should_quit(&self) -> bool {
    self.should_quit
  }
}
