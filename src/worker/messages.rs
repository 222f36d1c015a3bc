use crate::store::EntityKind;

/// Broadcast from the worker to every subscribed console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
  /// A sync pass for `kind` finished
  SyncComplete { kind: EntityKind, attempted: usize },
  /// The cache version is active and old generations are gone
  Activated { version: String },
  /// A new cache version is installed and waits for `SkipWaiting`
  Waiting { version: String },
}

/// Control messages from the console to the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMessage {
  /// Activate an installed version now
  SkipWaiting,
  SyncNow,
  Shutdown,
}
