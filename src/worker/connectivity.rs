//! Reachability tracking for the remote.

use async_trait::async_trait;

use crate::sync::HttpRemote;

#[async_trait]
pub trait Probe: Send + Sync + 'static {
  async fn is_reachable(&self) -> bool;
}

#[async_trait]
impl Probe for HttpRemote {
  async fn is_reachable(&self) -> bool {
    self.health_check().await
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
  CameOnline,
  WentOffline,
  Unchanged,
}

/// Remembers the last probe result. Starts unknown, so the first successful
/// probe counts as coming online.
#[derive(Debug, Default)]
pub struct ConnectivityMonitor {
  online: Option<bool>,
}

impl ConnectivityMonitor {
  pub fn observe(&mut self, reachable: bool) -> Transition {
    let previous = self.online.replace(reachable);
    match (previous, reachable) {
      (Some(true), true) | (Some(false), false) => Transition::Unchanged,
      (_, true) => {
        tracing::info!("remote reachable");
        Transition::CameOnline
      }
      (_, false) => {
        tracing::info!("remote unreachable, working offline");
        Transition::WentOffline
      }
    }
  }

  pub fn is_online(&self) -> bool {
    self.online == Some(true)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_first_success_counts_as_reconnect() {
    let mut monitor = ConnectivityMonitor::default();
    assert!(!monitor.is_online());
    assert_eq!(monitor.observe(true), Transition::CameOnline);
    assert_eq!(monitor.observe(true), Transition::Unchanged);
    assert!(monitor.is_online());
  }

  #[test]
  fn test_flapping_connection() {
    let mut monitor = ConnectivityMonitor::default();
    assert_eq!(monitor.observe(false), Transition::WentOffline);
    assert_eq!(monitor.observe(false), Transition::Unchanged);
    assert_eq!(monitor.observe(true), Transition::CameOnline);
    assert_eq!(monitor.observe(false), Transition::WentOffline);
    assert_eq!(monitor.observe(true), Transition::CameOnline);
  }
}
