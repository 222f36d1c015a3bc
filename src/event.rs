use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::{broadcast, mpsc};

use crate::worker::ClientMessage;

/// Console events
#[derive(Debug, PartialEq, Eq)]
pub enum Event {
  /// A line typed by the operator
  Line(String),
  /// Notification from the background worker
  Worker(ClientMessage),
  /// Input closed
  Eof,
}

/// Event handler that merges console input with worker broadcasts
pub struct EventHandler {
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  pub fn new<I>(input: I, mut worker: broadcast::Receiver<ClientMessage>) -> Self
  where
    I: AsyncBufRead + Unpin + Send + 'static,
  {
    let (tx, rx) = mpsc::unbounded_channel();

    // Spawn input reader
    let input_tx = tx.clone();
    tokio::spawn(async move {
      let mut lines = input.lines();
      loop {
        match lines.next_line().await {
          Ok(Some(line)) => {
            if input_tx.send(Event::Line(line)).is_err() {
              break;
            }
          }
          Ok(None) => {
            let _ = input_tx.send(Event::Eof);
            break;
          }
          Err(e) => {
            tracing::warn!(error = %e, "failed to read console input");
            let _ = input_tx.send(Event::Eof);
            break;
          }
        }
      }
    });

    // Forward worker notifications
    tokio::spawn(async move {
      loop {
        match worker.recv().await {
          Ok(message) => {
            if tx.send(Event::Worker(message)).is_err() {
              break;
            }
          }
          Err(broadcast::error::RecvError::Lagged(skipped)) => {
            tracing::warn!(skipped, "console fell behind worker notifications");
          }
          Err(broadcast::error::RecvError::Closed) => break,
        }
      }
    });

    Self { rx }
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::EntityKind;

  #[tokio::test]
  async fn test_merges_input_and_worker_messages() {
    let (worker_tx, worker_rx) = broadcast::channel(4);
    let mut events = EventHandler::new(&b"stats\nsample W-1\n"[..], worker_rx);

    let mut lines = Vec::new();
    while let Some(event) = events.next().await {
      match event {
        Event::Line(line) => lines.push(line),
        Event::Eof => break,
        Event::Worker(_) => unreachable!(),
      }
    }
    assert_eq!(lines, vec!["stats", "sample W-1"]);

    worker_tx
      .send(ClientMessage::SyncComplete {
        kind: EntityKind::Well,
        attempted: 3,
      })
      .unwrap();
    assert_eq!(
      events.next().await,
      Some(Event::Worker(ClientMessage::SyncComplete {
        kind: EntityKind::Well,
        attempted: 3
      }))
    );
  }
}
