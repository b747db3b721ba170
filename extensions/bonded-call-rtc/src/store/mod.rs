//! Call history backends and the per-call writer that keeps the writes for one row in order.

use std::sync::Arc;

use bonded::call::{CallLogStatus, CallLogStore, CallLogUpdate, NewCallLog};
use chrono::{DateTime, Utc};
use tokio::sync::mpsc::{self, UnboundedSender};

mod memory;
pub mod rest;

pub use memory::MemoryCallLog;
pub use rest::RestCallLog;

/// Owns the history row of one call attempt. The row is inserted in the background and
/// every later update is applied in submission order once the row id is known. A failed
/// insert drops the updates that follow it.
pub struct CallLogWriter {
    ch: UnboundedSender<CallLogUpdate>,
    started_at: DateTime<Utc>,
}

impl CallLogWriter {
    pub fn spawn(store: Arc<dyn CallLogStore>, entry: NewCallLog) -> Self {
        let started_at = entry.started_at;
        let (tx, mut rx) = mpsc::unbounded_channel::<CallLogUpdate>();
        tokio::spawn(async move {
            let id = match store.insert(entry).await {
                Ok(r) => r,
                Err(e) => {
                    log::error!("failed to insert call log: {e}");
                    return;
                }
            };
            log::debug!("inserted call log {id}");
            while let Some(update) = rx.recv().await {
                if let Err(e) = store.update(&id, update).await {
                    log::error!("failed to update call log {id}: {e}");
                }
            }
        });
        Self { ch: tx, started_at }
    }

    pub fn update(&self, update: CallLogUpdate) {
        if self.ch.send(update).is_err() {
            log::warn!("call log writer is gone. dropping update");
        }
    }

    /// last write for the row. consumes the writer so nothing can follow it.
    /// `ended_at` never precedes the start of the row
    pub fn finalize(self, status: CallLogStatus, duration: u64, ended_at: DateTime<Utc>) {
        let ended_at = ended_at.max(self.started_at);
        self.update(CallLogUpdate::finalize(status, duration, ended_at));
    }
}
