use async_trait::async_trait;
use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::{error::Error, identity::ParticipantId};

/// Row identifier handed out by the store on insert
#[derive(Debug, Display, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallLogId(pub String);

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallLogStatus {
    #[display(fmt = "missed")]
    Missed,
    #[display(fmt = "completed")]
    Completed,
    #[display(fmt = "rejected")]
    Rejected,
}

/// What the caller writes when it starts dialing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewCallLog {
    pub caller_id: ParticipantId,
    pub receiver_id: ParticipantId,
    pub status: CallLogStatus,
    /// stamped when dialing starts, not when the row reaches the store
    pub started_at: DateTime<Utc>,
}

impl NewCallLog {
    pub fn new(
        caller_id: ParticipantId,
        receiver_id: ParticipantId,
        status: CallLogStatus,
    ) -> Self {
        Self {
            caller_id,
            receiver_id,
            status,
            started_at: Utc::now(),
        }
    }
}

/// Partial update keyed by [`CallLogId`]. Fields left as `None` are not touched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallLogUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<CallLogStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl CallLogUpdate {
    pub fn status(status: CallLogStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// the final write for a call attempt
    pub fn finalize(status: CallLogStatus, duration: u64, ended_at: DateTime<Utc>) -> Self {
        Self {
            status: Some(status),
            duration: Some(duration),
            ended_at: Some(ended_at),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallLogRecord {
    pub id: CallLogId,
    pub caller_id: ParticipantId,
    pub receiver_id: ParticipantId,
    pub status: CallLogStatus,
    #[serde(default)]
    pub duration: u64,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

impl CallLogRecord {
    pub fn apply(&mut self, update: &CallLogUpdate) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(duration) = update.duration {
            self.duration = duration;
        }
        if let Some(ended_at) = update.ended_at {
            self.ended_at = Some(ended_at);
        }
    }
}

/// History table. Only insert and update-by-id are needed by the call core.
#[async_trait]
pub trait CallLogStore: Send + Sync + 'static {
    async fn insert(&self, entry: NewCallLog) -> Result<CallLogId, Error>;
    async fn update(&self, id: &CallLogId, update: CallLogUpdate) -> Result<(), Error>;
}
