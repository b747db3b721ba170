use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use bonded::{
    call::{CallLogId, CallLogRecord, CallLogStore, CallLogUpdate, NewCallLog},
    error::Error,
    sync::RwLock,
};

/// Call history kept in process
#[derive(Clone, Default)]
pub struct MemoryCallLog {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    records: RwLock<Vec<CallLogRecord>>,
    next_id: AtomicU64,
    failing: AtomicBool,
}

impl MemoryCallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<CallLogRecord> {
        self.inner.records.read().clone()
    }

    pub fn get(&self, id: &CallLogId) -> Option<CallLogRecord> {
        self.inner
            .records
            .read()
            .iter()
            .find(|r| &r.id == id)
            .cloned()
    }

    /// while failing every insert and update returns an error
    pub fn set_failing(&self, failing: bool) {
        self.inner.failing.store(failing, Ordering::SeqCst);
    }

    /// polls the first record until `predicate` holds or `timeout` passes
    pub async fn wait_for<F>(&self, timeout: Duration, predicate: F) -> Option<CallLogRecord>
    where
        F: Fn(&CallLogRecord) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(record) = self.records().into_iter().next() {
                if predicate(&record) {
                    return Some(record);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn check(&self) -> Result<(), Error> {
        if self.inner.failing.load(Ordering::SeqCst) {
            return Err(Error::CallLog("store unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl CallLogStore for MemoryCallLog {
    async fn insert(&self, entry: NewCallLog) -> Result<CallLogId, Error> {
        self.check()?;
        let id = CallLogId(
            (self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1).to_string(),
        );
        self.inner.records.write().push(CallLogRecord {
            id: id.clone(),
            caller_id: entry.caller_id,
            receiver_id: entry.receiver_id,
            status: entry.status,
            duration: 0,
            started_at: entry.started_at,
            ended_at: None,
        });
        Ok(id)
    }

    async fn update(&self, id: &CallLogId, update: CallLogUpdate) -> Result<(), Error> {
        self.check()?;
        let mut records = self.inner.records.write();
        let record = records
            .iter_mut()
            .find(|r| &r.id == id)
            .ok_or_else(|| Error::CallLog(format!("no call log with id {id}")))?;
        record.apply(&update);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bonded::call::CallLogStatus;

    #[tokio::test]
    async fn update_unknown_row_fails() -> anyhow::Result<()> {
        let store = MemoryCallLog::new();
        let result = store
            .update(
                &CallLogId("404".into()),
                CallLogUpdate::status(CallLogStatus::Completed),
            )
            .await;
        assert!(matches!(result, Err(Error::CallLog(_))));
        Ok(())
    }

    #[tokio::test]
    async fn ids_are_distinct() -> anyhow::Result<()> {
        let store = MemoryCallLog::new();
        let entry = NewCallLog::new("a".parse()?, "b".parse()?, CallLogStatus::Missed);
        let first = store.insert(entry.clone()).await?;
        let second = store.insert(entry).await?;
        assert_ne!(first, second);
        assert_eq!(store.get(&second).map(|r| r.status), Some(CallLogStatus::Missed));
        Ok(())
    }
}
