use std::sync::Arc;
use tokio::sync::Notify;

/// Stops the task waiting on `notify` when the last handle holding it goes away.
/// Each wrapper has exactly one task behind it, so the permit is kept if that task
/// is busy when the wrapper drops.
pub struct NotifyWrapper {
    pub notify: Arc<Notify>,
}

impl Drop for NotifyWrapper {
    fn drop(&mut self) {
        self.notify.notify_one();
    }
}
