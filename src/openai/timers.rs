//! # Scheduled Tasks
//!
//! A cancelable one-shot timer with a single active instance per purpose.
//! Each call session holds one of these per timed concern (connection
//! establishment, commit debounce, commit-ack safety, response fallback);
//! re-arming cancels the previous instance, and dropping the session cancels
//! everything, so no timer leaks across reconnects.

use std::time::Duration;
use tokio::task::JoinHandle;

/// One scheduled action; at most one instance is ever pending.
#[derive(Debug, Default)]
pub struct ScheduledTask {
    handle: Option<JoinHandle<()>>,
}

impl ScheduledTask {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the timer, replacing any pending instance.
    pub fn arm<F>(&mut self, delay: Duration, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.cancel();
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            action();
        }));
    }

    /// Cancel the pending instance, if any.
    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_fires_after_delay() {
        let fired = Arc::new(AtomicU32::new(0));
        let mut task = ScheduledTask::new();
        let f = fired.clone();
        task.arm(Duration::from_millis(10), move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rearm_cancels_previous() {
        let fired = Arc::new(AtomicU32::new(0));
        let mut task = ScheduledTask::new();
        for _ in 0..5 {
            let f = fired.clone();
            task.arm(Duration::from_millis(20), move || {
                f.fetch_add(1, Ordering::SeqCst);
            });
        }
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_prevents_firing() {
        let fired = Arc::new(AtomicU32::new(0));
        let mut task = ScheduledTask::new();
        let f = fired.clone();
        task.arm(Duration::from_millis(10), move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        task.cancel();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!task.is_armed());
    }
}
