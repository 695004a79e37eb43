//! Flush acknowledgement tracking

use parking_lot::Mutex;
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::Notify;

/// Result of waiting for a flush id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// The process echoed the id
    Acknowledged,
    /// The result stream ended; the id will never arrive
    Cleared,
    /// Nothing happened within the wait interval
    TimedOut,
}

#[derive(Debug, Default)]
struct FlushState {
    acknowledged: HashSet<String>,
    /// Ids whose waiter gave up before the echo arrived
    abandoned: HashSet<String>,
    cleared: bool,
}

/// Rendezvous between the result parser and flush callers
#[derive(Debug, Default)]
pub struct FlushListener {
    state: Mutex<FlushState>,
    notify: Notify,
}

impl FlushListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that the process echoed `flush_id`
    pub fn acknowledge(&self, flush_id: &str) {
        {
            let mut state = self.state.lock();
            if state.abandoned.remove(flush_id) {
                return;
            }
            state.acknowledged.insert(flush_id.to_string());
        }
        self.notify.notify_waiters();
    }

    /// Stop tracking `flush_id`; a later echo of it is discarded
    pub fn forget(&self, flush_id: &str) {
        let mut state = self.state.lock();
        if !state.acknowledged.remove(flush_id) {
            state.abandoned.insert(flush_id.to_string());
        }
    }

    /// Echoed ids not yet consumed by a waiter
    pub fn unclaimed(&self) -> usize {
        self.state.lock().acknowledged.len()
    }

    /// Release every waiter; called when the result stream ends
    pub fn clear(&self) {
        self.state.lock().cleared = true;
        self.notify.notify_waiters();
    }

    /// Wait up to `interval` for `flush_id` to be acknowledged
    pub async fn wait_for_flush(&self, flush_id: &str, interval: Duration) -> FlushOutcome {
        tokio::time::timeout(interval, self.wait_indefinitely(flush_id))
            .await
            .unwrap_or(FlushOutcome::TimedOut)
    }

    async fn wait_indefinitely(&self, flush_id: &str) -> FlushOutcome {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.acknowledged.remove(flush_id) {
                    return FlushOutcome::Acknowledged;
                }
                if state.cleared {
                    return FlushOutcome::Cleared;
                }
            }

            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_ack_before_wait() {
        let listener = FlushListener::new();
        listener.acknowledge("1");
        assert_eq!(
            listener.wait_for_flush("1", Duration::from_secs(1)).await,
            FlushOutcome::Acknowledged
        );
        // Each acknowledgement is consumed once
        assert_eq!(
            listener.wait_for_flush("1", Duration::from_millis(10)).await,
            FlushOutcome::TimedOut
        );
    }

    #[tokio::test]
    async fn test_ack_wakes_waiter() {
        let listener = Arc::new(FlushListener::new());
        let waiter = {
            let listener = listener.clone();
            tokio::spawn(async move { listener.wait_for_flush("9", Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        listener.acknowledge("8");
        listener.acknowledge("9");
        assert_eq!(waiter.await.unwrap(), FlushOutcome::Acknowledged);
    }

    #[tokio::test]
    async fn test_clear_releases_waiter() {
        let listener = Arc::new(FlushListener::new());
        let waiter = {
            let listener = listener.clone();
            tokio::spawn(async move { listener.wait_for_flush("3", Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        listener.clear();
        assert_eq!(waiter.await.unwrap(), FlushOutcome::Cleared);
    }

    #[test]
    fn test_forgotten_flush_is_not_retained() {
        let listener = FlushListener::new();

        // Echo arrives after the waiter gave up
        listener.forget("7");
        listener.acknowledge("7");
        assert_eq!(listener.unclaimed(), 0);

        // Echo arrived but nobody collected it
        listener.acknowledge("8");
        assert_eq!(listener.unclaimed(), 1);
        listener.forget("8");
        assert_eq!(listener.unclaimed(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let listener = FlushListener::new();
        assert_eq!(
            listener.wait_for_flush("4", Duration::from_secs(1)).await,
            FlushOutcome::TimedOut
        );
    }
}
