//! Single-assignment latch for late-bound collaborators.

use parking_lot::RwLock;
use tokio::sync::Notify;
use tracing::warn;

/// A write-once cell whose readers can await the value.
///
/// The segment allocation manager is constructed before the WAL is opened;
/// the WAL handle arrives later through one of these. The write path only
/// runs after the latch has fired, so consumers never need to handle the
/// unset case beyond awaiting [`FutureCell::get`].
pub struct FutureCell<T: Clone> {
    slot: RwLock<Option<T>>,
    notify: Notify,
}

impl<T: Clone> FutureCell<T> {
    pub fn new() -> Self {
        Self {
            slot: RwLock::new(None),
            notify: Notify::new(),
        }
    }

    /// Construct an already-resolved cell.
    pub fn ready(value: T) -> Self {
        Self {
            slot: RwLock::new(Some(value)),
            notify: Notify::new(),
        }
    }

    /// Resolve the latch. Only the first call takes effect.
    pub fn set(&self, value: T) {
        {
            let mut slot = self.slot.write();
            if slot.is_some() {
                warn!("future cell set twice, ignoring");
                return;
            }
            *slot = Some(value);
        }
        self.notify.notify_waiters();
    }

    /// Wait until the latch fires, then clone the value out.
    pub async fn get(&self) -> T {
        loop {
            let notified = self.notify.notified();
            if let Some(value) = self.slot.read().clone() {
                return value;
            }
            notified.await;
        }
    }

    /// Non-blocking read.
    pub fn peek(&self) -> Option<T> {
        self.slot.read().clone()
    }
}

impl<T: Clone> Default for FutureCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn get_blocks_until_set() {
        let cell = Arc::new(FutureCell::<u64>::new());
        assert!(cell.peek().is_none());

        let waiter = {
            let cell = cell.clone();
            tokio::spawn(async move { cell.get().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cell.set(42);

        assert_eq!(waiter.await.unwrap(), 42);
        assert_eq!(cell.peek(), Some(42));
    }

    #[tokio::test]
    async fn second_set_is_ignored() {
        let cell = FutureCell::new();
        cell.set(1);
        cell.set(2);
        assert_eq!(cell.get().await, 1);
    }
}
