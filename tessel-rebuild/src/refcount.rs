//! Reference counting with blocking teardown
//!
//! The owner holds the initial reference. Workers `acquire` before they
//! start and release on every exit path by dropping their guard. Teardown
//! waits, without spinning, until only the owner is left.

use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;

#[derive(Debug)]
pub struct RefCount {
    count: AtomicUsize,
    drained: Notify,
}

impl Default for RefCount {
    fn default() -> Self {
        Self::new()
    }
}

impl RefCount {
    /// Starts at one: the owner's reference
    pub fn new() -> Self {
        Self {
            count: AtomicUsize::new(1),
            drained: Notify::new(),
        }
    }

    pub fn get(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn acquire(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn release(&self) {
        let prev = self.count.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "refcount underflow");
        if prev <= 2 {
            self.drained.notify_waiters();
        }
    }

    /// Wait until only the owner's reference remains
    pub async fn wait_for_owner(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.get() <= 1 {
                return;
            }
            notified.await;
        }
    }

    /// Drop the owner's reference after `wait_for_owner`
    pub fn release_owner(&self) -> usize {
        self.count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .map(|prev| prev - 1)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_balanced_acquire_release() {
        let refs = RefCount::new();
        refs.acquire();
        refs.acquire();
        assert_eq!(refs.get(), 3);
        refs.release();
        refs.release();
        assert_eq!(refs.get(), 1);
        assert_eq!(refs.release_owner(), 0);
    }

    #[tokio::test]
    async fn test_wait_for_owner_blocks_until_released() {
        let refs = Arc::new(RefCount::new());
        for _ in 0..4 {
            refs.acquire();
        }

        let workers: Vec<_> = (0..4)
            .map(|i| {
                let refs = refs.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(5 * i)).await;
                    refs.release();
                })
            })
            .collect();

        refs.wait_for_owner().await;
        assert_eq!(refs.get(), 1);
        assert_eq!(refs.release_owner(), 0);

        for w in workers {
            w.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_wait_returns_immediately_when_idle() {
        let refs = RefCount::new();
        tokio::time::timeout(Duration::from_millis(100), refs.wait_for_owner())
            .await
            .unwrap();
    }
}
