//! Single-slot, overwrite-on-full mailbox.
//!
//! [`CoalescingMailbox::offer`] never waits: it replaces whatever value has not
//! been taken yet, so a consumer always sees the most recent value and never a
//! superseded one. [`CoalescingMailbox::take`] waits for a value or for the
//! mailbox to be closed.
use std::sync::{
    Mutex, PoisonError,
    atomic::{AtomicBool, Ordering},
};

use tokio::sync::Notify;

#[derive(Debug)]
pub struct CoalescingMailbox<T> {
    slot: Mutex<Option<T>>,
    notify: Notify,
    closed: AtomicBool,
}

impl<T> Default for CoalescingMailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CoalescingMailbox<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Store `value`, returning the unconsumed value it superseded, if any.
    pub fn offer(&self, value: T) -> Option<T> {
        let previous = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(value);
        self.notify.notify_one();
        previous
    }

    /// Take the current value without waiting.
    pub fn try_take(&self) -> Option<T> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Wait for the next value. Returns `None` once the mailbox is closed and empty.
    pub async fn take(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            if let Some(value) = self.try_take() {
                return Some(value);
            }
            if self.is_closed() {
                return None;
            }
            notified.await;
        }
    }

    /// Wake the consumer; a pending value is still delivered before `take` yields `None`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;

    #[test]
    fn test_offer_overwrites_unconsumed_value() {
        let mailbox = CoalescingMailbox::new();
        assert_eq!(mailbox.offer(1), None);
        assert_eq!(mailbox.offer(2), Some(1));
        assert_eq!(mailbox.offer(3), Some(2));
        assert_eq!(mailbox.try_take(), Some(3));
        assert!(mailbox.is_empty());
    }

    #[tokio::test]
    async fn test_take_waits_for_offer() {
        let mailbox = Arc::new(CoalescingMailbox::new());
        let consumer = {
            let mailbox = mailbox.clone();
            tokio::spawn(async move { mailbox.take().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        mailbox.offer("latest");

        let value = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(value, Some("latest"));
    }

    #[tokio::test]
    async fn test_burst_collapses_to_latest() {
        let mailbox = CoalescingMailbox::new();
        for i in 0..100 {
            mailbox.offer(i);
        }
        assert_eq!(mailbox.take().await, Some(99));
        assert!(mailbox.is_empty());
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let mailbox = CoalescingMailbox::new();
        mailbox.offer(7);
        mailbox.close();
        assert_eq!(mailbox.take().await, Some(7));
        assert_eq!(mailbox.take().await, None);
    }

    #[tokio::test]
    async fn test_close_wakes_waiting_consumer() {
        let mailbox: Arc<CoalescingMailbox<u8>> = Arc::new(CoalescingMailbox::new());
        let consumer = {
            let mailbox = mailbox.clone();
            tokio::spawn(async move { mailbox.take().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        mailbox.close();

        let value = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(value, None);
    }
}
