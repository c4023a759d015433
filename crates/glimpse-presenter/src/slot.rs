//! Single-slot drop-oldest channels.
//!
//! The pipeline stages are connected by channels holding at most one
//! item: a slow consumer never builds a backlog, it just sees the
//! newest item. The displaced item is handed back to the producer so
//! its buffers can be released immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

struct Shared<T> {
    slot: Mutex<Option<T>>,
    notify: Notify,
    closed: AtomicBool,
}

pub struct SlotSender<T> {
    shared: Arc<Shared<T>>,
}

pub struct SlotReceiver<T> {
    shared: Arc<Shared<T>>,
}

/// Create a connected sender/receiver pair.
#[must_use]
pub fn channel<T>() -> (SlotSender<T>, SlotReceiver<T>) {
    let shared = Arc::new(Shared {
        slot: Mutex::new(None),
        notify: Notify::new(),
        closed: AtomicBool::new(false),
    });
    (
        SlotSender {
            shared: Arc::clone(&shared),
        },
        SlotReceiver { shared },
    )
}

impl<T> SlotSender<T> {
    /// Write `item`, displacing any unconsumed predecessor.
    ///
    /// `Ok(Some(old))` returns the displaced item for disposal;
    /// `Err(item)` hands the item back when the channel is closed.
    pub fn send(&self, item: T) -> Result<Option<T>, T> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(item);
        }
        let displaced = self
            .shared
            .slot
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .replace(item);
        self.shared.notify.notify_one();
        Ok(displaced)
    }

    /// Close the channel; the receiver drains the last item then ends.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.notify.notify_one();
    }
}

impl<T> Drop for SlotSender<T> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<T> SlotReceiver<T> {
    /// Await the next item; `None` after close once the slot is empty.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            let notified = self.shared.notify.notified();
            if let Some(item) = self.take() {
                return Some(item);
            }
            if self.shared.closed.load(Ordering::Acquire) {
                // Close raced with a final send; drain it.
                return self.take();
            }
            notified.await;
        }
    }

    /// Non-blocking take.
    pub fn take(&self) -> Option<T> {
        self.shared
            .slot
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }

    /// Close from the consumer side; later sends fail.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.notify.notify_one();
    }
}
