//! Per-device infeed and outfeed queues.
//!
//! Programs dequeue from the infeed and enqueue to the outfeed while the
//! host side does the opposite. Both ends may block, so each queue pairs a
//! `Mutex<VecDeque>` with a `Condvar`. Closing a queue wakes every waiter
//! with an error so a backend can shut down while a program is parked on
//! an empty infeed.

use crate::error::{Result, RuntimeError};
use spindle_core::Value;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct QueueState {
    values: VecDeque<Value>,
    closed: bool,
}

/// A blocking FIFO of host values.
#[derive(Debug, Default)]
pub(crate) struct FeedQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl FeedQueue {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn push(&self, value: Value) -> Result<()> {
        let mut state = self.lock();
        if state.closed {
            return Err(RuntimeError::TransferError("feed queue is closed".to_string()));
        }
        state.values.push_back(value);
        self.available.notify_one();
        Ok(())
    }

    /// Block until a value is available.
    pub(crate) fn pop(&self) -> Result<Value> {
        let mut state = self.lock();
        loop {
            if let Some(value) = state.values.pop_front() {
                return Ok(value);
            }
            if state.closed {
                return Err(RuntimeError::TransferError("feed queue is closed".to_string()));
            }
            state = self
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().values.len()
    }

    pub(crate) fn close(&self) {
        self.lock().closed = true;
        self.available.notify_all();
    }
}

/// The infeed/outfeed pair of one device.
#[derive(Debug, Default)]
pub(crate) struct DeviceFeeds {
    pub(crate) infeed: FeedQueue,
    pub(crate) outfeed: FeedQueue,
}

impl DeviceFeeds {
    pub(crate) fn close(&self) {
        self.infeed.close();
        self.outfeed.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spindle_core::{ElementType, Literal};
    use std::sync::Arc;
    use std::thread;

    fn scalar(v: i32) -> Value {
        Literal::from_slice(ElementType::S32, &[], &[v]).unwrap().into()
    }

    #[test]
    fn test_fifo_order() {
        let queue = FeedQueue::default();
        queue.push(scalar(1)).unwrap();
        queue.push(scalar(2)).unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().unwrap(), scalar(1));
        assert_eq!(queue.pop().unwrap(), scalar(2));
    }

    #[test]
    fn test_pop_blocks_until_push() {
        let feeds = Arc::new(DeviceFeeds::default());
        let consumer = {
            let feeds = Arc::clone(&feeds);
            thread::spawn(move || feeds.infeed.pop())
        };
        feeds.infeed.push(scalar(7)).unwrap();
        assert_eq!(consumer.join().unwrap().unwrap(), scalar(7));
    }

    #[test]
    fn test_close_wakes_waiters() {
        let feeds = Arc::new(DeviceFeeds::default());
        let consumer = {
            let feeds = Arc::clone(&feeds);
            thread::spawn(move || feeds.outfeed.pop())
        };
        feeds.close();
        assert!(consumer.join().unwrap().is_err());
        assert!(feeds.infeed.push(scalar(1)).is_err());
    }
}
