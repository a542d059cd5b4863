//! FIFO work streams and completion events for host devices.

use crate::error::{Result, RuntimeError};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A dedicated worker thread that runs jobs in submission order.
pub(crate) struct Stream {
    sender: Option<mpsc::Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl Stream {
    pub(crate) fn new(name: String) -> Result<Self> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let worker = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                while let Ok(job) = receiver.recv() {
                    job();
                }
                tracing::trace!(stream = %name, "stream drained");
            })
            .map_err(|e| RuntimeError::InitError(format!("failed to spawn stream thread: {e}")))?;
        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    pub(crate) fn enqueue(&self, job: impl FnOnce() + Send + 'static) -> Result<()> {
        self.sender
            .as_ref()
            .ok_or_else(|| RuntimeError::ExecutionError("stream is shut down".to_string()))?
            .send(Box::new(job))
            .map_err(|_| RuntimeError::ExecutionError("stream worker exited".to_string()))
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        // Closing the channel lets the worker finish queued jobs and exit.
        self.sender.take();
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            tracing::warn!("stream worker panicked");
        }
    }
}

/// A one-shot event carrying the result of asynchronous work.
pub(crate) struct Completion<T> {
    state: Mutex<Option<std::result::Result<T, String>>>,
    done: Condvar,
}

impl<T: Clone> Completion<T> {
    pub(crate) fn pending() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(None),
            done: Condvar::new(),
        })
    }

    pub(crate) fn complete(&self, result: std::result::Result<T, String>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.is_none() {
            *state = Some(result);
            self.done.notify_all();
        }
    }

    /// Block until the event fires.
    pub(crate) fn wait(&self) -> std::result::Result<T, String> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(result) = state.as_ref() {
                return result.clone();
            }
            state = self
                .done
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_runs_jobs_in_order() {
        let stream = Stream::new("test-stream".to_string()).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..16 {
            let log = Arc::clone(&log);
            stream.enqueue(move || log.lock().unwrap().push(i)).unwrap();
        }
        drop(stream);
        assert_eq!(*log.lock().unwrap(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn test_completion_wakes_waiter() {
        let stream = Stream::new("test-completion".to_string()).unwrap();
        let event = Completion::<u32>::pending();
        assert!(!event.is_complete());
        {
            let event = Arc::clone(&event);
            stream.enqueue(move || event.complete(Ok(42))).unwrap();
        }
        assert_eq!(event.wait(), Ok(42));
        assert!(event.is_complete());

        // The first result wins.
        event.complete(Err("late".to_string()));
        assert_eq!(event.wait(), Ok(42));
    }
}
