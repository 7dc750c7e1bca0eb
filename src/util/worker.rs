//! Named background threads with bounded waits.
//!
//! A [`WorkerThread`] reports its result over a channel instead of being
//! joined, so callers can wait with a deadline, wait again later, or walk
//! away and leave the thread detached.

use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};

/// Result of waiting on a [`WorkerThread`].
#[derive(Debug)]
pub enum WaitOutcome<T> {
    /// The closure returned.
    Finished(T),
    /// The closure panicked; carries the panic message.
    Panicked(String),
    /// Still running when the wait expired.
    TimedOut,
}

/// A detached thread whose result can be awaited with a timeout.
#[derive(Debug)]
pub struct WorkerThread<T> {
    name: String,
    result_rx: Receiver<thread::Result<T>>,
}

impl<T: Send + 'static> WorkerThread<T> {
    /// Spawn `f` on a thread called `name`.
    ///
    /// # Errors
    ///
    /// The OS refused to create the thread.
    pub fn spawn<F>(name: impl Into<String>, f: F) -> io::Result<Self>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let name = name.into();
        let (result_tx, result_rx) = bounded(1);
        thread::Builder::new().name(name.clone()).spawn(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(f));
            // The receiver may already be gone when the waiter gave up.
            let _ = result_tx.send(result);
        })?;
        Ok(Self { name, result_rx })
    }

    /// Thread name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait up to `timeout`, or indefinitely when `None`.
    pub fn wait(&self, timeout: Option<Duration>) -> WaitOutcome<T> {
        let received = match timeout {
            Some(timeout) => match self.result_rx.recv_timeout(timeout) {
                Ok(result) => Ok(result),
                Err(RecvTimeoutError::Timeout) => return WaitOutcome::TimedOut,
                Err(RecvTimeoutError::Disconnected) => Err(()),
            },
            None => self.result_rx.recv().map_err(|_| ()),
        };
        match received {
            Ok(Ok(value)) => WaitOutcome::Finished(value),
            Ok(Err(payload)) => WaitOutcome::Panicked(panic_message(payload.as_ref())),
            // Only reachable if the result was already taken by an earlier wait.
            Err(()) => WaitOutcome::Panicked(format!("worker `{}` result already consumed", self.name)),
        }
    }
}

/// Best-effort rendering of a panic payload.
#[must_use]
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finished() {
        let worker = WorkerThread::spawn("adder", || 2 + 2).unwrap();
        assert!(matches!(worker.wait(Some(Duration::from_secs(5))), WaitOutcome::Finished(4)));
    }

    #[test]
    fn test_timeout_then_finish() {
        let worker = WorkerThread::spawn("sleeper", || {
            thread::sleep(Duration::from_millis(100));
            "done"
        })
        .unwrap();
        assert!(matches!(worker.wait(Some(Duration::from_millis(5))), WaitOutcome::TimedOut));
        assert!(matches!(worker.wait(None), WaitOutcome::Finished("done")));
    }

    #[test]
    fn test_panic_message_captured() {
        let worker = WorkerThread::spawn("panicker", || -> u8 { panic!("driver vanished") }).unwrap();
        match worker.wait(Some(Duration::from_secs(5))) {
            WaitOutcome::Panicked(message) => assert_eq!(message, "driver vanished"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
