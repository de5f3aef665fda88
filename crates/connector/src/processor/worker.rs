//! Background thread for long-running processor work.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use protocol::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{ProcessError, ProcessorContext};

/// Upper bound on one backpressure wait between cancellation checks.
const SPACE_WAIT: Duration = Duration::from_millis(200);

/// A named worker thread bound to a child cancellation token.
///
/// Dropping the worker stops it.
pub struct AsyncWorker {
    name: String,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl AsyncWorker {
    /// Spawn `work` on a new thread. It receives the worker's token and
    /// should return soon after it is cancelled.
    pub fn spawn<F>(name: &str, parent: &CancellationToken, work: F) -> Result<Self, ProcessError>
    where
        F: FnOnce(CancellationToken) + Send + 'static,
    {
        let cancel = parent.child_token();
        let token = cancel.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || work(token))?;

        debug!("Started async worker {}", name);
        Ok(Self {
            name: name.to_string(),
            cancel,
            handle: Some(handle),
        })
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Cancel the worker and wait for it to exit.
    pub fn stop(&mut self) {
        self.cancel.cancel();
        let Some(handle) = self.handle.take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            warn!("Async worker {} panicked", self.name);
        } else {
            debug!("Async worker {} stopped", self.name);
        }
    }
}

impl Drop for AsyncWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Queue `message` once the response queue has room.
///
/// Flushes the queue while waiting. Returns `Ok(false)` if cancelled before
/// the message could be queued.
pub(crate) fn send_with_backpressure(
    ctx: &ProcessorContext,
    cancel: &CancellationToken,
    message: &Message,
) -> Result<bool, ProcessError> {
    let session = &ctx.session;
    loop {
        if cancel.is_cancelled() {
            return Ok(false);
        }
        if session.is_response_space_available() {
            ctx.send(message)?;
            return Ok(true);
        }
        session.process_write_event()?;
        session.wait_for_response_space(SPACE_WAIT);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_stop_cancels_and_joins() {
        let parent = CancellationToken::new();
        let exited = Arc::new(AtomicBool::new(false));

        let flag = exited.clone();
        let mut worker = AsyncWorker::spawn("test-worker", &parent, move |cancel| {
            while !cancel.is_cancelled() {
                thread::sleep(Duration::from_millis(5));
            }
            flag.store(true, Ordering::SeqCst);
        })
        .unwrap();

        assert!(!worker.is_finished());
        worker.stop();
        assert!(exited.load(Ordering::SeqCst));
        assert!(worker.is_finished());
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn test_parent_cancellation_reaches_worker() {
        let parent = CancellationToken::new();
        let worker = AsyncWorker::spawn("test-worker", &parent, |cancel| {
            while !cancel.is_cancelled() {
                thread::sleep(Duration::from_millis(5));
            }
        })
        .unwrap();

        parent.cancel();
        drop(worker);
    }
}
