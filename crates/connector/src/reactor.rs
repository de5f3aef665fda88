//! Readiness loop driving one session.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::session::{IdleTimer, SessionError, SessionManager};
use crate::transport::UnixTransport;

/// Longest time the reactor sleeps without re-checking the queues.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Run read and write events until `cancel` fires or the connection fails.
///
/// Returns `Ok` on cancellation. End of stream and transport failures come
/// back as the fatal [`SessionError`].
pub async fn drive(
    transport: &UnixTransport,
    session: &SessionManager,
    cancel: &CancellationToken,
) -> Result<(), SessionError> {
    let notify = session.response_notifier();

    loop {
        let wants_write = session.has_pending_responses();

        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            ready = transport.readable() => {
                ready?;
                session.process_read_event()?;
                session.reset_timer();
            }
            ready = transport.writable(), if wants_write => {
                ready?;
                session.process_write_event()?;
                session.reset_timer();
            }
            _ = notify.notified() => {
                session.process_write_event()?;
            }
            _ = tokio::time::sleep(POLL_INTERVAL) => {
                trace!("Reactor poll tick");
            }
        }
    }
}

/// Resolve once `idle` has seen no activity for `timeout`.
pub async fn idle_expired(idle: &IdleTimer, timeout: Duration) {
    loop {
        let idle_for = idle.idle_for();
        if idle_for > timeout {
            return;
        }
        let remaining = timeout - idle_for;
        tokio::time::sleep(remaining.min(POLL_INTERVAL) + Duration::from_millis(1)).await;
    }
}
