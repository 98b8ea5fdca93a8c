//! Cooperative cancellation shared between a session and its caller.

use std::thread;
use std::time::{Duration, Instant};

/// Cancellation shared by a session, its model calls and the CLI's interrupt handler.
///
/// Only the synchronous half (`cancel`, `is_cancelled`) is used; blocking waits
/// poll it every [`POLL_SLICE`].
pub use tokio_util::sync::CancellationToken as CancelToken;

/// Granularity used when a blocking wait polls the token.
pub const POLL_SLICE: Duration = Duration::from_millis(50);

/// Sleep for `duration`, waking early when the token is cancelled.
///
/// Returns `false` if the sleep was interrupted.
pub fn sleep_cancellable(duration: Duration, cancel: &CancelToken) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(POLL_SLICE));
    }
}
