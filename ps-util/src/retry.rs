//! Backoff schedules for the retry loops used by join and transfer.

use std::time::Duration;

use exponential_backoff::Backoff;

/// Build the backoff schedule used by a joining node's `TryJoin` retry loop:
/// unbounded retries, starting near 10 seconds, doubling up to a one-minute
/// ceiling.
pub fn join_backoff() -> Backoff {
    let mut backoff = Backoff::new(u32::MAX, Duration::from_secs(10), Duration::from_secs(60));
    backoff.set_factor(2);
    backoff
}

/// Build the backoff schedule used for a single transfer batch's retry loop:
/// bounded at `try_num` attempts (default 3), starting at 200ms.
pub fn transfer_backoff(try_num: u32) -> Backoff {
    Backoff::new(try_num, Duration::from_millis(200), Duration::from_secs(2))
}
