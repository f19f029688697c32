//! Clock helpers.
//!
//! All deadlines inside the toolkit are signed nanoseconds on the monotonic
//! clock; capture timestamps are unix-epoch nanoseconds.

use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// One microsecond in nanoseconds.
pub const MICROSECOND: i64 = 1_000;
/// One millisecond in nanoseconds.
pub const MILLISECOND: i64 = 1_000_000;
/// One second in nanoseconds.
pub const SECOND: i64 = 1_000_000_000;

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Nanoseconds on the process-local monotonic clock.
///
/// The zero point is the first call in the process; only differences are
/// meaningful. Never goes backwards.
pub fn monotonic_ns() -> i64 {
    epoch().elapsed().as_nanos() as i64
}

/// Unix-epoch nanoseconds from the system wall clock.
///
/// Used for capture timestamps carried in packets and frames.
pub fn unix_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// A stable numeric id for the calling thread.
pub fn thread_id() -> u64 {
    use std::hash::{Hash, Hasher};

    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    let id = hasher.finish();
    // zero is reserved for "no thread recorded yet"
    if id == 0 {
        1
    } else {
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_is_monotonic() {
        let a = monotonic_ns();
        let b = monotonic_ns();
        assert!(b >= a);
    }

    #[test]
    fn thread_id_is_stable_and_nonzero() {
        assert_ne!(thread_id(), 0);
        assert_eq!(thread_id(), thread_id());
    }
}
