//! Creation stamps for optimistic triples.
//!
//! A stamp is `wall_ms * 10` plus a tie-break, so locally created triples
//! sort after anything the server returned while staying strictly
//! monotonic within one process.

use std::sync::atomic::{AtomicI64, Ordering};

#[derive(Debug, Default)]
pub struct TripleClock {
    last: AtomicI64,
}

impl TripleClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next stamp; strictly greater than every stamp this clock returned.
    pub fn next(&self) -> i64 {
        let floor = chrono::Utc::now().timestamp_millis() * 10;
        let mut current = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = floor.max(current + 1);
            match self.last.compare_exchange_weak(
                current,
                candidate,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return candidate,
                Err(actual) => current = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stamps_are_strictly_monotonic() {
        let clock = TripleClock::new();
        let mut prev = clock.next();
        for _ in 0..1000 {
            let next = clock.next();
            assert!(next > prev);
            prev = next;
        }
        assert!(prev >= chrono::Utc::now().timestamp_millis() * 10 - 10_000);
    }
}
