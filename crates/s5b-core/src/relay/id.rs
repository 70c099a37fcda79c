//! Process-wide relay-id counter.
//!
//! Ids wrap at half the `u64` range so an id recycled after wrap can never
//! collide with one still held by a long-lived session.

use parking_lot::Mutex;

/// Wrap threshold: once the counter passes this, it restarts from zero.
pub const RELAY_ID_MOD: u64 = u64::MAX / 2;

/// Mutex-guarded monotonic counter. The process-wide instance is
/// [`next_relay_id`]; separate instances exist only in tests.
#[derive(Debug)]
pub struct RelayIdGenerator {
    last: Mutex<u64>,
}

impl RelayIdGenerator {
    pub const fn new() -> Self {
        Self {
            last: Mutex::new(0),
        }
    }

    /// Next id, in `[1, RELAY_ID_MOD + 1]`.
    pub fn next(&self) -> u64 {
        let mut last = self.last.lock();
        if *last > RELAY_ID_MOD {
            *last = 0;
        }
        *last += 1;
        *last
    }

    /// The id `next` would return, without consuming it.
    pub fn peek(&self) -> u64 {
        *self.last.lock() + 1
    }

    /// Force the counter; test hook for exercising the wrap boundary.
    pub fn reset_to(&self, value: u64) {
        *self.last.lock() = value;
    }
}

impl Default for RelayIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

static GENERATOR: RelayIdGenerator = RelayIdGenerator::new();

/// Allocate the next process-wide relay id.
pub fn next_relay_id() -> u64 {
    GENERATOR.next()
}

/// Peek the next process-wide relay id without allocating it.
pub fn peek_relay_id() -> u64 {
    GENERATOR.peek()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_strictly_increasing_from_one() {
        let g = RelayIdGenerator::new();
        assert_eq!(g.peek(), 1);
        let a = g.next();
        let b = g.next();
        let c = g.next();
        assert_eq!((a, b, c), (1, 2, 3));
        assert_eq!(g.peek(), 4);
    }

    #[test]
    fn peek_does_not_consume() {
        let g = RelayIdGenerator::new();
        assert_eq!(g.peek(), g.peek());
        assert_eq!(g.next(), 1);
    }

    #[test]
    fn wraps_past_half_range() {
        let g = RelayIdGenerator::new();
        g.reset_to(RELAY_ID_MOD + 2); // 2^63 + 1 for u64
        assert_eq!(g.next(), 1);
        assert_eq!(g.next(), 2);
    }

    #[test]
    fn no_wrap_exactly_at_threshold() {
        let g = RelayIdGenerator::new();
        g.reset_to(RELAY_ID_MOD);
        assert_eq!(g.next(), RELAY_ID_MOD + 1);
        // Now past the threshold, the next call restarts.
        assert_eq!(g.next(), 1);
    }

    #[test]
    fn concurrent_next_yields_unique_ids() {
        use std::collections::HashSet;
        use std::sync::Arc;

        let g = Arc::new(RelayIdGenerator::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let g = g.clone();
            handles.push(std::thread::spawn(move || {
                (0..1000).map(|_| g.next()).collect::<Vec<_>>()
            }));
        }
        let mut seen = HashSet::new();
        for h in handles {
            for id in h.join().unwrap() {
                assert!(seen.insert(id), "duplicate relay id {id}");
            }
        }
        assert_eq!(seen.len(), 8000);
    }
}
