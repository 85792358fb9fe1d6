use std::sync::atomic::{AtomicU64, Ordering};

/// Source of commit versions.
///
/// Every committing write transaction ticks the clock once, so it is the
/// serialization point of the whole runtime.
pub trait VersionClock: Send + Sync {
    /// Strictly increasing version for a commit that publishes writes.
    fn tick(&self) -> u64;

    /// Latest version handed out.
    fn now(&self) -> u64;
}

/// Version clock backed by a local atomic counter.
#[derive(Debug)]
pub struct LocalVersionClock {
    counter: AtomicU64,
}

impl LocalVersionClock {
    /// Versions start at one; zero marks a reference that was never committed.
    pub const fn new() -> Self {
        Self::with_initial(1)
    }

    pub const fn with_initial(initial: u64) -> Self {
        Self {
            counter: AtomicU64::new(initial),
        }
    }
}

impl Default for LocalVersionClock {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionClock for LocalVersionClock {
    fn tick(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn now(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }
}

/// Counts commits that overwrote references other transactions were depending on.
///
/// A transaction remembers the count when it starts reading. As long as the count
/// did not move, nothing it read can have been invalidated and opening a new
/// reference needs no revalidation of the earlier ones.
#[derive(Debug, Default)]
pub struct GlobalConflictCounter {
    count: AtomicU64,
}

impl GlobalConflictCounter {
    pub const fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }

    pub fn signal_conflict(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn ticks_are_strictly_increasing() {
        let clock = LocalVersionClock::new();
        assert_eq!(clock.now(), 1);
        let a = clock.tick();
        let b = clock.tick();
        assert!(b > a);
        assert_eq!(clock.now(), b);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn concurrent_ticks_are_unique() {
        let clock = Arc::new(LocalVersionClock::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let clock = clock.clone();
                thread::spawn(move || (0..1000).map(|_| clock.tick()).collect::<Vec<_>>())
            })
            .collect();

        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 4000);
    }

    #[test]
    fn conflict_counter_moves_on_signal() {
        let counter = GlobalConflictCounter::new();
        let seen = counter.count();
        counter.signal_conflict();
        assert_ne!(counter.count(), seen);
    }
}
