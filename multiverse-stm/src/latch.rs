use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// One-shot gate a blocked transaction parks on until a reference it read changes.
///
/// Opening is idempotent; once open the latch stays open.
#[derive(Debug, Default)]
pub struct Latch {
    open: Mutex<bool>,
    cond: Condvar,
}

/// Why a latch wait returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchWait {
    Opened,
    TimedOut,
    Interrupted,
}

impl Latch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        *self.open.lock()
    }

    pub fn open(&self) {
        let mut open = self.open.lock();
        if !*open {
            *open = true;
            self.cond.notify_all();
        }
    }

    /// Block until opened.
    pub fn await_open(&self) {
        let mut open = self.open.lock();
        while !*open {
            self.cond.wait(&mut open);
        }
    }

    /// Block until opened or `timeout` elapsed. Returns whether the latch is open.
    pub fn await_open_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut open = self.open.lock();
        while !*open {
            if self.cond.wait_until(&mut open, deadline).timed_out() {
                break;
            }
        }
        *open
    }

    /// Block until opened, until `deadline` or until `interruptor` fires.
    pub fn wait(self: &Arc<Self>, deadline: Option<Instant>, interruptor: Option<&Interruptor>) -> LatchWait {
        if let Some(interruptor) = interruptor {
            interruptor.park(self);
        }
        let outcome = self.wait_parked(deadline, interruptor);
        if let Some(interruptor) = interruptor {
            interruptor.unpark(self);
        }
        outcome
    }

    fn wait_parked(&self, deadline: Option<Instant>, interruptor: Option<&Interruptor>) -> LatchWait {
        let mut open = self.open.lock();
        loop {
            if *open {
                return LatchWait::Opened;
            }
            if interruptor.is_some_and(Interruptor::take_interrupt) {
                return LatchWait::Interrupted;
            }
            match deadline {
                None => self.cond.wait(&mut open),
                Some(deadline) => {
                    if self.cond.wait_until(&mut open, deadline).timed_out() {
                        return if *open { LatchWait::Opened } else { LatchWait::TimedOut };
                    }
                }
            }
        }
    }

    fn wake(&self) {
        let _open = self.open.lock();
        self.cond.notify_all();
    }
}

/// Interrupt handle for interruptible blocking waits.
///
/// Share it (behind an `Arc`) between the thread that runs transactions and the
/// thread that wants to cancel their waits. An interrupt raised while nothing
/// waits stays pending until the next interruptible wait consumes it.
#[derive(Debug, Default)]
pub struct Interruptor {
    interrupted: AtomicBool,
    parked: Mutex<Vec<Arc<Latch>>>,
}

impl Interruptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        for latch in self.parked.lock().iter() {
            latch.wake();
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Consume a pending interrupt.
    pub fn take_interrupt(&self) -> bool {
        self.interrupted.swap(false, Ordering::SeqCst)
    }

    fn park(&self, latch: &Arc<Latch>) {
        self.parked.lock().push(latch.clone());
    }

    fn unpark(&self, latch: &Arc<Latch>) {
        self.parked.lock().retain(|parked| !Arc::ptr_eq(parked, latch));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn open_is_idempotent() {
        let latch = Latch::new();
        assert!(!latch.is_open());
        latch.open();
        latch.open();
        assert!(latch.is_open());
        latch.await_open();
    }

    #[test]
    fn await_for_times_out_when_closed() {
        let latch = Latch::new();
        assert!(!latch.await_open_for(Duration::from_millis(10)));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn open_wakes_waiter() {
        let latch = Arc::new(Latch::new());
        let waiter = {
            let latch = latch.clone();
            thread::spawn(move || latch.wait(None, None))
        };
        thread::sleep(Duration::from_millis(20));
        latch.open();
        assert_eq!(waiter.join().unwrap(), LatchWait::Opened);
    }

    #[test]
    fn deadline_elapses() {
        let latch = Arc::new(Latch::new());
        let outcome = latch.wait(Some(Instant::now() + Duration::from_millis(5)), None);
        assert_eq!(outcome, LatchWait::TimedOut);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn interrupt_wakes_waiter() {
        let latch = Arc::new(Latch::new());
        let interruptor = Arc::new(Interruptor::new());
        let waiter = {
            let latch = latch.clone();
            let interruptor = interruptor.clone();
            thread::spawn(move || latch.wait(None, Some(&interruptor)))
        };
        thread::sleep(Duration::from_millis(20));
        interruptor.interrupt();
        assert_eq!(waiter.join().unwrap(), LatchWait::Interrupted);
        assert!(!interruptor.is_interrupted(), "the wait consumes the interrupt");
    }

    #[test]
    fn pending_interrupt_is_consumed_by_next_wait() {
        let latch = Arc::new(Latch::new());
        let interruptor = Interruptor::new();
        interruptor.interrupt();
        assert_eq!(latch.wait(None, Some(&interruptor)), LatchWait::Interrupted);
    }
}
