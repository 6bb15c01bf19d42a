// kernel/src/sync/wait.rs
//
// Minimal wait queue for the single-hart kernel.  Waiters poll their
// condition and spin between checks; wakers bump a generation counter so
// a waiter that saw the old generation re-checks immediately.  When a
// blocking scheduler lands, `wait_until` becomes "sleep on the queue"
// and `wake_*` becomes "make runnable" without changing any caller.
//
// Must be used only from contexts that are allowed to wait: never call
// `wait_until` while holding a spinlock.

use core::sync::atomic::{AtomicU32, Ordering};

pub struct WaitQueue {
    generation: AtomicU32,
    waiters: AtomicU32,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            generation: AtomicU32::new(0),
            waiters: AtomicU32::new(0),
        }
    }

    /// Spin until `cond` returns true.  Re-checks after every wake-up and
    /// after a bounded number of idle spins so a missed wake cannot hang
    /// the hart.
    pub fn wait_until<F: Fn() -> bool>(&self, cond: F) {
        if cond() {
            return;
        }
        self.waiters.fetch_add(1, Ordering::AcqRel);
        loop {
            let gen = self.generation.load(Ordering::Acquire);
            if cond() {
                break;
            }
            let mut spins = 0u32;
            while self.generation.load(Ordering::Acquire) == gen && spins < 1 << 10 {
                core::hint::spin_loop();
                spins += 1;
            }
        }
        self.waiters.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn wake_one(&self) {
        self.generation.fetch_add(1, Ordering::Release);
    }

    pub fn wake_all(&self) {
        self.generation.fetch_add(1, Ordering::Release);
    }

    pub fn has_waiters(&self) -> bool {
        self.waiters.load(Ordering::Acquire) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicBool;

    #[test]
    fn wait_returns_immediately_when_condition_holds() {
        let wq = WaitQueue::new();
        let flag = AtomicBool::new(true);
        wq.wait_until(|| flag.load(Ordering::Relaxed));
        assert!(!wq.has_waiters());
    }

    #[test]
    fn wake_is_monotonic() {
        let wq = WaitQueue::new();
        wq.wake_one();
        wq.wake_all();
        // No waiters: wakes are only generation bumps.
        assert!(!wq.has_waiters());
    }
}
