// kernel/src/sync/spinlock.rs
//
// IRQ-safe spinlock: a spin::Mutex that disables interrupts for the
// lifetime of the guard and restores the previous interrupt state on
// drop.  Required for any lock that an interrupt handler may also take
// (buddy zones, slab caches, page-cache mappings) — otherwise an
// interrupt arriving while the lock is held deadlocks the single hart.
//
// Under `cfg(test)` the interrupt toggling is skipped: host tests run in
// user mode where cli/sti would fault, and the host test harness is
// single-threaded per arena anyway.

use core::ops::{Deref, DerefMut};

use spin::{Mutex, MutexGuard};

pub struct IrqLock<T> {
    inner: Mutex<T>,
}

pub struct IrqLockGuard<'a, T> {
    guard: Option<MutexGuard<'a, T>>,
    reenable: bool,
}

impl<T> IrqLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Disable interrupts, then take the lock.  The saved interrupt state
    /// is restored when the guard drops.
    pub fn lock(&self) -> IrqLockGuard<'_, T> {
        let reenable = irq_save_and_disable();
        IrqLockGuard {
            guard: Some(self.inner.lock()),
            reenable,
        }
    }

    pub fn try_lock(&self) -> Option<IrqLockGuard<'_, T>> {
        let reenable = irq_save_and_disable();
        match self.inner.try_lock() {
            Some(guard) => Some(IrqLockGuard {
                guard: Some(guard),
                reenable,
            }),
            None => {
                irq_restore(reenable);
                None
            }
        }
    }
}

impl<'a, T> Deref for IrqLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.as_ref().unwrap()
    }
}

impl<'a, T> DerefMut for IrqLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().unwrap()
    }
}

impl<'a, T> Drop for IrqLockGuard<'a, T> {
    fn drop(&mut self) {
        // Release the lock before re-enabling interrupts, or an interrupt
        // taken here could spin on a lock we still hold.
        self.guard.take();
        irq_restore(self.reenable);
    }
}

#[cfg(not(test))]
fn irq_save_and_disable() -> bool {
    use x86_64::instructions::interrupts;
    let enabled = interrupts::are_enabled();
    interrupts::disable();
    enabled
}

#[cfg(not(test))]
fn irq_restore(reenable: bool) {
    if reenable {
        x86_64::instructions::interrupts::enable();
    }
}

#[cfg(test)]
fn irq_save_and_disable() -> bool {
    false
}

#[cfg(test)]
fn irq_restore(_reenable: bool) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_guards_value() {
        let lock = IrqLock::new(7u32);
        {
            let mut g = lock.lock();
            *g += 1;
        }
        assert_eq!(*lock.lock(), 8);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = IrqLock::new(());
        let g = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(g);
        assert!(lock.try_lock().is_some());
    }
}
