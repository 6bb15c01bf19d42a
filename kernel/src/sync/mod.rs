// kernel/src/sync/mod.rs

mod spinlock;
mod wait;

pub use spinlock::{IrqLock, IrqLockGuard};
pub use wait::WaitQueue;
