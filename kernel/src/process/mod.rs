// kernel/src/process/mod.rs
//
// Minimal task layer: just enough for the memory subsystem's contracts.
// The fault handler needs "the current task and its address space"; fork
// and exec need address-space duplication.  Scheduling proper (queues,
// context switches, preemption) lives outside this kernel core.

use alloc::sync::Arc;

use spin::Mutex;

use crate::memory::address_space::AddressSpace;
use crate::serial_println;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Pid(pub usize);

pub struct Task {
    pub pid: Pid,
    pub name: &'static str,
    pub vas: Arc<AddressSpace>,
}

pub struct Scheduler {
    current: Option<Arc<Task>>,
    next_pid: usize,
}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            current: None,
            next_pid: 1,
        }
    }

    fn allocate_pid(&mut self) -> Pid {
        let pid = Pid(self.next_pid);
        self.next_pid += 1;
        pid
    }
}

pub static SCHEDULER: Mutex<Scheduler> = Mutex::new(Scheduler::new());

/// Bring the task layer up with PID 0 running on the kernel address
/// space.  Until this runs, the fault handler treats every fault as
/// fatal.
pub fn init() {
    let task = Arc::new(Task {
        pid: Pid(0),
        name: "kernel",
        vas: AddressSpace::kernel(),
    });
    SCHEDULER.lock().current = Some(task);
    serial_println!("process: task layer up (PID 0 on the kernel address space)");
}

pub fn is_initialized() -> bool {
    SCHEDULER.lock().current.is_some()
}

pub fn current() -> Option<Arc<Task>> {
    SCHEDULER.lock().current.clone()
}

/// Create a task owning `vas`.  It is not scheduled (there is no
/// scheduler to speak of); callers switch to it with `adopt`.
pub fn spawn(name: &'static str, vas: Arc<AddressSpace>) -> Arc<Task> {
    let pid = SCHEDULER.lock().allocate_pid();
    Arc::new(Task { pid, name, vas })
}

/// Make `task` current, returning the task it displaced.
pub fn adopt(task: Arc<Task>) -> Option<Arc<Task>> {
    let mut sched = SCHEDULER.lock();
    core::mem::replace(&mut sched.current, Some(task))
}

#[cfg(test)]
pub fn reset_for_test() {
    let mut sched = SCHEDULER.lock();
    sched.current = None;
    sched.next_pid = 1;
}
