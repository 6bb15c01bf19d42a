// kernel/src/errno.rs
//
// Error codes shared by the memory subsystem.  Data-plane functions return
// `Result<_, Errno>`; init paths panic instead, because nothing can recover
// before the allocators exist.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Errno {
    /// No such entry (no VMA covers the address).
    Enoent = 2,
    /// I/O error (readpage failed).
    Eio = 5,
    /// Out of memory.
    Enomem = 12,
    /// Permission denied.
    Eacces = 13,
    /// Bad address: no mapping, or a PTE invariant was broken.
    Efault = 14,
    /// The slot is already mapped.
    Eexist = 17,
    /// Invalid argument: misaligned address, contradictory flags.
    Einval = 22,
}

impl Errno {
    pub const fn as_str(self) -> &'static str {
        match self {
            Errno::Enoent => "ENOENT",
            Errno::Eio => "EIO",
            Errno::Enomem => "ENOMEM",
            Errno::Eacces => "EACCES",
            Errno::Efault => "EFAULT",
            Errno::Eexist => "EEXIST",
            Errno::Einval => "EINVAL",
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
