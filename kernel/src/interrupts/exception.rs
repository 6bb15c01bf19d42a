// kernel/src/interrupts/exception.rs
//
// The stack frame the CPU pushes on an exception.  This is the contract
// crossing from the trap entry to the fault handler: everything the
// memory subsystem learns about the interrupted context comes from
// here plus the control registers latched at entry.

#[repr(C)]
pub struct ExceptionStackFrame {
    /// Address of the next instruction to execute (the faulting one for
    /// a page fault).
    pub instruction_pointer: u64,
    pub code_segment: u64,
    /// RFLAGS at the time of the exception.
    pub cpu_flags: u64,
    /// Stack pointer before the exception.
    pub stack_pointer: u64,
    pub stack_segment: u64,
}

impl ExceptionStackFrame {
    pub const fn new() -> Self {
        Self {
            instruction_pointer: 0,
            code_segment: 0,
            cpu_flags: 0,
            stack_pointer: 0,
            stack_segment: 0,
        }
    }

    /// Ring of the interrupted code (low two bits of CS).
    pub fn privilege_level(&self) -> u64 {
        self.code_segment & 0x3
    }
}

impl core::fmt::Debug for ExceptionStackFrame {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("ExceptionStackFrame")
            .field(
                "instruction_pointer",
                &format_args!("{:#x}", self.instruction_pointer),
            )
            .field("code_segment", &format_args!("{:#x}", self.code_segment))
            .field("cpu_flags", &format_args!("{:#x}", self.cpu_flags))
            .field("stack_pointer", &format_args!("{:#x}", self.stack_pointer))
            .field("stack_segment", &format_args!("{:#x}", self.stack_segment))
            .finish()
    }
}
