// kernel/src/interrupts/idt.rs
//
// Hand-rolled Interrupt Descriptor Table: 256 gate entries plus typed
// handler signatures for the exception vectors the memory core wires
// up (#DE, #UD, #DF, #GP, #PF).

use core::marker::PhantomData;

use crate::interrupts::exception::ExceptionStackFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct IdtEntryOptions(u16);

impl IdtEntryOptions {
    const PRESENT: u16 = 1 << 15;
    const INTERRUPT_GATE: u16 = 0xE << 8;

    pub fn interrupt_gate() -> Self {
        IdtEntryOptions(Self::PRESENT | Self::INTERRUPT_GATE)
    }
}

/// One IDT gate.  `F` pins the handler signature the vector expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
#[repr(packed)]
pub struct IdtEntry<F> {
    pointer_low: u16,
    gdt_selector: u16,
    options: IdtEntryOptions,
    pointer_middle: u16,
    pointer_high: u32,
    reserved: u32,
    phantom: PhantomData<F>,
}

impl<F> IdtEntry<F> {
    pub fn missing() -> Self {
        IdtEntry {
            gdt_selector: 0,
            pointer_low: 0,
            pointer_middle: 0,
            pointer_high: 0,
            options: IdtEntryOptions(0),
            reserved: 0,
            phantom: PhantomData,
        }
    }

    pub fn set_handler_addr(&mut self, addr: u64) -> &mut Self {
        self.pointer_low = addr as u16;
        self.pointer_middle = (addr >> 16) as u16;
        self.pointer_high = (addr >> 32) as u32;
        // Kernel code selector as laid out by the bootloader's GDT.
        self.gdt_selector = 8;
        self.options = IdtEntryOptions::interrupt_gate();
        self
    }
}

pub type ExceptionHandler = extern "x86-interrupt" fn(&mut ExceptionStackFrame);

pub type ExceptionHandlerWithErrCode =
    extern "x86-interrupt" fn(&mut ExceptionStackFrame, error_code: u64);

pub type DoubleFaultHandler =
    extern "x86-interrupt" fn(&mut ExceptionStackFrame, error_code: u64) -> !;

#[repr(C)]
pub struct InterruptDescriptorTable {
    pub entries: [IdtEntry<ExceptionHandler>; 256],
}

impl InterruptDescriptorTable {
    pub fn new() -> Self {
        InterruptDescriptorTable {
            entries: [IdtEntry::missing(); 256],
        }
    }

    pub fn add_handler(&mut self, vector: u8, handler: ExceptionHandler) {
        self.entries[vector as usize].set_handler_addr(handler as u64);
    }

    pub fn add_handler_with_error(&mut self, vector: u8, handler: ExceptionHandlerWithErrCode) {
        self.entries[vector as usize].set_handler_addr(handler as u64);
    }

    pub fn add_double_fault_handler(&mut self, vector: u8, handler: DoubleFaultHandler) {
        self.entries[vector as usize].set_handler_addr(handler as u64);
    }

    pub fn load(&'static self) {
        use core::mem::size_of;

        #[repr(C, packed)]
        struct IdtDescriptor {
            size: u16,
            address: u64,
        }

        let descriptor = IdtDescriptor {
            size: (size_of::<Self>() - 1) as u16,
            address: self as *const _ as u64,
        };
        unsafe {
            core::arch::asm!("lidt [{}]", in(reg) &descriptor, options(nostack));
        }
    }
}
