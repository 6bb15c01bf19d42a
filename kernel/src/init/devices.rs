// kernel/src/init/devices.rs
//
// IDT construction, exception handlers, boot screen.
//
// The page-fault vector lives here because it bridges the trap layer
// and the memory subsystem: it latches CR2/CR3, hands a FaultContext to
// memory::fault, and turns any failure into a fatal dump.  There is no
// signal delivery in this core, so an unresolvable user fault is
// terminal.

use spin::Once;
use x86_64::registers::control::{Cr2, Cr3};
use x86_64::structures::paging::PageTableFlags;
use x86_64::PhysAddr;

use crate::framebuffer::{self, Color};
use crate::interrupts::{exception::ExceptionStackFrame, idt::InterruptDescriptorTable};
use crate::memory::fault::{handle_page_fault, FaultContext, PfError};
use crate::memory::{phys_to_virt, PAGE_MASK};
use crate::serial_println_raw;

// ============================================================================
// IDT
// ============================================================================

static IDT: Once<InterruptDescriptorTable> = Once::new();

pub fn init_idt() {
    let idt = IDT.call_once(|| {
        let mut idt = InterruptDescriptorTable::new();
        idt.add_handler(0, divide_by_zero_handler);
        idt.add_handler(6, invalid_opcode_handler);
        idt.add_double_fault_handler(8, double_fault_handler);
        idt.add_handler_with_error(13, general_protection_fault_handler);
        idt.add_handler_with_error(14, page_fault_handler);
        idt
    });
    idt.load();
}

// ============================================================================
// Exception handlers
// ============================================================================

extern "x86-interrupt" fn divide_by_zero_handler(sf: &mut ExceptionStackFrame) {
    panic!("DIVIDE BY ZERO at {:#x}", sf.instruction_pointer);
}

extern "x86-interrupt" fn invalid_opcode_handler(sf: &mut ExceptionStackFrame) {
    panic!("INVALID OPCODE at {:#x}", sf.instruction_pointer);
}

extern "x86-interrupt" fn double_fault_handler(
    sf: &mut ExceptionStackFrame,
    error_code: u64,
) -> ! {
    panic!(
        "DOUBLE FAULT (error: {}) at {:#x}",
        error_code, sf.instruction_pointer
    );
}

extern "x86-interrupt" fn general_protection_fault_handler(
    sf: &mut ExceptionStackFrame,
    error_code: u64,
) {
    panic!(
        "GENERAL PROTECTION FAULT (error: {}) at {:#x}",
        error_code, sf.instruction_pointer
    );
}

/// Page-fault vector: latch CR2/CR3, delegate to the memory subsystem,
/// escalate failure.  On success the CPU retries the faulting
/// instruction at iretq.
extern "x86-interrupt" fn page_fault_handler(sf: &mut ExceptionStackFrame, error_code: u64) {
    let (cr3_frame, _) = Cr3::read();
    let ctx = FaultContext {
        addr: Cr2::read_raw(),
        error: PfError::from_bits_truncate(error_code),
        rip: sf.instruction_pointer,
        cr3: cr3_frame.start_address(),
    };

    if let Err(errno) = handle_page_fault(&ctx) {
        fatal_fault_dump(sf, &ctx, errno.as_str());
    }
}

// ============================================================================
// Fatal dump
// ============================================================================

/// Unrecoverable fault: switch to the raw (unbuffered) writer, print
/// the registers, decode the error code in English, walk the page
/// tables for the faulting address, then panic.
fn fatal_fault_dump(sf: &ExceptionStackFrame, ctx: &FaultContext, reason: &str) -> ! {
    serial_println_raw!();
    serial_println_raw!("==== PAGE FAULT ({reason}) ====");
    serial_println_raw!("  cr2    = {:#018x}", ctx.addr);
    serial_println_raw!("  cr3    = {:#018x}", ctx.cr3.as_u64());
    serial_println_raw!("  rip    = {:#018x}", sf.instruction_pointer);
    serial_println_raw!("  rsp    = {:#018x}", sf.stack_pointer);
    serial_println_raw!("  cs:ss  = {:#x}:{:#x}", sf.code_segment, sf.stack_segment);
    serial_println_raw!("  rflags = {:#x}", sf.cpu_flags);

    let e = ctx.error;
    serial_println_raw!(
        "  error  = {:#x}: {} during a {} in {} mode{}",
        e.bits(),
        if e.contains(PfError::PRESENT) {
            "protection violation"
        } else {
            "page not present"
        },
        if e.contains(PfError::INSTRUCTION_FETCH) {
            "instruction fetch"
        } else if e.contains(PfError::WRITE) {
            "write"
        } else {
            "read"
        },
        if e.contains(PfError::USER) { "user" } else { "kernel" },
        if e.contains(PfError::RESERVED_BIT) {
            ", reserved bit set"
        } else {
            ""
        },
    );

    dump_walk(ctx.cr3, ctx.addr & PAGE_MASK);
    panic!("unrecoverable page fault at {:#x} ({})", ctx.addr, reason);
}

/// Print each level's entry for `va`, stopping at the first hole.
fn dump_walk(cr3: PhysAddr, va: u64) {
    use x86_64::structures::paging::PageTable;

    serial_println_raw!("  page-table walk for {:#x}:", va);
    let mut table_phys = cr3;
    for (name, shift) in [("PML4", 39u64), ("PDPT", 30), ("PD", 21), ("PT", 12)] {
        let table = unsafe { &*phys_to_virt(table_phys).as_ptr::<PageTable>() };
        let index = ((va >> shift) & 0x1FF) as usize;
        let entry = &table[index];
        if entry.is_unused() {
            serial_println_raw!("    {}[{}] = <not present>", name, index);
            return;
        }
        let flags = entry.flags();
        serial_println_raw!(
            "    {}[{}] = {:#018x} ({}{}{}{}{})",
            name,
            index,
            entry.addr().as_u64(),
            if flags.contains(PageTableFlags::PRESENT) { "P" } else { "-" },
            if flags.contains(PageTableFlags::WRITABLE) { "W" } else { "-" },
            if flags.contains(PageTableFlags::USER_ACCESSIBLE) { "U" } else { "-" },
            if flags.contains(PageTableFlags::NO_EXECUTE) { "X" } else { "-" },
            if flags.contains(PageTableFlags::HUGE_PAGE) { " PS" } else { "" },
        );
        if flags.contains(PageTableFlags::HUGE_PAGE) {
            serial_println_raw!("    (huge mapping; this kernel never creates these)");
            return;
        }
        table_phys = entry.addr();
    }
}

// ============================================================================
// Boot screen
// ============================================================================

/// Draw the boot banner (after the allocators are up).
pub fn draw_boot_screen() {
    let mut fb = framebuffer::FRAMEBUFFER.lock();
    if let Some(fb) = fb.as_mut() {
        fb.clear(Color::rgb(0, 0, 0));
        fb.draw_text(
            10,
            10,
            "OrionOS v0.1",
            Color::rgb(0, 200, 255),
            Color::rgb(0, 0, 0),
            2,
        );
        let (_, height) = fb.dimensions();
        fb.draw_text(
            10,
            height.saturating_sub(30),
            "memory: ready",
            Color::rgb(0, 255, 0),
            Color::rgb(0, 0, 0),
            2,
        );
    }
}
