// kernel/src/panic.rs
//
// Last-resort reporting.  Interrupts off, then the message goes out on
// the raw (lock-free) serial writer first — the panic may have fired
// with the framebuffer or serial locks held — and to a blue screen if
// the framebuffer is reachable without blocking.

#[cfg(not(test))]
use core::panic::PanicInfo;

#[cfg(not(test))]
use crate::framebuffer::{Color, Framebuffer};
#[cfg(not(test))]
use crate::serial_println_raw;

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    unsafe { core::arch::asm!("cli") };

    serial_println_raw!();
    serial_println_raw!("KERNEL PANIC");
    if let Some(location) = info.location() {
        serial_println_raw!("  at {}:{}:{}", location.file(), location.line(), location.column());
    }
    serial_println_raw!("  {}", info.message());

    // try_lock: a panic inside a framebuffer call must not deadlock.
    if let Some(mut guard) = crate::framebuffer::FRAMEBUFFER.try_lock() {
        if let Some(fb) = guard.as_mut() {
            draw_panic_screen(fb, info);
        }
    }

    loop {
        unsafe { core::arch::asm!("hlt") };
    }
}

#[cfg(not(test))]
fn draw_panic_screen(fb: &mut Framebuffer, info: &PanicInfo) {
    use core::fmt::Write;

    fb.clear(Color::rgb(0, 0, 170));

    let mut writer = FramebufferWriter::new(fb, 10, 10);
    let _ = writeln!(writer, "KERNEL PANIC");
    let _ = writeln!(writer, "========================================");
    let _ = writeln!(writer);
    if let Some(location) = info.location() {
        let _ = writeln!(writer, "Location: {}:{}", location.file(), location.line());
    }
    let _ = writeln!(writer, "Message:  {}", info.message());
    let _ = writeln!(writer);
    let _ = writeln!(writer, "System halted.");
}

#[cfg(not(test))]
struct FramebufferWriter<'a> {
    fb: &'a mut Framebuffer,
    left: usize,
    x: usize,
    y: usize,
    line_height: usize,
}

#[cfg(not(test))]
impl<'a> FramebufferWriter<'a> {
    fn new(fb: &'a mut Framebuffer, x: usize, y: usize) -> Self {
        Self {
            fb,
            left: x,
            x,
            y,
            line_height: 10,
        }
    }
}

#[cfg(not(test))]
impl<'a> core::fmt::Write for FramebufferWriter<'a> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        for &byte in s.as_bytes() {
            if byte == b'\n' {
                self.x = self.left;
                self.y += self.line_height;
                continue;
            }
            self.fb.draw_char(
                self.x,
                self.y,
                byte,
                Color::rgb(255, 255, 255),
                Color::rgb(0, 0, 170),
                1,
            );
            self.x += 8;
        }
        Ok(())
    }
}
