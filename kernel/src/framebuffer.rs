// kernel/src/framebuffer.rs
//
// Minimal linear-framebuffer console: clear, pixels, 8x8 bitmap text.
// Used for the boot banner and the panic screen; serial carries the
// real diagnostics.

use font8x8::legacy::BASIC_LEGACY;
use spin::Mutex;

#[derive(Debug, Clone, Copy)]
pub struct Color(pub [u8; 3]);

impl Color {
    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        // Framebuffer byte order is BGR.
        Color([b, g, r])
    }
}

pub struct Framebuffer {
    buffer: &'static mut [u8],
    width: usize,
    height: usize,
    stride: usize,
    bytes_per_pixel: usize,
}

pub static FRAMEBUFFER: Mutex<Option<Framebuffer>> = Mutex::new(None);

/// Stash the bootloader-provided framebuffer behind the global lock.
pub fn init_global_framebuffer(fb: Framebuffer) {
    *FRAMEBUFFER.lock() = Some(fb);
}

impl Framebuffer {
    pub fn new(
        buffer: &'static mut [u8],
        width: usize,
        height: usize,
        stride: usize,
        bytes_per_pixel: usize,
    ) -> Self {
        Self {
            buffer,
            width,
            height,
            stride,
            bytes_per_pixel,
        }
    }

    pub fn clear(&mut self, color: Color) {
        for i in 0..self.stride * self.height {
            let idx = i * self.bytes_per_pixel;
            if idx + 3 < self.buffer.len() {
                self.buffer[idx] = color.0[0];
                self.buffer[idx + 1] = color.0[1];
                self.buffer[idx + 2] = color.0[2];
                self.buffer[idx + 3] = 0x00;
            }
        }
    }

    pub fn draw_pixel(&mut self, x: usize, y: usize, color: Color) {
        if x >= self.width || y >= self.height {
            return;
        }
        let idx = (y * self.stride + x) * self.bytes_per_pixel;
        if idx + 3 < self.buffer.len() {
            self.buffer[idx] = color.0[0];
            self.buffer[idx + 1] = color.0[1];
            self.buffer[idx + 2] = color.0[2];
            self.buffer[idx + 3] = 0x00;
        }
    }

    pub fn draw_char(
        &mut self,
        x: usize,
        y: usize,
        ascii: u8,
        fg: Color,
        bg: Color,
        scale: usize,
    ) {
        let glyph: [u8; 8] = BASIC_LEGACY[ascii as usize];
        for (row, &bits) in glyph.iter().enumerate() {
            for col in 0..8 {
                let color = if (bits >> col) & 1 != 0 { fg } else { bg };
                for sy in 0..scale {
                    for sx in 0..scale {
                        self.draw_pixel(x + col * scale + sx, y + row * scale + sy, color);
                    }
                }
            }
        }
    }

    pub fn draw_text(
        &mut self,
        x: usize,
        y: usize,
        text: &str,
        fg: Color,
        bg: Color,
        scale: usize,
    ) {
        let char_width = 8 * scale;
        for (i, &byte) in text.as_bytes().iter().enumerate() {
            self.draw_char(x + i * char_width, y, byte, fg, bg, scale);
        }
    }

    pub fn dimensions(&self) -> (usize, usize) {
        (self.width, self.height)
    }
}
