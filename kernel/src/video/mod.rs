//! Framebuffer seam
//!
//! The kernel validates every drawing request and resolves the frame
//! buffer geometry; actually putting pixels on the glass belongs to the
//! video driver behind [`set_plotter`]. Without a plotter the operations
//! still validate and succeed, so the gfx syscalls behave identically
//! with video disabled (`video=off`).

use log::info;
use spin::Once;

use crate::error::{KernelError, KernelResult};

/// Frame buffer geometry, as reported through `fb_info`.
#[derive(Debug, Clone, Copy)]
pub struct FbInfo {
    pub width: u64,
    pub height: u64,
    /// Bytes per scanline.
    pub pitch: u64,
    /// Bits per pixel.
    pub bpp: u64,
    pub phys_base: u64,
}

/// Pixel sink provided by the video driver.
pub type PixelPlotter = fn(x: u32, y: u32, color: u32);

static FRAMEBUFFER: Once<FbInfo> = Once::new();
static PLOTTER: Once<PixelPlotter> = Once::new();

/// Record the boot framebuffer. Called once from the drivers phase when
/// one is present and video is not disabled.
pub fn init(info: FbInfo) {
    FRAMEBUFFER.call_once(|| info);
    info!(
        "video: {}x{} @{}bpp (pitch {}, base {:#x})",
        info.width, info.height, info.bpp, info.pitch, info.phys_base
    );
}

/// Install the pixel sink.
pub fn set_plotter(plotter: PixelPlotter) {
    PLOTTER.call_once(|| plotter);
}

pub fn fb_info() -> Option<FbInfo> {
    FRAMEBUFFER.get().copied()
}

fn geometry() -> KernelResult<FbInfo> {
    fb_info().ok_or(KernelError::Unsupported {
        operation: "graphics without framebuffer",
    })
}

fn plot(x: u32, y: u32, color: u32) {
    if let Some(plotter) = PLOTTER.get() {
        plotter(x, y, color);
    }
}

fn in_bounds(fb: &FbInfo, x: u32, y: u32) -> bool {
    (x as u64) < fb.width && (y as u64) < fb.height
}

/// Fill an axis-aligned rectangle. The whole rectangle must fit.
pub fn fill_rect(x: u32, y: u32, w: u32, h: u32, color: u32) -> KernelResult<()> {
    let fb = geometry()?;
    if w == 0 || h == 0 {
        return Err(KernelError::InvalidArgument { name: "extent" });
    }
    let (x1, y1) = (
        x.checked_add(w - 1).ok_or(KernelError::InvalidArgument { name: "width" })?,
        y.checked_add(h - 1).ok_or(KernelError::InvalidArgument { name: "height" })?,
    );
    if !in_bounds(&fb, x, y) || !in_bounds(&fb, x1, y1) {
        return Err(KernelError::InvalidAddress {
            addr: ((x1 as u64) << 32) | y1 as u64,
        });
    }
    for py in y..=y1 {
        for px in x..=x1 {
            plot(px, py, color);
        }
    }
    Ok(())
}

/// Bresenham line; both endpoints must be on screen.
pub fn draw_line(x0: u32, y0: u32, x1: u32, y1: u32, color: u32) -> KernelResult<()> {
    let fb = geometry()?;
    if !in_bounds(&fb, x0, y0) || !in_bounds(&fb, x1, y1) {
        return Err(KernelError::InvalidArgument { name: "endpoint" });
    }
    let (mut x, mut y) = (x0 as i64, y0 as i64);
    let (x1, y1) = (x1 as i64, y1 as i64);
    let dx = (x1 - x).abs();
    let dy = -(y1 - y).abs();
    let sx = if x < x1 { 1 } else { -1 };
    let sy = if y < y1 { 1 } else { -1 };
    let mut err = dx + dy;
    loop {
        plot(x as u32, y as u32, color);
        if x == x1 && y == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x += sx;
        }
        if e2 <= dx {
            err += dx;
            y += sy;
        }
    }
    Ok(())
}

/// Midpoint circle, outlined or filled. The bounding box must fit.
pub fn draw_circle(cx: u32, cy: u32, radius: u32, color: u32, filled: bool) -> KernelResult<()> {
    let fb = geometry()?;
    let r = radius as i64;
    let (cx_i, cy_i) = (cx as i64, cy as i64);
    if cx_i - r < 0
        || cy_i - r < 0
        || cx_i + r >= fb.width as i64
        || cy_i + r >= fb.height as i64
    {
        return Err(KernelError::InvalidArgument { name: "radius" });
    }
    let mut x = r;
    let mut y = 0i64;
    let mut err = 1 - r;
    while x >= y {
        if filled {
            for px in (cx_i - x)..=(cx_i + x) {
                plot(px as u32, (cy_i + y) as u32, color);
                plot(px as u32, (cy_i - y) as u32, color);
            }
            for px in (cx_i - y)..=(cx_i + y) {
                plot(px as u32, (cy_i + x) as u32, color);
                plot(px as u32, (cy_i - x) as u32, color);
            }
        } else {
            for (px, py) in [
                (cx_i + x, cy_i + y),
                (cx_i - x, cy_i + y),
                (cx_i + x, cy_i - y),
                (cx_i - x, cy_i - y),
                (cx_i + y, cy_i + x),
                (cx_i - y, cy_i + x),
                (cx_i + y, cy_i - x),
                (cx_i - y, cy_i - x),
            ] {
                plot(px as u32, py as u32, color);
            }
        }
        y += 1;
        if err < 0 {
            err += 2 * y + 1;
        } else {
            x -= 1;
            err += 2 * (y - x) + 1;
        }
    }
    Ok(())
}

/// Glyph cell size used for text layout bounds.
const GLYPH_W: u64 = 8;
const GLYPH_H: u64 = 16;

/// Draw a text run. Glyph rasterization is the plotter's problem; the
/// kernel only enforces that the run stays on screen.
pub fn font_draw(x: u32, y: u32, color: u32, text: &str) -> KernelResult<()> {
    let fb = geometry()?;
    let run = text.chars().count() as u64 * GLYPH_W;
    if x as u64 + run > fb.width || y as u64 + GLYPH_H > fb.height {
        return Err(KernelError::InvalidArgument { name: "text run" });
    }
    for (i, _ch) in text.chars().enumerate() {
        // One cell per character; the plotter substitutes real glyphs.
        let cell_x = x + (i as u32) * GLYPH_W as u32;
        plot(cell_x, y, color);
    }
    Ok(())
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn fb() -> FbInfo {
        FbInfo {
            width: 640,
            height: 480,
            pitch: 640 * 4,
            bpp: 32,
            phys_base: 0xE000_0000,
        }
    }

    fn ensure_fb() {
        FRAMEBUFFER.call_once(fb);
    }

    #[test]
    fn test_bounds_enforced() {
        ensure_fb();
        assert!(fill_rect(0, 0, 640, 480, 0xFFFFFF).is_ok());
        assert!(fill_rect(0, 0, 641, 1, 0).is_err());
        assert!(fill_rect(639, 479, 2, 2, 0).is_err());
        assert!(fill_rect(0, 0, 0, 10, 0).is_err(), "zero extent");
        assert!(draw_line(0, 0, 639, 479, 0).is_ok());
        assert!(draw_line(0, 0, 640, 0, 0).is_err());
        assert!(draw_circle(320, 240, 100, 0, true).is_ok());
        assert!(draw_circle(10, 240, 100, 0, false).is_err());
    }

    #[test]
    fn test_font_run_bounds() {
        ensure_fb();
        assert!(font_draw(0, 0, 0, "hello").is_ok());
        let long: alloc::string::String = core::iter::repeat('x').take(100).collect();
        assert!(font_draw(600, 0, 0, &long).is_err());
    }
}
