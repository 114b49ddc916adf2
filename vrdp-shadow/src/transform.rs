// Copyright 2024 Cloud Hypervisor Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Transform Table
//!
//! Maps between framebuffer (FB) coordinates, as written by the guest, and
//! shadow buffer (SB) coordinates, as seen by clients. The SB is the FB
//! rotated clockwise by 0, 90, 180 or 270 degrees, so for 90 and 270 the SB
//! width is the FB height.
//!
//! ```text
//!     FB (W x H)                SB, 90 degrees (H x W)
//!   +---------------+          +---------+
//!   | (x,y)         |   ---->  |  (y, W-1-x)
//!   |               |          |         |
//!   +---------------+          |         |
//!                              +---------+
//! ```
//!
//! Source bitmaps are never rotated up front. Instead [`Transform::trans_bits`]
//! describes the source as an origin byte plus per-line and per-pixel strides
//! walking it in SB order, and the copy routines follow those strides.

use log::trace;

use crate::error::{Result, ShadowError};
use crate::pixel::{PixelFormat, convert_line};
use crate::pixel_buffer::PixelBuffer;
use crate::rect::Rect;

/// Clockwise rotation from FB to SB
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl TryFrom<u32> for Rotation {
    type Error = ShadowError;

    /// Accepts either a quarter turn index (0 to 3) or degrees.
    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Rotation::Deg0),
            1 | 90 => Ok(Rotation::Deg90),
            2 | 180 => Ok(Rotation::Deg180),
            3 | 270 => Ok(Rotation::Deg270),
            _ => Err(ShadowError::InvalidConfig(format!("invalid rotation {value}"))),
        }
    }
}

impl Rotation {
    pub fn degrees(self) -> u32 {
        match self {
            Rotation::Deg0 => 0,
            Rotation::Deg90 => 90,
            Rotation::Deg180 => 180,
            Rotation::Deg270 => 270,
        }
    }

    /// Whether width and height trade places
    pub fn swaps_axes(self) -> bool {
        matches!(self, Rotation::Deg90 | Rotation::Deg270)
    }

    /// The rotation undoing this one
    pub fn inverse(self) -> Rotation {
        match self {
            Rotation::Deg90 => Rotation::Deg270,
            Rotation::Deg270 => Rotation::Deg90,
            other => other,
        }
    }
}

fn rect_from_i64(x: i64, y: i64, w: i64, h: i64) -> Rect {
    Rect::from_edges(x, y, x + w, y + h)
}

/// Rotate `rect` inside a target space of `target_w x target_h`.
pub fn rotate_rect(rotation: Rotation, rect: &Rect, target_w: u32, target_h: u32) -> Rect {
    let (x, y) = (rect.left(), rect.top());
    let (w, h) = (i64::from(rect.w), i64::from(rect.h));
    let (tw, th) = (i64::from(target_w), i64::from(target_h));
    match rotation {
        Rotation::Deg0 => *rect,
        Rotation::Deg90 => rect_from_i64(y, th - (x + w), h, w),
        Rotation::Deg180 => rect_from_i64(tw - (x + w), th - (y + h), w, h),
        Rotation::Deg270 => rect_from_i64(tw - (y + h), x, h, w),
    }
}

/// Rotate a point inside a target space of `target_w x target_h`.
pub fn rotate_point(rotation: Rotation, x: i32, y: i32, target_w: u32, target_h: u32) -> (i32, i32) {
    let (x, y) = (i64::from(x), i64::from(y));
    let (tw, th) = (i64::from(target_w), i64::from(target_h));
    let (rx, ry) = match rotation {
        Rotation::Deg0 => (x, y),
        Rotation::Deg90 => (y, th - 1 - x),
        Rotation::Deg180 => (tw - 1 - x, th - 1 - y),
        Rotation::Deg270 => (tw - 1 - y, x),
    };
    (saturate(rx), saturate(ry))
}

fn saturate(v: i64) -> i32 {
    i32::try_from(v).unwrap_or(if v < 0 { i32::MIN } else { i32::MAX })
}

/// Source bitmap in FB coordinates
#[derive(Debug, Clone, Copy)]
pub struct SourceBits<'a> {
    /// Backing bytes
    pub bits: &'a [u8],
    /// Offset of the pixel at `rect.x, rect.y`
    pub offset: usize,
    /// Distance between source lines
    pub line_size: usize,
    /// Area described, in FB coordinates
    pub rect: Rect,
    pub format: PixelFormat,
}

/// A source bitmap walked in SB order
#[derive(Debug, Clone, Copy)]
pub struct TransBits<'a> {
    pub src: &'a [u8],
    /// Offset of the source pixel landing at `rect.x, rect.y` of the SB
    pub origin: usize,
    /// Source advance for one SB line
    pub delta_line: isize,
    /// Source advance for one SB pixel
    pub delta_pixel: isize,
    /// Destination area in SB coordinates
    pub rect: Rect,
    pub format: PixelFormat,
}

impl TransBits<'_> {
    /// Source offset of SB pixel `x, y`. Only valid inside `rect`.
    fn offset_of(&self, x: i64, y: i64) -> usize {
        let dx = (x - self.rect.left()) as isize;
        let dy = (y - self.rect.top()) as isize;
        (self.origin as isize + dy * self.delta_line + dx * self.delta_pixel) as usize
    }

    /// Read the SB pixel at `x, y` as a raw value of `format`.
    pub fn pixel(&self, x: i32, y: i32) -> Option<u32> {
        if !self.rect.contains_point(x, y) {
            return None;
        }
        let offset = self.offset_of(i64::from(x), i64::from(y));
        Some((self.format.get_fn())(&self.src[offset..]))
    }

    /// Materialize the bitmap in SB orientation as tightly packed lines of
    /// `target` pixels.
    pub fn to_packed(&self, target: PixelFormat) -> Vec<u8> {
        let bpp = target.bytes_per_pixel();
        let (w, h) = (self.rect.w as usize, self.rect.h as usize);
        let mut out = vec![0u8; w * h * bpp];
        let get = self.format.get_fn();
        let store = target.store_fn();
        for (row, line) in out.chunks_exact_mut((w * bpp).max(1)).take(h).enumerate() {
            let y = self.rect.top() + row as i64;
            let start = self.offset_of(self.rect.left(), y) as isize;
            for (col, px) in line.chunks_exact_mut(bpp).enumerate() {
                let s = (start + col as isize * self.delta_pixel) as usize;
                store(px, self.format.convert(target, get(&self.src[s..])));
            }
        }
        out
    }
}

/// FB to SB mapping for one screen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transform {
    rotation: Rotation,
    fb_width: u32,
    fb_height: u32,
}

impl Transform {
    pub fn new(rotation: Rotation, fb_width: u32, fb_height: u32) -> Self {
        Self {
            rotation,
            fb_width,
            fb_height,
        }
    }

    pub fn rotation(&self) -> Rotation {
        self.rotation
    }

    pub fn fb_size(&self) -> (u32, u32) {
        (self.fb_width, self.fb_height)
    }

    pub fn sb_size(&self) -> (u32, u32) {
        self.width_height(self.fb_width, self.fb_height)
    }

    /// Extent of a FB sized area once rotated
    pub fn width_height(&self, w: u32, h: u32) -> (u32, u32) {
        if self.rotation.swaps_axes() {
            (h, w)
        } else {
            (w, h)
        }
    }

    pub fn rect_to_sb(&self, rect: &Rect) -> Rect {
        let (w, h) = self.sb_size();
        rotate_rect(self.rotation, rect, w, h)
    }

    pub fn rect_to_fb(&self, rect: &Rect) -> Rect {
        rotate_rect(self.rotation.inverse(), rect, self.fb_width, self.fb_height)
    }

    pub fn point_to_sb(&self, x: i32, y: i32) -> (i32, i32) {
        let (w, h) = self.sb_size();
        rotate_point(self.rotation, x, y, w, h)
    }

    pub fn point_to_fb(&self, x: i32, y: i32) -> (i32, i32) {
        rotate_point(self.rotation.inverse(), x, y, self.fb_width, self.fb_height)
    }

    /// Describe `src` walked in SB order. Fails when the source bytes do not
    /// cover every pixel of the rectangle.
    pub fn trans_bits<'a>(&self, src: &SourceBits<'a>) -> Result<TransBits<'a>> {
        let bpp = src.format.bytes_per_pixel();
        let (w, h) = (src.rect.w as usize, src.rect.h as usize);
        if w > 0 && h > 0 {
            let needed = (h - 1)
                .checked_mul(src.line_size)
                .and_then(|v| v.checked_add(w * bpp))
                .and_then(|v| v.checked_add(src.offset))
                .unwrap_or(usize::MAX);
            if needed > src.bits.len() {
                return Err(ShadowError::BitsTooShort {
                    needed,
                    available: src.bits.len(),
                });
            }
        }

        let line = src.line_size as isize;
        let ibpp = bpp as isize;
        let last_col = bpp * w.saturating_sub(1);
        let last_line = src.line_size * h.saturating_sub(1);
        let (origin, delta_line, delta_pixel) = match self.rotation {
            Rotation::Deg0 => (src.offset, line, ibpp),
            Rotation::Deg90 => (src.offset + last_col, -ibpp, line),
            Rotation::Deg180 => (src.offset + last_line + last_col, -line, -ibpp),
            Rotation::Deg270 => (src.offset + last_line, ibpp, -line),
        };

        Ok(TransBits {
            src: src.bits,
            origin,
            delta_line,
            delta_pixel,
            rect: self.rect_to_sb(&src.rect),
            format: src.format,
        })
    }

    /// Copy the part `rect` (SB coordinates) of `bits` into `pb`.
    ///
    /// Straight line copies are used when the walk is unrotated, with a
    /// per line color conversion if the formats differ. Rotated walks go
    /// pixel by pixel.
    pub fn copy_rect(&self, pb: &mut PixelBuffer, bits: &TransBits<'_>, rect: &Rect) -> Result<()> {
        if rect.is_empty() {
            return Ok(());
        }
        let pb_rect = pb.rect();
        if !pb_rect.contains_rect(rect) {
            return Err(ShadowError::RectOutOfRange {
                rect: *rect,
                bounds: pb_rect,
            });
        }
        if !bits.rect.contains_rect(rect) {
            return Err(ShadowError::RectOutOfRange {
                rect: *rect,
                bounds: bits.rect,
            });
        }

        let dst_format = pb.format();
        let dst_bpp = dst_format.bytes_per_pixel();
        let src_bpp = bits.format.bytes_per_pixel();
        let line_size = pb.line_size();
        let Some(dst) = pb.pixels_mut() else {
            return Err(ShadowError::OutOfMemory("pixel storage not allocated".to_string()));
        };

        trace!("copy {rect} rotation {:?}", self.rotation);

        let w = rect.w as usize;
        let dx = (rect.left() - pb_rect.left()) as usize;
        let get = bits.format.get_fn();
        let store = dst_format.store_fn();
        for y in rect.top()..rect.bottom() {
            let d_off = (y - pb_rect.top()) as usize * line_size + dx * dst_bpp;
            let s_off = bits.offset_of(rect.left(), y);
            let dst_line = &mut dst[d_off..d_off + w * dst_bpp];

            if bits.delta_pixel == src_bpp as isize {
                let src_line = &bits.src[s_off..s_off + w * src_bpp];
                if bits.format == dst_format {
                    dst_line.copy_from_slice(src_line);
                } else {
                    convert_line(bits.format, src_line, dst_format, dst_line, w);
                }
                continue;
            }

            for (col, px) in dst_line.chunks_exact_mut(dst_bpp).enumerate() {
                let s = (s_off as isize + col as isize * bits.delta_pixel) as usize;
                store(px, bits.format.convert(dst_format, get(&bits.src[s..])));
            }
        }
        Ok(())
    }

    /// Shrink `rect` horizontally to the columns whose source pixels differ
    /// from what `pb` already holds. An unchanged rectangle becomes empty.
    ///
    /// Only unrotated walks over matching formats are examined; otherwise the
    /// rectangle is left as is.
    pub fn adjust_rect(&self, pb: &PixelBuffer, bits: &TransBits<'_>, rect: &mut Rect) {
        if self.rotation != Rotation::Deg0 || rect.is_empty() || pb.format() != bits.format {
            return;
        }
        let pb_rect = pb.rect();
        if !pb_rect.contains_rect(rect) || !bits.rect.contains_rect(rect) {
            return;
        }
        let Some(dst) = pb.pixels() else {
            return;
        };

        let bpp = bits.format.bytes_per_pixel();
        let line_size = pb.line_size();
        let width = rect.w as i64;
        let dx = (rect.left() - pb_rect.left()) as usize;

        let mut leftmost = width;
        let mut rightmost: i64 = -1;
        for y in rect.top()..rect.bottom() {
            let d_off = (y - pb_rect.top()) as usize * line_size + dx * bpp;
            let s_off = bits.offset_of(rect.left(), y);
            let dst_line = &dst[d_off..d_off + rect.w as usize * bpp];
            let src_line = &bits.src[s_off..s_off + rect.w as usize * bpp];
            let differs = |x: i64| {
                let i = x as usize * bpp;
                dst_line[i..i + bpp] != src_line[i..i + bpp]
            };

            if let Some(x) = (0..leftmost).find(|&x| differs(x)) {
                leftmost = x;
            }
            let fence = leftmost.max(rightmost).max(0);
            if let Some(x) = (fence..width).rev().find(|&x| differs(x)) {
                rightmost = rightmost.max(x);
            }
            if leftmost == 0 && rightmost == width - 1 {
                break;
            }
        }

        if leftmost > rightmost {
            rect.w = 0;
        } else {
            *rect = rect_from_i64(
                rect.left() + leftmost,
                rect.top(),
                rightmost - leftmost + 1,
                i64::from(rect.h),
            );
        }
    }
}
