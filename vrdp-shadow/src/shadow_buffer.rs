// Copyright 2024 Cloud Hypervisor Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Shadow Buffer
//!
//! The per screen copy of the guest framebuffer, kept in shadow buffer (SB)
//! orientation. Pixels under pending orders are held back in the MSBs and
//! only merged into the main buffer once the order has been delivered, so the
//! output never shows pixels the client has not yet drawn the order for.
//!
//! ```text
//!   guest framebuffer --(rotate)--> MSB top ... MSB bottom --> main buffer
//!                                       \_________________________/
//!                                        each pixel lands in the newest
//!                                        buffer covering it
//! ```

use log::{debug, trace};

use crate::error::{Result, ShadowError};
use crate::framebuffer::FramebufferDesc;
use crate::msb::{MsbBudget, MsbList};
use crate::pixel::PixelFormat;
use crate::pixel_buffer::PixelBuffer;
use crate::rect::Rect;
use crate::region::Region;
use crate::transform::{Rotation, SourceBits, TransBits, Transform};

/// Shadow buffer of one screen
#[derive(Debug)]
pub struct ShadowBuffer {
    pub(crate) transform: Transform,
    /// Main pixel buffer, SB coordinates
    pub(crate) main: PixelBuffer,
    pub(crate) list: MsbList,
    pub(crate) budget: MsbBudget,
    /// Areas to refresh from the framebuffer once MSBs drain
    pub(crate) redraw: Region,
    /// Scratch region of areas already claimed during one update
    pub(crate) over: Region,
    /// Skip unchanged columns when copying
    pub(crate) adjust_rects: bool,
    /// A resize action is pending
    pub(crate) resized: bool,
    /// An INTERNALCANCEL action is pending
    pub(crate) reset_bounds: bool,
    pub(crate) source: FramebufferDesc,
    pub(crate) source_format: PixelFormat,
}

impl ShadowBuffer {
    /// Build a shadow buffer for `source` with zeroed pixels. Regions are
    /// tagged with `access_key`.
    pub fn new(source: FramebufferDesc, rotation: Rotation, msb_max: u32, access_key: u32) -> Result<Self> {
        let source_format = source.validate()?;
        let transform = Transform::new(rotation, source.width, source.height);
        let (w, h) = transform.sb_size();
        let rect = Rect::with_size(w, h);

        let mut main = PixelBuffer::new(rect, source_format, access_key);
        let size = main.size_bytes();
        let mut pixels = Vec::new();
        if pixels.try_reserve_exact(size).is_err() {
            return Err(ShadowError::OutOfMemory(format!("{size} bytes for a {w}x{h} shadow buffer")));
        }
        pixels.resize(size, 0);
        main.attach_pixels(pixels)?;

        debug!(
            "shadow buffer {w}x{h} {source_format:?} rotation {}",
            rotation.degrees()
        );

        Ok(Self {
            transform,
            main,
            list: MsbList::default(),
            budget: MsbBudget::new(msb_max),
            redraw: Region::new(rect, access_key),
            over: Region::new(rect, access_key),
            adjust_rects: true,
            resized: true,
            reset_bounds: false,
            source,
            source_format,
        })
    }

    pub fn transform(&self) -> &Transform {
        &self.transform
    }

    pub fn rect(&self) -> Rect {
        self.main.rect()
    }

    pub fn main(&self) -> &PixelBuffer {
        &self.main
    }

    pub fn budget(&self) -> MsbBudget {
        self.budget
    }

    pub fn redraw(&self) -> &Region {
        &self.redraw
    }

    pub fn source(&self) -> &FramebufferDesc {
        &self.source
    }

    /// Whether the framebuffer can be swapped in without a rebuild
    pub(crate) fn same_geometry(&self, desc: &FramebufferDesc, rotation: Rotation) -> bool {
        self.transform.rotation() == rotation && self.source.same_layout(desc)
    }

    /// Retag every region after an access key change
    pub(crate) fn retag(&mut self, access_key: u32) {
        let dirty = self.main.dirty().clone();
        self.main.dirty_mut().reset(access_key);
        self.main.dirty_mut().add(&dirty);
        let redraw = self.redraw.clone();
        self.redraw.reset(access_key);
        self.redraw.add(&redraw);
        self.over.reset(access_key);
    }

    /// Clamp a FB rectangle to the framebuffer
    pub(crate) fn clamp_fb(&self, rect: &Rect) -> Rect {
        let (w, h) = self.transform.fb_size();
        rect.clamp_to(w, h)
    }

    /// Source description of `fb_rect` in the locked framebuffer `memory`
    pub(crate) fn source_bits<'a>(&self, memory: &'a [u8], fb_rect: &Rect) -> SourceBits<'a> {
        self.source.source_bits(memory, fb_rect, self.source_format)
    }

    /// Copy `redraw` from the framebuffer straight into the main buffer and
    /// mark it dirty.
    pub(crate) fn flush_redraw(&mut self) {
        if self.redraw.is_empty() {
            return;
        }
        let redraw = self.redraw.take();
        let memory = self.source.memory.clone();
        let memory = memory.read();
        for rect in redraw.rects() {
            let fb_rect = self.transform.rect_to_fb(&rect);
            let src = self.source_bits(&memory, &fb_rect);
            let copied = self
                .transform
                .trans_bits(&src)
                .and_then(|bits| self.transform.copy_rect(&mut self.main, &bits, &bits.rect));
            if let Err(e) = copied {
                debug!("redraw of {rect} failed: {e}");
            }
        }
        self.main.dirty_mut().add(&redraw);
        trace!("flushed {} redraw rects", redraw.rect_count());
    }
}

/// Copy `rect` of `bits` into `pb`, leaving out what `over` already claims,
/// and add what was copied to the dirty region of `pb`.
pub(crate) fn update_pixel_buffer(
    transform: &Transform,
    pb: &mut PixelBuffer,
    over: &Region,
    bits: &TransBits<'_>,
    rect: &Rect,
    adjust_rects: bool,
) {
    let mut region = over.cut(rect);
    region.invert();
    for mut part in region.rects() {
        if adjust_rects {
            transform.adjust_rect(pb, bits, &mut part);
            if part.is_empty() {
                continue;
            }
        }
        match transform.copy_rect(pb, bits, &part) {
            Ok(()) => pb.dirty_mut().add_rect(&part),
            Err(e) => debug!("copy of {part} skipped: {e}"),
        }
    }
}

/// Walk a pixel buffer's own storage unrotated
pub(crate) fn normal_trans_bits(pb: &PixelBuffer) -> Option<TransBits<'_>> {
    Some(TransBits {
        src: pb.pixels()?,
        origin: 0,
        delta_line: pb.line_size() as isize,
        delta_pixel: pb.bytes_per_pixel() as isize,
        rect: pb.rect(),
        format: pb.format(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framebuffer::SharedFramebuffer;

    fn desc(w: u32, h: u32) -> FramebufferDesc {
        let memory = SharedFramebuffer::from_vec((0..w * h * 4).map(|i| i as u8).collect());
        FramebufferDesc::packed(w, h, 32, memory)
    }

    #[test]
    fn test_new_rotated() {
        let sb = ShadowBuffer::new(desc(8, 4), Rotation::Deg90, 16, 1).unwrap();
        assert_eq!(sb.rect(), Rect::with_size(4, 8));
        assert!(sb.resized);
        assert!(sb.adjust_rects);
        assert_eq!(sb.budget().limit, 16);
        assert!(sb.main().has_pixels());
    }

    #[test]
    fn test_update_pixel_buffer_skips_over() {
        let sb = ShadowBuffer::new(desc(4, 4), Rotation::Deg0, 16, 1).unwrap();
        let memory = sb.source.memory.read();
        let src = sb.source_bits(&memory, &Rect::with_size(4, 4));
        let bits = sb.transform.trans_bits(&src).unwrap();

        let mut pb = PixelBuffer::allocated(Rect::with_size(4, 4), PixelFormat::Xrgb8888, 1);
        let over = Region::from_rect(Rect::with_size(4, 4), 1, &Rect::new(0, 0, 2, 4));
        update_pixel_buffer(&sb.transform, &mut pb, &over, &bits, &Rect::with_size(4, 4), false);

        assert_eq!(pb.dirty().area(), 8);
        assert_eq!(pb.get_pixel(0, 0), Some(0));
        assert_eq!(pb.get_pixel(2, 0), bits.pixel(2, 0));
    }

    #[test]
    fn test_flush_redraw() {
        let mut sb = ShadowBuffer::new(desc(4, 4), Rotation::Deg180, 16, 1).unwrap();
        sb.redraw.add_rect(&Rect::new(1, 1, 2, 2));
        sb.flush_redraw();
        assert!(sb.redraw().is_empty());
        assert_eq!(sb.main().dirty().area(), 4);

        // SB (1,1) is FB (2,2) at 180 degrees
        let expected = u32::from_le_bytes([40, 41, 42, 43]);
        assert_eq!(sb.main().get_pixel(1, 1), Some(expected));
    }
}
