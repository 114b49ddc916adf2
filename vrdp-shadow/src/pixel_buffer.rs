// Copyright 2024 Cloud Hypervisor Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Pixel Buffer
//!
//! A rectangle of pixels plus the region of it that changed since it was last
//! reported. The main buffer of a screen owns zeroed storage from the start;
//! buffers attached to micro shadow buffers get storage only when the first
//! update lands in them.

use crate::error::{Result, ShadowError};
use crate::pixel::{GetPixelFn, PixelFormat, StorePixelFn};
use crate::rect::Rect;
use crate::region::Region;

pub struct PixelBuffer {
    rect: Rect,
    format: PixelFormat,
    line_size: usize,
    pixels: Option<Vec<u8>>,
    dirty: Region,
    get: GetPixelFn,
    store: StorePixelFn,
}

impl std::fmt::Debug for PixelBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PixelBuffer")
            .field("rect", &self.rect)
            .field("format", &self.format)
            .field("line_size", &self.line_size)
            .field("allocated", &self.pixels.is_some())
            .field("dirty_rects", &self.dirty.rect_count())
            .finish()
    }
}

impl PixelBuffer {
    /// Describe a buffer covering `rect` without allocating storage. The dirty
    /// region is bounded by `rect` and tagged with `uniq`.
    pub fn new(rect: Rect, format: PixelFormat, uniq: u32) -> Self {
        Self {
            rect,
            format,
            line_size: format.line_size(rect.w),
            pixels: None,
            dirty: Region::new(rect, uniq),
            get: format.get_fn(),
            store: format.store_fn(),
        }
    }

    /// Buffer with zeroed storage
    pub fn allocated(rect: Rect, format: PixelFormat, uniq: u32) -> Self {
        let mut pb = Self::new(rect, format, uniq);
        pb.pixels = Some(vec![0; pb.size_bytes()]);
        pb
    }

    pub fn rect(&self) -> Rect {
        self.rect
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn bytes_per_pixel(&self) -> usize {
        self.format.bytes_per_pixel()
    }

    pub fn line_size(&self) -> usize {
        self.line_size
    }

    /// Storage size: `line_size * h`
    pub fn size_bytes(&self) -> usize {
        self.line_size * self.rect.h as usize
    }

    pub fn has_pixels(&self) -> bool {
        self.pixels.is_some()
    }

    pub fn pixels(&self) -> Option<&[u8]> {
        self.pixels.as_deref()
    }

    pub fn pixels_mut(&mut self) -> Option<&mut [u8]> {
        self.pixels.as_deref_mut()
    }

    /// Hand storage to the buffer. The storage must be exactly `size_bytes`.
    pub fn attach_pixels(&mut self, pixels: Vec<u8>) -> Result<()> {
        if pixels.len() != self.size_bytes() {
            return Err(ShadowError::BitsTooShort {
                needed: self.size_bytes(),
                available: pixels.len(),
            });
        }
        self.pixels = Some(pixels);
        Ok(())
    }

    pub fn detach_pixels(&mut self) -> Option<Vec<u8>> {
        self.pixels.take()
    }

    pub fn dirty(&self) -> &Region {
        &self.dirty
    }

    pub fn dirty_mut(&mut self) -> &mut Region {
        &mut self.dirty
    }

    /// Byte offset of the pixel at `x, y` given in the buffer's coordinate
    /// space (not relative to the buffer origin).
    pub fn offset_of(&self, x: i32, y: i32) -> Option<usize> {
        if !self.rect.contains_point(x, y) {
            return None;
        }
        let dx = (i64::from(x) - self.rect.left()) as usize;
        let dy = (i64::from(y) - self.rect.top()) as usize;
        Some(dy * self.line_size + dx * self.bytes_per_pixel())
    }

    pub fn get_pixel(&self, x: i32, y: i32) -> Option<u32> {
        let offset = self.offset_of(x, y)?;
        let pixels = self.pixels.as_deref()?;
        Some((self.get)(&pixels[offset..]))
    }

    pub fn store_pixel(&mut self, x: i32, y: i32, value: u32) -> bool {
        let Some(offset) = self.offset_of(x, y) else {
            return false;
        };
        let store = self.store;
        match self.pixels.as_deref_mut() {
            Some(pixels) => {
                store(&mut pixels[offset..], value);
                true
            }
            None => false,
        }
    }
}
