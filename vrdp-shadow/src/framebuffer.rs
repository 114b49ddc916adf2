// Copyright 2024 Cloud Hypervisor Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Guest framebuffer description
//!
//! The framebuffer memory belongs to the VM side. The engine only reads it,
//! while copying updates into the shadow buffer, under the context lock.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{Result, ShadowError};
use crate::pixel::PixelFormat;
use crate::rect::Rect;
use crate::transform::SourceBits;

/// Framebuffer memory shared between the VM and the engine
#[derive(Debug, Clone, Default)]
pub struct SharedFramebuffer {
    memory: Arc<RwLock<Vec<u8>>>,
}

impl SharedFramebuffer {
    /// Zeroed framebuffer of `size` bytes
    pub fn new(size: usize) -> Self {
        Self::from_vec(vec![0; size])
    }

    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            memory: Arc::new(RwLock::new(bytes)),
        }
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.memory.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.memory.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether both refer to the same memory
    pub fn same_memory(&self, other: &SharedFramebuffer) -> bool {
        Arc::ptr_eq(&self.memory, &other.memory)
    }
}

/// Geometry of a guest framebuffer
#[derive(Debug, Clone)]
pub struct FramebufferDesc {
    /// Position of the screen on the virtual desktop
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub bits_per_pixel: u32,
    /// Bytes between lines
    pub line_size: usize,
    pub memory: SharedFramebuffer,
}

impl FramebufferDesc {
    /// Describe a tightly packed framebuffer
    pub fn packed(width: u32, height: u32, bits_per_pixel: u32, memory: SharedFramebuffer) -> Self {
        let line_size = (width as usize) * (bits_per_pixel as usize).div_ceil(8);
        Self {
            x: 0,
            y: 0,
            width,
            height,
            bits_per_pixel,
            line_size,
            memory,
        }
    }

    pub fn format(&self) -> Result<PixelFormat> {
        PixelFormat::from_bits_per_pixel(self.bits_per_pixel)
    }

    pub fn rect(&self) -> Rect {
        Rect::with_size(self.width, self.height)
    }

    /// Check geometry against the backing memory
    pub fn validate(&self) -> Result<PixelFormat> {
        let format = self.format()?;
        if self.width == 0 || self.height == 0 {
            return Err(ShadowError::InvalidFramebuffer(format!(
                "empty framebuffer {}x{}",
                self.width, self.height
            )));
        }
        if self.width > i16::MAX as u32 || self.height > i16::MAX as u32 {
            return Err(ShadowError::InvalidFramebuffer(format!(
                "framebuffer {}x{} too large",
                self.width, self.height
            )));
        }
        let min_line = self.width as usize * format.bytes_per_pixel();
        if self.line_size < min_line {
            return Err(ShadowError::InvalidFramebuffer(format!(
                "line size {} below {min_line}",
                self.line_size
            )));
        }
        let needed = self.line_size * self.height as usize;
        let available = self.memory.len();
        if available < needed {
            return Err(ShadowError::InvalidFramebuffer(format!(
                "memory holds {available} bytes, {needed} needed"
            )));
        }
        Ok(format)
    }

    /// Same geometry, possibly different memory
    pub fn same_layout(&self, other: &FramebufferDesc) -> bool {
        self.x == other.x
            && self.y == other.y
            && self.width == other.width
            && self.height == other.height
            && self.bits_per_pixel == other.bits_per_pixel
            && self.line_size == other.line_size
    }

    /// Source description of `rect` (FB coordinates, inside the framebuffer)
    /// within `bits`, the locked framebuffer memory.
    pub fn source_bits<'a>(&self, bits: &'a [u8], rect: &Rect, format: PixelFormat) -> SourceBits<'a> {
        let offset = rect.y.max(0) as usize * self.line_size + rect.x.max(0) as usize * format.bytes_per_pixel();
        SourceBits {
            bits,
            offset,
            line_size: self.line_size,
            rect: *rect,
            format,
        }
    }
}
