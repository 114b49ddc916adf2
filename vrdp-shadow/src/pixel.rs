// Copyright 2024 Cloud Hypervisor Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Pixel formats and accessors
//!
//! Pixels are little-endian packed values of 2, 3 or 4 bytes. Conversion
//! between formats goes through a 24-bit `0x00RRGGBB` intermediate.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Result, ShadowError};

/// Read one pixel from the start of a slice
pub type GetPixelFn = fn(&[u8]) -> u32;

/// Write one pixel to the start of a slice
pub type StorePixelFn = fn(&mut [u8], u32);

/// Supported pixel layouts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 15 bits per pixel in a 16-bit word
    Rgb555,
    /// 16 bits per pixel
    Rgb565,
    /// 24 bits per pixel, packed
    Rgb888,
    /// 32 bits per pixel, high byte unused
    Xrgb8888,
}

impl PixelFormat {
    /// Format for a framebuffer depth
    pub fn from_bits_per_pixel(bpp: u32) -> Result<Self> {
        match bpp {
            15 => Ok(PixelFormat::Rgb555),
            16 => Ok(PixelFormat::Rgb565),
            24 => Ok(PixelFormat::Rgb888),
            32 => Ok(PixelFormat::Xrgb8888),
            _ => Err(ShadowError::UnsupportedPixelDepth(bpp)),
        }
    }

    /// Format for a pixel width coming from an order payload
    pub fn from_bytes_per_pixel(bytes: u8) -> Result<Self> {
        match bytes {
            2 => Ok(PixelFormat::Rgb565),
            3 => Ok(PixelFormat::Rgb888),
            4 => Ok(PixelFormat::Xrgb8888),
            _ => Err(ShadowError::UnsupportedPixelDepth(u32::from(bytes) * 8)),
        }
    }

    pub fn bits_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Rgb555 => 15,
            PixelFormat::Rgb565 => 16,
            PixelFormat::Rgb888 => 24,
            PixelFormat::Xrgb8888 => 32,
        }
    }

    /// `(bits_per_pixel + 7) / 8`
    pub fn bytes_per_pixel(self) -> usize {
        (self.bits_per_pixel() as usize).div_ceil(8)
    }

    /// Stride for `width` pixels, aligned to 4 bytes
    pub fn line_size(self, width: u32) -> usize {
        (width as usize * self.bytes_per_pixel() + 3) & !3
    }

    pub fn get_fn(self) -> GetPixelFn {
        match self.bytes_per_pixel() {
            2 => get_pixel16,
            3 => get_pixel24,
            _ => get_pixel32,
        }
    }

    pub fn store_fn(self) -> StorePixelFn {
        match self.bytes_per_pixel() {
            2 => store_pixel16,
            3 => store_pixel24,
            _ => store_pixel32,
        }
    }

    /// Raw pixel to `0x00RRGGBB`
    pub fn to_rgb(self, raw: u32) -> u32 {
        match self {
            PixelFormat::Rgb555 => {
                let r = expand5((raw >> 10) & 0x1f);
                let g = expand5((raw >> 5) & 0x1f);
                let b = expand5(raw & 0x1f);
                (r << 16) | (g << 8) | b
            }
            PixelFormat::Rgb565 => {
                let r = expand5((raw >> 11) & 0x1f);
                let g = (((raw >> 5) & 0x3f) << 2) | ((raw >> 9) & 0x3);
                let b = expand5(raw & 0x1f);
                (r << 16) | (g << 8) | b
            }
            PixelFormat::Rgb888 | PixelFormat::Xrgb8888 => raw & 0x00ff_ffff,
        }
    }

    /// `0x00RRGGBB` to raw pixel
    pub fn from_rgb(self, rgb: u32) -> u32 {
        let (r, g, b) = ((rgb >> 16) & 0xff, (rgb >> 8) & 0xff, rgb & 0xff);
        match self {
            PixelFormat::Rgb555 => ((r >> 3) << 10) | ((g >> 3) << 5) | (b >> 3),
            PixelFormat::Rgb565 => ((r >> 3) << 11) | ((g >> 2) << 5) | (b >> 3),
            PixelFormat::Rgb888 | PixelFormat::Xrgb8888 => rgb & 0x00ff_ffff,
        }
    }

    /// Convert a raw pixel of this format into `target`
    pub fn convert(self, target: PixelFormat, raw: u32) -> u32 {
        if self == target {
            raw
        } else {
            target.from_rgb(self.to_rgb(raw))
        }
    }
}

fn expand5(v: u32) -> u32 {
    (v << 3) | (v >> 2)
}

fn get_pixel16(p: &[u8]) -> u32 {
    u32::from(LittleEndian::read_u16(p))
}

fn get_pixel24(p: &[u8]) -> u32 {
    LittleEndian::read_u24(p)
}

fn get_pixel32(p: &[u8]) -> u32 {
    LittleEndian::read_u32(p)
}

fn store_pixel16(p: &mut [u8], v: u32) {
    LittleEndian::write_u16(p, v as u16);
}

fn store_pixel24(p: &mut [u8], v: u32) {
    LittleEndian::write_u24(p, v & 0x00ff_ffff);
}

fn store_pixel32(p: &mut [u8], v: u32) {
    LittleEndian::write_u32(p, v);
}

/// Convert `count` packed pixels from `src` into `dst`
pub fn convert_line(
    src_format: PixelFormat,
    src: &[u8],
    dst_format: PixelFormat,
    dst: &mut [u8],
    count: usize,
) {
    let (sb, db) = (src_format.bytes_per_pixel(), dst_format.bytes_per_pixel());
    let get = src_format.get_fn();
    let store = dst_format.store_fn();
    for (s, d) in src.chunks_exact(sb).zip(dst.chunks_exact_mut(db)).take(count) {
        store(d, src_format.convert(dst_format, get(s)));
    }
}
