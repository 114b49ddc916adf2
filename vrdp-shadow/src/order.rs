// Copyright 2024 Cloud Hypervisor Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Order stream codec
//!
//! An order update is an 8-byte header giving the framebuffer rectangle the
//! update touches, followed by records. Each record is a little-endian `i32`
//! order code and a body whose size is fixed per code, except for orders that
//! carry pixels or glyphs inline:
//!
//! ```text
//! +---------+--------+--------+--------+--------+-------------------+
//! | x:i16   | y:i16  | w:u16  | h:u16  | op:i32 | body ...  | op ...|
//! +---------+--------+--------+--------+--------+-------------------+
//! ```
//!
//! Variable sized records:
//! - `CACHED_BITMAP`: 16 byte hash, [`DataBits`], `cb` pixel bytes
//! - `SAVESCREEN` with `restore`: 12 byte body, [`DataBits`], `cb` pixel bytes
//! - `TEXT`: 36 byte header whose leading `cb_order` covers header and glyphs
//! - `DIRTY_RECT`: [`DataBits`], `cb` pixel bytes

use byteorder::{ByteOrder, LittleEndian};
use log::debug;

use crate::error::{Result, ShadowError};
use crate::rect::Rect;

/// Size of the stream header
pub const UPDATE_HEADER_SIZE: usize = 8;
/// Size of an encoded [`DataBits`]
pub const DATA_BITS_SIZE: usize = 16;
/// Size of a bitmap content hash
pub const BITMAP_HASH_SIZE: usize = 16;
/// Size of the fixed part of a `TEXT` record
pub const TEXT_HEADER_SIZE: usize = 36;
/// Size of a `SAVESCREEN` body without bits
pub const SAVESCREEN_SIZE: usize = 12;

/// Order codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum OrderCode {
    InternalRedraw = -8,
    InternalSaveScreenRestore = -9,
    InternalCancel = -5,
    InternalCls = -1,
    SolidRect = 0,
    SolidBlt = 1,
    DstBlt = 2,
    ScreenBlt = 3,
    PatBltBrush = 4,
    MemBlt = 5,
    CachedBitmap = 6,
    DeletedBitmap = 7,
    Line = 8,
    Bounds = 9,
    Repeat = 10,
    Polyline = 11,
    Ellipse = 12,
    SaveScreen = 13,
    Text = 14,
    DirtyRect = 15,
}

impl TryFrom<i32> for OrderCode {
    type Error = ShadowError;

    fn try_from(value: i32) -> Result<Self> {
        Ok(match value {
            -9 => OrderCode::InternalSaveScreenRestore,
            -8 => OrderCode::InternalRedraw,
            -5 => OrderCode::InternalCancel,
            -1 => OrderCode::InternalCls,
            0 => OrderCode::SolidRect,
            1 => OrderCode::SolidBlt,
            2 => OrderCode::DstBlt,
            3 => OrderCode::ScreenBlt,
            4 => OrderCode::PatBltBrush,
            5 => OrderCode::MemBlt,
            6 => OrderCode::CachedBitmap,
            7 => OrderCode::DeletedBitmap,
            8 => OrderCode::Line,
            9 => OrderCode::Bounds,
            10 => OrderCode::Repeat,
            11 => OrderCode::Polyline,
            12 => OrderCode::Ellipse,
            13 => OrderCode::SaveScreen,
            14 => OrderCode::Text,
            15 => OrderCode::DirtyRect,
            _ => return Err(ShadowError::UnsupportedOrder(value)),
        })
    }
}

impl OrderCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Codes generated by the engine itself and never accepted from a stream
    pub fn is_internal_only(self) -> bool {
        matches!(
            self,
            OrderCode::InternalCancel | OrderCode::InternalRedraw | OrderCode::InternalSaveScreenRestore
        )
    }

    /// Body size of records without inline data
    pub fn fixed_body_size(self) -> Option<usize> {
        match self {
            OrderCode::InternalCls | OrderCode::Bounds | OrderCode::Repeat => Some(8),
            OrderCode::SolidRect | OrderCode::DstBlt => Some(12),
            OrderCode::SolidBlt | OrderCode::ScreenBlt | OrderCode::DeletedBitmap | OrderCode::Ellipse => {
                Some(16)
            }
            OrderCode::Line => Some(24),
            OrderCode::PatBltBrush => Some(28),
            OrderCode::MemBlt => Some(32),
            OrderCode::Polyline => Some(80),
            _ => None,
        }
    }
}

/// Decode the leading `{x:i16, y:i16, w:u16, h:u16}` of an order body
pub fn read_rect(b: &[u8]) -> Rect {
    Rect::new(
        i32::from(LittleEndian::read_i16(&b[0..2])),
        i32::from(LittleEndian::read_i16(&b[2..4])),
        u32::from(LittleEndian::read_u16(&b[4..6])),
        u32::from(LittleEndian::read_u16(&b[6..8])),
    )
}

/// Encode a rectangle the way order bodies carry it
pub fn encode_rect(rect: &Rect) -> [u8; 8] {
    let mut out = Vec::with_capacity(8);
    push_rect(&mut out, rect);
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&out);
    bytes
}

fn push_rect(buf: &mut Vec<u8>, rect: &Rect) {
    buf.extend_from_slice(&(rect.x as i16).to_le_bytes());
    buf.extend_from_slice(&(rect.y as i16).to_le_bytes());
    buf.extend_from_slice(&(rect.w as u16).to_le_bytes());
    buf.extend_from_slice(&(rect.h as u16).to_le_bytes());
}

/// Header of an inline bitmap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DataBits {
    /// Pixel bytes following the header
    pub cb: u32,
    pub x: i16,
    pub y: i16,
    pub width: u16,
    pub height: u16,
    pub bytes_per_pixel: u8,
}

impl DataBits {
    pub fn decode(b: &[u8]) -> Self {
        Self {
            cb: LittleEndian::read_u32(&b[0..4]),
            x: LittleEndian::read_i16(&b[4..6]),
            y: LittleEndian::read_i16(&b[6..8]),
            width: LittleEndian::read_u16(&b[8..10]),
            height: LittleEndian::read_u16(&b[10..12]),
            bytes_per_pixel: b[12],
        }
    }

    pub fn encode(&self) -> [u8; DATA_BITS_SIZE] {
        let mut out = [0u8; DATA_BITS_SIZE];
        LittleEndian::write_u32(&mut out[0..4], self.cb);
        LittleEndian::write_i16(&mut out[4..6], self.x);
        LittleEndian::write_i16(&mut out[6..8], self.y);
        LittleEndian::write_u16(&mut out[8..10], self.width);
        LittleEndian::write_u16(&mut out[10..12], self.height);
        out[12] = self.bytes_per_pixel;
        out
    }

    /// Area in framebuffer coordinates
    pub fn rect(&self) -> Rect {
        Rect::new(
            i32::from(self.x),
            i32::from(self.y),
            u32::from(self.width),
            u32::from(self.height),
        )
    }

    /// Lines are packed without padding
    pub fn line_size(&self) -> usize {
        usize::from(self.width) * usize::from(self.bytes_per_pixel)
    }

    pub fn has_supported_depth(&self) -> bool {
        matches!(self.bytes_per_pixel, 2..=4)
    }
}

/// `SCREENBLT` body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenBlt {
    pub dst: Rect,
    pub x_src: i16,
    pub y_src: i16,
    pub rop: u8,
}

impl ScreenBlt {
    pub fn decode(b: &[u8]) -> Self {
        Self {
            dst: read_rect(b),
            x_src: LittleEndian::read_i16(&b[8..10]),
            y_src: LittleEndian::read_i16(&b[10..12]),
            rop: b[12],
        }
    }

    /// Destination and source together, in framebuffer coordinates
    pub fn affected(&self) -> Rect {
        let src = Rect::new(i32::from(self.x_src), i32::from(self.y_src), self.dst.w, self.dst.h);
        self.dst.union(&src)
    }
}

/// `SAVESCREEN` body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveScreen {
    pub pt1: (i16, i16),
    pub pt2: (i16, i16),
    pub ident: u8,
    pub restore: bool,
}

impl SaveScreen {
    pub fn decode(b: &[u8]) -> Self {
        Self {
            pt1: (LittleEndian::read_i16(&b[0..2]), LittleEndian::read_i16(&b[2..4])),
            pt2: (LittleEndian::read_i16(&b[4..6]), LittleEndian::read_i16(&b[6..8])),
            ident: b[8],
            restore: b[9] != 0,
        }
    }
}

/// Payload stored for orders whose pixels went to the bitmap cache: the
/// content key followed by the cache handle.
pub fn encode_cache_reference(key: &[u8], handle: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + 8);
    out.extend_from_slice(key);
    out.extend_from_slice(&handle.to_le_bytes());
    out
}

/// Split a payload built by [`encode_cache_reference`]
pub fn decode_cache_reference(payload: &[u8]) -> Option<(&[u8], u64)> {
    let split = payload.len().checked_sub(8)?;
    let (key, handle) = payload.split_at(split);
    Some((key, LittleEndian::read_u64(handle)))
}

/// Position in a BOUNDS / order / REPEAT sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SeqState {
    /// Single orders
    #[default]
    Nothing,
    /// A BOUNDS record opened a sequence
    Bounds,
    /// The order following BOUNDS
    Order,
    /// REPEAT records of the sequence
    Repeat,
}

impl SeqState {
    pub fn advance(self, op: OrderCode) -> SeqState {
        match op {
            OrderCode::Bounds => {
                if !matches!(self, SeqState::Nothing | SeqState::Repeat) {
                    debug!("BOUNDS in sequence state {self:?}");
                }
                SeqState::Bounds
            }
            OrderCode::Repeat => {
                if !matches!(self, SeqState::Order | SeqState::Repeat) {
                    debug!("REPEAT in sequence state {self:?}");
                }
                SeqState::Repeat
            }
            _ => match self {
                SeqState::Nothing | SeqState::Repeat => SeqState::Nothing,
                SeqState::Bounds | SeqState::Order => SeqState::Order,
            },
        }
    }

    /// Whether this state begins a new unit (single order or sequence)
    pub fn starts_unit(self) -> bool {
        matches!(self, SeqState::Nothing | SeqState::Bounds)
    }
}

/// Cursor over an order stream
pub struct OrderReader<'a> {
    buf: &'a [u8],
    pos: usize,
    last_op: i32,
}

impl<'a> OrderReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            last_op: 0,
        }
    }

    pub fn offset(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn malformed(&self, reason: impl Into<String>) -> ShadowError {
        ShadowError::MalformedOrder {
            offset: self.pos,
            op: self.last_op,
            reason: reason.into(),
        }
    }

    /// Take `len` bytes
    pub fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(self.malformed(format!(
                "{what}: need {len} bytes, {} left",
                self.remaining()
            )));
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    /// Stream header rectangle
    pub fn read_header(&mut self) -> Result<Rect> {
        let b = self.take(UPDATE_HEADER_SIZE, "update header")?;
        Ok(read_rect(b))
    }

    /// Next order code, as found on the wire
    pub fn read_op(&mut self) -> Result<i32> {
        let b = self.take(4, "order code")?;
        self.last_op = LittleEndian::read_i32(b);
        Ok(self.last_op)
    }

    pub fn read_data_bits(&mut self) -> Result<DataBits> {
        let b = self.take(DATA_BITS_SIZE, "bitmap header")?;
        Ok(DataBits::decode(b))
    }

    /// Pixel bytes announced by `bits`
    pub fn read_bits(&mut self, bits: &DataBits) -> Result<&'a [u8]> {
        self.take(bits.cb as usize, "bitmap bits")
    }
}

/// Builder for order streams
#[derive(Debug, Clone)]
pub struct OrderWriter {
    buf: Vec<u8>,
}

impl OrderWriter {
    /// Start a stream touching `header` (framebuffer coordinates)
    pub fn new(header: Rect) -> Self {
        let mut buf = Vec::with_capacity(64);
        push_rect(&mut buf, &header);
        Self { buf }
    }

    /// Append a raw record
    pub fn record(mut self, op: i32, body: &[u8]) -> Self {
        self.buf.extend_from_slice(&op.to_le_bytes());
        self.buf.extend_from_slice(body);
        self
    }

    /// Append a fixed size order with a zeroed body past the rectangle
    pub fn simple(self, op: OrderCode, rect: &Rect) -> Self {
        let size = op.fixed_body_size().unwrap_or(8).max(8);
        let mut body = Vec::with_capacity(size);
        push_rect(&mut body, rect);
        body.resize(size, 0);
        self.record(op.code(), &body)
    }

    pub fn solid_rect(self, rect: &Rect, rgb: u32) -> Self {
        let mut body = Vec::with_capacity(12);
        push_rect(&mut body, rect);
        body.extend_from_slice(&rgb.to_le_bytes());
        self.record(OrderCode::SolidRect.code(), &body)
    }

    pub fn dst_blt(self, rect: &Rect, rop: u8) -> Self {
        let mut body = Vec::with_capacity(12);
        push_rect(&mut body, rect);
        body.extend_from_slice(&[rop, 0, 0, 0]);
        self.record(OrderCode::DstBlt.code(), &body)
    }

    pub fn screen_blt(self, dst: &Rect, x_src: i16, y_src: i16, rop: u8) -> Self {
        let mut body = Vec::with_capacity(16);
        push_rect(&mut body, dst);
        body.extend_from_slice(&x_src.to_le_bytes());
        body.extend_from_slice(&y_src.to_le_bytes());
        body.extend_from_slice(&[rop, 0, 0, 0]);
        self.record(OrderCode::ScreenBlt.code(), &body)
    }

    pub fn bounds(self, left: i16, top: i16, right: i16, bottom: i16) -> Self {
        let mut body = Vec::with_capacity(8);
        for v in [left, top, right, bottom] {
            body.extend_from_slice(&v.to_le_bytes());
        }
        self.record(OrderCode::Bounds.code(), &body)
    }

    pub fn repeat(self, rect: &Rect) -> Self {
        let mut body = Vec::with_capacity(8);
        push_rect(&mut body, rect);
        self.record(OrderCode::Repeat.code(), &body)
    }

    pub fn cached_bitmap(self, hash: &[u8; BITMAP_HASH_SIZE], header: &DataBits, bits: &[u8]) -> Self {
        let mut body = Vec::with_capacity(BITMAP_HASH_SIZE + DATA_BITS_SIZE + bits.len());
        body.extend_from_slice(hash);
        body.extend_from_slice(&header.encode());
        body.extend_from_slice(bits);
        self.record(OrderCode::CachedBitmap.code(), &body)
    }

    pub fn deleted_bitmap(self, hash: &[u8; BITMAP_HASH_SIZE]) -> Self {
        self.record(OrderCode::DeletedBitmap.code(), hash)
    }

    /// `SAVESCREEN`; `restore` carries the bits to put back
    pub fn save_screen(
        self,
        pt1: (i16, i16),
        pt2: (i16, i16),
        ident: u8,
        restore: Option<(&DataBits, &[u8])>,
    ) -> Self {
        let mut body = Vec::with_capacity(SAVESCREEN_SIZE);
        for v in [pt1.0, pt1.1, pt2.0, pt2.1] {
            body.extend_from_slice(&v.to_le_bytes());
        }
        body.extend_from_slice(&[ident, u8::from(restore.is_some()), 0, 0]);
        if let Some((header, bits)) = restore {
            body.extend_from_slice(&header.encode());
            body.extend_from_slice(bits);
        }
        self.record(OrderCode::SaveScreen.code(), &body)
    }

    /// `TEXT` with a background rectangle and raw glyph bytes
    pub fn text(self, background: &Rect, fg: u32, bg: u32, glyph_count: u8, glyphs: &[u8]) -> Self {
        let cb_order = (TEXT_HEADER_SIZE + glyphs.len()) as u32;
        let mut body = Vec::with_capacity(cb_order as usize);
        body.extend_from_slice(&cb_order.to_le_bytes());
        push_rect(&mut body, background);
        push_rect(&mut body, background);
        body.extend_from_slice(&0u16.to_le_bytes());
        body.extend_from_slice(&[glyph_count, 0, 0, 0, 0, 0]);
        body.extend_from_slice(&fg.to_le_bytes());
        body.extend_from_slice(&bg.to_le_bytes());
        body.extend_from_slice(glyphs);
        self.record(OrderCode::Text.code(), &body)
    }

    pub fn dirty_rect(self, header: &DataBits, bits: &[u8]) -> Self {
        let mut body = Vec::with_capacity(DATA_BITS_SIZE + bits.len());
        body.extend_from_slice(&header.encode());
        body.extend_from_slice(bits);
        self.record(OrderCode::DirtyRect.code(), &body)
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_code_conversion() {
        assert_eq!(OrderCode::try_from(3).unwrap(), OrderCode::ScreenBlt);
        assert_eq!(OrderCode::try_from(-9).unwrap(), OrderCode::InternalSaveScreenRestore);
        assert!(OrderCode::InternalRedraw.is_internal_only());
        assert!(!OrderCode::InternalCls.is_internal_only());
        assert!(matches!(OrderCode::try_from(99), Err(ShadowError::UnsupportedOrder(99))));
    }

    #[test]
    fn test_sequence_state_machine() {
        let mut s = SeqState::Nothing;
        s = s.advance(OrderCode::SolidRect);
        assert_eq!(s, SeqState::Nothing);
        s = s.advance(OrderCode::Bounds);
        assert_eq!(s, SeqState::Bounds);
        assert!(s.starts_unit());
        s = s.advance(OrderCode::Line);
        assert_eq!(s, SeqState::Order);
        assert!(!s.starts_unit());
        s = s.advance(OrderCode::Repeat);
        s = s.advance(OrderCode::Repeat);
        assert_eq!(s, SeqState::Repeat);
        s = s.advance(OrderCode::Bounds);
        assert_eq!(s, SeqState::Bounds);
        s = s.advance(OrderCode::Line);
        s = s.advance(OrderCode::Repeat);
        s = s.advance(OrderCode::DstBlt);
        assert_eq!(s, SeqState::Nothing);
    }

    #[test]
    fn test_reader_walks_writer_output() {
        let bits = [0xffu8; 8];
        let header = DataBits {
            cb: 8,
            x: 1,
            y: 2,
            width: 2,
            height: 1,
            bytes_per_pixel: 4,
        };
        let stream = OrderWriter::new(Rect::new(0, 0, 10, 10))
            .solid_rect(&Rect::new(1, 1, 2, 2), 0xff)
            .dirty_rect(&header, &bits)
            .finish();

        let mut reader = OrderReader::new(&stream);
        assert_eq!(reader.read_header().unwrap(), Rect::new(0, 0, 10, 10));
        assert_eq!(reader.read_op().unwrap(), OrderCode::SolidRect.code());
        reader.take(12, "solid rect").unwrap();
        assert_eq!(reader.read_op().unwrap(), OrderCode::DirtyRect.code());
        let decoded = reader.read_data_bits().unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.rect(), Rect::new(1, 2, 2, 1));
        assert_eq!(reader.read_bits(&decoded).unwrap(), &bits);
        assert!(reader.is_empty());
    }

    #[test]
    fn test_reader_reports_truncation() {
        let stream = OrderWriter::new(Rect::new(0, 0, 1, 1)).record(0, &[1, 2]).finish();
        let mut reader = OrderReader::new(&stream);
        reader.read_header().unwrap();
        reader.read_op().unwrap();
        let err = reader.take(12, "solid rect").unwrap_err();
        assert!(matches!(err, ShadowError::MalformedOrder { offset: 12, op: 0, .. }));
    }

    #[test]
    fn test_screen_blt_affected() {
        let mut body = Vec::new();
        push_rect(&mut body, &Rect::new(10, 10, 5, 5));
        body.extend_from_slice(&2i16.to_le_bytes());
        body.extend_from_slice(&20i16.to_le_bytes());
        body.extend_from_slice(&[0xcc, 0, 0, 0]);
        let blt = ScreenBlt::decode(&body);
        assert_eq!(blt.affected(), Rect::new(2, 10, 13, 15));
    }

    #[test]
    fn test_text_header_size() {
        let stream = OrderWriter::new(Rect::new(0, 0, 1, 1))
            .text(&Rect::new(0, 0, 8, 8), 0, 0, 1, &[1, 2, 3])
            .finish();
        assert_eq!(stream.len(), UPDATE_HEADER_SIZE + 4 + TEXT_HEADER_SIZE + 3);
        let cb_order = LittleEndian::read_u32(&stream[12..16]);
        assert_eq!(cb_order as usize, TEXT_HEADER_SIZE + 3);
    }

    #[test]
    fn test_cache_reference() {
        let payload = encode_cache_reference(&[7; 16], 42);
        let (key, handle) = decode_cache_reference(&payload).unwrap();
        assert_eq!(key, &[7u8; 16]);
        assert_eq!(handle, 42);
    }
}
