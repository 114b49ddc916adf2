// Copyright 2024 Cloud Hypervisor Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Order stream ingestion
//!
//! Every drawing order becomes an MSB on top of the screen's list. Orders may
//! arrive as singles or as `BOUNDS, order, REPEAT...` sequences; a sequence
//! is kept or dropped as a whole, since replaying part of it would draw
//! with the wrong clipping:
//!
//! ```text
//!   BOUNDS  -> MSB ok
//!   LINE    -> MSB failed -> area to redraw, skip the rest
//!   REPEAT  -> skipped
//!   REPEAT  -> skipped
//!   SOLIDRECT (new unit) -> MSB
//! ```

use byteorder::{ByteOrder, LittleEndian};
use log::{trace, warn};

use crate::cache::{BitmapCache, StoreRequest};
use crate::diag::Diagnostics;
use crate::error::{Result, ShadowError};
use crate::order::{
    BITMAP_HASH_SIZE, DataBits, OrderCode, OrderReader, SAVESCREEN_SIZE, SaveScreen, ScreenBlt, SeqState,
    TEXT_HEADER_SIZE, encode_cache_reference,
};
use crate::pixel::PixelFormat;
use crate::rect::Rect;
use crate::screen::Screen;
use crate::transform::SourceBits;
use crate::video::{NoVideoHandler, VideoHandler};

/// Collaborators an order stream may need
pub(crate) struct IngestEnv<'a> {
    pub cache: &'a mut dyn BitmapCache,
    pub handler: &'a mut dyn VideoHandler,
    /// Frames are only offered when a real handler is registered
    pub video: bool,
    pub now_ms: u64,
    pub diag: &'a Diagnostics,
}

impl Screen {
    /// Parse `data` and turn its orders into MSBs. Orders before a malformed
    /// record are kept; the rest of the stream is dropped.
    pub(crate) fn process_orders(&mut self, data: &[u8], env: &mut IngestEnv<'_>) -> Result<()> {
        let result = self.ingest(data, env);
        if let Err(e) = &result {
            let limiter = match e {
                ShadowError::RectOutOfRange { .. } => &env.diag.rect,
                _ => &env.diag.parse,
            };
            if limiter.hit() {
                warn!("screen {}: order stream dropped: {e}", self.id);
            }
        }
        result
    }

    fn ingest(&mut self, data: &[u8], env: &mut IngestEnv<'_>) -> Result<()> {
        let Some(sb) = self.sb.as_ref() else {
            return Err(ShadowError::ScreenInactive(self.id));
        };
        let transform = sb.transform;
        let (fb_w, fb_h) = transform.fb_size();
        let fb_bounds = Rect::with_size(fb_w, fb_h);

        let mut reader = OrderReader::new(data);
        let header = reader.read_header()?;
        if !fb_bounds.contains_rect(&header) {
            return Err(ShadowError::RectOutOfRange {
                rect: header,
                bounds: fb_bounds,
            });
        }
        let affected = transform.rect_to_sb(&header);

        let mut state = SeqState::Nothing;
        let mut skip = false;

        while !reader.is_empty() {
            let code = reader.read_op()?;
            let op = match OrderCode::try_from(code) {
                Ok(op) if !op.is_internal_only() => op,
                _ => return Err(ShadowError::UnsupportedOrder(code)),
            };

            state = state.advance(op);
            if state.starts_unit() {
                skip = false;
            }

            let processed = match op {
                OrderCode::Bounds => {
                    let body = reader.take(8, "BOUNDS")?;
                    self.create_msb(code, Some(&affected), body, false, env.diag)
                }
                OrderCode::DstBlt => {
                    let body = reader.take(12, "DSTBLT")?;
                    let processed =
                        !skip && !self.redraw_covered(&affected) && self.create_msb(code, Some(&affected), body, false, env.diag);
                    self.detector_order_update(&header, env.handler, env.diag);
                    processed
                }
                OrderCode::ScreenBlt => {
                    let body = reader.take(16, "SCREENBLT")?;
                    let blt_fb = ScreenBlt::decode(body).affected().clamp_to(fb_w, fb_h);
                    let blt = transform.rect_to_sb(&blt_fb);
                    let processed =
                        !skip && !self.redraw_covered(&blt) && self.create_msb(code, Some(&blt), body, false, env.diag);
                    self.detector_order_update(&blt_fb, env.handler, env.diag);
                    processed
                }
                OrderCode::CachedBitmap => {
                    let hash = reader.take(BITMAP_HASH_SIZE, "CACHED_BITMAP")?;
                    let bits_header = reader.read_data_bits()?;
                    if !bits_header.has_supported_depth() {
                        return Err(ShadowError::UnsupportedPixelDepth(u32::from(bits_header.bytes_per_pixel) * 8));
                    }
                    let bits = reader.read_bits(&bits_header)?;
                    let request = StoreRequest {
                        op: code,
                        key: hash,
                        header: bits_header,
                        bits,
                        access_key: self.access_key,
                        screen_id: self.id,
                    };
                    match env.cache.store(&request) {
                        Ok(handle) => {
                            let payload = encode_cache_reference(hash, handle.0);
                            if !self.create_msb(code, None, &payload, false, env.diag) {
                                env.cache.free(handle);
                            }
                        }
                        Err(e) => trace!("bitmap not cached: {e}"),
                    }
                    true
                }
                OrderCode::DeletedBitmap => {
                    let body = reader.take(16, "DELETED_BITMAP")?;
                    self.create_msb(code, None, body, true, env.diag);
                    true
                }
                OrderCode::SaveScreen => {
                    let body = reader.take(SAVESCREEN_SIZE, "SAVESCREEN")?;
                    if SaveScreen::decode(body).restore {
                        let bits_header = reader.read_data_bits()?;
                        let bits = reader.read_bits(&bits_header)?;
                        self.save_screen_restore(body, &bits_header, bits, &affected, env)?;
                    } else {
                        // Saves are replayed even inside a skipped sequence
                        self.create_msb(code, Some(&affected), body, false, env.diag);
                    }
                    true
                }
                OrderCode::DirtyRect => {
                    let bits_header = reader.read_data_bits()?;
                    if !bits_header.has_supported_depth() {
                        return Err(ShadowError::UnsupportedPixelDepth(u32::from(bits_header.bytes_per_pixel) * 8));
                    }
                    let bits = reader.read_bits(&bits_header)?;
                    self.dirty_rect(&bits_header, bits, env)?;
                    true
                }
                OrderCode::Text => {
                    let text_header = reader.take(TEXT_HEADER_SIZE, "TEXT")?;
                    let cb_order = LittleEndian::read_u32(text_header) as usize;
                    let Some(glyph_bytes) = cb_order.checked_sub(TEXT_HEADER_SIZE) else {
                        return Err(ShadowError::MalformedOrder {
                            offset: reader.offset(),
                            op: code,
                            reason: format!("text order size {cb_order} below its header"),
                        });
                    };
                    let glyphs = reader.take(glyph_bytes, "TEXT glyphs")?;
                    if skip {
                        false
                    } else {
                        let mut payload = Vec::with_capacity(cb_order);
                        payload.extend_from_slice(text_header);
                        payload.extend_from_slice(glyphs);
                        self.create_msb(code, Some(&affected), &payload, false, env.diag)
                    }
                }
                _ => {
                    let size = op.fixed_body_size().unwrap_or(0);
                    let body = reader.take(size, "order body")?;
                    !skip && self.create_msb(code, Some(&affected), body, false, env.diag)
                }
            };

            if !processed && state != SeqState::Nothing && !skip {
                trace!("screen {}: sequence element {code} failed, skipping", self.id);
                if let Some(sb) = self.sb.as_mut() {
                    sb.redraw.add_rect(&affected);
                }
                skip = true;
            }
        }
        Ok(())
    }

    /// Blits touching a cover are redrawn instead of replayed
    fn redraw_covered(&mut self, rect: &Rect) -> bool {
        if !self.covers.intersects(rect) {
            return false;
        }
        if let Some(sb) = self.sb.as_mut() {
            sb.redraw.add_rect(rect);
        }
        true
    }

    /// Pixel format of inline bits: the framebuffer format when the width
    /// matches, the natural one for the width otherwise
    fn inline_format(&self, bits_header: &DataBits) -> Result<PixelFormat> {
        match self.sb.as_ref() {
            Some(sb) if sb.source_format.bytes_per_pixel() == usize::from(bits_header.bytes_per_pixel) => {
                Ok(sb.source_format)
            }
            _ => PixelFormat::from_bytes_per_pixel(bits_header.bytes_per_pixel),
        }
    }

    fn save_screen_restore(
        &mut self,
        body: &[u8],
        bits_header: &DataBits,
        bits: &[u8],
        affected: &Rect,
        env: &mut IngestEnv<'_>,
    ) -> Result<()> {
        let code = OrderCode::InternalSaveScreenRestore.code();
        let request = StoreRequest {
            op: code,
            key: body,
            header: *bits_header,
            bits,
            access_key: self.access_key,
            screen_id: self.id,
        };
        match env.cache.store(&request) {
            Ok(handle) => {
                let payload = encode_cache_reference(body, handle.0);
                if !self.create_msb(code, Some(affected), &payload, false, env.diag) {
                    env.cache.free(handle);
                }
                Ok(())
            }
            Err(e) => {
                // Put the saved pixels back directly
                trace!("saved screen not cached, drawing it: {e}");
                let src = self.inline_source(bits_header, bits)?;
                self.update_from_source(&src, &mut NoVideoHandler, None, env.diag);
                Ok(())
            }
        }
    }

    fn dirty_rect(&mut self, bits_header: &DataBits, bits: &[u8], env: &mut IngestEnv<'_>) -> Result<()> {
        let src = self.inline_source(bits_header, bits)?;
        let video_now = env.video.then_some(env.now_ms);
        self.update_from_source(&src, env.handler, video_now, env.diag);
        Ok(())
    }

    fn inline_source<'a>(&self, bits_header: &DataBits, bits: &'a [u8]) -> Result<SourceBits<'a>> {
        let format = self.inline_format(bits_header)?;
        let src = SourceBits {
            bits,
            offset: 0,
            line_size: bits_header.line_size(),
            rect: bits_header.rect(),
            format,
        };
        if let Some(sb) = self.sb.as_ref() {
            sb.transform.trans_bits(&src)?;
        }
        Ok(src)
    }
}
