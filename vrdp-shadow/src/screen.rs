// Copyright 2024 Cloud Hypervisor Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Screen state
//!
//! A screen owns its shadow buffer, the MSB arena the buffer's orders live
//! in, the covers and the video detector. The arena outlives shadow buffer
//! rebuilds so that orders in flight at resize time stay readable until the
//! output side releases them.

use log::{debug, info, trace, warn};

use crate::action::ActionKind;
use crate::cover::Covers;
use crate::diag::Diagnostics;
use crate::error::{Result, ShadowError};
use crate::framebuffer::FramebufferDesc;
use crate::msb::{MsbBudget, MsbFlags, MsbHandle, MsbList, MsbPool};
use crate::order::{OrderCode, encode_rect};
use crate::pixel_buffer::PixelBuffer;
use crate::rect::Rect;
use crate::shadow_buffer::{ShadowBuffer, normal_trans_bits, update_pixel_buffer};
use crate::transform::{Rotation, SourceBits, TransBits};
use crate::video::{NoVideoHandler, StopRecorder, VideoDetector, VideoFrame, VideoHandler, VideoVerdict};

pub(crate) struct Screen {
    pub(crate) id: u32,
    /// Bumped on every resize, never 0 once the screen was resized
    pub(crate) access_key: u32,
    pub(crate) active: bool,
    pub(crate) accessible: bool,
    /// Position on the virtual desktop
    pub(crate) origin: (i32, i32),
    pub(crate) pool: MsbPool,
    pub(crate) sb: Option<ShadowBuffer>,
    pub(crate) detector: Box<dyn VideoDetector>,
    pub(crate) covers: Covers,
    msb_max: u32,
}

/// Unlink an MSB and free it, or mark it for release by the output side
pub(crate) fn delete_msb(pool: &mut MsbPool, list: &mut MsbList, budget: &mut MsbBudget, index: usize) {
    let Some(msb) = pool.at_mut(index) else {
        return;
    };
    msb.deleted = msb.deleted.saturating_add(1);
    if msb.is_in_list() {
        list.unlink(pool, index);
        budget.count = budget.count.saturating_sub(1);
    }

    let Some(msb) = pool.at_mut(index) else {
        return;
    };
    if msb.is_output() {
        trace!("MSB {index} in flight, free postponed");
        msb.flags.insert(MsbFlags::POSTPONED);
    } else if let Some(handle) = pool.handle_at(index) {
        pool.free(handle);
    }
}

impl Screen {
    pub(crate) fn new(
        id: u32,
        pool: MsbPool,
        msb_max: u32,
        detector: Box<dyn VideoDetector>,
    ) -> Self {
        Self {
            id,
            access_key: 0,
            active: false,
            accessible: true,
            origin: (0, 0),
            pool,
            sb: None,
            detector,
            covers: Covers::default(),
            msb_max,
        }
    }

    /// Active, accessible and backed by a shadow buffer
    pub(crate) fn is_accessible(&self) -> bool {
        self.active && self.accessible && self.sb.is_some()
    }

    pub(crate) fn change_access_key(&mut self) {
        self.access_key = self.access_key.wrapping_add(1);
        if self.access_key == 0 {
            self.access_key = 1;
        }
    }

    /// Drop the shadow buffer. MSBs in flight stay in the arena until
    /// released.
    pub(crate) fn teardown(&mut self) {
        let Some(mut sb) = self.sb.take() else {
            return;
        };
        while let Some(index) = sb.list.top() {
            delete_msb(&mut self.pool, &mut sb.list, &mut sb.budget, index);
        }
        self.active = false;
    }

    pub(crate) fn resize(
        &mut self,
        desc: Option<FramebufferDesc>,
        rotation: Rotation,
        handler: &mut dyn VideoHandler,
        diag: &Diagnostics,
    ) -> Result<()> {
        self.change_access_key();
        self.covers.clear();
        self.detector.reset(true, handler);

        if let Some(desc) = desc.as_ref() {
            if let Err(e) = desc.validate() {
                self.teardown();
                return Err(e);
            }
        }

        let key = self.access_key;
        if let (Some(sb), Some(desc)) = (self.sb.as_mut(), desc.as_ref()) {
            if sb.same_geometry(desc, rotation) {
                debug!("screen {}: framebuffer swapped, key {key}", self.id);
                sb.source = desc.clone();
                sb.retag(key);
                let rect = sb.rect();
                sb.main.dirty_mut().add_rect(&rect);
                let fb_rect = sb.transform.rect_to_fb(&rect);
                self.copy_from_framebuffer(&fb_rect, diag);
                return Ok(());
            }
        }

        self.teardown();
        let Some(desc) = desc else {
            info!("screen {} disabled", self.id);
            return Ok(());
        };

        let (w, h) = (desc.width, desc.height);
        let sb = ShadowBuffer::new(desc, rotation, self.msb_max, key).inspect_err(|e| {
            warn!("screen {}: shadow buffer {w}x{h} not created: {e}", self.id);
        })?;
        info!(
            "screen {}: {w}x{h} rotation {}, key {key}",
            self.id,
            rotation.degrees()
        );
        self.sb = Some(sb);
        self.active = true;
        Ok(())
    }

    /// Insert a new MSB at the top. On failure MSBs are disabled and the
    /// affected area scheduled for redraw.
    pub(crate) fn create_msb(
        &mut self,
        op: i32,
        affected: Option<&Rect>,
        payload: &[u8],
        control: bool,
        diag: &Diagnostics,
    ) -> bool {
        let Some(sb) = self.sb.as_mut() else {
            return false;
        };
        let rect = affected.copied().unwrap_or(Rect::EMPTY);
        if affected.is_some() && !sb.rect().contains_rect(&rect) {
            if diag.rect.hit() {
                warn!("screen {}: order {op} rect {rect} outside {}", self.id, sb.rect());
            }
            sb.budget.disabled = true;
            return false;
        }

        sb.adjust_rects = false;

        let handle = if sb.budget.admit(control) {
            let pb = PixelBuffer::new(rect, sb.main.format(), self.access_key);
            self.pool.alloc(op, payload, control, rect, pb)
        } else {
            None
        };

        let Some(handle) = handle else {
            if !sb.budget.disabled {
                debug!("screen {}: MSB allocation failed, disabling", self.id);
            }
            sb.budget.disabled = true;
            if !rect.is_empty() {
                sb.redraw.add_rect(&rect);
            }
            return false;
        };

        sb.list.insert_top(&mut self.pool, handle.index());
        if let Some(msb) = self.pool.get_mut(handle) {
            msb.flags.insert(MsbFlags::HAS_ORDER);
        }
        sb.budget.count += 1;
        trace!("screen {}: MSB {} op {op} at {rect}", self.id, handle.index());
        true
    }

    /// Copy `bits` into every MSB it touches, newest first, and the rest into
    /// the main buffer.
    pub(crate) fn copy_bits_to_pixel_buffers(&mut self, bits: &TransBits<'_>, diag: &Diagnostics) {
        let Some(sb) = self.sb.as_mut() else {
            return;
        };
        if !sb.rect().contains_rect(&bits.rect) {
            if diag.rect.hit() {
                warn!("screen {}: update {} outside {}", self.id, bits.rect, sb.rect());
            }
            return;
        }
        if sb.budget.disabled {
            sb.redraw.add_rect(&bits.rect);
            return;
        }

        for cover in self.covers.rects() {
            sb.over.add_rect(&cover);
        }

        let mut cursor = sb.list.top();
        while let Some(index) = cursor {
            let Some(msb) = self.pool.at(index) else {
                break;
            };
            cursor = msb.lower;
            let affected = msb.affected;
            let Some(sect) = affected.intersect(&bits.rect) else {
                continue;
            };

            if !self.pool.alloc_pixels(index) {
                // Evicted area is refreshed from the redraw region after recovery
                debug!("screen {}: no pixels for MSB {index}, redrawing {affected}", self.id);
                sb.redraw.add_rect(&affected);
                sb.budget.disabled = true;
                sb.over.add_rect(&affected);
                continue;
            }
            if let Some(msb) = self.pool.at_mut(index) {
                update_pixel_buffer(
                    &sb.transform,
                    &mut msb.pixel_buffer,
                    &sb.over,
                    bits,
                    &sect,
                    sb.adjust_rects,
                );
            }
            sb.over.add_rect(&affected);
        }

        update_pixel_buffer(&sb.transform, &mut sb.main, &sb.over, bits, &bits.rect, sb.adjust_rects);
        sb.over.clear();
    }

    /// Copy a clamped FB area from the registered framebuffer
    pub(crate) fn copy_from_framebuffer(&mut self, fb_rect: &Rect, diag: &Diagnostics) {
        let Some(sb) = self.sb.as_ref() else {
            return;
        };
        let rect = sb.clamp_fb(fb_rect);
        if rect.is_empty() {
            return;
        }
        let memory = sb.source.memory.clone();
        let memory = memory.read();
        let src = sb.source_bits(&memory, &rect);
        self.update_from_source(&src, &mut NoVideoHandler, None, diag);
    }

    /// Run a bitmap update: video detection when `video_now` carries a
    /// timestamp, then the copy
    pub(crate) fn update_from_source(
        &mut self,
        src: &SourceBits<'_>,
        handler: &mut dyn VideoHandler,
        video_now: Option<u64>,
        diag: &Diagnostics,
    ) {
        let Some(sb) = self.sb.as_ref() else {
            return;
        };
        let bits = match sb.transform.trans_bits(src) {
            Ok(bits) => bits,
            Err(e) => {
                if diag.rect.hit() {
                    warn!("screen {}: update {} dropped: {e}", self.id, src.rect);
                }
                return;
            }
        };

        if let Some(now_ms) = video_now {
            self.offer_video_frame(&src.rect, &bits, handler, now_ms);
        }
        self.copy_bits_to_pixel_buffers(&bits, diag);
    }

    /// Let the detector look at a bitmap update and forward stream frames
    pub(crate) fn offer_video_frame(
        &mut self,
        fb_rect: &Rect,
        bits: &TransBits<'_>,
        handler: &mut dyn VideoHandler,
        now_ms: u64,
    ) {
        if let VideoVerdict::Frame(stream_id) = self.detector.bitmap_update(fb_rect, now_ms, handler) {
            if !handler.source_frame(stream_id, now_ms, &VideoFrame::new(bits)) {
                trace!("screen {}: frame of stream {stream_id} not consumed", self.id);
            }
        }
    }

    /// Bitmap update from caller supplied bits laid out as `line_size` bytes
    /// per line for the FB rectangle `rect`.
    pub(crate) fn bitmap_update_bits(
        &mut self,
        rect: &Rect,
        bits: &[u8],
        line_size: usize,
        handler: &mut dyn VideoHandler,
        video_now: Option<u64>,
        diag: &Diagnostics,
    ) -> Result<()> {
        let Some(sb) = self.sb.as_ref() else {
            return Err(ShadowError::ScreenInactive(self.id));
        };
        let clamped = sb.clamp_fb(rect);
        if clamped.is_empty() {
            return Ok(());
        }
        let bpp = sb.source_format.bytes_per_pixel();
        let offset = ((clamped.top() - rect.top()) as usize)
            .checked_mul(line_size)
            .and_then(|skip| skip.checked_add((clamped.left() - rect.left()) as usize * bpp))
            .ok_or(ShadowError::BitsTooShort {
                needed: usize::MAX,
                available: bits.len(),
            })?;
        let src = SourceBits {
            bits,
            offset,
            line_size,
            rect: clamped,
            format: sb.source_format,
        };
        // Validate before touching any state
        sb.transform.trans_bits(&src)?;
        self.update_from_source(&src, handler, video_now, diag);
        Ok(())
    }

    /// Refresh `screen_rect` (SB coordinates, whole buffer by default) from
    /// the framebuffer, optionally preceded by a clear of `client_rect`.
    pub(crate) fn redraw_update(&mut self, screen_rect: Option<&Rect>, client_rect: Option<&Rect>, diag: &Diagnostics) {
        if let Some(client) = client_rect {
            self.create_msb(OrderCode::InternalCls.code(), None, &encode_rect(client), true, diag);
        }

        let Some(sb) = self.sb.as_mut() else {
            return;
        };
        let (w, h) = sb.transform.sb_size();
        let rect = screen_rect.copied().unwrap_or(sb.rect()).clamp_to(w, h);
        if rect.is_empty() {
            return;
        }
        let fb_rect = sb.transform.rect_to_fb(&rect);

        let adjust_rects = sb.adjust_rects;
        sb.adjust_rects = false;
        self.copy_from_framebuffer(&fb_rect, diag);
        if let Some(sb) = self.sb.as_mut() {
            sb.adjust_rects = adjust_rects;
        }
    }

    /// Tell the detector that an order drew over `fb_rect`
    pub(crate) fn detector_order_update(&mut self, fb_rect: &Rect, handler: &mut dyn VideoHandler, diag: &Diagnostics) {
        let mut recorder = StopRecorder::new(handler);
        self.detector.order_update(fb_rect, &mut recorder);
        let stopped = recorder.into_stopped();
        self.refresh_stopped_streams(&stopped, diag);
    }

    /// Areas of stopped streams were not copied while streaming, bring them
    /// up to date from the framebuffer
    fn refresh_stopped_streams(&mut self, stopped: &[Rect], diag: &Diagnostics) {
        for fb_rect in stopped {
            debug!("screen {}: refreshing stopped stream area {fb_rect}", self.id);
            self.copy_from_framebuffer(fb_rect, diag);
        }
    }

    /// End of an update cycle: detector upkeep, budget growth and recovery
    /// from degraded mode once every MSB has been delivered.
    pub(crate) fn update_complete(&mut self, now_ms: u64, handler: &mut dyn VideoHandler, diag: &Diagnostics) {
        if !self.is_accessible() {
            return;
        }
        let mut recorder = StopRecorder::new(handler);
        self.detector.update_complete(now_ms, &mut recorder);
        let stopped = recorder.into_stopped();
        self.refresh_stopped_streams(&stopped, diag);

        let Some(sb) = self.sb.as_mut() else {
            return;
        };
        sb.budget.grow();
        if sb.budget.count == 0 {
            sb.flush_redraw();
            if sb.budget.disabled {
                info!("screen {}: MSBs enabled again, limit {}", self.id, sb.budget.limit);
                sb.budget.disabled = false;
            }
        }
    }

    /// Next output action of this screen
    pub(crate) fn next_action(&mut self) -> Option<(ActionKind, Option<MsbHandle>)> {
        let sb = self.sb.as_mut()?;

        if sb.resized {
            sb.resized = false;
            return Some((ActionKind::Resize, None));
        }

        if sb.reset_bounds {
            sb.reset_bounds = false;
            debug!("screen {}: resetting bounds", self.id);
            let kind = ActionKind::Order {
                op: OrderCode::InternalCancel.code(),
                payload: Vec::new(),
                affected: Rect::EMPTY,
            };
            return Some((kind, None));
        }

        while let Some(index) = sb.list.bottom() {
            let handle = self.pool.handle_at(index)?;
            let msb = self.pool.at_mut(index)?;

            if !msb.flags.contains(MsbFlags::UNDERLYING_REPORTED) {
                let rect = msb.pixel_buffer.rect();
                let underlying = sb.main.dirty().cut(&rect);
                if !underlying.is_empty() {
                    sb.main.dirty_mut().subtract_rect(&rect);
                    msb.underlying = Some(underlying);
                }
                msb.flags.insert(MsbFlags::UNDERLYING_REPORTED);
            }

            if let Some(mut region) = msb.underlying.take() {
                region.merge_adjacent_rows();
                msb.flags.insert(MsbFlags::OUTPUT);
                return Some((ActionKind::Region(region), Some(handle)));
            }

            if msb.flags.contains(MsbFlags::HAS_ORDER) {
                msb.flags.remove(MsbFlags::HAS_ORDER);
                msb.flags.insert(MsbFlags::OUTPUT);
                let (op, affected) = (msb.op, msb.affected);
                if sb.budget.disabled && sb.budget.count == 1 && op == OrderCode::Bounds.code() {
                    sb.reset_bounds = true;
                }
                let payload = self.pool.payload(handle).map_or_else(Vec::new, <[u8]>::to_vec);
                return Some((ActionKind::Order { op, payload, affected }, Some(handle)));
            }

            // Order delivered: what was drawn under it goes to the main buffer
            let dirty = msb.pixel_buffer.dirty().clone();
            if !dirty.is_empty() {
                if let Some(bits) = normal_trans_bits(&msb.pixel_buffer) {
                    for rect in dirty.rects() {
                        if let Err(e) = sb.transform.copy_rect(&mut sb.main, &bits, &rect) {
                            debug!("screen {}: merge of {rect} failed: {e}", self.id);
                        }
                    }
                }
                sb.main.dirty_mut().add(&dirty);
            }
            msb.flags.remove(MsbFlags::OUTPUT);
            delete_msb(&mut self.pool, &mut sb.list, &mut sb.budget, index);
        }

        if sb.main.dirty().is_empty() {
            return None;
        }
        let mut region = sb.main.dirty_mut().take();
        region.merge_adjacent_rows();
        Some((ActionKind::Region(region), None))
    }

    /// Release the MSB behind a finished action
    pub(crate) fn release(&mut self, handle: MsbHandle) {
        let Some(msb) = self.pool.get_mut(handle) else {
            return;
        };
        msb.flags.remove(MsbFlags::OUTPUT);
        if msb.is_in_list() {
            return;
        }
        trace!("screen {}: postponed MSB {} released", self.id, handle.index());
        self.pool.free(handle);
    }
}
