// Copyright 2024 Cloud Hypervisor Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Shadow buffer context
//!
//! The entry point shared by the VM side (producer) and the output side
//! (consumer). All state sits behind a single mutex; every call is one short
//! critical section, except [`ShadowBufferContext::lock`], whose guard keeps
//! the mutex until dropped.

use std::borrow::Cow;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use log::{debug, info};

use crate::action::{Action, RegionCursor};
use crate::cache::{BitmapCache, MemoryBitmapCache};
use crate::config::ShadowConfig;
use crate::cover::CoverHandle;
use crate::diag::Diagnostics;
use crate::error::{Result, ShadowError};
use crate::framebuffer::FramebufferDesc;
use crate::ingest::IngestEnv;
use crate::msb::{MsbBudget, MsbPool, MsbStats};
use crate::order::{DataBits, OrderCode, encode_rect};
use crate::pixel::PixelFormat;
use crate::pixel_buffer::PixelBuffer;
use crate::rect::Rect;
use crate::screen::Screen;
use crate::transform::{Rotation, SourceBits, Transform, rotate_rect};
use crate::video::{
    DetectorCommand, HistoryVideoDetector, NoVideoHandler, NullVideoDetector, VideoDetector, VideoHandler,
};

/// Default bitmap cache capacity
const DEFAULT_CACHE_SIZE: usize = 8 * 1024 * 1024;

type DetectorFactory = Box<dyn Fn(u32) -> Box<dyn VideoDetector>>;

struct Inner {
    screens: Vec<Screen>,
    /// Round robin output cursor
    output_screen: usize,
    video_handler: Option<Box<dyn VideoHandler>>,
    cache: Box<dyn BitmapCache>,
}

impl Inner {
    fn screen(&self, id: u32) -> Result<&Screen> {
        self.screens.get(id as usize).ok_or(ShadowError::InvalidScreen(id))
    }

    fn screen_mut(&mut self, id: u32) -> Result<&mut Screen> {
        self.screens.get_mut(id as usize).ok_or(ShadowError::InvalidScreen(id))
    }

    fn advance_output(&mut self) {
        self.output_screen = (self.output_screen + 1) % self.screens.len().max(1);
    }
}

fn handler_or<'a>(slot: &'a mut Option<Box<dyn VideoHandler>>, none: &'a mut NoVideoHandler) -> &'a mut dyn VideoHandler {
    match slot {
        Some(handler) => handler.as_mut(),
        None => none,
    }
}

/// Builder for [`ShadowBufferContext`]
pub struct ShadowBufferContextBuilder {
    config: ShadowConfig,
    cache: Option<Box<dyn BitmapCache>>,
    detector_factory: Option<DetectorFactory>,
}

impl ShadowBufferContextBuilder {
    pub fn config(mut self, config: ShadowConfig) -> Self {
        self.config = config;
        self
    }

    pub fn screen_count(mut self, screen_count: u32) -> Self {
        self.config.screen_count = screen_count;
        self
    }

    /// Cache receiving inline bitmaps of orders
    pub fn bitmap_cache(mut self, cache: Box<dyn BitmapCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Build each screen's video detector with `factory`
    pub fn video_detector(mut self, factory: impl Fn(u32) -> Box<dyn VideoDetector> + 'static) -> Self {
        self.detector_factory = Some(Box::new(factory));
        self
    }

    pub fn build(self) -> Result<ShadowBufferContext> {
        let config = self.config;
        config.validate()?;

        let heap_size = usize::try_from(config.heap_size_aligned())
            .map_err(|_| ShadowError::InvalidConfig(format!("heap size {} too large", config.msb_heap_size)))?;

        let screens = (0..config.screen_count)
            .map(|id| {
                let detector: Box<dyn VideoDetector> = match &self.detector_factory {
                    Some(factory) => factory(id),
                    None if config.video_detection => Box::new(HistoryVideoDetector::new(config.detector)),
                    None => Box::new(NullVideoDetector),
                };
                let pool = MsbPool::new(
                    config.msb_block_count as usize,
                    config.msb_block_size as usize,
                    heap_size,
                );
                Screen::new(id, pool, config.msb_block_count, detector)
            })
            .collect();

        info!(
            "shadow buffer context: {} screens, {} MSB blocks of {} bytes, {heap_size} bytes heap",
            config.screen_count, config.msb_block_count, config.msb_block_size
        );

        Ok(ShadowBufferContext {
            inner: Mutex::new(Inner {
                screens,
                output_screen: 0,
                video_handler: None,
                cache: self
                    .cache
                    .unwrap_or_else(|| Box::new(MemoryBitmapCache::new(DEFAULT_CACHE_SIZE))),
            }),
            diag: Diagnostics::default(),
            started: Instant::now(),
            config,
        })
    }
}

/// Shadow buffers of all screens
pub struct ShadowBufferContext {
    inner: Mutex<Inner>,
    diag: Diagnostics,
    started: Instant,
    config: ShadowConfig,
}

impl ShadowBufferContext {
    /// Create a context with inactive screens
    pub fn new(config: ShadowConfig) -> Result<Self> {
        Self::builder().config(config).build()
    }

    pub fn builder() -> ShadowBufferContextBuilder {
        ShadowBufferContextBuilder {
            config: ShadowConfig::default(),
            cache: None,
            detector_factory: None,
        }
    }

    pub fn config(&self) -> &ShadowConfig {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    pub fn screen_count(&self) -> u32 {
        self.config.screen_count
    }

    pub fn verify_screen_id(&self, id: u32) -> bool {
        id < self.config.screen_count
    }

    /// Point screen `id` at a new framebuffer, or disable it with `None`.
    ///
    /// The access key changes in every case, invalidating earlier locks and
    /// regions. When only the framebuffer memory changed the shadow buffer is
    /// kept and refreshed; otherwise it is rebuilt and a resize action queued.
    pub fn resize(&self, id: u32, desc: Option<FramebufferDesc>, rotation: Rotation) -> Result<()> {
        let mut inner = self.state();
        let Inner {
            screens, video_handler, ..
        } = &mut *inner;
        let screen = screens.get_mut(id as usize).ok_or(ShadowError::InvalidScreen(id))?;
        if let Some(desc) = desc.as_ref() {
            screen.origin = (desc.x, desc.y);
        }
        let mut none = NoVideoHandler;
        screen.resize(desc, rotation, handler_or(video_handler, &mut none), &self.diag)
    }

    /// Tear down every screen's shadow buffer
    pub fn destroy_buffers(&self) {
        let mut inner = self.state();
        for screen in inner.screens.iter_mut() {
            screen.change_access_key();
            screen.teardown();
        }
        debug!("shadow buffers destroyed");
    }

    /// Framebuffer area `x, y, w, h` changed. Out of range parts are clamped.
    pub fn bitmap_update(&self, id: u32, x: i32, y: i32, w: u32, h: u32) -> Result<()> {
        let now_ms = self.now_ms();
        let mut inner = self.state();
        let Inner {
            screens, video_handler, ..
        } = &mut *inner;
        let screen = screens.get_mut(id as usize).ok_or(ShadowError::InvalidScreen(id))?;
        if !screen.is_accessible() {
            return Err(ShadowError::ScreenInactive(id));
        }
        let Some(sb) = screen.sb.as_ref() else {
            return Err(ShadowError::ScreenInactive(id));
        };

        let rect = sb.clamp_fb(&Rect::new(x, y, w, h));
        if rect.is_empty() {
            return Ok(());
        }
        let video_now = video_handler.is_some().then_some(now_ms);
        let memory = sb.source.memory.clone();
        let memory = memory.read();
        let src: SourceBits<'_> = sb.source_bits(&memory, &rect);
        let mut none = NoVideoHandler;
        screen.update_from_source(&src, handler_or(video_handler, &mut none), video_now, &self.diag);
        Ok(())
    }

    /// Area `x, y, w, h` changed to `bits`, laid out with `line_size` bytes
    /// per line in the framebuffer format.
    #[allow(clippy::too_many_arguments)]
    pub fn bitmap_update_ex(
        &self,
        id: u32,
        x: i32,
        y: i32,
        w: u32,
        h: u32,
        bits: &[u8],
        line_size: usize,
        video_detection: bool,
    ) -> Result<()> {
        let now_ms = self.now_ms();
        let mut inner = self.state();
        let Inner {
            screens, video_handler, ..
        } = &mut *inner;
        let screen = screens.get_mut(id as usize).ok_or(ShadowError::InvalidScreen(id))?;
        if !screen.is_accessible() {
            return Err(ShadowError::ScreenInactive(id));
        }
        let video_now = (video_detection && video_handler.is_some()).then_some(now_ms);
        let mut none = NoVideoHandler;
        screen.bitmap_update_bits(
            &Rect::new(x, y, w, h),
            bits,
            line_size,
            handler_or(video_handler, &mut none),
            video_now,
            &self.diag,
        )
    }

    /// Ingest an order stream
    pub fn order(&self, id: u32, data: &[u8]) -> Result<()> {
        let now_ms = self.now_ms();
        let mut inner = self.state();
        let Inner {
            screens,
            video_handler,
            cache,
            ..
        } = &mut *inner;
        let screen = screens.get_mut(id as usize).ok_or(ShadowError::InvalidScreen(id))?;
        if !screen.is_accessible() {
            return Err(ShadowError::ScreenInactive(id));
        }
        let video = video_handler.is_some();
        let mut none = NoVideoHandler;
        let mut env = IngestEnv {
            cache: cache.as_mut(),
            handler: handler_or(video_handler, &mut none),
            video,
            now_ms,
            diag: &self.diag,
        };
        screen.process_orders(data, &mut env)
    }

    /// Refresh `screen_rect` (SB coordinates, the whole screen when `None`)
    /// from the framebuffer. With `client_rect` the client first clears that
    /// area.
    pub fn redraw_update(&self, id: u32, screen_rect: Option<Rect>, client_rect: Option<Rect>) -> Result<()> {
        let mut inner = self.state();
        let screen = inner.screen_mut(id)?;
        if !screen.is_accessible() {
            return Err(ShadowError::ScreenInactive(id));
        }
        screen.redraw_update(screen_rect.as_ref(), client_rect.as_ref(), &self.diag);
        Ok(())
    }

    /// End of a batch of updates
    pub fn update_complete(&self) {
        let now_ms = self.now_ms();
        let mut inner = self.state();
        let Inner {
            screens, video_handler, ..
        } = &mut *inner;
        let mut none = NoVideoHandler;
        let handler = handler_or(video_handler, &mut none);
        for screen in screens.iter_mut() {
            screen.update_complete(now_ms, &mut *handler, &self.diag);
        }
    }

    /// Next output action, visiting screens round robin
    pub fn get_action(&self) -> Action {
        let mut inner = self.state();
        for _ in 0..inner.screens.len() {
            let index = inner.output_screen;
            let screen = &mut inner.screens[index];
            if screen.is_accessible() {
                if let Some((kind, context)) = screen.next_action() {
                    return Action::new(screen.id, kind, context);
                }
            }
            inner.advance_output();
        }
        Action::nop()
    }

    /// Finish an action: release its MSB and move to the next screen
    pub fn cancel_action(&self, action: Action) {
        let (screen_id, context) = action.into_context();
        let mut inner = self.state();
        if let Some(handle) = context {
            if let Ok(screen) = inner.screen_mut(screen_id) {
                screen.release(handle);
            }
        }
        inner.advance_output();
    }

    /// Start enumerating the rectangles of a region action. Fails when the
    /// screen was resized since the action was generated.
    pub fn begin_region_enum(&self, action: &Action) -> Option<RegionCursor> {
        let region = action.region()?;
        let inner = self.state();
        let screen = inner.screens.get(inner.output_screen)?;
        if screen.id != action.screen_id || screen.access_key != region.uniq() {
            debug!(
                "region of key {} rejected, screen {} key {}",
                region.uniq(),
                screen.id,
                screen.access_key
            );
            return None;
        }
        Some(RegionCursor {
            screen_id: screen.id,
            uniq: region.uniq(),
            rects: region.rects().collect(),
            pos: 0,
        })
    }

    /// Next rectangle, or `None` at the end or after a resize
    pub fn next_region_rect(&self, cursor: &mut RegionCursor) -> Option<Rect> {
        {
            let inner = self.state();
            let screen = inner.screens.get(inner.output_screen)?;
            if screen.id != cursor.screen_id || screen.access_key != cursor.uniq {
                return None;
            }
        }
        let rect = cursor.rects.get(cursor.pos).copied()?;
        cursor.pos += 1;
        Some(rect)
    }

    /// Lock screen `id` for reading shadow buffer pixels.
    ///
    /// With `key` the lock only succeeds while the screen still has that
    /// access key. `rect` (SB coordinates, whole buffer by default) must lie
    /// within the buffer. No other context call may be made while the guard
    /// is alive.
    pub fn lock(&self, key: Option<u32>, id: u32, rect: Option<Rect>) -> Option<ShadowLock<'_>> {
        let inner = self.state();
        let screen = inner.screens.get(id as usize)?;
        if !screen.active {
            return None;
        }
        if key.is_some_and(|key| key != screen.access_key) {
            return None;
        }
        let sb = screen.sb.as_ref()?;
        let rect = rect.unwrap_or(sb.rect());
        if !sb.rect().contains_rect(&rect) {
            return None;
        }
        let access_key = screen.access_key;
        Some(ShadowLock {
            guard: inner,
            screen: id as usize,
            rect,
            access_key,
        })
    }

    pub fn set_accessible(&self, id: u32, accessible: bool) -> Result<()> {
        let mut inner = self.state();
        inner.screen_mut(id)?.accessible = accessible;
        Ok(())
    }

    /// Screen relative pointer position to desktop coordinates
    pub fn map_mouse(&self, id: u32, x: i32, y: i32) -> Option<(i32, i32)> {
        let inner = self.state();
        let (ox, oy) = inner.screen(id).ok()?.origin;
        Some((x.saturating_add(ox), y.saturating_add(oy)))
    }

    /// Shadow buffer rectangle of screen `id`
    pub fn query_rect(&self, id: u32) -> Option<Rect> {
        let inner = self.state();
        inner.screen(id).ok()?.sb.as_ref().map(|sb| sb.rect())
    }

    fn with_transform<R>(&self, id: u32, f: impl FnOnce(&Transform) -> R) -> Option<R> {
        let inner = self.state();
        let sb = inner.screen(id).ok()?.sb.as_ref()?;
        Some(f(&sb.transform))
    }

    /// FB rectangle to SB coordinates
    pub fn transform_rect(&self, id: u32, rect: &Rect) -> Option<Rect> {
        self.with_transform(id, |t| t.rect_to_sb(rect))
    }

    /// Rotate `rect` within an FB sized `w x h` area using the screen's
    /// rotation
    pub fn transform_rect_generic(&self, id: u32, rect: &Rect, w: u32, h: u32) -> Option<Rect> {
        self.with_transform(id, |t| {
            let (tw, th) = t.width_height(w, h);
            rotate_rect(t.rotation(), rect, tw, th)
        })
    }

    pub fn transform_width_height(&self, id: u32, w: u32, h: u32) -> Option<(u32, u32)> {
        self.with_transform(id, |t| t.width_height(w, h))
    }

    /// FB point to SB coordinates
    pub fn transform_point(&self, id: u32, x: i32, y: i32) -> Option<(i32, i32)> {
        self.with_transform(id, |t| t.point_to_sb(x, y))
    }

    /// SB point to FB coordinates
    pub fn transform_point_to_fb(&self, id: u32, x: i32, y: i32) -> Option<(i32, i32)> {
        self.with_transform(id, |t| t.point_to_fb(x, y))
    }

    /// Rotate an inline bitmap into SB orientation. Unrotated screens get
    /// the input back unchanged.
    pub fn transform_data_bits<'a>(&self, id: u32, header: &DataBits, bits: &'a [u8]) -> Result<(DataBits, Cow<'a, [u8]>)> {
        let inner = self.state();
        let sb = inner.screen(id)?.sb.as_ref().ok_or(ShadowError::ScreenInactive(id))?;
        if sb.transform.rotation() == Rotation::Deg0 {
            return Ok((*header, Cow::Borrowed(bits)));
        }

        let format = PixelFormat::from_bytes_per_pixel(header.bytes_per_pixel)?;
        let src = SourceBits {
            bits,
            offset: 0,
            line_size: header.line_size(),
            rect: header.rect(),
            format,
        };
        let trans = sb.transform.trans_bits(&src)?;
        let out = DataBits {
            cb: header.cb,
            x: trans.rect.x as i16,
            y: trans.rect.y as i16,
            width: trans.rect.w as u16,
            height: trans.rect.h as u16,
            bytes_per_pixel: header.bytes_per_pixel,
        };
        Ok((out, Cow::Owned(trans.to_packed(format))))
    }

    /// Exclude `rect` (SB coordinates) from bitmap updates
    pub fn cover_add(&self, id: u32, rect: Rect) -> Option<CoverHandle> {
        let mut inner = self.state();
        let screen = inner.screen_mut(id).ok()?;
        if screen.access_key == 0 {
            return None;
        }
        let key = screen.access_key;
        let handle = screen.covers.add(key, rect);
        debug!("screen {id}: cover {rect} -> {handle:?}");
        handle
    }

    /// Drop a cover and schedule a redraw of its area. Handles from before
    /// the last resize are ignored.
    pub fn cover_remove(&self, id: u32, handle: CoverHandle) -> bool {
        let mut inner = self.state();
        let Ok(screen) = inner.screen_mut(id) else {
            return false;
        };
        if handle.access_key() != screen.access_key {
            return false;
        }
        let Some(rect) = screen.covers.remove(handle) else {
            return false;
        };
        screen.create_msb(OrderCode::InternalRedraw.code(), Some(&rect), &encode_rect(&rect), true, &self.diag);
        true
    }

    pub fn cover_reset_all(&self) {
        let mut inner = self.state();
        for screen in inner.screens.iter_mut() {
            screen.covers.clear();
        }
    }

    pub fn register_video_handler(&self, handler: Box<dyn VideoHandler>) {
        self.state().video_handler = Some(handler);
    }

    pub fn unregister_video_handler(&self) -> Option<Box<dyn VideoHandler>> {
        self.state().video_handler.take()
    }

    /// Run `f` on the registered video handler
    pub fn video_handler<R>(&self, f: impl FnOnce(&mut dyn VideoHandler) -> R) -> Option<R> {
        let mut inner = self.state();
        let handler = inner.video_handler.as_mut()?;
        Some(f(handler.as_mut()))
    }

    /// Queue a command on every screen's detector
    pub fn video_detector_command(&self, command: DetectorCommand) {
        let mut inner = self.state();
        for screen in inner.screens.iter_mut() {
            screen.detector.store_command(command);
        }
    }

    /// Run `f` on the bitmap cache
    pub fn with_bitmap_cache<R>(&self, f: impl FnOnce(&mut dyn BitmapCache) -> R) -> R {
        let mut inner = self.state();
        f(inner.cache.as_mut())
    }

    pub fn msb_stats(&self, id: u32) -> Option<MsbStats> {
        let inner = self.state();
        inner.screen(id).ok().map(|screen| screen.pool.stats().clone())
    }

    /// MSB budget state, `None` while the screen has no shadow buffer
    pub fn degradation(&self, id: u32) -> Option<MsbBudget> {
        let inner = self.state();
        inner.screen(id).ok()?.sb.as_ref().map(|sb| sb.budget())
    }

    /// Current access key of screen `id`
    pub fn access_key(&self, id: u32) -> Option<u32> {
        let inner = self.state();
        inner.screen(id).ok().map(|screen| screen.access_key)
    }
}

/// Read access to a screen's shadow buffer; the context stays locked until
/// the guard is dropped.
pub struct ShadowLock<'a> {
    guard: MutexGuard<'a, Inner>,
    screen: usize,
    rect: Rect,
    access_key: u32,
}

impl ShadowLock<'_> {
    fn main(&self) -> Option<&PixelBuffer> {
        self.guard.screens.get(self.screen)?.sb.as_ref().map(|sb| sb.main())
    }

    pub fn access_key(&self) -> u32 {
        self.access_key
    }

    /// Locked area
    pub fn rect(&self) -> Rect {
        self.rect
    }

    pub fn format(&self) -> Option<PixelFormat> {
        self.main().map(|pb| pb.format())
    }

    pub fn line_size(&self) -> usize {
        self.main().map_or(0, |pb| pb.line_size())
    }

    /// Buffer bytes starting at the top left pixel of the locked area
    pub fn bits(&self) -> &[u8] {
        let Some(pb) = self.main() else {
            return &[];
        };
        match (pb.pixels(), pb.offset_of(self.rect.x, self.rect.y)) {
            (Some(pixels), Some(offset)) => &pixels[offset..],
            _ => &[],
        }
    }

    /// Raw pixel at SB `x, y`
    pub fn pixel(&self, x: i32, y: i32) -> Option<u32> {
        self.main()?.get_pixel(x, y)
    }
}
