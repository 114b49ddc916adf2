// Copyright 2024 Cloud Hypervisor Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Integration tests for the vrdp-shadow crate
//!
//! This file contains end-to-end tests for:
//! - Producer updates and consumer actions through the context
//! - MSB budget degradation and recovery
//! - Access key checks after resize
//! - Covers and video handler plumbing

use std::sync::{Arc, Mutex};

use proptest::prelude::*;

use vrdp_shadow::transform::Transform;
use vrdp_shadow::video::VideoVerdict;
use vrdp_shadow::{
    ActionKind, DetectorCommand, FramebufferDesc, OrderCode, OrderWriter, Rect, Rotation, ShadowBufferContext,
    ShadowConfig, SharedFramebuffer, VideoDetector, VideoFrame, VideoHandler,
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Delivered {
    Resize,
    Region(Vec<Rect>),
    Order(i32, Rect),
}

fn context(screens: u32, blocks: u32) -> ShadowBufferContext {
    ShadowBufferContext::new(ShadowConfig {
        screen_count: screens,
        msb_block_count: blocks,
        video_detection: false,
        ..Default::default()
    })
    .unwrap()
}

/// Attach a 32 bpp framebuffer filled with `fill` and consume the resize
fn attach(ctx: &ShadowBufferContext, id: u32, w: u32, h: u32, fill: u8) -> SharedFramebuffer {
    let memory = SharedFramebuffer::from_vec(vec![fill; (w * h * 4) as usize]);
    ctx.resize(id, Some(FramebufferDesc::packed(w, h, 32, memory.clone())), Rotation::Deg0)
        .unwrap();
    memory
}

fn next(ctx: &ShadowBufferContext) -> Option<(u32, Delivered)> {
    let action = ctx.get_action();
    let delivered = match &action.kind {
        ActionKind::Nop => return None,
        ActionKind::Resize => Delivered::Resize,
        ActionKind::Order { op, affected, .. } => Delivered::Order(*op, *affected),
        ActionKind::Region(_) => {
            let mut cursor = ctx.begin_region_enum(&action).unwrap();
            let mut rects = Vec::new();
            while let Some(rect) = ctx.next_region_rect(&mut cursor) {
                rects.push(rect);
            }
            Delivered::Region(rects)
        }
    };
    let screen_id = action.screen_id;
    ctx.cancel_action(action);
    Some((screen_id, delivered))
}

fn drain(ctx: &ShadowBufferContext) -> Vec<Delivered> {
    std::iter::from_fn(|| next(ctx).map(|(_, delivered)| delivered)).collect()
}

fn pixel(ctx: &ShadowBufferContext, id: u32, x: i32, y: i32) -> u32 {
    ctx.lock(None, id, None).unwrap().pixel(x, y).unwrap()
}

fn region_area(rects: &[Rect]) -> u64 {
    rects.iter().map(Rect::area).sum()
}

// ============================================================================
// Marker Test
// ============================================================================

#[test]
fn vrdp_shadow_integration_tests_available() {
    // Marker test to ensure integration test module is available
}

// ============================================================================
// Transform Tests
// ============================================================================

proptest! {
    #[test]
    fn test_transform_inverse_law(
        fb_w in 1u32..300,
        fb_h in 1u32..300,
        quarter in 0u32..4,
        a in any::<u32>(),
        b in any::<u32>(),
        c in any::<u32>(),
        d in any::<u32>(),
    ) {
        let x = a % fb_w;
        let y = b % fb_h;
        let w = c % (fb_w - x) + 1;
        let h = d % (fb_h - y) + 1;
        let transform = Transform::new(Rotation::try_from(quarter).unwrap(), fb_w, fb_h);

        let rect = Rect::new(x as i32, y as i32, w, h);
        let sb = transform.rect_to_sb(&rect);
        let (sb_w, sb_h) = transform.sb_size();
        prop_assert!(Rect::with_size(sb_w, sb_h).contains_rect(&sb));
        prop_assert_eq!(transform.rect_to_fb(&sb), rect);

        let (px, py) = transform.point_to_sb(x as i32, y as i32);
        prop_assert!(Rect::with_size(sb_w, sb_h).contains_point(px, py));
        prop_assert_eq!(transform.point_to_fb(px, py), (x as i32, y as i32));
    }
}

#[test]
fn test_rotated_screen_helpers() {
    let ctx = context(1, 16);
    let memory = SharedFramebuffer::new(100 * 50 * 4);
    ctx.resize(0, Some(FramebufferDesc::packed(100, 50, 32, memory)), Rotation::Deg90)
        .unwrap();

    assert_eq!(ctx.query_rect(0), Some(Rect::with_size(50, 100)));
    assert_eq!(ctx.transform_width_height(0, 100, 50), Some((50, 100)));
    assert_eq!(
        ctx.transform_rect(0, &Rect::new(10, 5, 20, 10)),
        Some(Rect::new(5, 70, 10, 20))
    );
    assert_eq!(ctx.transform_point(0, 0, 0), Some((0, 99)));
    assert_eq!(ctx.transform_point_to_fb(0, 0, 99), Some((0, 0)));
    assert_eq!(
        ctx.transform_rect_generic(0, &Rect::new(0, 0, 2, 1), 4, 2),
        Some(Rect::new(0, 2, 1, 2))
    );
    assert_eq!(ctx.transform_rect(1, &Rect::new(0, 0, 1, 1)), None);
}

// ============================================================================
// Bitmap Update Tests
// ============================================================================

#[test]
fn test_bitmap_update_clamped_to_framebuffer() {
    let ctx = context(1, 16);
    attach(&ctx, 0, 100, 40, 0x22);
    assert_eq!(drain(&ctx), vec![Delivered::Resize]);

    ctx.bitmap_update(0, -5, 10, 20, 20).unwrap();
    assert_eq!(drain(&ctx), vec![Delivered::Region(vec![Rect::new(0, 10, 15, 20)])]);
    assert_eq!(pixel(&ctx, 0, 14, 29), 0x2222_2222);
    assert_eq!(pixel(&ctx, 0, 15, 29), 0);
}

#[test]
fn test_bitmap_update_ex_with_caller_bits() {
    let ctx = context(1, 16);
    attach(&ctx, 0, 16, 16, 0);
    drain(&ctx);

    // 2x2 source with an 12 byte stride
    let mut bits = vec![0u8; 24];
    bits[..8].fill(0x5a);
    bits[12..20].fill(0x5a);
    ctx.bitmap_update_ex(0, 3, 4, 2, 2, &bits, 12, false).unwrap();
    assert_eq!(drain(&ctx), vec![Delivered::Region(vec![Rect::new(3, 4, 2, 2)])]);
    assert_eq!(pixel(&ctx, 0, 4, 5), 0x5a5a_5a5a);

    // Too few bytes for the rectangle
    assert!(matches!(
        ctx.bitmap_update_ex(0, 0, 0, 4, 4, &bits, 16, false),
        Err(vrdp_shadow::ShadowError::BitsTooShort { .. })
    ));
}

#[test]
fn test_bitmap_update_ex_huge_stride_rejected() {
    let ctx = context(1, 16);
    attach(&ctx, 0, 16, 16, 0);
    drain(&ctx);

    // Skipping the 1000 clipped lines overflows the source offset
    assert!(matches!(
        ctx.bitmap_update_ex(0, 0, -1000, 4, 1010, &[0u8; 64], usize::MAX / 100, false),
        Err(vrdp_shadow::ShadowError::BitsTooShort { .. })
    ));
    assert!(drain(&ctx).is_empty());
}

#[test]
fn test_occlusion_ordering() {
    let ctx = context(1, 16);
    let memory = attach(&ctx, 0, 16, 16, 0);
    drain(&ctx);

    let a = Rect::new(0, 0, 8, 8);
    let b = Rect::new(4, 4, 8, 8);
    ctx.order(0, &OrderWriter::new(a).solid_rect(&a, 0xff).finish()).unwrap();
    ctx.order(0, &OrderWriter::new(b).solid_rect(&b, 0xff00).finish()).unwrap();

    memory.write().fill(0x11);
    ctx.bitmap_update(0, 0, 0, 16, 16).unwrap();

    // Pixels under pending orders are held back
    assert_eq!(pixel(&ctx, 0, 12, 12), 0x1111_1111);
    assert_eq!(pixel(&ctx, 0, 1, 1), 0);
    assert_eq!(pixel(&ctx, 0, 5, 5), 0);

    let (_, first) = next(&ctx).unwrap();
    assert_eq!(first, Delivered::Order(OrderCode::SolidRect.code(), a));
    assert_eq!(pixel(&ctx, 0, 1, 1), 0);

    let (_, second) = next(&ctx).unwrap();
    assert_eq!(second, Delivered::Order(OrderCode::SolidRect.code(), b));
    assert_eq!(pixel(&ctx, 0, 1, 1), 0x1111_1111);
    assert_eq!(pixel(&ctx, 0, 5, 5), 0);

    let Some((_, Delivered::Region(rects))) = next(&ctx) else {
        panic!("expected the main dirty region");
    };
    assert_eq!(region_area(&rects), 256);
    assert_eq!(pixel(&ctx, 0, 5, 5), 0x1111_1111);
    assert!(next(&ctx).is_none());
}

// ============================================================================
// Order Delivery Tests
// ============================================================================

#[test]
fn test_order_delivered_once_after_underlying_region() {
    let ctx = context(1, 16);
    let memory = attach(&ctx, 0, 16, 16, 0);
    drain(&ctx);

    memory.write().fill(0x33);
    ctx.bitmap_update(0, 0, 0, 16, 16).unwrap();
    let h = Rect::new(0, 0, 4, 4);
    ctx.order(0, &OrderWriter::new(h).solid_rect(&h, 0).finish()).unwrap();
    assert_eq!(ctx.msb_stats(0).unwrap().live, 1);

    assert_eq!(next(&ctx).unwrap().1, Delivered::Region(vec![h]));
    assert_eq!(ctx.msb_stats(0).unwrap().live, 1);
    assert_eq!(next(&ctx).unwrap().1, Delivered::Order(OrderCode::SolidRect.code(), h));
    assert_eq!(ctx.msb_stats(0).unwrap().live, 1);

    let Some((_, Delivered::Region(rest))) = next(&ctx) else {
        panic!("expected the rest of the dirty area");
    };
    assert_eq!(region_area(&rest), 256 - 16);
    assert!(rest.iter().all(|r| r.intersect(&h).is_none()));
    assert_eq!(ctx.msb_stats(0).unwrap().live, 0);
    assert!(next(&ctx).is_none());
}

#[test]
fn test_sequence_failure_skips_remaining_elements() {
    let ctx = context(1, 2);
    attach(&ctx, 0, 16, 16, 0x44);
    drain(&ctx);

    let h = Rect::new(0, 0, 8, 8);
    let stream = OrderWriter::new(h)
        .solid_rect(&h, 1)
        .bounds(0, 0, 8, 8)
        .solid_rect(&h, 2)
        .repeat(&h)
        .repeat(&h)
        .solid_rect(&h, 3)
        .finish();
    ctx.order(0, &stream).unwrap();

    let budget = ctx.degradation(0).unwrap();
    assert!(budget.disabled);
    assert_eq!(budget.count, 2);

    assert_eq!(
        drain(&ctx),
        vec![
            Delivered::Order(OrderCode::SolidRect.code(), h),
            Delivered::Order(OrderCode::Bounds.code(), h),
            Delivered::Order(OrderCode::InternalCancel.code(), Rect::EMPTY),
        ]
    );

    // The dropped area comes back once every MSB is gone
    ctx.update_complete();
    assert!(!ctx.degradation(0).unwrap().disabled);
    assert_eq!(drain(&ctx), vec![Delivered::Region(vec![h])]);
    assert_eq!(pixel(&ctx, 0, 7, 7), 0x4444_4444);
}

#[test]
fn test_msb_budget_shrinks_and_recovers() {
    let ctx = context(1, 32);
    attach(&ctx, 0, 16, 16, 0x55);
    drain(&ctx);

    let header = Rect::with_size(16, 16);
    let mut writer = OrderWriter::new(header);
    for i in 0..33 {
        writer = writer.solid_rect(&Rect::new(i % 8 * 2, i / 8 * 2, 2, 2), i as u32);
    }
    ctx.order(0, &writer.finish()).unwrap();

    let budget = ctx.degradation(0).unwrap();
    assert!(budget.disabled);
    assert_eq!((budget.count, budget.limit, budget.max), (32, 24, 32));

    let delivered = drain(&ctx);
    assert_eq!(delivered.len(), 32);
    assert!(
        delivered
            .iter()
            .all(|d| *d == Delivered::Order(OrderCode::SolidRect.code(), header))
    );

    ctx.update_complete();
    let budget = ctx.degradation(0).unwrap();
    assert!(!budget.disabled);
    assert_eq!((budget.count, budget.limit), (0, 24));
    assert_eq!(drain(&ctx), vec![Delivered::Region(vec![header])]);

    ctx.update_complete();
    assert_eq!(ctx.degradation(0).unwrap().limit, 30);
    ctx.update_complete();
    assert_eq!(ctx.degradation(0).unwrap().limit, 32);
}

#[test]
fn test_msb_without_pixels_evicted_to_redraw() {
    let ctx = ShadowBufferContext::new(ShadowConfig {
        screen_count: 1,
        msb_block_count: 32,
        msb_heap_size: 4096,
        video_detection: false,
        ..Default::default()
    })
    .unwrap();
    let memory = attach(&ctx, 0, 64, 64, 0);
    drain(&ctx);

    // 64 snapshot bytes fit the heap, 6400 do not
    let small = Rect::new(0, 0, 4, 4);
    let large = Rect::new(16, 16, 40, 40);
    ctx.order(0, &OrderWriter::new(small).solid_rect(&small, 1).finish())
        .unwrap();
    ctx.order(0, &OrderWriter::new(large).solid_rect(&large, 2).finish())
        .unwrap();

    memory.write().fill(0x21);
    ctx.bitmap_update(0, 0, 0, 64, 64).unwrap();

    assert!(ctx.degradation(0).unwrap().disabled);
    let stats = ctx.msb_stats(0).unwrap();
    assert_eq!(stats.pixel_allocs, 1);
    assert!(stats.failures >= 1);

    // Main buffer got the bits outside both orders
    assert_eq!(pixel(&ctx, 0, 60, 60), 0x2121_2121);
    assert_eq!(pixel(&ctx, 0, 1, 1), 0);
    assert_eq!(pixel(&ctx, 0, 20, 20), 0);

    let delivered = drain(&ctx);
    assert_eq!(delivered.len(), 3);
    assert_eq!(delivered[0], Delivered::Order(OrderCode::SolidRect.code(), small));
    assert_eq!(delivered[1], Delivered::Order(OrderCode::SolidRect.code(), large));
    let Delivered::Region(rects) = &delivered[2] else {
        panic!("expected the main dirty region");
    };
    assert_eq!(region_area(rects), 64 * 64 - large.area());
    assert!(rects.iter().all(|r| r.intersect(&large).is_none()));
    // The small order's snapshot reached the main buffer
    assert_eq!(pixel(&ctx, 0, 1, 1), 0x2121_2121);

    // The evicted area is refreshed once the screen recovers
    ctx.update_complete();
    assert!(!ctx.degradation(0).unwrap().disabled);
    assert_eq!(drain(&ctx), vec![Delivered::Region(vec![large])]);
    assert_eq!(pixel(&ctx, 0, 20, 20), 0x2121_2121);
}

#[test]
fn test_malformed_stream_keeps_earlier_orders() {
    let ctx = context(1, 16);
    attach(&ctx, 0, 16, 16, 0);
    drain(&ctx);

    let h = Rect::new(0, 0, 4, 4);
    let mut stream = OrderWriter::new(h).solid_rect(&h, 7).finish();
    stream.extend_from_slice(&OrderCode::InternalRedraw.code().to_le_bytes());
    assert!(matches!(
        ctx.order(0, &stream),
        Err(vrdp_shadow::ShadowError::UnsupportedOrder(-8))
    ));
    assert_eq!(drain(&ctx), vec![Delivered::Order(OrderCode::SolidRect.code(), h)]);

    let outside = OrderWriter::new(Rect::new(10, 10, 10, 10)).finish();
    assert!(matches!(
        ctx.order(0, &outside),
        Err(vrdp_shadow::ShadowError::RectOutOfRange { .. })
    ));
}

#[test]
fn test_redraw_update_with_client_clear() {
    let ctx = context(1, 16);
    attach(&ctx, 0, 16, 16, 0x66);
    drain(&ctx);

    let client = Rect::new(1, 2, 3, 4);
    ctx.redraw_update(0, None, Some(client)).unwrap();
    assert_eq!(
        drain(&ctx),
        vec![
            Delivered::Order(OrderCode::InternalCls.code(), Rect::EMPTY),
            Delivered::Region(vec![Rect::with_size(16, 16)]),
        ]
    );
    assert_eq!(pixel(&ctx, 0, 15, 15), 0x6666_6666);
}

// ============================================================================
// Access Key Tests
// ============================================================================

#[test]
fn test_stale_keys_rejected_after_resize() {
    let ctx = context(1, 16);
    let memory = attach(&ctx, 0, 16, 16, 0x77);
    drain(&ctx);
    let old_key = ctx.access_key(0).unwrap();
    let cover = ctx.cover_add(0, Rect::new(0, 0, 2, 2)).unwrap();

    ctx.bitmap_update(0, 0, 0, 4, 4).unwrap();
    let action = ctx.get_action();
    assert!(action.region().is_some());

    // Same geometry: the buffer is kept but the key changes
    ctx.resize(0, Some(FramebufferDesc::packed(16, 16, 32, memory)), Rotation::Deg0)
        .unwrap();
    let new_key = ctx.access_key(0).unwrap();
    assert_ne!(old_key, new_key);

    assert!(ctx.begin_region_enum(&action).is_none());
    assert!(ctx.lock(Some(old_key), 0, None).is_none());
    assert!(ctx.lock(Some(new_key), 0, None).is_some());
    assert!(!ctx.cover_remove(0, cover));
    ctx.cancel_action(action);

    // The kept buffer is refreshed as a whole
    assert_eq!(drain(&ctx), vec![Delivered::Region(vec![Rect::with_size(16, 16)])]);
}

#[test]
fn test_region_cursor_rejected_mid_enumeration() {
    let ctx = context(1, 16);
    attach(&ctx, 0, 16, 16, 0x12);
    drain(&ctx);

    ctx.bitmap_update(0, 0, 0, 2, 2).unwrap();
    ctx.bitmap_update(0, 8, 8, 2, 2).unwrap();
    let action = ctx.get_action();
    let mut cursor = ctx.begin_region_enum(&action).unwrap();
    assert_eq!(cursor.len(), 2);
    assert_eq!(ctx.next_region_rect(&mut cursor), Some(Rect::new(0, 0, 2, 2)));

    let memory = SharedFramebuffer::new(8 * 8 * 4);
    ctx.resize(0, Some(FramebufferDesc::packed(8, 8, 32, memory)), Rotation::Deg0)
        .unwrap();
    assert_eq!(ctx.next_region_rect(&mut cursor), None);
    ctx.cancel_action(action);
    assert_eq!(drain(&ctx), vec![Delivered::Resize]);
}

#[test]
fn test_disabled_screen() {
    let ctx = context(1, 16);
    attach(&ctx, 0, 16, 16, 0);
    ctx.resize(0, None, Rotation::Deg0).unwrap();

    assert_eq!(ctx.query_rect(0), None);
    assert!(ctx.lock(None, 0, None).is_none());
    assert!(matches!(
        ctx.bitmap_update(0, 0, 0, 1, 1),
        Err(vrdp_shadow::ShadowError::ScreenInactive(0))
    ));
    assert!(drain(&ctx).is_empty());
}

// ============================================================================
// Output Scheduling Tests
// ============================================================================

#[test]
fn test_round_robin_over_screens() {
    let ctx = context(3, 16);
    for id in 0..3 {
        attach(&ctx, id, 16, 16, 0x21);
    }
    let resized: Vec<u32> = std::iter::from_fn(|| next(&ctx).map(|(id, _)| id)).collect();
    assert_eq!(resized, vec![0, 1, 2]);

    let h = Rect::new(0, 0, 4, 4);
    for id in 0..3 {
        ctx.order(id, &OrderWriter::new(h).solid_rect(&h, id).finish()).unwrap();
    }
    ctx.order(0, &OrderWriter::new(h).solid_rect(&h, 9).finish()).unwrap();

    let served: Vec<u32> = std::iter::from_fn(|| next(&ctx).map(|(id, _)| id)).collect();
    assert_eq!(served, vec![0, 1, 2, 0]);
}

#[test]
fn test_inaccessible_screen_skipped() {
    let ctx = context(2, 16);
    attach(&ctx, 0, 16, 16, 0x21);
    attach(&ctx, 1, 16, 16, 0x21);
    drain(&ctx);

    ctx.set_accessible(0, false).unwrap();
    ctx.bitmap_update(1, 0, 0, 2, 2).unwrap();
    assert!(matches!(
        ctx.bitmap_update(0, 0, 0, 2, 2),
        Err(vrdp_shadow::ShadowError::ScreenInactive(0))
    ));
    let served: Vec<u32> = std::iter::from_fn(|| next(&ctx).map(|(id, _)| id)).collect();
    assert_eq!(served, vec![1]);
}

#[test]
fn test_map_mouse_uses_origin() {
    let ctx = context(2, 16);
    let memory = SharedFramebuffer::new(16 * 16 * 4);
    let mut desc = FramebufferDesc::packed(16, 16, 32, memory);
    desc.x = 100;
    desc.y = -20;
    ctx.resize(1, Some(desc), Rotation::Deg0).unwrap();

    assert_eq!(ctx.map_mouse(1, 5, 5), Some((105, -15)));
    assert_eq!(ctx.map_mouse(0, 5, 5), Some((5, 5)));
    assert_eq!(ctx.map_mouse(2, 5, 5), None);
    assert!(ctx.verify_screen_id(1));
    assert!(!ctx.verify_screen_id(2));
}

// ============================================================================
// Cover Tests
// ============================================================================

#[test]
fn test_covered_area_skipped_and_redrawn_on_removal() {
    let ctx = context(1, 16);
    attach(&ctx, 0, 16, 16, 0x44);
    drain(&ctx);

    let covered = Rect::new(0, 0, 8, 8);
    let cover = ctx.cover_add(0, covered).unwrap();
    ctx.bitmap_update(0, 0, 0, 16, 16).unwrap();
    assert_eq!(pixel(&ctx, 0, 1, 1), 0);
    assert_eq!(pixel(&ctx, 0, 12, 12), 0x4444_4444);

    // A blit into the cover is not replayed
    let blit = Rect::new(2, 2, 2, 2);
    ctx.order(0, &OrderWriter::new(blit).dst_blt(&blit, 0).finish()).unwrap();
    assert_eq!(ctx.degradation(0).unwrap().count, 0);

    assert!(ctx.cover_remove(0, cover));
    let delivered = drain(&ctx);
    assert_eq!(delivered[0], Delivered::Order(OrderCode::InternalRedraw.code(), covered));
    assert!(matches!(&delivered[1], Delivered::Region(rects) if region_area(rects) == 256 - 64));

    ctx.update_complete();
    assert_eq!(drain(&ctx), vec![Delivered::Region(vec![blit])]);
}

#[test]
fn test_cover_reset_all() {
    let ctx = context(2, 16);
    attach(&ctx, 0, 16, 16, 0);
    attach(&ctx, 1, 16, 16, 0);
    let a = ctx.cover_add(0, Rect::new(0, 0, 1, 1)).unwrap();
    let b = ctx.cover_add(1, Rect::new(0, 0, 1, 1)).unwrap();
    ctx.cover_reset_all();
    assert!(!ctx.cover_remove(0, a));
    assert!(!ctx.cover_remove(1, b));
}

// ============================================================================
// Video Tests
// ============================================================================

/// Treats every bitmap update as a frame of stream 5
struct EveryUpdateIsVideo {
    commands: Arc<Mutex<Vec<DetectorCommand>>>,
}

impl VideoDetector for EveryUpdateIsVideo {
    fn bitmap_update(&mut self, _rect: &Rect, _now_ms: u64, _handler: &mut dyn VideoHandler) -> VideoVerdict {
        VideoVerdict::Frame(5)
    }

    fn order_update(&mut self, _rect: &Rect, _handler: &mut dyn VideoHandler) {}

    fn update_complete(&mut self, _now_ms: u64, _handler: &mut dyn VideoHandler) {}

    fn reset(&mut self, _stop_streams: bool, _handler: &mut dyn VideoHandler) {}

    fn store_command(&mut self, command: DetectorCommand) {
        self.commands.lock().unwrap().push(command);
    }
}

/// Ends stream 9 at the first update completion
struct StopsOnComplete {
    rect: Rect,
    stopped: bool,
}

impl VideoDetector for StopsOnComplete {
    fn bitmap_update(&mut self, _rect: &Rect, _now_ms: u64, _handler: &mut dyn VideoHandler) -> VideoVerdict {
        VideoVerdict::NotVideo
    }

    fn order_update(&mut self, _rect: &Rect, _handler: &mut dyn VideoHandler) {}

    fn update_complete(&mut self, _now_ms: u64, handler: &mut dyn VideoHandler) {
        if !self.stopped {
            self.stopped = true;
            handler.stream_stop(9, &self.rect);
        }
    }

    fn reset(&mut self, _stop_streams: bool, _handler: &mut dyn VideoHandler) {}

    fn store_command(&mut self, _command: DetectorCommand) {}
}

#[derive(Default)]
struct RecordingHandler {
    frames: Arc<Mutex<Vec<(u32, Rect, usize)>>>,
    stops: Arc<Mutex<Vec<u32>>>,
}

impl VideoHandler for RecordingHandler {
    fn stream_start(&mut self, _stream_id: u32, _rect: &Rect, _timestamp_ms: u64) -> bool {
        true
    }

    fn stream_stop(&mut self, stream_id: u32, _rect: &Rect) {
        self.stops.lock().unwrap().push(stream_id);
    }

    fn source_frame(&mut self, stream_id: u32, _timestamp_ms: u64, frame: &VideoFrame<'_>) -> bool {
        let pixels = frame.read_xrgb8888();
        self.frames.lock().unwrap().push((stream_id, frame.rect(), pixels.len()));
        true
    }
}

#[test]
fn test_video_frames_reach_handler() {
    let commands = Arc::new(Mutex::new(Vec::new()));
    let detector_commands = commands.clone();
    let ctx = ShadowBufferContext::builder()
        .screen_count(1)
        .video_detector(move |_| {
            Box::new(EveryUpdateIsVideo {
                commands: detector_commands.clone(),
            })
        })
        .build()
        .unwrap();
    attach(&ctx, 0, 16, 16, 0x10);

    // No handler, no frames
    ctx.bitmap_update(0, 0, 0, 4, 4).unwrap();

    let handler = RecordingHandler::default();
    let frames = handler.frames.clone();
    ctx.register_video_handler(Box::new(handler));
    ctx.bitmap_update(0, 0, 0, 4, 4).unwrap();
    ctx.bitmap_update_ex(0, 0, 0, 2, 2, &[0; 16], 8, false).unwrap();
    assert_eq!(*frames.lock().unwrap(), vec![(5, Rect::new(0, 0, 4, 4), 64)]);
    assert_eq!(ctx.video_handler(|_| ()), Some(()));

    ctx.video_detector_command(DetectorCommand::Disable);
    assert_eq!(*commands.lock().unwrap(), vec![DetectorCommand::Disable]);

    assert!(ctx.unregister_video_handler().is_some());
    assert_eq!(ctx.video_handler(|_| ()), None);
}

#[test]
fn test_stopped_stream_area_refreshed() {
    let stream = Rect::new(2, 2, 4, 4);
    let ctx = ShadowBufferContext::builder()
        .screen_count(1)
        .video_detector(move |_| {
            Box::new(StopsOnComplete {
                rect: stream,
                stopped: false,
            })
        })
        .build()
        .unwrap();
    let memory = attach(&ctx, 0, 16, 16, 0);
    drain(&ctx);

    let handler = RecordingHandler::default();
    let stops = handler.stops.clone();
    ctx.register_video_handler(Box::new(handler));

    // Frames went to the stream, the shadow buffer never saw them
    memory.write().fill(0x77);
    ctx.update_complete();

    assert_eq!(*stops.lock().unwrap(), vec![9]);
    assert_eq!(drain(&ctx), vec![Delivered::Region(vec![stream])]);
    assert_eq!(pixel(&ctx, 0, 2, 2), 0x7777_7777);
    assert_eq!(pixel(&ctx, 0, 6, 6), 0);
}
