// Copyright 2024 Cloud Hypervisor Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Shadow buffer simulator
//!
//! Drives a context with a random producer and a draining consumer, then
//! prints per screen statistics as JSON.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use log::{LevelFilter, debug, error, info};
use serde::Serialize;

use vrdp_shadow::{
    ActionKind, FramebufferDesc, MemoryProfile, MsbBudget, MsbStats, OrderWriter, Rect, Rotation,
    ShadowBufferContext, ShadowConfig, SharedFramebuffer, VideoFrame, VideoHandler,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Profile {
    Compact,
    Standard,
    Generous,
}

impl From<Profile> for MemoryProfile {
    fn from(profile: Profile) -> Self {
        match profile {
            Profile::Compact => MemoryProfile::Compact,
            Profile::Standard => MemoryProfile::Standard,
            Profile::Generous => MemoryProfile::Generous,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "vrdp-shadow-sim", version, about = "Shadow buffer workload simulator")]
struct Args {
    /// Number of screens
    #[arg(short, long, default_value_t = 1)]
    screens: u32,

    #[arg(long, default_value_t = 640)]
    width: u32,

    #[arg(long, default_value_t = 480)]
    height: u32,

    /// Bits per pixel: 16, 24 or 32
    #[arg(long, default_value_t = 32)]
    bpp: u32,

    /// Rotation in degrees
    #[arg(short, long, default_value_t = 0)]
    rotation: u32,

    /// Producer frames, 0 runs until Ctrl+C
    #[arg(short, long, default_value_t = 100)]
    frames: u64,

    /// JSON configuration file, overrides --profile
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = Profile::Standard)]
    profile: Profile,

    /// Register a video handler
    #[arg(long)]
    video: bool,

    /// Random seed
    #[arg(long)]
    seed: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Default)]
struct VideoCounters {
    streams: AtomicU64,
    frames: AtomicU64,
}

struct SimVideoHandler {
    counters: Arc<VideoCounters>,
}

impl VideoHandler for SimVideoHandler {
    fn stream_start(&mut self, stream_id: u32, rect: &Rect, timestamp_ms: u64) -> bool {
        info!("video stream {stream_id} at {rect} started at {timestamp_ms} ms");
        self.counters.streams.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn stream_stop(&mut self, stream_id: u32, rect: &Rect) {
        info!("video stream {stream_id} at {rect} stopped");
    }

    fn source_frame(&mut self, _stream_id: u32, _timestamp_ms: u64, frame: &VideoFrame<'_>) -> bool {
        let pixels = frame.read_xrgb8888();
        debug!("video frame {} ({} bytes)", frame.rect(), pixels.len());
        self.counters.frames.fetch_add(1, Ordering::Relaxed);
        true
    }
}

#[derive(Debug, Default)]
struct ConsumerCounters {
    regions: u64,
    rects: u64,
    pixel_bytes: u64,
    orders: u64,
    resizes: u64,
    stale: u64,
}

#[derive(Debug, Serialize)]
struct ScreenReport {
    id: u32,
    rect: Option<Rect>,
    msb: Option<MsbStats>,
    budget: Option<MsbBudget>,
}

#[derive(Debug, Serialize)]
struct Report {
    elapsed_ms: u128,
    frames: u64,
    regions: u64,
    rects: u64,
    pixel_bytes: u64,
    orders: u64,
    resizes: u64,
    stale_regions: u64,
    video_streams: u64,
    video_frames: u64,
    screens: Vec<ScreenReport>,
}

fn load_config(args: &Args) -> Result<ShadowConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
        }
        None => ShadowConfig::from_profile(args.profile.into(), args.screens),
    };
    config.screen_count = args.screens;
    config.validate()?;
    Ok(config)
}

/// Random rectangle inside `w x h`
fn random_rect(rng: &mut fastrand::Rng, w: u32, h: u32) -> Rect {
    let rw = rng.u32(1..=(w / 4).max(1));
    let rh = rng.u32(1..=(h / 4).max(1));
    let x = rng.u32(0..=(w - rw));
    let y = rng.u32(0..=(h - rh));
    Rect::new(x as i32, y as i32, rw, rh)
}

fn paint(memory: &SharedFramebuffer, desc: &FramebufferDesc, rect: &Rect, value: u8) {
    let bpp = desc.bits_per_pixel as usize / 8;
    let mut bytes = memory.write();
    for y in rect.top()..rect.bottom() {
        let start = y as usize * desc.line_size + rect.x as usize * bpp;
        let end = start + rect.w as usize * bpp;
        if let Some(line) = bytes.get_mut(start..end) {
            line.fill(value);
        }
    }
}

fn produce_frame(
    ctx: &ShadowBufferContext,
    screens: &[(FramebufferDesc, SharedFramebuffer)],
    rng: &mut fastrand::Rng,
) {
    for (id, (desc, memory)) in screens.iter().enumerate() {
        let id = id as u32;
        let rect = random_rect(rng, desc.width, desc.height);
        if rng.u8(..) < 160 {
            paint(memory, desc, &rect, rng.u8(..));
            if let Err(e) = ctx.bitmap_update(id, rect.x, rect.y, rect.w, rect.h) {
                debug!("screen {id}: bitmap update failed: {e}");
            }
            continue;
        }

        // Stream headers bound everything the stream draws
        let bytes = if rng.bool() {
            let dst = random_rect(rng, desc.width, desc.height);
            let src = random_rect(rng, desc.width - dst.w + 1, desc.height - dst.h + 1);
            let header = rect.union(&dst).union(&Rect::new(src.x, src.y, dst.w, dst.h));
            OrderWriter::new(header)
                .solid_rect(&rect, rng.u32(..))
                .screen_blt(&dst, src.x as i16, src.y as i16, 0xcc)
                .finish()
        } else {
            let clip = random_rect(rng, desc.width, desc.height);
            OrderWriter::new(rect.union(&clip))
                .bounds(
                    clip.x as i16,
                    clip.y as i16,
                    clip.right() as i16,
                    clip.bottom() as i16,
                )
                .solid_rect(&rect, rng.u32(..))
                .repeat(&clip)
                .finish()
        };
        if let Err(e) = ctx.order(id, &bytes) {
            debug!("screen {id}: order stream dropped: {e}");
        }
    }
    ctx.update_complete();
}

fn consume(ctx: &ShadowBufferContext, producing: &AtomicBool) -> ConsumerCounters {
    let mut counters = ConsumerCounters::default();
    loop {
        let action = ctx.get_action();
        match &action.kind {
            ActionKind::Nop => {
                if !producing.load(Ordering::SeqCst) {
                    break;
                }
                thread::sleep(Duration::from_millis(1));
            }
            ActionKind::Region(_) => {
                counters.regions += 1;
                match ctx.begin_region_enum(&action) {
                    Some(mut cursor) => {
                        let key = cursor.access_key();
                        while let Some(rect) = ctx.next_region_rect(&mut cursor) {
                            counters.rects += 1;
                            if let Some(lock) = ctx.lock(Some(key), action.screen_id, Some(rect)) {
                                let bpp = lock.format().map_or(0, |f| f.bytes_per_pixel() as u64);
                                counters.pixel_bytes += rect.area() * bpp;
                            }
                        }
                    }
                    None => counters.stale += 1,
                }
            }
            ActionKind::Order { op, affected, .. } => {
                debug!("screen {}: order {op} at {affected}", action.screen_id);
                counters.orders += 1;
            }
            ActionKind::Resize => counters.resizes += 1,
        }
        ctx.cancel_action(action);
    }
    counters
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { LevelFilter::Debug } else { LevelFilter::Info };
    env_logger::Builder::new().filter_level(level).parse_default_env().init();

    let config = load_config(&args)?;
    let rotation = Rotation::try_from(args.rotation)?;
    if !matches!(args.bpp, 16 | 24 | 32) {
        bail!("unsupported depth {} bpp", args.bpp);
    }
    if args.width < 4 || args.height < 4 {
        bail!("screen {}x{} too small", args.width, args.height);
    }

    info!("Starting vrdp-shadow-sim with config: {config:?}");
    let ctx = Arc::new(ShadowBufferContext::new(config)?);

    let video = Arc::new(VideoCounters::default());
    if args.video {
        ctx.register_video_handler(Box::new(SimVideoHandler {
            counters: video.clone(),
        }));
    }

    let mut screens = Vec::new();
    for id in 0..args.screens {
        let line_size = (args.width * args.bpp / 8) as usize;
        let memory = SharedFramebuffer::new(line_size * args.height as usize);
        let mut desc = FramebufferDesc::packed(args.width, args.height, args.bpp, memory.clone());
        desc.x = (id * args.width) as i32;
        ctx.resize(id, Some(desc.clone()), rotation)?;
        ctx.redraw_update(id, None, None)?;
        screens.push((desc, memory));
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .context("installing Ctrl+C handler")?;

    let producing = Arc::new(AtomicBool::new(true));
    let consumer = {
        let ctx = ctx.clone();
        let producing = producing.clone();
        thread::Builder::new()
            .name("consumer".to_string())
            .spawn(move || consume(&ctx, &producing))
            .context("spawning consumer")?
    };

    let started = Instant::now();
    let mut rng = args.seed.map_or_else(fastrand::Rng::new, fastrand::Rng::with_seed);
    let mut frames = 0;
    info!("Simulator running, press Ctrl+C to stop");
    while running.load(Ordering::SeqCst) && (args.frames == 0 || frames < args.frames) {
        produce_frame(&ctx, &screens, &mut rng);
        frames += 1;
    }
    producing.store(false, Ordering::SeqCst);

    let counters = match consumer.join() {
        Ok(counters) => counters,
        Err(_) => {
            error!("consumer thread panicked");
            ConsumerCounters::default()
        }
    };

    let report = Report {
        elapsed_ms: started.elapsed().as_millis(),
        frames,
        regions: counters.regions,
        rects: counters.rects,
        pixel_bytes: counters.pixel_bytes,
        orders: counters.orders,
        resizes: counters.resizes,
        stale_regions: counters.stale,
        video_streams: video.streams.load(Ordering::Relaxed),
        video_frames: video.frames.load(Ordering::Relaxed),
        screens: (0..ctx.screen_count())
            .map(|id| ScreenReport {
                id,
                rect: ctx.query_rect(id),
                msb: ctx.msb_stats(id),
                budget: ctx.degradation(id),
            })
            .collect(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    ctx.destroy_buffers();
    info!("Simulator stopped");
    Ok(())
}
