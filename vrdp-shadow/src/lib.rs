// Copyright 2024 Cloud Hypervisor Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! VRDP shadow buffer engine
//!
//! This crate keeps a server side copy of every guest screen and turns guest
//! drawing activity into output actions for remote desktop clients.
//!
//! # Overview
//!
//! The VM side reports framebuffer changes either as plain bitmap updates or
//! as drawing orders. Each order is wrapped into a micro shadow buffer (MSB)
//! that holds the order itself plus the pixels drawn under it while the order
//! waits for delivery. The output side drains the screens round robin and
//! receives, in causal order, the regions to encode and the orders to replay.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 VM side (display updates)                   │
//! │  resize / bitmap_update / order / update_complete           │
//! └─────────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  ShadowBufferContext                        │
//! │  per screen: shadow buffer, MSB list, covers, detector      │
//! │  transform FB -> SB (0, 90, 180, 270 degrees)               │
//! └─────────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │               Output side (client encoders)                 │
//! │  get_action / region enumeration / lock / cancel_action     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! When MSB allocation fails the screen degrades: new orders are dropped and
//! their areas are redrawn from the framebuffer once pending MSBs drain.
//!
//! # Usage
//!
//! ```ignore
//! use vrdp_shadow::{ShadowBufferContext, ShadowConfig, FramebufferDesc, Rotation};
//!
//! let ctx = ShadowBufferContext::new(ShadowConfig::default())?;
//! ctx.resize(0, Some(FramebufferDesc::packed(1024, 768, 32, memory)), Rotation::Deg0)?;
//! ctx.bitmap_update(0, 0, 0, 64, 64)?;
//! ctx.update_complete();
//!
//! loop {
//!     let action = ctx.get_action();
//!     if action.is_nop() {
//!         break;
//!     }
//!     // ...
//!     ctx.cancel_action(action);
//! }
//! ```
//!
//! # Modules
//!
//! - [`context`]: Public entry point shared by both sides
//! - [`order`]: Order stream wire format
//! - [`msb`]: MSB arena and allocation budget
//! - [`transform`]: Rotation between framebuffer and shadow buffer
//! - [`video`]: Video stream detection

pub mod action;
pub mod cache;
pub mod config;
pub mod context;
pub mod cover;
pub mod diag;
pub mod error;
pub mod framebuffer;
mod ingest;
pub mod msb;
pub mod order;
pub mod pixel;
pub mod pixel_buffer;
pub mod rect;
pub mod region;
mod screen;
pub mod shadow_buffer;
pub mod transform;
pub mod video;

pub use action::{Action, ActionKind, RegionCursor};
pub use cache::{BitmapCache, BitmapHandle, CachedBitmap, MemoryBitmapCache, StoreRequest};
pub use config::{MemoryProfile, ShadowConfig};
pub use context::{ShadowBufferContext, ShadowBufferContextBuilder, ShadowLock};
pub use cover::CoverHandle;
pub use error::{Result, ShadowError};
pub use framebuffer::{FramebufferDesc, SharedFramebuffer};
pub use msb::{MsbBudget, MsbStats};
pub use order::{DataBits, OrderCode, OrderWriter};
pub use pixel::PixelFormat;
pub use rect::Rect;
pub use region::Region;
pub use transform::Rotation;
pub use video::{DetectorCommand, DetectorConfig, HistoryVideoDetector, VideoDetector, VideoFrame, VideoHandler};
