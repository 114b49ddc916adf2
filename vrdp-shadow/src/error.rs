// Copyright 2024 Cloud Hypervisor Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Shadow buffer error types

use crate::rect::Rect;

/// Shadow buffer error types
#[derive(Debug, thiserror::Error)]
pub enum ShadowError {
    #[error("Invalid screen id {0}")]
    InvalidScreen(u32),

    #[error("Screen {0} is not active or not accessible")]
    ScreenInactive(u32),

    #[error("Invalid framebuffer description: {0}")]
    InvalidFramebuffer(String),

    #[error("Unsupported pixel depth: {0} bits per pixel")]
    UnsupportedPixelDepth(u32),

    #[error("Rectangle {rect:?} is outside of {bounds:?}")]
    RectOutOfRange { rect: Rect, bounds: Rect },

    #[error("Malformed order stream at offset {offset} (op {op}): {reason}")]
    MalformedOrder {
        offset: usize,
        op: i32,
        reason: String,
    },

    #[error("Unsupported order code {0:#010x}")]
    UnsupportedOrder(i32),

    #[error("Source bits too short: need {needed} bytes, have {available}")]
    BitsTooShort { needed: usize, available: usize },

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("Stale handle: generation {handle} does not match {current}")]
    StaleHandle { handle: u32, current: u32 },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for shadow buffer operations
pub type Result<T> = std::result::Result<T, ShadowError>;
