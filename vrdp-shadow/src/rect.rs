// Copyright 2024 Cloud Hypervisor Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Rectangle primitives shared by the region engine, pixel buffers and
//! transforms.
//!
//! Coordinates are signed so that guest supplied rectangles with a negative
//! origin can be represented before they are clamped. Edge arithmetic is done
//! in `i64` to keep `x + w` free of overflow for any `u32` width.

use serde::{Deserialize, Serialize};

/// Axis aligned rectangle: origin plus extent
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub w: u32,
    pub h: u32,
}

impl Rect {
    /// The empty rectangle at the origin
    pub const EMPTY: Rect = Rect::new(0, 0, 0, 0);

    pub const fn new(x: i32, y: i32, w: u32, h: u32) -> Self {
        Self { x, y, w, h }
    }

    /// Rectangle `[0, w) x [0, h)`
    pub const fn with_size(w: u32, h: u32) -> Self {
        Self::new(0, 0, w, h)
    }

    /// Build a rectangle from exclusive edges. Inverted edges give an empty
    /// rectangle anchored at `left, top`.
    pub(crate) fn from_edges(left: i64, top: i64, right: i64, bottom: i64) -> Self {
        let w = (right - left).max(0);
        let h = (bottom - top).max(0);
        Self {
            x: saturate_i32(left),
            y: saturate_i32(top),
            w: u32::try_from(w).unwrap_or(u32::MAX),
            h: u32::try_from(h).unwrap_or(u32::MAX),
        }
    }

    pub fn left(&self) -> i64 {
        i64::from(self.x)
    }

    pub fn top(&self) -> i64 {
        i64::from(self.y)
    }

    /// Exclusive right edge
    pub fn right(&self) -> i64 {
        i64::from(self.x) + i64::from(self.w)
    }

    /// Exclusive bottom edge
    pub fn bottom(&self) -> i64 {
        i64::from(self.y) + i64::from(self.h)
    }

    pub fn is_empty(&self) -> bool {
        self.w == 0 || self.h == 0
    }

    /// Number of pixels covered
    pub fn area(&self) -> u64 {
        u64::from(self.w) * u64::from(self.h)
    }

    /// Intersection of two rectangles, `None` when they do not overlap.
    pub fn intersect(&self, other: &Rect) -> Option<Rect> {
        let left = self.left().max(other.left());
        let right = self.right().min(other.right());
        if left >= right {
            return None;
        }
        let top = self.top().max(other.top());
        let bottom = self.bottom().min(other.bottom());
        if top >= bottom {
            return None;
        }
        Some(Rect::from_edges(left, top, right, bottom))
    }

    /// Smallest rectangle containing both.
    pub fn union(&self, other: &Rect) -> Rect {
        Rect::from_edges(
            self.left().min(other.left()),
            self.top().min(other.top()),
            self.right().max(other.right()),
            self.bottom().max(other.bottom()),
        )
    }

    /// Whether `other` lies entirely within `self`. Edges are compared even for
    /// empty rectangles, so an empty rectangle far outside is rejected.
    pub fn contains_rect(&self, other: &Rect) -> bool {
        self.left() <= other.left()
            && self.top() <= other.top()
            && self.right() >= other.right()
            && self.bottom() >= other.bottom()
    }

    pub fn contains_point(&self, x: i32, y: i32) -> bool {
        let (x, y) = (i64::from(x), i64::from(y));
        x >= self.left() && x < self.right() && y >= self.top() && y < self.bottom()
    }

    /// Clip a guest supplied rectangle to `[0, cx) x [0, cy)`.
    ///
    /// A negative origin moves to zero and the extent shrinks to the part
    /// that was right of (or below) zero; extents past the far edge are cut.
    /// Nothing is rejected: a rectangle entirely outside becomes empty.
    pub fn clamp_to(&self, cx: u32, cy: u32) -> Rect {
        let (x, w) = clamp_axis(i64::from(self.x), i64::from(self.w), i64::from(cx));
        let (y, h) = clamp_axis(i64::from(self.y), i64::from(self.h), i64::from(cy));
        Rect::from_edges(x, y, x + w, y + h)
    }
}

fn clamp_axis(mut pos: i64, mut len: i64, limit: i64) -> (i64, i64) {
    if pos < 0 {
        pos += len;
        len = pos.max(0);
        pos = 0;
    }
    if pos + len > limit {
        len = if limit > pos { limit - pos } else { 0 };
    }
    (pos, len)
}

fn saturate_i32(v: i64) -> i32 {
    i32::try_from(v).unwrap_or(if v < 0 { i32::MIN } else { i32::MAX })
}

impl std::fmt::Display for Rect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{} {}x{}", self.x, self.y, self.w, self.h)
    }
}
