// Copyright 2024 Cloud Hypervisor Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Region Engine
//!
//! A region is a set of non-overlapping rectangles clipped to a bounding
//! rectangle and tagged with a generation (`uniq`). The generation is the
//! access key of the screen the region belongs to, which lets callers holding
//! an old region detect that the screen has been resized since.
//!
//! Storage is banded: the region is a vertical sequence of bands, each band a
//! sorted list of disjoint horizontal spans. Every set operation is a single
//! sweep over the union of band edges, so union, intersection and difference
//! share one implementation.

use itertools::Itertools;

use crate::rect::Rect;

#[derive(Clone, Debug, PartialEq, Eq)]
struct Band {
    top: i64,
    bottom: i64,
    spans: Vec<(i64, i64)>,
}

/// Set of rectangles within `bounds`
#[derive(Clone, Debug)]
pub struct Region {
    bounds: Rect,
    uniq: u32,
    bands: Vec<Band>,
}

impl Region {
    /// Create an empty region
    pub fn new(bounds: Rect, uniq: u32) -> Self {
        Self {
            bounds,
            uniq,
            bands: Vec::new(),
        }
    }

    /// Create a region holding a single rectangle
    pub fn from_rect(bounds: Rect, uniq: u32, rect: &Rect) -> Self {
        let mut region = Self::new(bounds, uniq);
        region.add_rect(rect);
        region
    }

    pub fn bounds(&self) -> Rect {
        self.bounds
    }

    /// Generation tag
    pub fn uniq(&self) -> u32 {
        self.uniq
    }

    pub fn is_empty(&self) -> bool {
        self.bands.is_empty()
    }

    /// Drop all rectangles and retag the region
    pub fn reset(&mut self, uniq: u32) {
        self.bands.clear();
        self.uniq = uniq;
    }

    pub fn clear(&mut self) {
        self.bands.clear();
    }

    /// Move the contents out, leaving an empty region with the same bounds and
    /// generation in place.
    pub fn take(&mut self) -> Region {
        let empty = Region::new(self.bounds, self.uniq);
        std::mem::replace(self, empty)
    }

    /// Union with a rectangle. The part outside `bounds` is ignored.
    pub fn add_rect(&mut self, rect: &Rect) {
        let Some(clipped) = rect.intersect(&self.bounds) else {
            return;
        };
        self.bands = combine(&self.bands, &rect_bands(&clipped), |a, b| a || b);
    }

    /// Union with another region, clipped to `bounds`
    pub fn add(&mut self, other: &Region) {
        if other.is_empty() {
            return;
        }
        let clipped = combine(&other.bands, &rect_bands(&self.bounds), |a, b| a && b);
        self.bands = combine(&self.bands, &clipped, |a, b| a || b);
    }

    /// Intersection with `rect` as a new region whose bounds are `rect`.
    pub fn cut(&self, rect: &Rect) -> Region {
        Region {
            bounds: *rect,
            uniq: self.uniq,
            bands: combine(&self.bands, &rect_bands(rect), |a, b| a && b),
        }
    }

    /// Remove a rectangle
    pub fn subtract_rect(&mut self, rect: &Rect) {
        if self.is_empty() || rect.is_empty() {
            return;
        }
        self.bands = combine(&self.bands, &rect_bands(rect), |a, b| a && !b);
    }

    /// Replace the region by its complement within `bounds`
    pub fn invert(&mut self) {
        self.bands = combine(&rect_bands(&self.bounds), &self.bands, |a, b| a && !b);
    }

    /// Whether any part of `rect` is in the region
    pub fn intersects(&self, rect: &Rect) -> bool {
        self.rects().any(|r| r.intersect(rect).is_some())
    }

    pub fn contains_point(&self, x: i32, y: i32) -> bool {
        self.rects().any(|r| r.contains_point(x, y))
    }

    /// Number of pixels covered
    pub fn area(&self) -> u64 {
        self.rects().map(|r| r.area()).sum()
    }

    /// Smallest rectangle containing the region
    pub fn extents(&self) -> Option<Rect> {
        self.rects().reduce(|acc, r| acc.union(&r))
    }

    /// Rectangles top to bottom, left to right
    pub fn rects(&self) -> impl Iterator<Item = Rect> + '_ {
        self.bands.iter().flat_map(|band| {
            band.spans
                .iter()
                .map(move |&(left, right)| Rect::from_edges(left, band.top, right, band.bottom))
        })
    }

    pub fn rect_count(&self) -> usize {
        self.bands.iter().map(|band| band.spans.len()).sum()
    }

    /// Coalesce vertically adjacent bands with identical spans, so that the
    /// rectangle list handed to an encoder is as short as possible.
    pub fn merge_adjacent_rows(&mut self) {
        let mut merged: Vec<Band> = Vec::with_capacity(self.bands.len());
        for band in self.bands.drain(..) {
            match merged.last_mut() {
                Some(last) if last.bottom == band.top && last.spans == band.spans => {
                    last.bottom = band.bottom;
                }
                _ => merged.push(band),
            }
        }
        self.bands = merged;
    }
}

fn rect_bands(rect: &Rect) -> Vec<Band> {
    if rect.is_empty() {
        return Vec::new();
    }
    vec![Band {
        top: rect.top(),
        bottom: rect.bottom(),
        spans: vec![(rect.left(), rect.right())],
    }]
}

/// Sweep both band lists over every distinct band edge and keep the parts
/// where `op(in_a, in_b)` holds. `op(false, false)` must be false.
fn combine(a: &[Band], b: &[Band], op: impl Fn(bool, bool) -> bool) -> Vec<Band> {
    let edges = a
        .iter()
        .chain(b)
        .flat_map(|band| [band.top, band.bottom])
        .sorted_unstable()
        .dedup();

    let mut out = Vec::new();
    let (mut ia, mut ib) = (0, 0);
    for (top, bottom) in edges.tuple_windows() {
        while ia < a.len() && a[ia].bottom <= top {
            ia += 1;
        }
        while ib < b.len() && b[ib].bottom <= top {
            ib += 1;
        }
        let spans = combine_spans(spans_at(a, ia, top), spans_at(b, ib, top), &op);
        if !spans.is_empty() {
            out.push(Band {
                top,
                bottom,
                spans,
            });
        }
    }
    out
}

fn spans_at(bands: &[Band], index: usize, y: i64) -> &[(i64, i64)] {
    match bands.get(index) {
        Some(band) if band.top <= y => &band.spans,
        _ => &[],
    }
}

fn combine_spans(
    a: &[(i64, i64)],
    b: &[(i64, i64)],
    op: &impl Fn(bool, bool) -> bool,
) -> Vec<(i64, i64)> {
    let edges = a
        .iter()
        .chain(b)
        .flat_map(|&(left, right)| [left, right])
        .sorted_unstable()
        .dedup();

    let mut out: Vec<(i64, i64)> = Vec::new();
    let (mut ia, mut ib) = (0, 0);
    for (left, right) in edges.tuple_windows() {
        while ia < a.len() && a[ia].1 <= left {
            ia += 1;
        }
        while ib < b.len() && b[ib].1 <= left {
            ib += 1;
        }
        let in_a = ia < a.len() && a[ia].0 <= left;
        let in_b = ib < b.len() && b[ib].0 <= left;
        if !op(in_a, in_b) {
            continue;
        }
        match out.last_mut() {
            Some(last) if last.1 == left => last.1 = right,
            _ => out.push((left, right)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounds() -> Rect {
        Rect::with_size(100, 100)
    }

    #[test]
    fn test_add_rect_clips_to_bounds() {
        let mut region = Region::new(bounds(), 1);
        region.add_rect(&Rect::new(90, 90, 20, 20));
        assert_eq!(region.rects().collect::<Vec<_>>(), vec![Rect::new(90, 90, 10, 10)]);

        region.add_rect(&Rect::new(200, 200, 5, 5));
        assert_eq!(region.rect_count(), 1);
    }

    #[test]
    fn test_union_has_no_overlap() {
        let mut region = Region::new(bounds(), 1);
        region.add_rect(&Rect::new(0, 0, 10, 10));
        region.add_rect(&Rect::new(5, 5, 10, 10));
        assert_eq!(region.area(), 100 + 100 - 25);
        assert_eq!(region.extents(), Some(Rect::new(0, 0, 15, 15)));

        let rects: Vec<Rect> = region.rects().collect();
        for (i, a) in rects.iter().enumerate() {
            for b in &rects[i + 1..] {
                assert!(a.intersect(b).is_none());
            }
        }
    }

    #[test]
    fn test_cut_and_invert() {
        let mut over = Region::new(bounds(), 7);
        over.add_rect(&Rect::new(0, 0, 50, 100));

        let mut visible = over.cut(&Rect::new(25, 25, 50, 50));
        assert_eq!(visible.bounds(), Rect::new(25, 25, 50, 50));
        assert_eq!(visible.uniq(), 7);
        assert_eq!(visible.area(), 25 * 50);

        visible.invert();
        assert_eq!(visible.rects().collect::<Vec<_>>(), vec![Rect::new(50, 25, 25, 50)]);
    }

    #[test]
    fn test_invert_empty_is_bounds() {
        let mut region = Region::new(Rect::new(10, 10, 5, 5), 1);
        region.invert();
        assert_eq!(region.rects().collect::<Vec<_>>(), vec![Rect::new(10, 10, 5, 5)]);
    }

    #[test]
    fn test_subtract_rect() {
        let mut region = Region::from_rect(bounds(), 1, &Rect::new(0, 0, 30, 30));
        region.subtract_rect(&Rect::new(10, 10, 10, 10));
        assert_eq!(region.area(), 900 - 100);
        assert!(!region.contains_point(15, 15));
        assert!(region.contains_point(5, 15));

        region.subtract_rect(&Rect::new(0, 0, 30, 30));
        assert!(region.is_empty());
    }

    #[test]
    fn test_merge_adjacent_rows() {
        let mut region = Region::new(bounds(), 1);
        region.add_rect(&Rect::new(0, 0, 10, 10));
        region.add_rect(&Rect::new(0, 10, 10, 10));
        region.merge_adjacent_rows();
        assert_eq!(region.rects().collect::<Vec<_>>(), vec![Rect::new(0, 0, 10, 20)]);
    }

    #[test]
    fn test_take_and_reset() {
        let mut region = Region::from_rect(bounds(), 3, &Rect::new(1, 1, 2, 2));
        let taken = region.take();
        assert!(region.is_empty());
        assert_eq!(region.uniq(), 3);
        assert_eq!(taken.area(), 4);

        region.add_rect(&Rect::new(1, 1, 2, 2));
        region.reset(4);
        assert!(region.is_empty());
        assert_eq!(region.uniq(), 4);
    }

    #[test]
    fn test_add_region() {
        let mut a = Region::new(Rect::with_size(20, 20), 1);
        let b = Region::from_rect(bounds(), 1, &Rect::new(10, 10, 50, 50));
        a.add(&b);
        assert_eq!(a.rects().collect::<Vec<_>>(), vec![Rect::new(10, 10, 10, 10)]);
        assert!(a.intersects(&Rect::new(0, 0, 11, 11)));
        assert!(!a.intersects(&Rect::new(0, 0, 10, 10)));
    }
}
