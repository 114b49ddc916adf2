// Copyright 2024 Cloud Hypervisor Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Covered areas
//!
//! A cover is a screen area owned by another channel, typically a video
//! stream being played. Bitmap updates skip covered areas and blits touching
//! them are redrawn instead of replayed.

use crate::rect::Rect;

/// Number of cover slots per screen
pub const COVER_SLOTS: usize = 32;

/// Cover handle: access key in the high half, slot index in the low half
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CoverHandle(pub u64);

impl CoverHandle {
    pub fn new(access_key: u32, index: usize) -> Self {
        Self((u64::from(access_key) << 32) | index as u64)
    }

    pub fn access_key(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn index(&self) -> usize {
        (self.0 & 0xffff_ffff) as usize
    }
}

#[derive(Debug, Clone, Copy)]
struct Cover {
    handle: CoverHandle,
    rect: Rect,
}

#[derive(Debug, Default)]
pub struct Covers {
    slots: [Option<Cover>; COVER_SLOTS],
}

impl Covers {
    /// Take a free slot for `rect`
    pub fn add(&mut self, access_key: u32, rect: Rect) -> Option<CoverHandle> {
        let (index, slot) = self.slots.iter_mut().enumerate().find(|(_, s)| s.is_none())?;
        let handle = CoverHandle::new(access_key, index);
        *slot = Some(Cover { handle, rect });
        Some(handle)
    }

    /// Release the slot of `handle`, returning its rectangle
    pub fn remove(&mut self, handle: CoverHandle) -> Option<Rect> {
        let slot = self.slots.get_mut(handle.index())?;
        if slot.as_ref().is_some_and(|c| c.handle == handle) {
            slot.take().map(|c| c.rect)
        } else {
            None
        }
    }

    pub fn clear(&mut self) {
        self.slots = [None; COVER_SLOTS];
    }

    pub fn rects(&self) -> impl Iterator<Item = Rect> + '_ {
        self.slots.iter().flatten().map(|c| c.rect)
    }

    /// Whether any cover touches `rect`
    pub fn intersects(&self, rect: &Rect) -> bool {
        self.rects().any(|c| c.intersect(rect).is_some())
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles() {
        let mut covers = Covers::default();
        let a = covers.add(7, Rect::new(0, 0, 10, 10)).unwrap();
        let b = covers.add(7, Rect::new(20, 0, 10, 10)).unwrap();
        assert_eq!(a.access_key(), 7);
        assert_eq!((a.index(), b.index()), (0, 1));
        assert!(covers.intersects(&Rect::new(5, 5, 2, 2)));

        // Same slot, older key
        assert_eq!(covers.remove(CoverHandle::new(6, 0)), None);
        assert_eq!(covers.remove(a), Some(Rect::new(0, 0, 10, 10)));
        assert_eq!(covers.remove(a), None);
        assert_eq!(covers.len(), 1);
    }

    #[test]
    fn test_slots_exhausted() {
        let mut covers = Covers::default();
        for _ in 0..COVER_SLOTS {
            covers.add(1, Rect::new(0, 0, 1, 1)).unwrap();
        }
        assert_eq!(covers.add(1, Rect::new(0, 0, 1, 1)), None);
        covers.clear();
        assert!(covers.is_empty());
    }
}
