// Copyright 2024 Cloud Hypervisor Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Bitmap cache interface
//!
//! Orders that carry pixels inline (`CACHED_BITMAP`, `SAVESCREEN` restores)
//! park the pixels in a cache owned by the output side and keep only the
//! handle in their micro shadow buffer. The engine stores and frees entries;
//! lookup and eviction belong to the cache.

use std::collections::HashMap;

use log::debug;

use crate::error::{Result, ShadowError};
use crate::order::DataBits;

/// Opaque cache entry handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BitmapHandle(pub u64);

/// One store request
#[derive(Debug, Clone, Copy)]
pub struct StoreRequest<'a> {
    /// Order code the entry belongs to
    pub op: i32,
    /// Content key, the bitmap hash or the order body
    pub key: &'a [u8],
    pub header: DataBits,
    pub bits: &'a [u8],
    /// Access key of the screen at store time
    pub access_key: u32,
    pub screen_id: u32,
}

/// Cache for bitmaps referenced by orders
pub trait BitmapCache: Send {
    fn store(&mut self, request: &StoreRequest<'_>) -> Result<BitmapHandle>;

    /// Whether `handle` still refers to an entry
    fn contains(&self, handle: BitmapHandle) -> bool;

    fn free(&mut self, handle: BitmapHandle);
}

/// Cached entry of [`MemoryBitmapCache`]
#[derive(Debug, Clone)]
pub struct CachedBitmap {
    pub op: i32,
    pub key: Vec<u8>,
    pub header: DataBits,
    pub bits: Vec<u8>,
    pub access_key: u32,
    pub screen_id: u32,
}

/// Capacity bounded in-memory cache
#[derive(Debug, Default)]
pub struct MemoryBitmapCache {
    capacity: usize,
    used: usize,
    next_handle: u64,
    entries: HashMap<u64, CachedBitmap>,
}

impl MemoryBitmapCache {
    /// Cache holding at most `capacity` bytes of pixels
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ..Default::default()
        }
    }

    pub fn get(&self, handle: BitmapHandle) -> Option<&CachedBitmap> {
        self.entries.get(&handle.0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn used_bytes(&self) -> usize {
        self.used
    }
}

impl BitmapCache for MemoryBitmapCache {
    fn store(&mut self, request: &StoreRequest<'_>) -> Result<BitmapHandle> {
        let size = request.bits.len();
        if self.used + size > self.capacity {
            return Err(ShadowError::OutOfMemory(format!(
                "bitmap cache full: {} + {size} > {}",
                self.used, self.capacity
            )));
        }

        self.next_handle += 1;
        let handle = self.next_handle;
        self.entries.insert(
            handle,
            CachedBitmap {
                op: request.op,
                key: request.key.to_vec(),
                header: request.header,
                bits: request.bits.to_vec(),
                access_key: request.access_key,
                screen_id: request.screen_id,
            },
        );
        self.used += size;
        debug!("cached {size} bytes for op {} as {handle}", request.op);
        Ok(BitmapHandle(handle))
    }

    fn contains(&self, handle: BitmapHandle) -> bool {
        self.entries.contains_key(&handle.0)
    }

    fn free(&mut self, handle: BitmapHandle) {
        if let Some(entry) = self.entries.remove(&handle.0) {
            self.used -= entry.bits.len();
        }
    }
}
