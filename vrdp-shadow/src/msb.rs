// Copyright 2024 Cloud Hypervisor Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Micro Shadow Buffers
//!
//! A micro shadow buffer (MSB) holds one drawing order that has not been sent
//! yet, together with a snapshot of the pixels under it. MSBs of a screen live
//! in a slot arena ([`MsbPool`]) and are chained into a doubly linked list
//! ([`MsbList`]) by slot index: the top is the newest order, the bottom the
//! oldest.
//!
//! ```text
//!   top                                            bottom
//!   [msb 7] --lower--> [msb 2] --lower--> [msb 5]
//!          <--upper--         <--upper--
//! ```
//!
//! Order payloads are copied into preallocated fixed size blocks when they
//! fit. Larger payloads, and all snapshot pixels, are charged to the screen's
//! dedicated heap budget; control orders that do not fit a block fall back to
//! the general allocator so they cannot be starved by drawing traffic.

use log::{debug, warn};

use crate::pixel_buffer::PixelBuffer;
use crate::rect::Rect;
use crate::region::Region;

/// Bookkeeping cost of one MSB record, counted against the block size
pub const MSB_RECORD_HEADER: usize = 64;

bitflags::bitflags! {
    /// MSB state flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MsbFlags: u32 {
        /// Linked into the screen's MSB list
        const IN_LIST = 1 << 0;
        /// Handed to the output side and not yet released
        const OUTPUT = 1 << 1;
        /// The dirty area beneath the MSB has been computed
        const UNDERLYING_REPORTED = 1 << 2;
        /// The order has not been delivered yet
        const HAS_ORDER = 1 << 3;
        /// Deleted while in flight, freed on release
        const POSTPONED = 1 << 4;
    }
}

/// Where the record storage came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocSource {
    /// Preallocated fixed size block
    Block,
    /// Dedicated per screen heap
    Heap,
    /// General allocator
    System,
}

#[derive(Debug)]
enum Payload {
    Block { index: usize, len: usize },
    Owned(Vec<u8>),
}

/// Generation checked reference to an MSB
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MsbHandle {
    index: u32,
    generation: u32,
}

impl MsbHandle {
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

/// One pending drawing order
#[derive(Debug)]
pub struct Msb {
    pub(crate) upper: Option<usize>,
    pub(crate) lower: Option<usize>,
    pub(crate) flags: MsbFlags,
    pub(crate) deleted: u8,
    source: AllocSource,
    payload: Payload,
    payload_charge: usize,
    pixel_charge: usize,
    /// Order code
    pub(crate) op: i32,
    /// Area touched by the order, SB coordinates
    pub(crate) affected: Rect,
    /// Pixels under the order, captured as later updates arrive
    pub(crate) pixel_buffer: PixelBuffer,
    /// Part of the main buffer dirty region beneath the order
    pub(crate) underlying: Option<Region>,
}

impl Msb {
    pub fn source(&self) -> AllocSource {
        self.source
    }

    pub fn flags(&self) -> MsbFlags {
        self.flags
    }

    pub fn op(&self) -> i32 {
        self.op
    }

    pub fn affected(&self) -> Rect {
        self.affected
    }

    pub fn pixel_buffer(&self) -> &PixelBuffer {
        &self.pixel_buffer
    }

    pub fn is_in_list(&self) -> bool {
        self.flags.contains(MsbFlags::IN_LIST)
    }

    pub fn is_output(&self) -> bool {
        self.flags.contains(MsbFlags::OUTPUT)
    }
}

/// Byte accounting for the dedicated heap
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapBudget {
    capacity: usize,
    used: usize,
}

impl HeapBudget {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, used: 0 }
    }

    fn charge(&mut self, bytes: usize) -> bool {
        match self.used.checked_add(bytes) {
            Some(total) if total <= self.capacity => {
                self.used = total;
                true
            }
            _ => false,
        }
    }

    fn release(&mut self, bytes: usize) {
        self.used = self.used.saturating_sub(bytes);
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// MSB allocation statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct MsbStats {
    /// Records placed in preallocated blocks
    pub block_allocs: u64,
    /// Records placed on the dedicated heap
    pub heap_allocs: u64,
    /// Records placed with the general allocator
    pub system_allocs: u64,
    /// Record or pixel allocations that failed
    pub failures: u64,
    /// Snapshot pixel buffers allocated
    pub pixel_allocs: u64,
    /// Records currently alive
    pub live: u64,
    /// Highest number of records alive at once
    pub peak_live: u64,
    /// Heap bytes in use
    pub heap_used: u64,
    /// Highest heap use
    pub heap_peak: u64,
}

struct Slot {
    generation: u32,
    msb: Option<Msb>,
}

/// Arena of MSB records for one screen
pub struct MsbPool {
    slots: Vec<Slot>,
    vacant: Vec<usize>,
    blocks: Vec<Box<[u8]>>,
    free_blocks: Vec<usize>,
    block_size: usize,
    heap: HeapBudget,
    stats: MsbStats,
}

impl MsbPool {
    pub fn new(block_count: usize, block_size: usize, heap_size: usize) -> Self {
        let blocks: Vec<Box<[u8]>> = (0..block_count)
            .map(|_| vec![0u8; block_size].into_boxed_slice())
            .collect();
        Self {
            slots: Vec::new(),
            vacant: Vec::new(),
            free_blocks: (0..block_count).rev().collect(),
            blocks,
            block_size,
            heap: HeapBudget::new(heap_size),
            stats: MsbStats::default(),
        }
    }

    pub fn stats(&self) -> &MsbStats {
        &self.stats
    }

    pub fn heap(&self) -> &HeapBudget {
        &self.heap
    }

    pub fn free_block_count(&self) -> usize {
        self.free_blocks.len()
    }

    /// Number of live records
    pub fn live(&self) -> usize {
        self.slots.iter().filter(|s| s.msb.is_some()).count()
    }

    /// Store a new record. Returns `None` when no storage could be found.
    pub fn alloc(
        &mut self,
        op: i32,
        payload: &[u8],
        control: bool,
        affected: Rect,
        pixel_buffer: PixelBuffer,
    ) -> Option<MsbHandle> {
        let total = MSB_RECORD_HEADER + payload.len();

        let (source, stored, charge) = if total <= self.block_size && !self.free_blocks.is_empty() {
            let index = self.free_blocks.pop()?;
            self.blocks[index][..payload.len()].copy_from_slice(payload);
            (
                AllocSource::Block,
                Payload::Block {
                    index,
                    len: payload.len(),
                },
                0,
            )
        } else if control {
            let mut owned = Vec::new();
            if owned.try_reserve_exact(payload.len()).is_err() {
                self.stats.failures += 1;
                return None;
            }
            owned.extend_from_slice(payload);
            (AllocSource::System, Payload::Owned(owned), 0)
        } else {
            if !self.heap.charge(total) {
                debug!(
                    "MSB heap exhausted: {} + {total} > {}",
                    self.heap.used(),
                    self.heap.capacity()
                );
                self.stats.failures += 1;
                return None;
            }
            (AllocSource::Heap, Payload::Owned(payload.to_vec()), total)
        };

        match source {
            AllocSource::Block => self.stats.block_allocs += 1,
            AllocSource::Heap => self.stats.heap_allocs += 1,
            AllocSource::System => self.stats.system_allocs += 1,
        }
        self.note_heap();

        let msb = Msb {
            upper: None,
            lower: None,
            flags: MsbFlags::empty(),
            deleted: 0,
            source,
            payload: stored,
            payload_charge: charge,
            pixel_charge: 0,
            op,
            affected,
            pixel_buffer,
            underlying: None,
        };

        let index = match self.vacant.pop() {
            Some(index) => {
                self.slots[index].msb = Some(msb);
                index
            }
            None => {
                self.slots.push(Slot {
                    generation: 1,
                    msb: Some(msb),
                });
                self.slots.len() - 1
            }
        };

        self.stats.live += 1;
        self.stats.peak_live = self.stats.peak_live.max(self.stats.live);

        Some(MsbHandle {
            index: index as u32,
            generation: self.slots[index].generation,
        })
    }

    /// Release a record and its storage. Stale handles are ignored.
    pub fn free(&mut self, handle: MsbHandle) -> bool {
        let index = handle.index();
        let Some(slot) = self.slots.get_mut(index) else {
            return false;
        };
        if slot.generation != handle.generation {
            return false;
        }
        let Some(msb) = slot.msb.take() else {
            return false;
        };
        slot.generation = slot.generation.wrapping_add(1).max(1);
        self.vacant.push(index);

        if let Payload::Block { index, .. } = msb.payload {
            self.free_blocks.push(index);
        }
        self.heap.release(msb.payload_charge + msb.pixel_charge);
        self.stats.live = self.stats.live.saturating_sub(1);
        self.note_heap();
        true
    }

    pub fn get(&self, handle: MsbHandle) -> Option<&Msb> {
        self.slots
            .get(handle.index())
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.msb.as_ref())
    }

    pub fn get_mut(&mut self, handle: MsbHandle) -> Option<&mut Msb> {
        self.slots
            .get_mut(handle.index())
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.msb.as_mut())
    }

    /// Current handle for an occupied slot
    pub fn handle_at(&self, index: usize) -> Option<MsbHandle> {
        let slot = self.slots.get(index)?;
        slot.msb.as_ref().map(|_| MsbHandle {
            index: index as u32,
            generation: slot.generation,
        })
    }

    pub(crate) fn at(&self, index: usize) -> Option<&Msb> {
        self.slots.get(index).and_then(|slot| slot.msb.as_ref())
    }

    pub(crate) fn at_mut(&mut self, index: usize) -> Option<&mut Msb> {
        self.slots.get_mut(index).and_then(|slot| slot.msb.as_mut())
    }

    /// Copy of the order payload
    pub fn payload(&self, handle: MsbHandle) -> Option<&[u8]> {
        let msb = self.get(handle)?;
        Some(match &msb.payload {
            Payload::Block { index, len } => &self.blocks[*index][..*len],
            Payload::Owned(bytes) => bytes.as_slice(),
        })
    }

    /// Give the record's pixel buffer zeroed storage from the heap. Returns
    /// true when storage is present afterwards.
    pub fn alloc_pixels(&mut self, index: usize) -> bool {
        let Some(msb) = self.slots.get(index).and_then(|slot| slot.msb.as_ref()) else {
            return false;
        };
        if msb.pixel_buffer.has_pixels() {
            return true;
        }
        let size = msb.pixel_buffer.size_bytes();
        if !self.heap.charge(size) {
            warn!("MSB heap cannot hold {size} bytes of pixels");
            self.stats.failures += 1;
            return false;
        }

        let mut pixels = Vec::new();
        if pixels.try_reserve_exact(size).is_err() {
            self.heap.release(size);
            self.stats.failures += 1;
            return false;
        }
        pixels.resize(size, 0);

        let Some(msb) = self.at_mut(index) else {
            return false;
        };
        if msb.pixel_buffer.attach_pixels(pixels).is_err() {
            self.heap.release(size);
            return false;
        }
        msb.pixel_charge = size;
        self.stats.pixel_allocs += 1;
        self.note_heap();
        true
    }

    fn note_heap(&mut self) {
        self.stats.heap_used = self.heap.used() as u64;
        self.stats.heap_peak = self.stats.heap_peak.max(self.stats.heap_used);
    }
}

/// Ordered MSB list, linked through the pool
#[derive(Debug, Clone, Copy, Default)]
pub struct MsbList {
    top: Option<usize>,
    bottom: Option<usize>,
}

impl MsbList {
    pub fn top(&self) -> Option<usize> {
        self.top
    }

    pub fn bottom(&self) -> Option<usize> {
        self.bottom
    }

    pub fn is_empty(&self) -> bool {
        self.top.is_none()
    }

    /// Link `index` as the newest entry
    pub fn insert_top(&mut self, pool: &mut MsbPool, index: usize) {
        let old_top = self.top;
        let Some(msb) = pool.at_mut(index) else {
            return;
        };
        msb.upper = None;
        msb.lower = old_top;
        msb.flags.insert(MsbFlags::IN_LIST);

        match old_top.and_then(|top| pool.at_mut(top)) {
            Some(top) => top.upper = Some(index),
            None => self.bottom = Some(index),
        }
        self.top = Some(index);
    }

    pub fn unlink(&mut self, pool: &mut MsbPool, index: usize) {
        let Some(msb) = pool.at_mut(index) else {
            return;
        };
        if !msb.flags.contains(MsbFlags::IN_LIST) {
            return;
        }
        let (upper, lower) = (msb.upper.take(), msb.lower.take());
        msb.flags.remove(MsbFlags::IN_LIST);

        match upper.and_then(|u| pool.at_mut(u)) {
            Some(u) => u.lower = lower,
            None => self.top = lower,
        }
        match lower.and_then(|l| pool.at_mut(l)) {
            Some(l) => l.upper = upper,
            None => self.bottom = upper,
        }
    }

    /// Slot indices from top (newest) to bottom (oldest)
    pub fn iter_top_down(self, pool: &MsbPool) -> impl Iterator<Item = usize> + '_ {
        std::iter::successors(self.top, move |&i| pool.at(i).and_then(|m| m.lower))
    }
}

/// Degradation state of one shadow buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct MsbBudget {
    /// No new MSBs are created; orders go to the redraw region
    pub disabled: bool,
    /// MSBs in the list
    pub count: u32,
    /// Current allowance
    pub limit: u32,
    /// Upper bound for `limit`
    pub max: u32,
}

impl MsbBudget {
    pub fn new(max: u32) -> Self {
        Self {
            disabled: false,
            count: 0,
            limit: max,
            max,
        }
    }

    /// Whether another record may be created. Hitting the limit with a
    /// drawing order disables MSBs and halves the allowance.
    pub fn admit(&mut self, control: bool) -> bool {
        if self.disabled {
            return false;
        }
        if !control && self.count >= self.limit {
            self.disabled = true;
            let shrunk = self.limit / 2 + 8;
            self.limit = if shrunk < self.limit { shrunk } else { (self.limit / 2).max(1) };
            debug!("MSB limit reached, new limit {}", self.limit);
            return false;
        }
        true
    }

    /// Grow the allowance by a quarter after a clean update cycle
    pub fn grow(&mut self) {
        if !self.disabled && self.limit < self.max {
            self.limit = (self.limit + (self.limit / 4).max(1)).min(self.max);
        }
    }
}
