// Copyright 2024 Cloud Hypervisor Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Output actions
//!
//! The output side repeatedly asks the context for the next thing to send to
//! clients and releases it when done:
//!
//! ```text
//!   loop {
//!       action = get_action()
//!       Region  -> enumerate rects, lock the shadow buffer, encode pixels
//!       Order   -> replay the order payload
//!       Resize  -> renegotiate the client desktop
//!       cancel_action(action)
//!   }
//! ```

use crate::msb::MsbHandle;
use crate::rect::Rect;
use crate::region::Region;

#[derive(Debug)]
pub enum ActionKind {
    /// Nothing to send
    Nop,
    /// Pixels of these shadow buffer areas must be sent
    Region(Region),
    /// A drawing order to replay
    Order {
        op: i32,
        payload: Vec<u8>,
        /// Area in SB coordinates, empty for control orders
        affected: Rect,
    },
    /// The screen geometry changed
    Resize,
}

/// One unit of output work
#[derive(Debug)]
pub struct Action {
    pub screen_id: u32,
    pub kind: ActionKind,
    pub(crate) context: Option<MsbHandle>,
}

impl Action {
    pub fn nop() -> Self {
        Self {
            screen_id: 0,
            kind: ActionKind::Nop,
            context: None,
        }
    }

    pub(crate) fn new(screen_id: u32, kind: ActionKind, context: Option<MsbHandle>) -> Self {
        Self {
            screen_id,
            kind,
            context,
        }
    }

    pub fn is_nop(&self) -> bool {
        matches!(self.kind, ActionKind::Nop)
    }

    /// The MSB that produced the action, if any
    pub fn context(&self) -> Option<MsbHandle> {
        self.context
    }

    /// Screen and MSB, consuming the action
    pub(crate) fn into_context(self) -> (u32, Option<MsbHandle>) {
        (self.screen_id, self.context)
    }

    pub fn region(&self) -> Option<&Region> {
        match &self.kind {
            ActionKind::Region(region) => Some(region),
            _ => None,
        }
    }

    /// Order code, for order actions
    pub fn order_op(&self) -> Option<i32> {
        match &self.kind {
            ActionKind::Order { op, .. } => Some(*op),
            _ => None,
        }
    }
}

/// Cursor over the rectangles of a region action
#[derive(Debug, Clone)]
pub struct RegionCursor {
    pub(crate) screen_id: u32,
    pub(crate) uniq: u32,
    pub(crate) rects: Vec<Rect>,
    pub(crate) pos: usize,
}

impl RegionCursor {
    /// Access key the region was built for
    pub fn access_key(&self) -> u32 {
        self.uniq
    }

    pub fn screen_id(&self) -> u32 {
        self.screen_id
    }

    pub fn len(&self) -> usize {
        self.rects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }
}
