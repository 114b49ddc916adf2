// Copyright 2024 Cloud Hypervisor Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Rate limited diagnostics

use std::sync::atomic::{AtomicU32, Ordering};

/// Cap for rectangle range errors
pub const RECT_LOG_LIMIT: u32 = 32;

/// Cap for malformed or unsupported orders
pub const PARSE_LOG_LIMIT: u32 = 16;

/// Counts occurrences and allows logging of the first `limit`
#[derive(Debug)]
pub struct LogLimiter {
    count: AtomicU32,
    limit: u32,
}

impl LogLimiter {
    pub const fn new(limit: u32) -> Self {
        Self {
            count: AtomicU32::new(0),
            limit,
        }
    }

    /// Record an occurrence. Returns true while it may still be logged.
    pub fn hit(&self) -> bool {
        let seen = self.count.fetch_add(1, Ordering::Relaxed);
        if seen == u32::MAX {
            self.count.store(u32::MAX, Ordering::Relaxed);
        }
        seen < self.limit
    }

    /// Occurrences so far
    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Per context limiters
#[derive(Debug)]
pub struct Diagnostics {
    pub rect: LogLimiter,
    pub parse: LogLimiter,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            rect: LogLimiter::new(RECT_LOG_LIMIT),
            parse: LogLimiter::new(PARSE_LOG_LIMIT),
        }
    }
}
