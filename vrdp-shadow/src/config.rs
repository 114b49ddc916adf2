// Copyright 2024 Cloud Hypervisor Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Shadow buffer configuration

use serde::{Deserialize, Serialize};

use crate::error::{Result, ShadowError};
use crate::video::DetectorConfig;

/// Maximum number of screens
pub const MAX_SCREENS: u32 = 64;

/// Default number of preallocated MSB blocks per screen
pub const DEFAULT_BLOCK_COUNT: u32 = 512;

/// Default MSB block size in bytes
pub const DEFAULT_BLOCK_SIZE: u32 = 256;

/// Default dedicated MSB heap per screen
pub const DEFAULT_HEAP_SIZE: u64 = 16 * 1024 * 1024;

const PAGE_SIZE: u64 = 4096;

/// Memory sizing presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MemoryProfile {
    /// Small heap, few blocks
    Compact,
    /// 512 blocks, 16 MiB heap (default)
    #[default]
    Standard,
    /// Large heap for high resolution guests
    Generous,
}

impl MemoryProfile {
    pub fn block_count(&self) -> u32 {
        match self {
            MemoryProfile::Compact => 128,
            MemoryProfile::Standard => DEFAULT_BLOCK_COUNT,
            MemoryProfile::Generous => 2048,
        }
    }

    pub fn heap_size(&self) -> u64 {
        match self {
            MemoryProfile::Compact => 4 * 1024 * 1024,
            MemoryProfile::Standard => DEFAULT_HEAP_SIZE,
            MemoryProfile::Generous => 64 * 1024 * 1024,
        }
    }
}

/// Shadow buffer context configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShadowConfig {
    /// Number of screens
    pub screen_count: u32,
    /// Preallocated MSB blocks per screen, also the MSB count ceiling
    pub msb_block_count: u32,
    /// Size of one MSB block
    pub msb_block_size: u32,
    /// Dedicated MSB heap per screen, rounded up to a page
    pub msb_heap_size: u64,
    /// Run the video detector on bitmap updates
    pub video_detection: bool,
    /// Video detector thresholds
    pub detector: DetectorConfig,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            screen_count: 1,
            msb_block_count: DEFAULT_BLOCK_COUNT,
            msb_block_size: DEFAULT_BLOCK_SIZE,
            msb_heap_size: DEFAULT_HEAP_SIZE,
            video_detection: true,
            detector: DetectorConfig::default(),
        }
    }
}

impl ShadowConfig {
    /// Create config from profile
    pub fn from_profile(profile: MemoryProfile, screen_count: u32) -> Self {
        Self {
            screen_count,
            msb_block_count: profile.block_count(),
            msb_heap_size: profile.heap_size(),
            ..Default::default()
        }
    }

    /// Heap size rounded up to a whole page
    pub fn heap_size_aligned(&self) -> u64 {
        self.msb_heap_size.div_ceil(PAGE_SIZE) * PAGE_SIZE
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.screen_count == 0 {
            return Err(ShadowError::InvalidConfig("screen count cannot be zero".to_string()));
        }
        if self.screen_count > MAX_SCREENS {
            return Err(ShadowError::InvalidConfig(format!(
                "screen count {} exceeds maximum {MAX_SCREENS}",
                self.screen_count
            )));
        }
        if self.msb_block_count == 0 {
            return Err(ShadowError::InvalidConfig("MSB block count cannot be zero".to_string()));
        }
        if (self.msb_block_size as usize) <= crate::msb::MSB_RECORD_HEADER {
            return Err(ShadowError::InvalidConfig(format!(
                "MSB block size {} does not exceed the record header",
                self.msb_block_size
            )));
        }
        if self.msb_heap_size == 0 {
            return Err(ShadowError::InvalidConfig("MSB heap size cannot be zero".to_string()));
        }
        if self.detector.detection_min_ms >= self.detector.detection_max_ms {
            return Err(ShadowError::InvalidConfig(format!(
                "video detection window {}..{} ms is empty",
                self.detector.detection_min_ms, self.detector.detection_max_ms
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ShadowConfig::default();
        config.validate().unwrap();
        assert_eq!(config.msb_block_count, 512);
        assert!(config.video_detection);
        assert_eq!(config, ShadowConfig::from_profile(MemoryProfile::default(), 1));
    }

    #[test]
    fn test_validate() {
        let config = ShadowConfig {
            screen_count: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ShadowError::InvalidConfig(_))));

        let config = ShadowConfig {
            msb_block_size: 32,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ShadowError::InvalidConfig(_))));
    }

    #[test]
    fn test_heap_alignment() {
        let config = ShadowConfig {
            msb_heap_size: 5000,
            ..Default::default()
        };
        assert_eq!(config.heap_size_aligned(), 8192);
    }

    #[test]
    fn test_json_partial() {
        let config: ShadowConfig = serde_json::from_str(r#"{"screen_count": 3}"#).unwrap();
        assert_eq!(config.screen_count, 3);
        assert_eq!(config.msb_block_size, DEFAULT_BLOCK_SIZE);
    }
}
