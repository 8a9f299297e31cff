// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Declarative manager configuration loaded from TOML files or
//! constructed programmatically.
//!
//! # TOML Format
//! ```toml
//! quota = "8G"
//! allocator = "mmap"
//! mmap_capacity = "8G"
//! alignment = 64
//! ```

use crate::manager::{ManagerOptions, MemoryManager};
use crate::mmap::{MmapAllocator, MmapAllocatorOptions};
use crate::quota::MemoryQuota;
use crate::{ByteAllocator, MemoryError};
use std::path::Path;
use std::sync::Arc;

/// Configuration for a [`MemoryManager`].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MemoryConfig {
    /// Global byte quota (human-readable, e.g. `"8G"`). Absent means
    /// practically unlimited.
    pub quota: Option<String>,
    /// Byte source: `"heap"` or `"mmap"`.
    pub allocator: String,
    /// Capacity for the mmap allocator; defaults to the quota (or the
    /// allocator's built-in default when no quota is set).
    pub mmap_capacity: Option<String>,
    /// Allocation alignment: a power of two ≥ 8, or absent for none.
    pub alignment: Option<usize>,
}

impl MemoryConfig {
    /// Loads configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, MemoryError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            MemoryError::Config(format!("cannot read config '{}': {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    /// Parses configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, MemoryError> {
        toml::from_str(toml_str).map_err(|e| MemoryError::Config(format!("TOML parse error: {e}")))
    }

    /// Serialises configuration to TOML.
    pub fn to_toml(&self) -> Result<String, MemoryError> {
        toml::to_string_pretty(self)
            .map_err(|e| MemoryError::Config(format!("TOML serialise error: {e}")))
    }

    /// Builds a manager from this configuration.
    pub fn build(&self) -> Result<MemoryManager, MemoryError> {
        let quota = match &self.quota {
            Some(s) => Some(MemoryQuota::parse(s)?.as_bytes()),
            None => None,
        };

        let allocator: Option<Arc<dyn ByteAllocator>> =
            match self.allocator.to_lowercase().as_str() {
                "heap" => None, // manager default
                "mmap" => {
                    let capacity = match &self.mmap_capacity {
                        Some(s) => MemoryQuota::parse(s)?.as_bytes() as usize,
                        None => quota
                            .map(|q| q as usize)
                            .unwrap_or(MmapAllocatorOptions::default().capacity),
                    };
                    Some(Arc::new(MmapAllocator::new(MmapAllocatorOptions {
                        capacity,
                    })))
                }
                other => {
                    return Err(MemoryError::Config(format!(
                        "unknown allocator '{other}'; expected 'heap' or 'mmap'"
                    )))
                }
            };

        MemoryManager::with_options(ManagerOptions {
            quota,
            alignment: self.alignment,
            allocator,
        })
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            quota: None,
            allocator: "heap".to_string(),
            mmap_capacity: None,
            alignment: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default() {
        let c = MemoryConfig::default();
        assert_eq!(c.allocator, "heap");
        assert!(c.quota.is_none());
        assert!(c.alignment.is_none());
    }

    #[test]
    fn test_from_toml() {
        let toml = r#"
quota = "127M"
allocator = "mmap"
mmap_capacity = "1G"
alignment = 64
"#;
        let c = MemoryConfig::from_toml(toml).unwrap();
        assert_eq!(c.quota.as_deref(), Some("127M"));
        assert_eq!(c.allocator, "mmap");
        assert_eq!(c.mmap_capacity.as_deref(), Some("1G"));
        assert_eq!(c.alignment, Some(64));
    }

    #[test]
    fn test_to_toml_roundtrip() {
        let c = MemoryConfig {
            quota: Some("512M".to_string()),
            allocator: "heap".to_string(),
            mmap_capacity: None,
            alignment: Some(16),
        };
        let toml = c.to_toml().unwrap();
        let back = MemoryConfig::from_toml(&toml).unwrap();
        assert_eq!(back.quota, c.quota);
        assert_eq!(back.allocator, c.allocator);
        assert_eq!(back.alignment, c.alignment);
    }

    #[test]
    fn test_build_heap() {
        let c = MemoryConfig {
            quota: Some("64M".to_string()),
            ..Default::default()
        };
        let manager = c.build().unwrap();
        assert_eq!(manager.quota(), 64 * 1024 * 1024);
        assert!(manager.allocator().size_classes().is_empty());
    }

    #[test]
    fn test_build_mmap() {
        let c = MemoryConfig {
            quota: Some("64M".to_string()),
            allocator: "mmap".to_string(),
            ..Default::default()
        };
        let manager = c.build().unwrap();
        assert!(!manager.allocator().size_classes().is_empty());
    }

    #[test]
    fn test_build_unknown_allocator() {
        let c = MemoryConfig {
            allocator: "tcmalloc".to_string(),
            ..Default::default()
        };
        assert!(matches!(c.build(), Err(MemoryError::Config(_))));
    }

    #[test]
    fn test_build_invalid_quota() {
        let c = MemoryConfig {
            quota: Some("lots".to_string()),
            ..Default::default()
        };
        assert!(c.build().is_err());
    }

    #[test]
    fn test_build_invalid_alignment() {
        let c = MemoryConfig {
            alignment: Some(24),
            ..Default::default()
        };
        assert!(matches!(c.build(), Err(MemoryError::Config(_))));
    }
}
