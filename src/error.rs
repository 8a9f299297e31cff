// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Error types for memory accounting and allocation.
//!
//! Every cap-exceeded variant is retriable: an operator that frees memory
//! (or waits for a sibling to finish) may legitimately retry the same
//! allocation. Size overflows and configuration problems are not.

use crate::quota::format_bytes;

/// Subsystem a [`MemoryError`] originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSource {
    /// Raised while executing a query.
    Runtime,
}

impl ErrorSource {
    /// Returns the wire tag for this source.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorSource::Runtime => "RUNTIME",
        }
    }
}

/// Machine-readable error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// A pool-local, manager-global, manual, or allocator-capacity cap was hit.
    MemCapExceeded,
    /// The underlying byte source could not satisfy the request.
    MemAllocFailed,
    /// The request itself was malformed (overflowing size, bad config).
    InvalidArgument,
}

impl ErrorCode {
    /// Returns the wire tag for this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::MemCapExceeded => "MEM_CAP_EXCEEDED",
            ErrorCode::MemAllocFailed => "MEM_ALLOC_FAILED",
            ErrorCode::InvalidArgument => "INVALID_ARGUMENT",
        }
    }
}

/// Errors that can occur during memory accounting and allocation.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    /// The request would push the pool past its own byte cap.
    #[error("Exceeded memory cap of {} when requesting {}", fmt_b(.cap), fmt_b(.requested))]
    PoolCapExceeded { cap: i64, requested: i64 },

    /// The request would push the whole tree past the manager quota.
    #[error("Exceeded memory manager cap of {} MB", .quota / (1024 * 1024))]
    ManagerCapExceeded { quota: i64 },

    /// The pool (or one of its ancestors) is in the capped state.
    #[error("Memory allocation manually capped")]
    ManuallyCapped,

    /// The byte allocator ran out of its own mapping capacity.
    #[error("Exceeded allocator capacity of {} when requesting {}", fmt_b(.capacity), fmt_b(.requested))]
    AllocatorCapExceeded { capacity: i64, requested: i64 },

    /// A size computation left the 63-bit addressable range.
    #[error("allocation of {count} x {unit} bytes overflows the 63-bit size range")]
    SizeOverflow { count: usize, unit: usize },

    /// The underlying byte source failed (heap exhaustion, mmap error).
    #[error("allocation failed: {0}")]
    AllocationFailed(String),

    /// Invalid construction parameters.
    #[error("configuration error: {0}")]
    Config(String),
}

impl MemoryError {
    /// Source tag attached to this error when reported.
    pub fn error_source(&self) -> ErrorSource {
        ErrorSource::Runtime
    }

    /// Classification code attached to this error when reported.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            MemoryError::PoolCapExceeded { .. }
            | MemoryError::ManagerCapExceeded { .. }
            | MemoryError::ManuallyCapped
            | MemoryError::AllocatorCapExceeded { .. } => ErrorCode::MemCapExceeded,
            MemoryError::AllocationFailed(_) => ErrorCode::MemAllocFailed,
            MemoryError::SizeOverflow { .. } | MemoryError::Config(_) => {
                ErrorCode::InvalidArgument
            }
        }
    }

    /// Whether the same request may succeed later (after memory is freed).
    pub fn is_retriable(&self) -> bool {
        self.error_code() == ErrorCode::MemCapExceeded
    }
}

fn fmt_b(bytes: &i64) -> String {
    format_bytes(*bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: i64 = 1024 * 1024;

    #[test]
    fn test_pool_cap_message() {
        let err = MemoryError::PoolCapExceeded {
            cap: 63 * MB,
            requested: 64 * MB,
        };
        assert_eq!(
            err.to_string(),
            "Exceeded memory cap of 63.00MB when requesting 64.00MB"
        );
        assert_eq!(err.error_code(), ErrorCode::MemCapExceeded);
        assert_eq!(err.error_source(), ErrorSource::Runtime);
        assert!(err.is_retriable());
    }

    #[test]
    fn test_manager_cap_message() {
        let err = MemoryError::ManagerCapExceeded { quota: 127 * MB };
        assert_eq!(err.to_string(), "Exceeded memory manager cap of 127 MB");
        assert!(err.is_retriable());
    }

    #[test]
    fn test_manual_cap_message() {
        let err = MemoryError::ManuallyCapped;
        assert_eq!(err.to_string(), "Memory allocation manually capped");
        assert_eq!(err.error_code(), ErrorCode::MemCapExceeded);
        assert!(err.is_retriable());
    }

    #[test]
    fn test_overflow_not_retriable() {
        let err = MemoryError::SizeOverflow {
            count: 1 << 62,
            unit: 8,
        };
        assert_eq!(err.error_code(), ErrorCode::InvalidArgument);
        assert!(!err.is_retriable());
    }

    #[test]
    fn test_wire_tags() {
        assert_eq!(ErrorSource::Runtime.as_str(), "RUNTIME");
        assert_eq!(ErrorCode::MemCapExceeded.as_str(), "MEM_CAP_EXCEEDED");
    }
}
