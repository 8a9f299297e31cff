// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! The root holder of a pool tree.
//!
//! A [`MemoryManager`] owns the global byte quota, the single
//! [`ByteAllocator`] instance shared by the whole tree, and the root
//! [`MemoryPool`](crate::MemoryPool). The root is not destroyable while
//! the manager lives; operators obtain child pools from it.
//!
//! On construction the manager installs its allocator as the process
//! default (see [`default_byte_allocator`](crate::default_byte_allocator));
//! on drop it uninstalls it, but only if nothing replaced it in the
//! meantime.

use crate::alloc::{clear_default_byte_allocator_if, set_default_byte_allocator, HeapAllocator};
use crate::pool::{MemoryPool, UNBOUNDED_CAP};
use crate::{ByteAllocator, MemoryError};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// State shared between the manager and every pool in its tree.
pub(crate) struct PoolShared {
    quota: i64,
    total_bytes: AtomicI64,
    allocator: Arc<dyn ByteAllocator>,
}

impl PoolShared {
    pub(crate) fn quota(&self) -> i64 {
        self.quota
    }

    pub(crate) fn allocator(&self) -> &Arc<dyn ByteAllocator> {
        &self.allocator
    }

    pub(crate) fn total_bytes(&self) -> i64 {
        self.total_bytes.load(Ordering::Acquire)
    }

    /// Atomically adds `bytes` to the global tally unless that would
    /// exceed the quota. The check-and-commit is a single CAS, so
    /// concurrent reservations can never overshoot together.
    pub(crate) fn try_reserve(&self, bytes: i64) -> bool {
        self.total_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |total| {
                let next = total.checked_add(bytes)?;
                (next <= self.quota).then_some(next)
            })
            .is_ok()
    }

    pub(crate) fn release(&self, bytes: i64) {
        self.total_bytes.fetch_sub(bytes, Ordering::AcqRel);
    }
}

/// Construction parameters for [`MemoryManager`].
#[derive(Debug, Clone, Default)]
pub struct ManagerOptions {
    /// Global byte quota; `None` is practically unlimited.
    pub quota: Option<i64>,
    /// Allocation alignment for every pool in the tree: `None`, or a
    /// power of two ≥ 8.
    pub alignment: Option<usize>,
    /// Byte source for the tree; defaults to [`HeapAllocator`].
    pub allocator: Option<Arc<dyn ByteAllocator>>,
}

/// Root holder: global quota, byte allocator, root pool.
pub struct MemoryManager {
    shared: Arc<PoolShared>,
    root: Arc<MemoryPool>,
}

impl MemoryManager {
    /// Creates a manager with no quota, heap allocation, and no alignment.
    pub fn new() -> Self {
        Self::build(None, None, Arc::new(HeapAllocator::new()))
    }

    /// Creates a heap-backed manager with the given global byte quota.
    pub fn with_quota(quota: i64) -> Self {
        Self::build(Some(quota), None, Arc::new(HeapAllocator::new()))
    }

    /// Creates a manager from [`ManagerOptions`].
    pub fn with_options(options: ManagerOptions) -> Result<Self, MemoryError> {
        if let Some(align) = options.alignment {
            if !align.is_power_of_two() || align < 8 {
                return Err(MemoryError::Config(format!(
                    "alignment must be a power of two >= 8, got {align}"
                )));
            }
        }
        let allocator = options
            .allocator
            .unwrap_or_else(|| Arc::new(HeapAllocator::new()));
        Ok(Self::build(options.quota, options.alignment, allocator))
    }

    fn build(quota: Option<i64>, alignment: Option<usize>, allocator: Arc<dyn ByteAllocator>) -> Self {
        let quota = quota.unwrap_or(UNBOUNDED_CAP);
        let shared = Arc::new(PoolShared {
            quota,
            total_bytes: AtomicI64::new(0),
            allocator,
        });
        let root = MemoryPool::create(
            "root".to_string(),
            quota,
            alignment,
            None,
            false,
            None,
            Arc::clone(&shared),
        );
        set_default_byte_allocator(Some(Arc::clone(&shared.allocator)));
        debug!(quota, ?alignment, "memory manager constructed");
        Self { shared, root }
    }

    /// The root pool of the tree.
    pub fn root(&self) -> &Arc<MemoryPool> {
        &self.root
    }

    /// The global byte quota (`i64::MAX` when unlimited).
    pub fn quota(&self) -> i64 {
        self.shared.quota()
    }

    /// Bytes currently reserved across the whole tree.
    pub fn total_bytes(&self) -> i64 {
        self.shared.total_bytes()
    }

    /// The byte allocator shared by the tree.
    pub fn allocator(&self) -> &Arc<dyn ByteAllocator> {
        self.shared.allocator()
    }
}

impl Default for MemoryManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        clear_default_byte_allocator_if(self.shared.allocator());
        debug!("memory manager dropped");
    }
}

impl std::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("quota", &self.quota())
            .field("total_bytes", &self.total_bytes())
            .field("allocator", self.allocator())
            .finish()
    }
}
