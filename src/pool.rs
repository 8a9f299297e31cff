// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Hierarchical memory pools: named accounting nodes with byte caps.
//!
//! A [`MemoryPool`] is a node in a tree rooted at the
//! [`MemoryManager`](crate::MemoryManager). It does not own raw memory —
//! it accounts. Every `allocate`/`free`/`reallocate` call:
//!
//! 1. rounds the size up to the pool's alignment,
//! 2. checks the manager quota, the manual capped flag, and the pool's
//!    own cap (failed checks leave all counters untouched),
//! 3. delegates byte acquisition to the shared
//!    [`ByteAllocator`](crate::ByteAllocator),
//! 4. updates the pool's current/peak counters and, if attached, its
//!    [`MemoryUsageTracker`].
//!
//! Accounting is flat: a pool's `current_bytes` covers only bytes
//! attributed to that pool, never its subtree. Subtree aggregation is
//! the tracker's job.
//!
//! # Ownership
//!
//! `add_child` returns an `Arc<MemoryPool>`; the child holds a strong
//! reference to its parent while the parent only tracks children
//! weakly. Parent state therefore stays valid while any descendant
//! lives, and dropping the last handle to a pool detaches it from the
//! parent's child set and releases its outstanding bytes from the
//! manager tally and the attached tracker.
//!
//! # Thread Safety
//! `MemoryPool` is `Send + Sync`; counters are atomics and per-pool
//! operations are linearizable. Tracker attachment is serialized with
//! accounting through an `RwLock` so no delta is double-counted or
//! lost when trackers are swapped mid-flight.

use crate::alloc::DEFAULT_ALIGNMENT;
use crate::manager::PoolShared;
use crate::tracker::MemoryUsageTracker;
use crate::MemoryError;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use tracing::{debug, warn};

/// Cap value meaning "effectively unbounded".
pub(crate) const UNBOUNDED_CAP: i64 = i64::MAX;

/// An accounting node in the hierarchical memory tree.
pub struct MemoryPool {
    /// Diagnostic name; not unique among siblings.
    name: String,
    /// Local byte cap; `i64::MAX` when unbounded.
    cap: i64,
    /// Allocation sizes are rounded up to this; `None` leaves them as-is.
    alignment: Option<usize>,
    current_bytes: AtomicI64,
    peak_bytes: AtomicI64,
    capped: AtomicBool,
    parent: Option<Arc<MemoryPool>>,
    /// Weak handle to ourselves, for minting child back-references.
    self_handle: Weak<MemoryPool>,
    children: Mutex<Vec<Weak<MemoryPool>>>,
    tracker: RwLock<Option<Arc<MemoryUsageTracker>>>,
    shared: Arc<PoolShared>,
}

impl MemoryPool {
    pub(crate) fn create(
        name: String,
        cap: i64,
        alignment: Option<usize>,
        parent: Option<Arc<MemoryPool>>,
        capped: bool,
        tracker: Option<Arc<MemoryUsageTracker>>,
        shared: Arc<PoolShared>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_handle| Self {
            name,
            cap,
            alignment,
            current_bytes: AtomicI64::new(0),
            peak_bytes: AtomicI64::new(0),
            capped: AtomicBool::new(capped),
            parent,
            self_handle: self_handle.clone(),
            children: Mutex::new(Vec::new()),
            tracker: RwLock::new(tracker),
            shared,
        })
    }

    /// Creates a child pool with the given diagnostic name and optional
    /// byte cap (`None` = unbounded).
    ///
    /// Sibling names need not be unique. The child inherits the parent's
    /// alignment and capped state, and — if the parent has a tracker — a
    /// child tracker parented to it.
    pub fn add_child(&self, name: impl Into<String>, cap: Option<i64>) -> Arc<MemoryPool> {
        let name = name.into();
        let child_tracker = self
            .tracker
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|t| t.add_child());
        let child = MemoryPool::create(
            name,
            cap.unwrap_or(UNBOUNDED_CAP),
            self.alignment,
            Some(self.handle()),
            self.capped.load(Ordering::Acquire),
            child_tracker,
            Arc::clone(&self.shared),
        );
        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::downgrade(&child));
        debug!(parent = %self.name, child = %child.name, "added child pool");
        child
    }

    /// Invokes `f` once per currently-live child. Order is unspecified.
    pub fn visit_children<F: FnMut(&Arc<MemoryPool>)>(&self, mut f: F) {
        for child in self.children_snapshot() {
            f(&child);
        }
    }

    /// Number of live children.
    pub fn child_count(&self) -> usize {
        let mut children = self
            .children
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        children.retain(|w| w.strong_count() > 0);
        children.len()
    }

    /// Allocates `size` bytes attributed to this pool.
    ///
    /// The size is rounded up to the pool's alignment and the rounded
    /// amount is accounted. Fails with a retriable cap-exceeded error if
    /// the manager quota, the manual capped state, or the pool's own cap
    /// is in the way; a failed allocation leaves all counters untouched.
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, MemoryError> {
        let rounded = self.size_align(size)?;
        let tracker = self.tracker.read().unwrap_or_else(PoisonError::into_inner);
        let committed = self.reserve_internal(rounded as i64)?;
        match self
            .shared
            .allocator()
            .allocate(rounded, self.effective_alignment())
        {
            Ok(ptr) => {
                self.peak_bytes.fetch_max(committed, Ordering::AcqRel);
                if let Some(t) = tracker.as_ref() {
                    t.update(rounded as i64);
                }
                Ok(ptr)
            }
            Err(e) => {
                self.unreserve_internal(rounded as i64);
                Err(e)
            }
        }
    }

    /// Returns an allocation to the byte source and removes it from this
    /// pool's accounting. The peak is untouched.
    ///
    /// # Safety
    /// `ptr` must come from `allocate`/`reallocate` on this pool with the
    /// same requested `size`, and must not be used afterwards.
    pub unsafe fn free(&self, ptr: NonNull<u8>, size: usize) {
        let rounded = match self.size_align(size) {
            Ok(r) => r,
            Err(_) => {
                warn!(pool = %self.name, size, "free called with an unrepresentable size");
                return;
            }
        };
        let tracker = self.tracker.read().unwrap_or_else(PoisonError::into_inner);
        // SAFETY: forwarded caller contract.
        unsafe {
            self.shared
                .allocator()
                .free(ptr, rounded, self.effective_alignment())
        };
        let freed = self.release_internal(rounded as i64);
        if let Some(t) = tracker.as_ref() {
            t.update(-freed);
        }
    }

    /// Resizes an allocation, accounting the net delta.
    ///
    /// Growth runs the same cap checks as `allocate`; if they fail, the
    /// original allocation remains valid, untouched, and still attributed
    /// to this pool. Shrinkage releases the delta without checks and
    /// never lowers the peak.
    ///
    /// # Safety
    /// Same contract as [`MemoryPool::free`] for `ptr` and `old_size`.
    pub unsafe fn reallocate(
        &self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
    ) -> Result<NonNull<u8>, MemoryError> {
        let rounded_old = self.size_align(old_size)?;
        let rounded_new = self.size_align(new_size)?;
        let delta = rounded_new as i64 - rounded_old as i64;
        let tracker = self.tracker.read().unwrap_or_else(PoisonError::into_inner);

        if delta > 0 {
            let committed = self.reserve_internal(delta)?;
            // SAFETY: forwarded caller contract.
            match unsafe {
                self.shared.allocator().reallocate(
                    ptr,
                    rounded_old,
                    rounded_new,
                    self.effective_alignment(),
                )
            } {
                Ok(new_ptr) => {
                    self.peak_bytes.fetch_max(committed, Ordering::AcqRel);
                    if let Some(t) = tracker.as_ref() {
                        t.update_reallocation(delta);
                    }
                    Ok(new_ptr)
                }
                Err(e) => {
                    self.unreserve_internal(delta);
                    Err(e)
                }
            }
        } else {
            // SAFETY: forwarded caller contract.
            let new_ptr = unsafe {
                self.shared.allocator().reallocate(
                    ptr,
                    rounded_old,
                    rounded_new,
                    self.effective_alignment(),
                )
            }?;
            if delta < 0 {
                let released = self.release_internal(-delta);
                if let Some(t) = tracker.as_ref() {
                    t.update_reallocation(-released);
                }
            }
            Ok(new_ptr)
        }
    }

    /// Tracks externally-managed bytes: runs the full cap checks and
    /// adjusts `current`/`peak` without touching the byte source.
    pub fn reserve(&self, size: usize) -> Result<(), MemoryError> {
        let rounded = self.size_align(size)? as i64;
        let tracker = self.tracker.read().unwrap_or_else(PoisonError::into_inner);
        let committed = self.reserve_internal(rounded)?;
        self.peak_bytes.fetch_max(committed, Ordering::AcqRel);
        if let Some(t) = tracker.as_ref() {
            t.update(rounded);
        }
        Ok(())
    }

    /// Releases bytes previously recorded with [`MemoryPool::reserve`].
    pub fn release(&self, size: usize) {
        let rounded = match self.size_align(size) {
            Ok(r) => r as i64,
            Err(_) => {
                warn!(pool = %self.name, size, "release called with an unrepresentable size");
                return;
            }
        };
        let tracker = self.tracker.read().unwrap_or_else(PoisonError::into_inner);
        let freed = self.release_internal(rounded);
        if let Some(t) = tracker.as_ref() {
            t.update(-freed);
        }
    }

    /// Puts this pool and every descendant into the capped state.
    /// Subsequent allocations anywhere in the subtree fail until uncapped.
    pub fn cap_memory_allocation(&self) {
        self.capped.store(true, Ordering::Release);
        debug!(pool = %self.name, "memory allocation capped");
        for child in self.children_snapshot() {
            child.cap_memory_allocation();
        }
    }

    /// Clears the capped state on this pool and every descendant.
    ///
    /// A no-op while the parent remains capped: a node cannot uncap below
    /// a capped ancestor.
    pub fn uncap_memory_allocation(&self) {
        if let Some(parent) = &self.parent {
            if parent.is_memory_capped() {
                return;
            }
        }
        debug!(pool = %self.name, "memory allocation uncapped");
        self.uncap_recursive();
    }

    fn uncap_recursive(&self) {
        self.capped.store(false, Ordering::Release);
        for child in self.children_snapshot() {
            child.uncap_recursive();
        }
    }

    /// Whether this pool is in the capped state.
    pub fn is_memory_capped(&self) -> bool {
        self.capped.load(Ordering::Acquire)
    }

    /// Attaches `tracker`, transferring this pool's outstanding bytes
    /// from the previous tracker (if any) to the new one. A no-op when
    /// `tracker` is already attached. The transfer is atomic with respect
    /// to concurrent accounting on this pool.
    pub fn set_memory_usage_tracker(&self, tracker: Arc<MemoryUsageTracker>) {
        let mut slot = self.tracker.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(old) = slot.as_ref() {
            if Arc::ptr_eq(old, &tracker) {
                return;
            }
        }
        let outstanding = self.current_bytes.load(Ordering::Acquire);
        if let Some(old) = slot.as_ref() {
            old.update(-outstanding);
        }
        tracker.update(outstanding);
        *slot = Some(tracker);
    }

    /// The attached tracker, if any.
    pub fn memory_usage_tracker(&self) -> Option<Arc<MemoryUsageTracker>> {
        self.tracker
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Bytes currently attributed to this pool (not its subtree).
    pub fn current_bytes(&self) -> i64 {
        self.current_bytes.load(Ordering::Acquire)
    }

    /// High-water mark of [`Self::current_bytes`] since creation.
    pub fn max_bytes(&self) -> i64 {
        self.peak_bytes.load(Ordering::Acquire)
    }

    /// Diagnostic name of this pool.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parent pool; `None` for the root.
    pub fn parent(&self) -> Option<&Arc<MemoryPool>> {
        self.parent.as_ref()
    }

    /// Local byte cap; `i64::MAX` when unbounded.
    pub fn cap_bytes(&self) -> i64 {
        self.cap
    }

    /// Allocation alignment; `None` means sizes are accounted as-is.
    pub fn alignment(&self) -> Option<usize> {
        self.alignment
    }

    /// Rounds a caller-chosen buffer capacity up to the allocation-friendly
    /// sequence `{8} ∪ {2^k, 3·2^(k-1)}`: the next power of two, or one and
    /// a half times the previous one, whichever is closer from above.
    ///
    /// ```
    /// # let manager = query_memory::MemoryManager::new();
    /// # let pool = manager.root();
    /// assert_eq!(pool.preferred_size(25), 32);
    /// assert_eq!(pool.preferred_size(1024 * 1024 + 1), 1024 * 1536);
    /// ```
    pub fn preferred_size(&self, size: usize) -> usize {
        debug_assert!(size as u64 <= 1u64 << 63);
        if size < 8 {
            return 8;
        }
        let bits = usize::BITS - 1 - size.leading_zeros();
        let lower = 1usize << bits;
        // Size is a power of two.
        if lower == size {
            return size;
        }
        let mid = lower + (lower >> 1);
        if size <= mid {
            mid
        } else {
            lower << 1
        }
    }

    /// Snapshot of this pool's counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            name: self.name.clone(),
            current_bytes: self.current_bytes(),
            peak_bytes: self.max_bytes(),
            cap_bytes: (self.cap != UNBOUNDED_CAP).then_some(self.cap),
            capped: self.is_memory_capped(),
            child_count: self.child_count(),
        }
    }

    // ── Internals ──────────────────────────────────────────────

    pub(crate) fn handle(&self) -> Arc<MemoryPool> {
        self.self_handle
            .upgrade()
            .expect("pool handle valid while the pool is live")
    }

    pub(crate) fn effective_alignment(&self) -> usize {
        self.alignment.unwrap_or(DEFAULT_ALIGNMENT)
    }

    /// Rounds `size` up to the pool alignment, rejecting anything that
    /// leaves the 63-bit range.
    fn size_align(&self, size: usize) -> Result<usize, MemoryError> {
        let overflow = MemoryError::SizeOverflow {
            count: size,
            unit: 1,
        };
        let rounded = match self.alignment {
            Some(align) => size
                .checked_add(align - 1)
                .map(|s| s & !(align - 1))
                .ok_or(overflow)?,
            None => size,
        };
        if rounded as u64 > i64::MAX as u64 {
            return Err(MemoryError::SizeOverflow {
                count: size,
                unit: 1,
            });
        }
        Ok(rounded)
    }

    /// Runs the quota/capped/cap checks and commits `bytes` to `current`,
    /// returning the committed value of `current` so the caller can feed
    /// it into the peak once the operation is known to succeed. Check
    /// order mirrors failure precedence: manager quota, then the manual
    /// capped state, then the local cap. Any failure rolls back
    /// completely before returning.
    fn reserve_internal(&self, bytes: i64) -> Result<i64, MemoryError> {
        if !self.shared.try_reserve(bytes) {
            return Err(MemoryError::ManagerCapExceeded {
                quota: self.shared.quota(),
            });
        }
        if self.capped.load(Ordering::Acquire) {
            self.shared.release(bytes);
            return Err(MemoryError::ManuallyCapped);
        }
        match self.try_reserve_local(bytes) {
            Some(committed) => Ok(committed),
            None => {
                self.shared.release(bytes);
                Err(MemoryError::PoolCapExceeded {
                    cap: self.cap,
                    requested: bytes,
                })
            }
        }
    }

    /// Rolls back a successful [`Self::reserve_internal`].
    fn unreserve_internal(&self, bytes: i64) {
        self.current_bytes.fetch_sub(bytes, Ordering::AcqRel);
        self.shared.release(bytes);
    }

    /// Atomically adds `bytes` to `current` unless that would reach the
    /// cap. Returns the value `current` was committed to, so peak updates
    /// use the exact reserved value rather than a later re-read that a
    /// concurrent free may already have lowered.
    fn try_reserve_local(&self, bytes: i64) -> Option<i64> {
        self.current_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let next = current.checked_add(bytes)?;
                (next < self.cap).then_some(next)
            })
            .ok()
            .map(|previous| previous + bytes)
    }

    /// Removes up to `bytes` from `current` (clamped at zero) and the
    /// manager tally. Returns the amount actually removed.
    fn release_internal(&self, bytes: i64) -> i64 {
        let mut freed = 0;
        let _ = self
            .current_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                freed = bytes.min(current).max(0);
                Some(current - freed)
            });
        if freed != bytes {
            warn!(
                pool = %self.name,
                requested = bytes,
                freed,
                "free size exceeds outstanding bytes; clamping"
            );
        }
        self.shared.release(freed);
        freed
    }

    fn children_snapshot(&self) -> Vec<Arc<MemoryPool>> {
        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }
}

impl Drop for MemoryPool {
    fn drop(&mut self) {
        let outstanding = self.current_bytes.load(Ordering::Acquire);
        if outstanding > 0 {
            warn!(
                pool = %self.name,
                bytes = outstanding,
                "pool dropped with outstanding bytes"
            );
            let slot = self.tracker.get_mut().unwrap_or_else(PoisonError::into_inner);
            if let Some(t) = slot.as_ref() {
                t.update(-outstanding);
            }
            self.shared.release(outstanding);
        }
        if let Some(parent) = &self.parent {
            parent
                .children
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|w| w.strong_count() > 0);
        }
    }
}

impl std::fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPool")
            .field("name", &self.name)
            .field("current_bytes", &self.current_bytes())
            .field("peak_bytes", &self.max_bytes())
            .field("capped", &self.is_memory_capped())
            .field("child_count", &self.child_count())
            .finish()
    }
}

/// Point-in-time counters of a single pool.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStats {
    /// Diagnostic name.
    pub name: String,
    /// Bytes currently attributed to the pool.
    pub current_bytes: i64,
    /// High-water mark of current bytes.
    pub peak_bytes: i64,
    /// Local cap, if bounded.
    pub cap_bytes: Option<i64>,
    /// Whether the pool is manually capped.
    pub capped: bool,
    /// Live children.
    pub child_count: usize,
}

impl PoolStats {
    /// Returns a one-line human-readable summary.
    pub fn summary(&self) -> String {
        let cap = self
            .cap_bytes
            .map(crate::quota::format_bytes)
            .unwrap_or_else(|| "unbounded".to_string());
        format!(
            "pool '{}': current {}, peak {}, cap {}, {} children{}",
            self.name,
            crate::quota::format_bytes(self.current_bytes),
            crate::quota::format_bytes(self.peak_bytes),
            cap,
            self.child_count,
            if self.capped { ", capped" } else { "" },
        )
    }
}
