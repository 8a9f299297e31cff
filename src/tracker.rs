// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Usage trackers: byte aggregation independent of pool topology.
//!
//! A [`MemoryUsageTracker`] receives signed byte deltas from the pools it
//! is attached to and folds them up its *own* parent chain. The tracker
//! tree is deliberately independent of the pool tree: a query scope can
//! attach one tracker (or a family of child trackers) across sibling
//! pools owned by different operators and observe the aggregate, without
//! touching pool ownership.
//!
//! Trackers outlive pools. When a pool is destroyed, its outstanding
//! bytes are released from the attached tracker, so a tracker held after
//! teardown still reports an accurate post-free current and the
//! historical peak.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Accounting discipline of a tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerKind {
    /// Full accounting: every delta is applied with its sign.
    Full,
    /// Additive accounting: reallocation shrinkage is ignored. Explicit
    /// frees and detaches still decrease the count.
    Additive,
}

/// Aggregates current and peak user bytes along a logical hierarchy.
#[derive(Debug)]
pub struct MemoryUsageTracker {
    kind: TrackerKind,
    parent: Option<Arc<MemoryUsageTracker>>,
    current_user_bytes: AtomicI64,
    peak_total_bytes: AtomicI64,
}

impl MemoryUsageTracker {
    /// Creates a root tracker with full accounting.
    pub fn new() -> Arc<Self> {
        Self::with_kind(TrackerKind::Full, None)
    }

    /// Creates a root tracker that never shrinks on reallocation.
    pub fn new_simple() -> Arc<Self> {
        Self::with_kind(TrackerKind::Additive, None)
    }

    fn with_kind(kind: TrackerKind, parent: Option<Arc<MemoryUsageTracker>>) -> Arc<Self> {
        Arc::new(Self {
            kind,
            parent,
            current_user_bytes: AtomicI64::new(0),
            peak_total_bytes: AtomicI64::new(0),
        })
    }

    /// Creates a child tracker of the same kind. Deltas applied to the
    /// child are folded into this tracker as well.
    pub fn add_child(self: &Arc<Self>) -> Arc<Self> {
        Self::with_kind(self.kind, Some(Arc::clone(self)))
    }

    /// Applies a signed byte delta here and up the parent chain.
    pub fn update(&self, delta: i64) {
        if delta == 0 {
            return;
        }
        let now = self.current_user_bytes.fetch_add(delta, Ordering::AcqRel) + delta;
        debug_assert!(now >= 0, "tracker current went negative: {now}");
        self.peak_total_bytes.fetch_max(now, Ordering::AcqRel);
        if let Some(parent) = &self.parent {
            parent.update(delta);
        }
    }

    /// Applies a delta coming from a fused reallocation. Additive trackers
    /// drop the negative (shrink) case.
    pub(crate) fn update_reallocation(&self, delta: i64) {
        if delta < 0 && self.kind == TrackerKind::Additive {
            return;
        }
        self.update(delta);
    }

    /// Bytes currently attributed through this tracker.
    pub fn current_user_bytes(&self) -> i64 {
        self.current_user_bytes.load(Ordering::Acquire)
    }

    /// High-water mark of [`Self::current_user_bytes`] since creation.
    pub fn peak_total_bytes(&self) -> i64 {
        self.peak_total_bytes.load(Ordering::Acquire)
    }

    /// Accounting discipline of this tracker.
    pub fn kind(&self) -> TrackerKind {
        self.kind
    }

    /// Parent tracker, if this is not a root.
    pub fn parent(&self) -> Option<&Arc<MemoryUsageTracker>> {
        self.parent.as_ref()
    }
}
