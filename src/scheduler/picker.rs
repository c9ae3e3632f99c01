//! Pluggable pending-queue ordering.
//!
//! The engine loads and filters the queue; a picker only decides which of the
//! admissible sessions goes next. The queue arrives pre-sorted by
//! `(priority desc, created_at asc, id asc)`, which makes FIFO trivial and
//! keeps every picker deterministic.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use rust_decimal::Decimal;

use crate::resource::ResourceSlot;
use crate::state::SessionWithKernels;
use crate::types::{AccessKey, SessionId, SessionPickerKind};

/// Cluster-level context for one pick.
#[derive(Debug, Clone, Default)]
pub struct PickContext {
    /// Total free capacity of the resource group.
    pub total_capacity: ResourceSlot,
    /// Occupancy of admitted sessions per access key (DRF input).
    pub occupancy_by_key: BTreeMap<AccessKey, ResourceSlot>,
}

/// Chooses the next session from the admissible queue.
pub trait SessionPicker: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Pick one session, or `None` when the queue is empty.
    fn pick_session(
        &self,
        ctx: &PickContext,
        pending: &[SessionWithKernels],
    ) -> Option<SessionId>;
}

/// First-in-first-out within priority buckets: the queue order itself.
#[derive(Debug, Default)]
pub struct FifoSessionPicker;

impl SessionPicker for FifoSessionPicker {
    fn name(&self) -> &'static str {
        "fifo"
    }

    fn pick_session(
        &self,
        _ctx: &PickContext,
        pending: &[SessionWithKernels],
    ) -> Option<SessionId> {
        pending.first().map(|s| s.session.id.clone())
    }
}

/// Last-in-first-out: the newest session in the top priority bucket.
#[derive(Debug, Default)]
pub struct LifoSessionPicker;

impl SessionPicker for LifoSessionPicker {
    fn name(&self) -> &'static str {
        "lifo"
    }

    fn pick_session(
        &self,
        _ctx: &PickContext,
        pending: &[SessionWithKernels],
    ) -> Option<SessionId> {
        let top_priority = pending.first()?.session.priority;
        pending
            .iter()
            .take_while(|s| s.session.priority == top_priority)
            .max_by(|a, b| {
                a.session
                    .created_at
                    .cmp(&b.session.created_at)
                    .then_with(|| b.session.id.cmp(&a.session.id))
            })
            .map(|s| s.session.id.clone())
    }
}

/// Dominant-resource fairness within the top priority bucket: the access key
/// with the smallest dominant share goes first.
#[derive(Debug, Default)]
pub struct DrfSessionPicker;

impl DrfSessionPicker {
    fn dominant_share(ctx: &PickContext, access_key: &AccessKey) -> Decimal {
        let Some(occupancy) = ctx.occupancy_by_key.get(access_key) else {
            return Decimal::ZERO;
        };
        let mut share = Decimal::ZERO;
        for (name, capacity) in ctx.total_capacity.iter() {
            if capacity.is_zero() {
                continue;
            }
            let used = occupancy.get(name);
            if !used.is_zero() {
                share = share.max(used / capacity);
            }
        }
        share
    }
}

impl SessionPicker for DrfSessionPicker {
    fn name(&self) -> &'static str {
        "drf"
    }

    fn pick_session(
        &self,
        ctx: &PickContext,
        pending: &[SessionWithKernels],
    ) -> Option<SessionId> {
        let top_priority = pending.first()?.session.priority;
        pending
            .iter()
            .take_while(|s| s.session.priority == top_priority)
            .min_by(|a, b| {
                Self::dominant_share(ctx, &a.session.access_key)
                    .cmp(&Self::dominant_share(ctx, &b.session.access_key))
                // Queue order breaks ties (stable min_by keeps the earlier).
            })
            .map(|s| s.session.id.clone())
    }
}

/// Build a picker from its configured kind.
pub fn create_session_picker(kind: SessionPickerKind) -> Arc<dyn SessionPicker> {
    match kind {
        SessionPickerKind::Fifo => Arc::new(FifoSessionPicker),
        SessionPickerKind::Lifo => Arc::new(LifoSessionPicker),
        SessionPickerKind::Drf => Arc::new(DrfSessionPicker),
    }
}
