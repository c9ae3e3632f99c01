//! Fair-share usage aggregation.
//!
//! Converts live kernel occupancy into immutable five-minute usage slices.
//! Slice boundaries align to the wall clock; only the first slice of a
//! kernel (at `starts_at`) and the last one (at `terminated_at`) may be
//! partial. The aggregator is pure computation: persistence and observation
//! write-back belong to the caller.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::resource::ResourceSlot;
use crate::types::{KernelId, Result, SessionId};

/// Length of one accounting slice.
pub const SLICE_DURATION_SECONDS: i64 = 300;

/// Largest boundary instant `<= t`. A boundary is any wall-clock instant on
/// a five-minute mark. Idempotent.
pub fn floor_to_boundary(t: DateTime<Utc>) -> DateTime<Utc> {
    let secs = t.timestamp();
    let floored = secs - secs.rem_euclid(SLICE_DURATION_SECONDS);
    DateTime::from_timestamp(floored, 0).unwrap_or(t)
}

/// What the aggregator reads per kernel: lifecycle timestamps and occupancy,
/// plus the ownership scope stamped onto every slice.
#[derive(Debug, Clone)]
pub struct KernelUsageObservation {
    pub kernel_id: KernelId,
    pub session_id: SessionId,
    pub occupied_slots: ResourceSlot,
    pub starts_at: DateTime<Utc>,
    pub last_observed_at: Option<DateTime<Utc>>,
    pub terminated_at: Option<DateTime<Utc>>,
    pub domain: String,
    pub project: String,
    pub user: String,
}

/// One usage slice, ready for persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSliceSpec {
    pub kernel_id: KernelId,
    pub session_id: SessionId,
    pub scaling_group: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    /// Resource-seconds: occupancy times slice length, component-wise.
    pub resource_usage: ResourceSlot,
    pub domain: String,
    pub project: String,
    pub user: String,
}

/// Result of one aggregation pass.
#[derive(Debug, Clone, Default)]
pub struct UsageAggregation {
    pub specs: Vec<UsageSliceSpec>,
    /// New `last_observed_at` per kernel, for the caller to write back.
    pub observation_times: BTreeMap<KernelId, DateTime<Utc>>,
    pub observed_count: usize,
}

/// Pure slicer over kernel observations.
#[derive(Debug, Clone, Copy, Default)]
pub struct FairShareAggregator;

impl FairShareAggregator {
    pub fn new() -> Self {
        Self
    }

    /// Slice every kernel's unaccounted occupancy up to `now`.
    pub fn prepare_usage_records(
        &self,
        kernels: &[KernelUsageObservation],
        scaling_group: &str,
        now: DateTime<Utc>,
    ) -> UsageAggregation {
        let mut aggregation = UsageAggregation::default();
        for kernel in kernels {
            let (specs, last_observed_at) =
                self.prepare_kernel_usage_specs(kernel, scaling_group, now);
            aggregation.observed_count += 1;
            if let Some(observed_at) = last_observed_at {
                aggregation
                    .observation_times
                    .insert(kernel.kernel_id.clone(), observed_at);
            }
            aggregation.specs.extend(specs);
        }
        aggregation
    }

    /// Slices for one kernel plus its new observation time.
    ///
    /// A running kernel is sliced up to the last boundary before `now`; a
    /// terminated kernel up to `terminated_at`, which may end mid-slice.
    fn prepare_kernel_usage_specs(
        &self,
        kernel: &KernelUsageObservation,
        scaling_group: &str,
        now: DateTime<Utc>,
    ) -> (Vec<UsageSliceSpec>, Option<DateTime<Utc>>) {
        let start = kernel.last_observed_at.unwrap_or(kernel.starts_at);
        let end = match kernel.terminated_at {
            Some(terminated_at) => terminated_at.min(now),
            None => floor_to_boundary(now),
        };
        if end <= start {
            return (Vec::new(), kernel.last_observed_at);
        }
        let specs = self.generate_slice_specs(kernel, scaling_group, start, end);
        let last_observed_at = specs
            .last()
            .map(|s| s.period_end)
            .or(kernel.last_observed_at);
        (specs, last_observed_at)
    }

    /// Split `[start_time, end_time)` on boundaries; consecutive slices are
    /// contiguous by construction.
    fn generate_slice_specs(
        &self,
        kernel: &KernelUsageObservation,
        scaling_group: &str,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Vec<UsageSliceSpec> {
        let mut specs = Vec::new();
        let mut cursor = start_time;
        while cursor < end_time {
            let next_boundary = floor_to_boundary(cursor) + Duration::seconds(SLICE_DURATION_SECONDS);
            let slice_end = next_boundary.min(end_time);
            let seconds = (slice_end - cursor).num_seconds();
            specs.push(UsageSliceSpec {
                kernel_id: kernel.kernel_id.clone(),
                session_id: kernel.session_id.clone(),
                scaling_group: scaling_group.to_string(),
                period_start: cursor,
                period_end: slice_end,
                resource_usage: kernel.occupied_slots.scaled(Decimal::from(seconds)),
                domain: kernel.domain.clone(),
                project: kernel.project.clone(),
                user: kernel.user.clone(),
            });
            cursor = slice_end;
        }
        specs
    }
}

/// Persistence seam for usage slices.
#[async_trait]
pub trait UsageRecordStore: Send + Sync + fmt::Debug {
    /// Upsert slices keyed by `(kernel_id, period_start)`.
    async fn insert_slices(&self, specs: &[UsageSliceSpec]) -> Result<()>;
}

/// In-memory slice store for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryUsageRecordStore {
    slices: RwLock<BTreeMap<(KernelId, DateTime<Utc>), UsageSliceSpec>>,
}

impl InMemoryUsageRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> Vec<UsageSliceSpec> {
        self.slices.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl UsageRecordStore for InMemoryUsageRecordStore {
    async fn insert_slices(&self, specs: &[UsageSliceSpec]) -> Result<()> {
        let mut slices = self.slices.write().await;
        for spec in specs {
            slices.insert((spec.kernel_id.clone(), spec.period_start), spec.clone());
        }
        Ok(())
    }
}
