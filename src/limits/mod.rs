//! Rate limiting and admission control.
//!
//! Two dimensions per project: a per-minute token bucket checked before any
//! normalization-heavy work, and a monthly request counter checked after
//! normalization (so the event carries accurate endpoint attribution).
//! Cache hits count against both; that is the documented product policy,
//! not an accident.
//!
//! Buckets use atomic arithmetic on the hot path. The monthly counter is
//! in-process here; the control plane reconciles it with durable storage
//! out-of-band.

use std::sync::{
    Arc,
    atomic::{AtomicI64, AtomicU64, Ordering},
};

use chrono::{Datelike, TimeZone, Utc};
use dashmap::DashMap;

use crate::{error::ApiError, observability::metrics, registry::Project};

/// Sub-token resolution so fractional refill keeps precision.
const MICRO: i64 = 1_000_000;

/// Per-minute token bucket. Capacity equals the per-minute limit; refill is
/// continuous at limit/60s.
struct MinuteBucket {
    microtokens: AtomicI64,
    last_refill_ms: AtomicI64,
    capacity_micro: i64,
    refill_per_ms_micro: i64,
}

impl MinuteBucket {
    fn new(per_minute_limit: u32, now_ms: i64) -> Self {
        let capacity_micro = i64::from(per_minute_limit) * MICRO;
        Self {
            microtokens: AtomicI64::new(capacity_micro),
            last_refill_ms: AtomicI64::new(now_ms),
            capacity_micro,
            refill_per_ms_micro: capacity_micro / 60_000,
        }
    }

    /// Take one token. On an empty bucket, returns the seconds until one
    /// token will have refilled.
    fn try_acquire(&self, now_ms: i64) -> Result<(), u64> {
        // Claim the elapsed interval with a CAS so concurrent refills do
        // not double-count the same wall-clock time.
        let last = self.last_refill_ms.load(Ordering::Acquire);
        if now_ms > last
            && self
                .last_refill_ms
                .compare_exchange(last, now_ms, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        {
            let refill = (now_ms - last).saturating_mul(self.refill_per_ms_micro);
            let _ = self
                .microtokens
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |tokens| {
                    Some((tokens.saturating_add(refill)).min(self.capacity_micro))
                });
        }

        let taken = self
            .microtokens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |tokens| {
                (tokens >= MICRO).then_some(tokens - MICRO)
            });

        match taken {
            Ok(_) => Ok(()),
            Err(tokens) => {
                let deficit_micro = MICRO - tokens.max(0);
                let ms_needed = if self.refill_per_ms_micro > 0 {
                    (deficit_micro + self.refill_per_ms_micro - 1) / self.refill_per_ms_micro
                } else {
                    60_000
                };
                Err((ms_needed as u64).div_ceil(1000).max(1))
            }
        }
    }
}

/// Per-project monthly request counter, keyed by the UTC month window.
struct MonthlyCounter {
    window: String,
    count: AtomicU64,
}

/// Admission control over both limit dimensions.
pub struct RateLimiter {
    buckets: DashMap<String, Arc<MinuteBucket>>,
    monthly: DashMap<String, Arc<MonthlyCounter>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
            monthly: DashMap::new(),
        }
    }

    /// Per-minute admission. Runs before normalization.
    pub fn check_minute(&self, project: &Project) -> Result<(), ApiError> {
        let now_ms = Utc::now().timestamp_millis();
        let bucket = self
            .buckets
            .entry(project.id.clone())
            .or_insert_with(|| Arc::new(MinuteBucket::new(project.per_minute_limit, now_ms)))
            .clone();

        match bucket.try_acquire(now_ms) {
            Ok(()) => {
                metrics::record_rate_limit("minute", "allowed");
                Ok(())
            }
            Err(retry_after) => {
                metrics::record_rate_limit("minute", "rejected");
                Err(ApiError::rate_limited(
                    format!(
                        "Rate limit exceeded: {} requests per minute",
                        project.per_minute_limit
                    ),
                    retry_after,
                ))
            }
        }
    }

    /// Monthly quota. Runs after normalization; every admitted request
    /// (cache hits included) counts.
    pub fn check_monthly(&self, project: &Project) -> Result<(), ApiError> {
        let now = Utc::now();
        let window = now.format("%Y-%m").to_string();

        let counter = {
            let mut slot = self
                .monthly
                .entry(project.id.clone())
                .or_insert_with(|| {
                    Arc::new(MonthlyCounter {
                        window: window.clone(),
                        count: AtomicU64::new(0),
                    })
                });
            if slot.window != window {
                // Month rolled over; start a fresh counter.
                *slot = Arc::new(MonthlyCounter {
                    window: window.clone(),
                    count: AtomicU64::new(0),
                });
            }
            Arc::clone(&slot)
        };

        let admitted = counter
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count < project.monthly_request_limit).then_some(count + 1)
            });

        match admitted {
            Ok(_) => {
                metrics::record_rate_limit("monthly", "allowed");
                Ok(())
            }
            Err(_) => {
                metrics::record_rate_limit("monthly", "rejected");
                Err(ApiError::rate_limited(
                    format!(
                        "Monthly request limit of {} exceeded for plan {}",
                        project.monthly_request_limit,
                        project.plan.as_str()
                    ),
                    seconds_until_next_month(now),
                ))
            }
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

fn seconds_until_next_month(now: chrono::DateTime<Utc>) -> u64 {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    let next = Utc
        .with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .unwrap_or(now);
    (next - now).num_seconds().max(1) as u64
}
