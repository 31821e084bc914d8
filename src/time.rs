use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::NaiveDate;

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Time source used by every component that needs "now".
///
/// Production code uses [`SystemClock`]; tests inject [`ManualClock`] so that
/// due-time, cooldown, and TTL behavior can be driven deterministically.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        now_ms()
    }
}

/// Manually-advanced clock for tests.
#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    ms: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn at(ms: u64) -> Self {
        let c = Self::default();
        c.set(ms);
        c
    }

    pub fn set(&self, ms: u64) {
        self.ms.store(ms, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: u64) {
        self.ms.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.ms.load(Ordering::SeqCst)
    }
}

/// Fresh opaque entity id.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// UTC calendar day for a millisecond timestamp. Used by the daily rollup.
pub fn utc_day(ts_ms: u64) -> NaiveDate {
    chrono::DateTime::from_timestamp_millis(ts_ms as i64)
        .map(|dt| dt.date_naive())
        .unwrap_or_default()
}
