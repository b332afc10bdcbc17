use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, TimeZone, Utc};

/// Source of wall-clock time for the flood detector.
pub trait Clock: Send + Sync {
    /// Time elapsed since the Unix epoch.
    fn now(&self) -> Duration;
}

/// Clock backed by the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
    }
}

/// Clock that only moves when told to. Used by tests and benches.
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    pub fn new(start: Duration) -> Self {
        Self {
            millis: AtomicU64::new(start.as_millis() as u64),
        }
    }

    pub fn set(&self, at: Duration) {
        self.millis.store(at.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.millis.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_millis(self.millis.load(Ordering::SeqCst))
    }
}

/// Convert a time since the Unix epoch into a UTC timestamp.
///
/// Times past chrono's range clamp to `DateTime::<Utc>::MAX_UTC`.
pub fn to_datetime(since_epoch: Duration) -> DateTime<Utc> {
    i64::try_from(since_epoch.as_millis())
        .ok()
        .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub fn format_endpoint_url(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/'))
}
