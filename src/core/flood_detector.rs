//! Flood detection for the forwarder.
//!
//! Every inbound client packet and every new inbound connection passes
//! through [`FloodDetector::admit`]. Sources are counted in coarse one-second
//! buckets; a source that exceeds the per-second limit is blocked for a fixed
//! duration and a single alert is raised for the block transition.
//!
//! Per-source counters are never evicted and live for the whole process.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{info, warn};
use metrics::increment_counter;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::alert_dispatcher::{AlertSink, FloodAlert};
use crate::utils::{to_datetime, Clock, SystemClock};

/// Flood detection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FloodDetectionConfig {
    /// Packets (or new connections) allowed per source per second
    pub packets_per_second: u32,
    /// How long a flooding source stays blocked (seconds)
    pub block_seconds: u64,
}

impl Default for FloodDetectionConfig {
    fn default() -> Self {
        Self {
            packets_per_second: 50,
            block_seconds: 30,
        }
    }
}

/// Packets seen from one source in the current one-second window
#[derive(Debug, Clone, Copy)]
struct TrafficStats {
    count: u32,
    /// Whole second (since the epoch) the window belongs to
    window_start: u64,
}

#[derive(Debug, Clone, Copy)]
struct BlockEntry {
    unblock_at: Duration,
}

/// An active block, as reported to operators
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockedSource {
    pub ip: IpAddr,
    /// Seconds until the block lapses, rounded up
    pub unblock_in_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct DetectorStats {
    /// Sources with a traffic record
    pub tracked_sources: usize,
    /// Sources currently blocked
    pub blocked_sources: usize,
}

enum Verdict {
    Allow,
    Deny,
    Flood { rate: u32, unblock_at: Duration },
}

#[derive(Default)]
struct DetectorState {
    traffic: HashMap<IpAddr, TrafficStats>,
    blocked: HashMap<IpAddr, BlockEntry>,
}

impl DetectorState {
    fn evaluate(&mut self, ip: IpAddr, now: Duration, config: &FloodDetectionConfig) -> Verdict {
        if let Some(entry) = self.blocked.get(&ip) {
            if now < entry.unblock_at {
                return Verdict::Deny;
            }
            self.blocked.remove(&ip);
            info!("[DDoS] Unblocking IP: {}", ip);
        }

        let second = now.as_secs();
        let stats = self.traffic.entry(ip).or_insert(TrafficStats {
            count: 0,
            window_start: second,
        });

        if stats.window_start != second {
            stats.count = 1;
            stats.window_start = second;
        } else {
            stats.count = stats.count.saturating_add(1);
        }

        if stats.count > config.packets_per_second {
            let unblock_at = now
                .checked_add(Duration::from_secs(config.block_seconds))
                .unwrap_or(Duration::MAX);
            self.blocked.insert(ip, BlockEntry { unblock_at });
            return Verdict::Flood {
                rate: stats.count,
                unblock_at,
            };
        }

        Verdict::Allow
    }
}

/// Process-wide admission authority shared by every relay
pub struct FloodDetector {
    /// Flood detection configuration
    config: FloodDetectionConfig,
    clock: Arc<dyn Clock>,
    alerts: Arc<dyn AlertSink>,
    /// Traffic and block tables, behind a single lock
    state: Mutex<DetectorState>,
}

impl FloodDetector {
    /// Create a detector driven by the system clock
    pub fn new(config: FloodDetectionConfig, alerts: Arc<dyn AlertSink>) -> Self {
        Self::with_clock(config, alerts, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: FloodDetectionConfig,
        alerts: Arc<dyn AlertSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            clock,
            alerts,
            state: Mutex::new(DetectorState::default()),
        }
    }

    /// Decide whether traffic from `ip` may pass.
    ///
    /// Returns `false` while the source is blocked and for the packet that
    /// pushes it over the limit. The alert for a new block is handed to the
    /// sink after the lock is released.
    pub fn admit(&self, ip: IpAddr) -> bool {
        let now = self.clock.now();
        let verdict = self.lock_state().evaluate(ip, now, &self.config);

        match verdict {
            Verdict::Allow => {
                increment_counter!("forwarder_packets_admitted_total");
                true
            }
            Verdict::Deny => {
                increment_counter!("forwarder_packets_denied_total");
                false
            }
            Verdict::Flood { rate, unblock_at } => {
                warn!(
                    "[DDoS] FLOOD DETECTED from {}! Rate: {} pps. Blocking for {}s.",
                    ip, rate, self.config.block_seconds
                );
                increment_counter!("forwarder_packets_denied_total");
                increment_counter!("forwarder_blocks_total");

                self.alerts.notify(FloodAlert {
                    id: Uuid::new_v4(),
                    ip,
                    rate,
                    blocked_at: to_datetime(now),
                    unblock_at: to_datetime(unblock_at),
                });
                false
            }
        }
    }

    /// Snapshot of blocks that are still in effect
    pub fn blocked_sources(&self) -> Vec<BlockedSource> {
        let now = self.clock.now();
        let state = self.lock_state();

        let mut blocked: Vec<BlockedSource> = state
            .blocked
            .iter()
            .filter(|(_, entry)| now < entry.unblock_at)
            .map(|(ip, entry)| {
                let remaining = entry.unblock_at - now;
                let mut secs = remaining.as_secs();
                if remaining.subsec_nanos() > 0 {
                    secs += 1;
                }
                BlockedSource {
                    ip: *ip,
                    unblock_in_secs: secs,
                }
            })
            .collect();
        blocked.sort_by_key(|b| b.ip);
        blocked
    }

    /// Lift a block ahead of time.
    ///
    /// Also forgets the source's traffic record so its next packet opens a
    /// fresh window. Returns whether an active block was lifted.
    pub fn unblock(&self, ip: IpAddr) -> bool {
        let now = self.clock.now();
        let mut state = self.lock_state();

        state.traffic.remove(&ip);
        let lifted = matches!(state.blocked.remove(&ip), Some(entry) if now < entry.unblock_at);
        drop(state);

        if lifted {
            info!("[DDoS] Block on {} lifted by operator", ip);
        }
        lifted
    }

    pub fn stats(&self) -> DetectorStats {
        let now = self.clock.now();
        let state = self.lock_state();

        DetectorStats {
            tracked_sources: state.traffic.len(),
            blocked_sources: state
                .blocked
                .values()
                .filter(|entry| now < entry.unblock_at)
                .count(),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, DetectorState> {
        // The tables stay consistent even if a holder panicked
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::alert_dispatcher::MockAlertSink;
    use crate::core::test_utils::RecordingSink;
    use crate::utils::ManualClock;
    use std::net::Ipv4Addr;
    use std::thread;

    const START: Duration = Duration::from_secs(1_700_000_000);

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    fn detector_with(
        limit: u32,
        block_seconds: u64,
        alerts: Arc<dyn AlertSink>,
    ) -> (FloodDetector, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(START));
        let config = FloodDetectionConfig {
            packets_per_second: limit,
            block_seconds,
        };
        (FloodDetector::with_clock(config, alerts, clock.clone()), clock)
    }

    #[test]
    fn test_sources_at_the_limit_are_admitted() {
        let mut sink = MockAlertSink::new();
        sink.expect_notify().times(0);
        let (detector, clock) = detector_with(50, 30, Arc::new(sink));

        for _ in 0..50 {
            assert!(detector.admit(ip(1)));
            clock.advance(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_flood_blocks_and_alerts_once() {
        let mut sink = MockAlertSink::new();
        sink.expect_notify()
            .withf(|alert: &FloodAlert| alert.ip == IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)) && alert.rate == 51)
            .times(1)
            .return_const(());
        let (detector, _clock) = detector_with(50, 30, Arc::new(sink));

        let admitted = (0..60).filter(|_| detector.admit(ip(1))).count();

        assert_eq!(admitted, 50);
        assert_eq!(detector.stats().blocked_sources, 1);
    }

    #[test]
    fn test_block_lasts_for_block_duration() {
        let sink = Arc::new(RecordingSink::default());
        let (detector, clock) = detector_with(50, 30, sink.clone());

        for _ in 0..51 {
            detector.admit(ip(1));
        }
        let blocked_at = clock.now();

        clock.set(blocked_at + Duration::from_secs(29));
        assert!(!detector.admit(ip(1)));
        clock.set(blocked_at + Duration::from_millis(29_999));
        assert!(!detector.admit(ip(1)));

        clock.set(blocked_at + Duration::from_millis(30_001));
        assert!(detector.admit(ip(1)));
        assert!(detector.blocked_sources().is_empty());

        // Denied packets while blocked raise no further alerts
        let alerts = sink.alerts();
        assert_eq!(alerts.len(), 1);
        let alert = &alerts[0];
        assert_eq!((alert.unblock_at - alert.blocked_at).num_seconds(), 30);
    }

    #[test]
    fn test_window_rollover_resets_count() {
        let sink = Arc::new(RecordingSink::default());
        let (detector, clock) = detector_with(50, 30, sink.clone());

        for _ in 0..50 {
            assert!(detector.admit(ip(1)));
        }
        clock.advance(Duration::from_secs(1));

        // Fresh window: another full quota is admitted
        for _ in 0..50 {
            assert!(detector.admit(ip(1)));
        }
        assert!(!detector.admit(ip(1)));
        assert_eq!(sink.alerts().len(), 1);
    }

    #[test]
    fn test_burst_straddling_boundary_is_accepted() {
        let sink = Arc::new(RecordingSink::default());
        let (detector, clock) = detector_with(50, 30, sink.clone());
        clock.set(START + Duration::from_millis(900));

        for _ in 0..50 {
            assert!(detector.admit(ip(1)));
        }
        clock.set(START + Duration::from_millis(1_100));
        for _ in 0..50 {
            assert!(detector.admit(ip(1)));
        }
        assert!(sink.alerts().is_empty());
    }

    #[test]
    fn test_blocked_source_does_not_affect_others() {
        let sink = Arc::new(RecordingSink::default());
        let (detector, clock) = detector_with(50, 30, sink.clone());

        for i in 0..120 {
            let flooder = detector.admit(ip(1));
            if i % 4 == 0 {
                assert!(detector.admit(ip(2)), "well-behaved source was denied");
            }
            if i >= 50 {
                assert!(!flooder);
            }
            clock.advance(Duration::from_millis(5));
        }

        let alerts = sink.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].ip, ip(1));
    }

    #[test]
    fn test_unblock_lifts_block_and_resets_window() {
        let sink = Arc::new(RecordingSink::default());
        let (detector, clock) = detector_with(5, 30, sink);

        for _ in 0..6 {
            detector.admit(ip(7));
        }
        clock.advance(Duration::from_millis(2_500));
        assert_eq!(
            detector.blocked_sources(),
            vec![BlockedSource {
                ip: ip(7),
                unblock_in_secs: 28
            }]
        );

        assert!(detector.unblock(ip(7)));
        assert!(!detector.unblock(ip(7)));
        assert!(!detector.unblock(ip(8)));

        for _ in 0..5 {
            assert!(detector.admit(ip(7)));
        }
    }

    #[test]
    fn test_stats_count_tracked_and_blocked_sources() {
        let sink = Arc::new(RecordingSink::default());
        let (detector, clock) = detector_with(2, 10, sink);

        detector.admit(ip(1));
        detector.admit(ip(2));
        for _ in 0..3 {
            detector.admit(ip(3));
        }

        assert_eq!(
            detector.stats(),
            DetectorStats {
                tracked_sources: 3,
                blocked_sources: 1
            }
        );

        clock.advance(Duration::from_secs(11));
        assert_eq!(detector.stats().blocked_sources, 0);
        // Traffic records are kept for the life of the process
        assert_eq!(detector.stats().tracked_sources, 3);
    }

    #[test]
    fn test_oversized_block_duration_saturates() {
        let sink = Arc::new(RecordingSink::default());
        let (detector, clock) = detector_with(1, u64::MAX, sink.clone());

        assert!(detector.admit(ip(1)));
        assert!(!detector.admit(ip(1)));

        clock.advance(Duration::from_secs(365 * 24 * 3600));
        assert!(!detector.admit(ip(1)));
        assert_eq!(detector.stats().blocked_sources, 1);
        assert_eq!(sink.alerts().len(), 1);
    }

    #[test]
    fn test_concurrent_flood_alerts_once() {
        let sink = Arc::new(RecordingSink::default());
        let (detector, _clock) = detector_with(50, 30, sink.clone());
        let detector = Arc::new(detector);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let detector = Arc::clone(&detector);
                thread::spawn(move || (0..25).filter(|_| detector.admit(ip(9))).count())
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        assert_eq!(admitted, 50);
        assert_eq!(sink.alerts().len(), 1);
        assert_eq!(sink.alerts()[0].rate, 51);
    }
}
