//! Adaptive transmission rate control
//!
//! Keeps the outbound send frequency within a configured [min, max] window,
//! stepping it down under high latency or loss and back up when the link is
//! healthy. High and low thresholds are distinct so the rate does not
//! oscillate around a single cutoff.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::util::time::{Timer, STATS_EPOCH};

/// Source of link-quality estimates, injected by the transport layer
pub trait LinkMeasurement {
    /// Current round-trip latency estimate (milliseconds)
    fn latency_ms(&self) -> f32;
    /// Current packet-loss ratio in [0, 1]
    fn packet_loss(&self) -> f32;
}

/// Rate controller tuning knobs
#[derive(Debug, Clone)]
pub struct RateTuning {
    /// Floor for the outbound send rate (Hz)
    pub min_rate: f32,
    /// Ceiling for the outbound send rate (Hz)
    pub max_rate: f32,
    /// Fixed adjustment step per decision (Hz)
    pub step: f32,
    /// Latency above this decreases the rate (ms)
    pub high_latency_ms: f32,
    /// Latency below this allows increasing the rate (ms)
    pub low_latency_ms: f32,
    /// Loss ratio above this decreases the rate
    pub high_loss: f32,
    /// Loss ratio below this allows increasing the rate
    pub low_loss: f32,
    /// Statistics epoch length
    pub epoch: Duration,
}

impl Default for RateTuning {
    fn default() -> Self {
        Self {
            min_rate: 5.0,
            max_rate: 20.0,
            step: 1.0,
            high_latency_ms: 200.0,
            low_latency_ms: 100.0,
            high_loss: 0.05,
            low_loss: 0.01,
            epoch: STATS_EPOCH,
        }
    }
}

/// One epoch's worth of link statistics
#[derive(Debug, Clone, Serialize)]
pub struct NetworkStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Combined send+receive throughput over the epoch (bytes/second)
    pub bandwidth_bytes_per_sec: f64,
    pub latency_ms: f32,
    pub packet_loss: f32,
    pub send_rate: f32,
    pub epoch_secs: f64,
}

/// Outbound rate controller with per-epoch statistics.
#[derive(Debug)]
pub struct TransmissionController {
    tuning: RateTuning,
    current_rate: f32,
    bytes_sent: u64,
    bytes_received: u64,
    epoch_timer: Timer,
    stats_tx: broadcast::Sender<NetworkStats>,
}

impl TransmissionController {
    pub fn new(tuning: RateTuning) -> Self {
        let (stats_tx, _) = broadcast::channel(16);
        let current_rate = tuning.max_rate;
        Self {
            tuning,
            current_rate,
            bytes_sent: 0,
            bytes_received: 0,
            epoch_timer: Timer::new(),
            stats_tx,
        }
    }

    /// Subscribe to per-epoch statistics snapshots
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkStats> {
        self.stats_tx.subscribe()
    }

    /// Account an outbound payload
    pub fn record_sent(&mut self, bytes: usize) {
        self.bytes_sent += bytes as u64;
    }

    /// Account an inbound payload
    pub fn record_received(&mut self, bytes: usize) {
        self.bytes_received += bytes as u64;
    }

    /// Re-evaluate the send rate from current link measurements.
    ///
    /// Decrease on high latency OR high loss, increase only when both are
    /// low, hold in between. Returns the rate now in effect.
    pub fn adjust_rate(&mut self, link: &dyn LinkMeasurement) -> f32 {
        let latency = link.latency_ms();
        let loss = link.packet_loss();

        if latency > self.tuning.high_latency_ms || loss > self.tuning.high_loss {
            let next = (self.current_rate - self.tuning.step).max(self.tuning.min_rate);
            if next < self.current_rate {
                debug!(latency_ms = latency, loss, rate = next, "decreasing send rate");
            }
            self.current_rate = next;
        } else if latency < self.tuning.low_latency_ms && loss < self.tuning.low_loss {
            let next = (self.current_rate + self.tuning.step).min(self.tuning.max_rate);
            if next > self.current_rate {
                debug!(latency_ms = latency, loss, rate = next, "increasing send rate");
            }
            self.current_rate = next;
        }

        self.current_rate
    }

    /// Close the statistics epoch if it has elapsed, emitting a snapshot to
    /// subscribers and resetting the byte counters.
    pub fn poll_epoch(&mut self, link: &dyn LinkMeasurement) -> Option<NetworkStats> {
        let elapsed = self.epoch_timer.elapsed();
        if elapsed < self.tuning.epoch {
            return None;
        }
        self.epoch_timer.reset();
        Some(self.end_epoch(elapsed, link.latency_ms(), link.packet_loss()))
    }

    /// Compute one epoch's statistics from the counters, reset them, and
    /// fan the snapshot out to subscribers
    fn end_epoch(&mut self, elapsed: Duration, latency_ms: f32, packet_loss: f32) -> NetworkStats {
        let epoch_secs = elapsed.as_secs_f64().max(f64::EPSILON);
        let stats = NetworkStats {
            bytes_sent: self.bytes_sent,
            bytes_received: self.bytes_received,
            bandwidth_bytes_per_sec: (self.bytes_sent + self.bytes_received) as f64 / epoch_secs,
            latency_ms,
            packet_loss,
            send_rate: self.current_rate,
            epoch_secs,
        };
        self.bytes_sent = 0;
        self.bytes_received = 0;
        let _ = self.stats_tx.send(stats.clone());
        stats
    }

    /// Rate currently in effect (Hz)
    pub fn current_rate(&self) -> f32 {
        self.current_rate
    }

    /// Interval between outbound sends at the current rate
    pub fn send_interval(&self) -> Duration {
        Duration::from_secs_f32(1.0 / self.current_rate.max(0.001))
    }
}

/// Link measurement fed by envelope ping/pong round trips.
///
/// Latency is an exponentially-weighted moving average of observed RTTs;
/// loss is the fraction of pings that went unanswered in the last window.
#[derive(Debug, Default)]
pub struct PingMeter {
    latency_ms: f32,
    packet_loss: f32,
    pings_sent: u32,
    pongs_received: u32,
}

/// EWMA weight for new RTT samples
const RTT_ALPHA: f32 = 0.2;

impl PingMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_ping_sent(&mut self) {
        self.pings_sent += 1;
    }

    pub fn on_pong(&mut self, rtt_ms: f32) {
        self.pongs_received += 1;
        if self.latency_ms == 0.0 {
            self.latency_ms = rtt_ms;
        } else {
            self.latency_ms += RTT_ALPHA * (rtt_ms - self.latency_ms);
        }
    }

    /// Roll the loss window: recompute the loss ratio from the counters and
    /// start a fresh window. Called once per statistics epoch.
    pub fn roll_window(&mut self) {
        if self.pings_sent > 0 {
            let answered = self.pongs_received.min(self.pings_sent);
            self.packet_loss = 1.0 - answered as f32 / self.pings_sent as f32;
        }
        self.pings_sent = 0;
        self.pongs_received = 0;
    }
}

impl LinkMeasurement for PingMeter {
    fn latency_ms(&self) -> f32 {
        self.latency_ms
    }

    fn packet_loss(&self) -> f32 {
        self.packet_loss
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedLink {
        latency_ms: f32,
        loss: f32,
    }

    impl LinkMeasurement for FixedLink {
        fn latency_ms(&self) -> f32 {
            self.latency_ms
        }

        fn packet_loss(&self) -> f32 {
            self.loss
        }
    }

    #[test]
    fn sustained_bad_link_converges_to_min_rate() {
        let mut controller = TransmissionController::new(RateTuning::default());
        let link = FixedLink {
            latency_ms: 350.0,
            loss: 0.2,
        };

        let mut previous = controller.current_rate();
        for _ in 0..100 {
            let rate = controller.adjust_rate(&link);
            assert!(rate <= previous, "rate must decrease monotonically");
            previous = rate;
        }
        assert_eq!(controller.current_rate(), controller.tuning.min_rate);
    }

    #[test]
    fn sustained_good_link_converges_to_max_rate() {
        let tuning = RateTuning::default();
        let mut controller = TransmissionController::new(tuning.clone());
        // Push the rate down first
        let bad = FixedLink {
            latency_ms: 500.0,
            loss: 0.5,
        };
        for _ in 0..100 {
            controller.adjust_rate(&bad);
        }

        let good = FixedLink {
            latency_ms: 20.0,
            loss: 0.0,
        };
        let mut previous = controller.current_rate();
        for _ in 0..100 {
            let rate = controller.adjust_rate(&good);
            assert!(rate >= previous, "rate must increase monotonically");
            previous = rate;
        }
        assert_eq!(controller.current_rate(), tuning.max_rate);
    }

    #[test]
    fn hysteresis_band_holds_the_rate() {
        let mut controller = TransmissionController::new(RateTuning::default());
        let bad = FixedLink {
            latency_ms: 500.0,
            loss: 0.0,
        };
        controller.adjust_rate(&bad);
        let settled = controller.current_rate();

        // Latency between the low and high thresholds: neither branch fires
        let middling = FixedLink {
            latency_ms: 150.0,
            loss: 0.0,
        };
        for _ in 0..20 {
            assert_eq!(controller.adjust_rate(&middling), settled);
        }
    }

    #[test]
    fn loss_alone_decreases_rate() {
        let mut controller = TransmissionController::new(RateTuning::default());
        let lossy = FixedLink {
            latency_ms: 20.0,
            loss: 0.3,
        };
        let before = controller.current_rate();
        assert!(controller.adjust_rate(&lossy) < before);
    }

    #[test]
    fn epoch_reports_bandwidth_and_resets_counters() {
        let mut controller = TransmissionController::new(RateTuning::default());
        controller.record_sent(600);
        controller.record_received(400);

        let stats = controller.end_epoch(Duration::from_secs(1), 50.0, 0.0);
        assert_eq!(stats.bytes_sent, 600);
        assert_eq!(stats.bytes_received, 400);
        assert!((stats.bandwidth_bytes_per_sec - 1000.0).abs() < 1.0);

        let empty = controller.end_epoch(Duration::from_secs(1), 50.0, 0.0);
        assert_eq!(empty.bytes_sent, 0);
        assert_eq!(empty.bytes_received, 0);
    }

    #[test]
    fn epoch_stats_reach_subscribers() {
        let mut controller = TransmissionController::new(RateTuning::default());
        let mut stats_rx = controller.subscribe();
        controller.record_sent(128);
        controller.end_epoch(Duration::from_secs(1), 42.0, 0.01);

        let stats = stats_rx.try_recv().unwrap();
        assert_eq!(stats.bytes_sent, 128);
        assert!((stats.latency_ms - 42.0).abs() < f32::EPSILON);
    }

    #[test]
    fn ping_meter_tracks_latency_and_loss() {
        let mut meter = PingMeter::new();
        for _ in 0..10 {
            meter.on_ping_sent();
        }
        for _ in 0..8 {
            meter.on_pong(100.0);
        }
        meter.roll_window();

        assert!((meter.latency_ms() - 100.0).abs() < 1e-3);
        assert!((meter.packet_loss() - 0.2).abs() < 1e-6);

        // Next window with full delivery clears the loss estimate
        meter.on_ping_sent();
        meter.on_pong(100.0);
        meter.roll_window();
        assert!(meter.packet_loss().abs() < 1e-6);
    }
}
