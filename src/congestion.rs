//! Fixed-rate congestion control for the negotiated rate contract.
//!
//! The server hello grants the client a send rate; the controller keeps the
//! congestion window pinned at that rate regardless of loss. quinn fixes the
//! controller factory at dial time, so the factory carries a shared rate
//! cell that the handshake fills in once the grant is known, before any
//! user dial can return.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use quinn_proto::congestion::{Controller, ControllerFactory};
use quinn_proto::RttEstimator;

/// Compensates for ack aggregation so the window does not starve the pacer.
const WINDOW_MULTIPLIER: f64 = 1.5;

/// Window floor, in packets.
const MIN_WINDOW_PACKETS: u64 = 16;

/// RTT assumed until the first ack arrives.
const DEFAULT_RTT: Duration = Duration::from_millis(100);

/// Shared bits-per-second cap.
#[derive(Debug, Default)]
pub struct RateCell(AtomicU64);

impl RateCell {
    pub fn new(bps: u64) -> Arc<Self> {
        Arc::new(Self(AtomicU64::new(bps)))
    }

    pub fn set(&self, bps: u64) {
        self.0.store(bps, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Fixed-rate sender: window tracks rate × RTT and never backs off on loss.
#[derive(Debug, Clone)]
pub struct Brutal {
    rate: Arc<RateCell>,
    mtu: u16,
    srtt: Duration,
}

impl Brutal {
    fn new(rate: Arc<RateCell>, current_mtu: u16) -> Self {
        Self {
            rate,
            mtu: current_mtu,
            srtt: DEFAULT_RTT,
        }
    }

    fn floor(&self) -> u64 {
        MIN_WINDOW_PACKETS * self.mtu as u64
    }
}

impl Controller for Brutal {
    fn on_ack(
        &mut self,
        _now: Instant,
        _sent: Instant,
        _bytes: u64,
        _app_limited: bool,
        rtt: &RttEstimator,
    ) {
        self.srtt = rtt.get();
    }

    fn on_congestion_event(
        &mut self,
        _now: Instant,
        _sent: Instant,
        _is_persistent_congestion: bool,
        _lost_bytes: u64,
    ) {
        // Loss never shrinks the window; the granted rate is the contract.
    }

    fn on_mtu_update(&mut self, new_mtu: u16) {
        self.mtu = new_mtu;
    }

    fn window(&self) -> u64 {
        let bytes_per_sec = self.rate.get() / 8;
        let window = (bytes_per_sec as f64 * self.srtt.as_secs_f64() * WINDOW_MULTIPLIER) as u64;
        window.max(self.floor())
    }

    fn clone_box(&self) -> Box<dyn Controller> {
        Box::new(self.clone())
    }

    fn initial_window(&self) -> u64 {
        self.floor()
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// Factory handed to quinn's transport config at dial time.
#[derive(Debug)]
pub struct BrutalConfig {
    rate: Arc<RateCell>,
}

impl BrutalConfig {
    pub fn new(rate: Arc<RateCell>) -> Self {
        Self { rate }
    }
}

impl ControllerFactory for BrutalConfig {
    fn build(self: Arc<Self>, _now: Instant, current_mtu: u16) -> Box<dyn Controller> {
        Box::new(Brutal::new(self.rate.clone(), current_mtu))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(bps: u64) -> (Arc<RateCell>, Brutal) {
        let rate = RateCell::new(bps);
        (rate.clone(), Brutal::new(rate, 1200))
    }

    #[test]
    fn test_window_tracks_rate_and_rtt() {
        let (_, mut brutal) = controller(16_000_000);
        brutal.srtt = Duration::from_millis(100);
        // 16 Mbps = 2 MB/s; 100ms window = 200 KB, times the multiplier.
        assert_eq!(brutal.window(), 300_000);
    }

    #[test]
    fn test_window_floor() {
        let (_, brutal) = controller(0);
        assert_eq!(brutal.window(), MIN_WINDOW_PACKETS * 1200);
        assert_eq!(brutal.initial_window(), MIN_WINDOW_PACKETS * 1200);
    }

    #[test]
    fn test_rate_update_takes_effect() {
        let (rate, mut brutal) = controller(8_000_000);
        brutal.srtt = Duration::from_millis(100);
        let before = brutal.window();
        rate.set(16_000_000);
        assert_eq!(brutal.window(), before * 2);
    }

    #[test]
    fn test_loss_does_not_shrink_window() {
        let (_, mut brutal) = controller(16_000_000);
        brutal.srtt = Duration::from_millis(100);
        let before = brutal.window();
        brutal.on_congestion_event(Instant::now(), Instant::now(), true, 50_000);
        assert_eq!(brutal.window(), before);
    }

    #[test]
    fn test_mtu_update_raises_floor() {
        let (_, mut brutal) = controller(0);
        brutal.on_mtu_update(1500);
        assert_eq!(brutal.window(), MIN_WINDOW_PACKETS * 1500);
    }
}
