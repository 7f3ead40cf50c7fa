//! Loss/RTT-driven congestion control with priority biasing.
//!
//! Implements a windowed AIMD-style controller: slow start, congestion
//! avoidance, fast recovery, and a congested state for sustained loss.
//! Higher transfer priorities get a larger window growth cap and a shorter
//! retransmission timeout.
//!
//! The controller is per-transfer. Window, RTT estimate, and counters are
//! atomics so the sender loop can read the current window without taking the
//! transfer lock; state-machine transitions (`on_ack`, `on_loss`,
//! `update_rtt`) are driven under that lock.

use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::packet::Priority;

/// Smallest permitted send window (chunks)
pub const MIN_WINDOW: u32 = 8;

/// Initial send window (chunks)
pub const INITIAL_WINDOW: u32 = 32;

/// Largest base send window (chunks); priority scales the growth cap
pub const MAX_WINDOW: u32 = 1024;

/// Initial slow-start threshold
pub const INITIAL_SSTHRESH: u32 = MAX_WINDOW / 2;

/// Retransmission timeout before the first RTT sample
pub const INITIAL_RTO: Duration = Duration::from_millis(1000);

/// Lower RTO clamp
pub const MIN_RTO: Duration = Duration::from_millis(200);

/// Upper RTO clamp
pub const MAX_RTO: Duration = Duration::from_millis(5000);

/// Loss rate above which a further loss in fast recovery enters CONGESTED
const CONGESTED_ENTRY_LOSS_RATE: f64 = 0.25;

/// Loss rate below which CONGESTED recovers to congestion avoidance
const CONGESTED_EXIT_LOSS_RATE: f64 = 0.01;

/// Controller states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CongestionState {
    /// Exponential window growth until ssthresh
    SlowStart = 0,
    /// Linear growth, one increment per window of ACKs
    CongestionAvoidance = 1,
    /// Post-loss probing; first ACK returns to avoidance
    FastRecovery = 2,
    /// Sustained loss; growth at half rate until the loss rate subsides
    Congested = 3,
}

impl CongestionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::SlowStart,
            1 => Self::CongestionAvoidance,
            2 => Self::FastRecovery,
            _ => Self::Congested,
        }
    }
}

fn window_multiplier(priority: Priority) -> f64 {
    match priority {
        Priority::Normal => 1.0,
        Priority::High => 1.5,
        Priority::Critical => 2.0,
    }
}

fn rto_multiplier(priority: Priority) -> f64 {
    match priority {
        Priority::Normal => 1.0,
        Priority::High => 0.75,
        Priority::Critical => 0.5,
    }
}

/// Per-transfer congestion controller.
pub struct CongestionControl {
    state: AtomicU8,
    priority: Priority,
    window: AtomicU32,
    ssthresh: AtomicU32,
    /// Smoothed RTT in microseconds; zero until the first sample
    srtt_us: AtomicU64,
    /// RTT variance in microseconds
    rttvar_us: AtomicU64,
    /// ACKs processed (the denominator of the loss rate)
    packets_sent: AtomicU64,
    packets_lost: AtomicU64,
    bytes_sent: AtomicU64,
    start: Instant,
}

impl CongestionControl {
    /// Create a controller for a transfer of the given priority.
    #[must_use]
    pub fn new(priority: Priority) -> Self {
        Self {
            state: AtomicU8::new(CongestionState::SlowStart as u8),
            priority,
            window: AtomicU32::new(INITIAL_WINDOW),
            ssthresh: AtomicU32::new(INITIAL_SSTHRESH),
            srtt_us: AtomicU64::new(0),
            rttvar_us: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            packets_lost: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            start: Instant::now(),
        }
    }

    /// Feed one RTT sample (RFC 6298 smoothing, microsecond resolution).
    pub fn update_rtt(&self, rtt: Duration) {
        let sample = rtt.as_micros() as u64;

        let srtt = self.srtt_us.load(Ordering::Relaxed);
        if srtt == 0 {
            self.srtt_us.store(sample, Ordering::Relaxed);
            self.rttvar_us.store(sample / 2, Ordering::Relaxed);
        } else {
            let rttvar = self.rttvar_us.load(Ordering::Relaxed);
            let diff = srtt.abs_diff(sample);
            self.rttvar_us
                .store((3 * rttvar + diff) / 4, Ordering::Relaxed);
            self.srtt_us.store((7 * srtt + sample) / 8, Ordering::Relaxed);
        }
    }

    /// Process one acknowledged chunk.
    pub fn on_ack(&self) {
        let acked = self.packets_sent.fetch_add(1, Ordering::Relaxed) + 1;
        let current = self.window.load(Ordering::Relaxed);
        let cap = (f64::from(MAX_WINDOW) * window_multiplier(self.priority)) as u32;

        match self.state() {
            CongestionState::SlowStart => {
                self.window.store((current + 1).min(cap), Ordering::Relaxed);
                if current >= self.ssthresh.load(Ordering::Relaxed) {
                    self.transition(CongestionState::CongestionAvoidance);
                }
            }
            CongestionState::CongestionAvoidance => {
                if acked % u64::from(current) == 0 {
                    self.window.store((current + 1).min(cap), Ordering::Relaxed);
                }
            }
            CongestionState::FastRecovery => {
                self.transition(CongestionState::CongestionAvoidance);
            }
            CongestionState::Congested => {
                if acked % u64::from(current * 2) == 0 {
                    self.window.store((current + 1).min(cap), Ordering::Relaxed);
                    if self.loss_rate() < CONGESTED_EXIT_LOSS_RATE {
                        self.transition(CongestionState::CongestionAvoidance);
                    }
                }
            }
        }
    }

    /// Process one lost (timed-out) chunk.
    pub fn on_loss(&self) {
        self.packets_lost.fetch_add(1, Ordering::Relaxed);
        let current = self.window.load(Ordering::Relaxed);

        match self.state() {
            CongestionState::SlowStart | CongestionState::CongestionAvoidance => {
                let ssthresh = (current / 2).max(MIN_WINDOW);
                self.ssthresh.store(ssthresh, Ordering::Relaxed);
                self.window.store(ssthresh, Ordering::Relaxed);
                self.transition(CongestionState::FastRecovery);
            }
            CongestionState::FastRecovery => {
                self.window
                    .store((current * 3 / 4).max(MIN_WINDOW), Ordering::Relaxed);
                if self.loss_rate() > CONGESTED_ENTRY_LOSS_RATE {
                    self.transition(CongestionState::Congested);
                }
            }
            CongestionState::Congested => {
                self.window
                    .store((current / 2).max(MIN_WINDOW), Ordering::Relaxed);
            }
        }
    }

    /// Account bytes handed to the wire, for the throughput readout.
    pub fn record_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Current send window in chunks.
    #[must_use]
    pub fn window_size(&self) -> u32 {
        self.window.load(Ordering::Relaxed)
    }

    /// Current retransmission timeout.
    ///
    /// `srtt + 4 * rttvar`, biased by priority and clamped to
    /// [`MIN_RTO`, `MAX_RTO`]. [`INITIAL_RTO`] before the first RTT sample.
    #[must_use]
    pub fn retry_timeout(&self) -> Duration {
        let srtt = self.srtt_us.load(Ordering::Relaxed);
        if srtt == 0 {
            return INITIAL_RTO;
        }

        let rttvar = self.rttvar_us.load(Ordering::Relaxed);
        let rto_us = (srtt + 4 * rttvar) as f64 * rto_multiplier(self.priority);
        let rto_us = (rto_us as u64)
            .clamp(MIN_RTO.as_micros() as u64, MAX_RTO.as_micros() as u64);

        Duration::from_millis(rto_us / 1000)
    }

    /// Sending throughput since the controller was created, in Mbps.
    #[must_use]
    pub fn throughput_mbps(&self) -> f64 {
        let seconds = self.start.elapsed().as_secs_f64();
        if seconds < 0.001 {
            return 0.0;
        }
        let bytes = self.bytes_sent.load(Ordering::Relaxed) as f64;
        (bytes * 8.0) / (seconds * 1_000_000.0)
    }

    /// Fraction of processed chunks that were declared lost; zero before any
    /// ACK.
    #[must_use]
    pub fn loss_rate(&self) -> f64 {
        let sent = self.packets_sent.load(Ordering::Relaxed);
        if sent == 0 {
            return 0.0;
        }
        self.packets_lost.load(Ordering::Relaxed) as f64 / sent as f64
    }

    /// Smoothed RTT estimate; zero before the first sample.
    #[must_use]
    pub fn avg_rtt(&self) -> Duration {
        Duration::from_micros(self.srtt_us.load(Ordering::Relaxed))
    }

    /// Current controller state.
    #[must_use]
    pub fn state(&self) -> CongestionState {
        CongestionState::from_u8(self.state.load(Ordering::Relaxed))
    }

    /// Priority this controller was created with.
    #[must_use]
    pub fn priority(&self) -> Priority {
        self.priority
    }

    fn transition(&self, new_state: CongestionState) {
        self.state.store(new_state as u8, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let cc = CongestionControl::new(Priority::Normal);

        assert_eq!(cc.state(), CongestionState::SlowStart);
        assert_eq!(cc.window_size(), INITIAL_WINDOW);
        assert_eq!(cc.retry_timeout(), INITIAL_RTO);
        assert_eq!(cc.loss_rate(), 0.0);
        assert_eq!(cc.avg_rtt(), Duration::ZERO);
    }

    #[test]
    fn test_slow_start_growth() {
        let cc = CongestionControl::new(Priority::Normal);

        cc.on_ack();
        cc.on_ack();
        cc.on_ack();

        assert_eq!(cc.window_size(), INITIAL_WINDOW + 3);
        assert_eq!(cc.state(), CongestionState::SlowStart);
    }

    #[test]
    fn test_slow_start_exits_at_ssthresh() {
        let cc = CongestionControl::new(Priority::Normal);

        for _ in 0..2000 {
            if cc.state() != CongestionState::SlowStart {
                break;
            }
            cc.on_ack();
        }

        assert_eq!(cc.state(), CongestionState::CongestionAvoidance);
        assert!(cc.window_size() >= INITIAL_SSTHRESH);
        assert!(cc.window_size() <= MAX_WINDOW);
    }

    #[test]
    fn test_loss_halves_window() {
        let cc = CongestionControl::new(Priority::Normal);

        // Grow a bit first so the halving is visible.
        for _ in 0..32 {
            cc.on_ack();
        }
        let before = cc.window_size();
        assert_eq!(before, 64);

        cc.on_loss();

        assert_eq!(cc.window_size(), (before / 2).max(MIN_WINDOW));
        assert_eq!(cc.state(), CongestionState::FastRecovery);
    }

    #[test]
    fn test_loss_at_minimum_window_clamps() {
        let cc = CongestionControl::new(Priority::Normal);

        for _ in 0..10 {
            cc.on_loss();
        }

        assert!(cc.window_size() >= MIN_WINDOW);
    }

    #[test]
    fn test_fast_recovery_returns_on_ack() {
        let cc = CongestionControl::new(Priority::Normal);

        cc.on_loss();
        assert_eq!(cc.state(), CongestionState::FastRecovery);

        let window = cc.window_size();
        cc.on_ack();

        // The recovery ACK transitions without growing the window.
        assert_eq!(cc.state(), CongestionState::CongestionAvoidance);
        assert_eq!(cc.window_size(), window);
    }

    #[test]
    fn test_fast_recovery_loss_shrinks_three_quarters() {
        let cc = CongestionControl::new(Priority::Normal);

        for _ in 0..32 {
            cc.on_ack();
        }
        cc.on_loss(); // -> FastRecovery, window = 32
        let before = cc.window_size();

        cc.on_loss();

        assert_eq!(cc.window_size(), (before * 3 / 4).max(MIN_WINDOW));
    }

    #[test]
    fn test_congested_entry_under_sustained_loss() {
        let cc = CongestionControl::new(Priority::Normal);

        for _ in 0..4 {
            cc.on_ack();
        }
        cc.on_loss(); // loss rate 1/4 -> FastRecovery
        cc.on_loss(); // loss rate 2/4 -> Congested

        assert_eq!(cc.state(), CongestionState::Congested);
    }

    #[test]
    fn test_congested_recovers_when_loss_subsides() {
        let cc = CongestionControl::new(Priority::Normal);

        for _ in 0..4 {
            cc.on_ack();
        }
        cc.on_loss();
        cc.on_loss();
        assert_eq!(cc.state(), CongestionState::Congested);

        // Drown the two losses in ACKs until the rate drops under 1%.
        for _ in 0..500 {
            cc.on_ack();
        }

        assert_eq!(cc.state(), CongestionState::CongestionAvoidance);
    }

    #[test]
    fn test_window_bounds_after_mixed_events() {
        let cc = CongestionControl::new(Priority::Normal);

        for i in 0..3000u32 {
            if i % 7 == 0 {
                cc.on_loss();
            } else {
                cc.on_ack();
            }
            let w = cc.window_size();
            assert!((MIN_WINDOW..=MAX_WINDOW).contains(&w), "window {w} out of bounds");
        }
    }

    #[test]
    fn test_rtt_first_sample() {
        let cc = CongestionControl::new(Priority::Normal);

        cc.update_rtt(Duration::from_micros(100_000));

        assert_eq!(cc.avg_rtt(), Duration::from_micros(100_000));
        // RTO = srtt + 4 * rttvar = 100ms + 4 * 50ms = 300ms
        assert_eq!(cc.retry_timeout(), Duration::from_millis(300));
    }

    #[test]
    fn test_rtt_smoothing() {
        let cc = CongestionControl::new(Priority::Normal);

        cc.update_rtt(Duration::from_micros(100_000));
        cc.update_rtt(Duration::from_micros(200_000));

        // rttvar = (3*50000 + 100000) / 4 = 62500
        // srtt   = (7*100000 + 200000) / 8 = 112500
        assert_eq!(cc.avg_rtt(), Duration::from_micros(112_500));
        // RTO = 112500 + 4*62500 = 362500us -> 362ms
        assert_eq!(cc.retry_timeout(), Duration::from_millis(362));
    }

    #[test]
    fn test_rto_clamped_low() {
        let cc = CongestionControl::new(Priority::Normal);

        cc.update_rtt(Duration::from_micros(10_000)); // RTO would be 30ms

        assert_eq!(cc.retry_timeout(), MIN_RTO);
    }

    #[test]
    fn test_rto_clamped_high() {
        let cc = CongestionControl::new(Priority::Normal);

        cc.update_rtt(Duration::from_secs(10));

        assert_eq!(cc.retry_timeout(), MAX_RTO);
    }

    #[test]
    fn test_rto_priority_bias() {
        let normal = CongestionControl::new(Priority::Normal);
        let high = CongestionControl::new(Priority::High);
        let critical = CongestionControl::new(Priority::Critical);

        for cc in [&normal, &high, &critical] {
            cc.update_rtt(Duration::from_micros(400_000));
        }

        // base RTO = 400ms + 4*200ms = 1200ms
        assert_eq!(normal.retry_timeout(), Duration::from_millis(1200));
        assert_eq!(high.retry_timeout(), Duration::from_millis(900));
        assert_eq!(critical.retry_timeout(), Duration::from_millis(600));
    }

    #[test]
    fn test_loss_rate() {
        let cc = CongestionControl::new(Priority::Normal);
        assert_eq!(cc.loss_rate(), 0.0);

        for _ in 0..8 {
            cc.on_ack();
        }
        cc.on_loss();
        cc.on_loss();

        assert!((cc.loss_rate() - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_throughput_accounts_recorded_bytes() {
        let cc = CongestionControl::new(Priority::Normal);

        cc.record_sent(1_000_000);
        std::thread::sleep(Duration::from_millis(10));

        assert!(cc.throughput_mbps() > 0.0);
    }

    #[test]
    fn test_priority_accessor() {
        let cc = CongestionControl::new(Priority::Critical);
        assert_eq!(cc.priority(), Priority::Critical);
    }
}
