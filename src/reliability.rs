//! RTT estimation, the loss-reactive packet throttle, and the packet-loss EWMA.
//!
//! These three pieces of per-peer state all update from the same source event — an
//! acknowledgement arriving with its round-trip sample — but decay on independent periodic
//! clocks (`packetThrottleInterval` for RTT/throttle, a fixed ten seconds for loss), so they're
//! kept as separate small trackers composed together in [`Peer`](crate::peer::Peer) rather than
//! one monolithic struct.

/// Default RTT assumed before the first sample arrives.
pub const DEFAULT_ROUND_TRIP_TIME: u32 = 500;
/// Acceptance-probability scale the throttle value is expressed out of.
pub const PACKET_THROTTLE_SCALE: u32 = 32;
/// Default throttle acceleration/deceleration step and starting value.
pub const DEFAULT_PACKET_THROTTLE: u32 = PACKET_THROTTLE_SCALE;
pub const DEFAULT_PACKET_THROTTLE_ACCELERATION: u32 = 2;
pub const DEFAULT_PACKET_THROTTLE_DECELERATION: u32 = 2;
/// Default interval, in ms, at which throttle/RTT trackers roll their per-interval extremes.
pub const DEFAULT_PACKET_THROTTLE_INTERVAL: u32 = 5_000;

/// Scale the loss fraction is expressed out of, and the interval it's recomputed on.
pub const PACKET_LOSS_SCALE: u32 = 65_536;
pub const PACKET_LOSS_INTERVAL: u32 = 10_000;

/// Exponentially-averaged round-trip time, tracked the way RFC 6298 tracks SRTT/RTTVAR, plus
/// the per-throttle-interval low/high extremes the packet throttle reacts to.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    pub rtt: u32,
    pub rtt_variance: u32,
    lowest_rtt_this_interval: u32,
    highest_rtt_variance_this_interval: u32,
    pub last_rtt: u32,
    pub last_rtt_variance: u32,
}

impl RttEstimator {
    pub fn new() -> Self {
        RttEstimator {
            rtt: DEFAULT_ROUND_TRIP_TIME,
            rtt_variance: DEFAULT_ROUND_TRIP_TIME / 2,
            lowest_rtt_this_interval: DEFAULT_ROUND_TRIP_TIME,
            highest_rtt_variance_this_interval: 0,
            last_rtt: DEFAULT_ROUND_TRIP_TIME,
            last_rtt_variance: 0,
        }
    }

    /// Folds one round-trip sample (in ms) into the moving averages, per the decay-then-update
    /// rule: the old variance decays by a quarter, then absorbs a quarter of the new deviation.
    pub fn sample(&mut self, sample_rtt: u32) {
        let diff = (sample_rtt as i64 - self.rtt as i64).abs() as u32;

        self.rtt_variance -= self.rtt_variance / 4;
        self.rtt_variance += diff / 4;
        self.rtt = (self.rtt as i64 + (sample_rtt as i64 - self.rtt as i64) / 8) as u32;

        if sample_rtt < self.lowest_rtt_this_interval {
            self.lowest_rtt_this_interval = sample_rtt;
        }
        if self.rtt_variance > self.highest_rtt_variance_this_interval {
            self.highest_rtt_variance_this_interval = self.rtt_variance;
        }
    }

    /// Rolls the interval's low/high extremes into `last_rtt`/`last_rtt_variance` and resets
    /// the trackers. Called once every `packetThrottleInterval` ms.
    pub fn roll_interval(&mut self) {
        self.last_rtt = self.lowest_rtt_this_interval;
        self.last_rtt_variance = self.highest_rtt_variance_this_interval;
        self.lowest_rtt_this_interval = u32::MAX;
        self.highest_rtt_variance_this_interval = 0;
    }

    /// The round-trip timeout a freshly-sent reliable command should be given: `rtt + 4 *
    /// variance`.
    pub fn round_trip_timeout(&self) -> u32 {
        self.rtt + 4 * self.rtt_variance
    }
}

/// The loss-reactive acceptance probability applied to unreliable sends.
#[derive(Debug, Clone)]
pub struct PacketThrottle {
    pub value: u32,
    pub acceleration: u32,
    pub deceleration: u32,
    pub interval: u32,
}

impl PacketThrottle {
    pub fn new() -> Self {
        PacketThrottle {
            value: DEFAULT_PACKET_THROTTLE,
            acceleration: DEFAULT_PACKET_THROTTLE_ACCELERATION,
            deceleration: DEFAULT_PACKET_THROTTLE_DECELERATION,
            interval: DEFAULT_PACKET_THROTTLE_INTERVAL,
        }
    }

    /// Adjusts the throttle value in reaction to one round-trip sample, per the rule: speed up
    /// if this sample beat the last interval's best RTT, slow down if it's well above it.
    pub fn on_sample(&mut self, sample_rtt: u32, rtt: &RttEstimator) {
        if sample_rtt <= rtt.last_rtt {
            self.value = (self.value + self.acceleration).min(PACKET_THROTTLE_SCALE);
        } else if sample_rtt as u64 > rtt.last_rtt as u64 + 2 * rtt.last_rtt_variance as u64 {
            self.value = self.value.saturating_sub(self.deceleration);
        }
    }

    /// Whether an unreliable packet should be sent this time, given a uniform random draw in
    /// `[0, PACKET_THROTTLE_SCALE)`.
    pub fn admits(&self, draw: u32) -> bool {
        draw % PACKET_THROTTLE_SCALE < self.value
    }
}

/// Packet-loss fraction, recomputed every [`PACKET_LOSS_INTERVAL`] ms from counters the peer
/// accumulates between recomputations.
#[derive(Debug, Clone)]
pub struct LossEstimator {
    pub packets_sent: u32,
    pub packets_lost: u32,
    pub packet_loss: u32,
    pub packet_loss_variance: u32,
}

impl LossEstimator {
    pub fn new() -> Self {
        LossEstimator { packets_sent: 0, packets_lost: 0, packet_loss: 0, packet_loss_variance: 0 }
    }

    pub fn record_sent(&mut self) {
        self.packets_sent += 1;
    }

    pub fn record_lost(&mut self) {
        self.packets_lost += 1;
    }

    /// Recomputes `packet_loss`/`packet_loss_variance` from the accumulated counters and resets
    /// them. A no-op if nothing was sent in the interval.
    pub fn roll_interval(&mut self) {
        if self.packets_sent == 0 {
            return;
        }

        let loss = self.packets_lost * PACKET_LOSS_SCALE / self.packets_sent;
        let diff = (loss as i64 - self.packet_loss as i64).abs() as u32;

        self.packet_loss_variance -= self.packet_loss_variance / 4;
        self.packet_loss_variance += diff / 4;
        self.packet_loss = (self.packet_loss as i64 + (loss as i64 - self.packet_loss as i64) / 4) as u32;

        self.packets_sent = 0;
        self.packets_lost = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtt_converges_toward_samples() {
        let mut rtt = RttEstimator::new();
        for _ in 0..50 {
            rtt.sample(100);
        }
        assert!((rtt.rtt as i64 - 100).abs() < 5, "rtt = {}", rtt.rtt);
    }

    #[test]
    fn throttle_accelerates_on_fast_sample() {
        let mut throttle = PacketThrottle { value: 10, ..PacketThrottle::new() };
        let mut rtt = RttEstimator::new();
        rtt.last_rtt = 100;
        rtt.last_rtt_variance = 0;
        throttle.on_sample(50, &rtt);
        assert_eq!(throttle.value, 12);
    }

    #[test]
    fn throttle_decelerates_on_slow_sample() {
        let mut throttle = PacketThrottle { value: 10, ..PacketThrottle::new() };
        let mut rtt = RttEstimator::new();
        rtt.last_rtt = 100;
        rtt.last_rtt_variance = 0;
        throttle.on_sample(500, &rtt);
        assert_eq!(throttle.value, 8);
    }

    #[test]
    fn throttle_caps_at_scale() {
        let mut throttle = PacketThrottle::new();
        let mut rtt = RttEstimator::new();
        rtt.last_rtt = 1000;
        throttle.on_sample(1, &rtt);
        assert_eq!(throttle.value, PACKET_THROTTLE_SCALE);
    }

    #[test]
    fn loss_interval_noop_when_nothing_sent() {
        let mut loss = LossEstimator::new();
        loss.roll_interval();
        assert_eq!(loss.packet_loss, 0);
    }

    #[test]
    fn loss_interval_computes_fraction() {
        let mut loss = LossEstimator::new();
        for _ in 0..10 {
            loss.record_sent();
        }
        for _ in 0..2 {
            loss.record_lost();
        }
        loss.roll_interval();
        assert!(loss.packet_loss > 0);
        assert_eq!(loss.packets_sent, 0);
    }
}
