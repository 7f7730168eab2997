//! RFC 6298 retransmission-timeout estimation, in simulated time.

use sim_time::SimDuration;

const ALPHA: f64 = 1.0 / 8.0;
const BETA: f64 = 1.0 / 4.0;

pub const MIN_RTO: SimDuration = SimDuration::from_millis(200);
pub const MAX_RTO: SimDuration = SimDuration::from_secs(60);

#[derive(Debug, Clone, Copy)]
pub struct RttEstimator {
    srtt: Option<SimDuration>,
    rttvar: SimDuration,
    rto: SimDuration,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self {
            srtt: None,
            rttvar: SimDuration::ZERO,
            // Conservative until the first sample arrives.
            rto: SimDuration::SECOND,
        }
    }
}

impl RttEstimator {
    pub fn sample(&mut self, rtt: SimDuration) {
        match self.srtt {
            None => {
                self.srtt = Some(rtt);
                self.rttvar = rtt / 2;
            }
            Some(srtt) => {
                let srtt_ns = srtt.as_nanos() as f64;
                let rtt_ns = rtt.as_nanos() as f64;

                let rttvar_ns = (1.0 - BETA) * self.rttvar.as_nanos() as f64
                    + BETA * (srtt_ns - rtt_ns).abs();
                let srtt_ns = (1.0 - ALPHA) * srtt_ns + ALPHA * rtt_ns;

                self.srtt = Some(SimDuration::from_nanos(srtt_ns as u64));
                self.rttvar = SimDuration::from_nanos(rttvar_ns as u64);
            }
        }

        let srtt = self.srtt.unwrap_or_default();
        self.rto = (srtt + self.rttvar.saturating_mul(4)).clamp(MIN_RTO, MAX_RTO);
    }

    pub fn srtt(&self) -> Option<SimDuration> {
        self.srtt
    }

    pub fn rto(&self) -> SimDuration {
        self.rto
    }

    /// Exponential backoff after an expiry, clamped to [`MAX_RTO`].
    pub fn backoff(&mut self) {
        self.rto = (self.rto.saturating_mul(2)).min(MAX_RTO);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_initialises_srtt() {
        let mut est = RttEstimator::default();

        est.sample(SimDuration::from_millis(10));

        assert_eq!(est.srtt(), Some(SimDuration::from_millis(10)));
        // RTO = SRTT + 4*RTTVAR = 10 + 4*5 = 30ms, clamped up to the floor.
        assert_eq!(est.rto(), MIN_RTO);
    }

    #[test]
    fn smoothing_uses_one_eighth_gain() {
        let mut est = RttEstimator::default();
        est.sample(SimDuration::from_millis(100));

        est.sample(SimDuration::from_millis(180));

        // SRTT = 7/8*100 + 1/8*180 = 110ms.
        assert_eq!(est.srtt(), Some(SimDuration::from_millis(110)));
    }

    #[test]
    fn rto_never_exceeds_ceiling() {
        let mut est = RttEstimator::default();

        for _ in 0..20 {
            est.backoff();
        }

        assert_eq!(est.rto(), MAX_RTO);
    }
}
