//! Reno congestion control.
//!
//! Slow start until `ssthresh`, then congestion avoidance. A triple
//! duplicate ACK halves the pipe and enters fast recovery; a retransmission
//! timeout collapses the window to one segment and starts over.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    SlowStart,
    CongestionAvoidance,
    FastRecovery,
}

#[derive(Debug, Clone)]
pub struct Reno {
    mss: u32,
    cwnd: u32,
    ssthresh: u32,
    phase: Phase,
    /// Byte credit accumulated during congestion avoidance; grows cwnd by
    /// one MSS per cwnd-worth of acknowledged data.
    avoidance_credit: u32,
}

impl Reno {
    pub fn new(mss: u32, initial_window_segments: u32, ssthresh: u32) -> Self {
        Self {
            mss,
            cwnd: mss * initial_window_segments.max(1),
            ssthresh,
            phase: Phase::SlowStart,
            avoidance_credit: 0,
        }
    }

    pub fn window(&self) -> u32 {
        self.cwnd
    }

    pub fn ssthresh(&self) -> u32 {
        self.ssthresh
    }

    pub fn in_fast_recovery(&self) -> bool {
        self.phase == Phase::FastRecovery
    }

    /// New data was cumulatively acknowledged.
    pub fn on_ack(&mut self, acked_bytes: u32) {
        match self.phase {
            Phase::SlowStart => {
                self.cwnd = self.cwnd.saturating_add(acked_bytes.min(self.mss));

                if self.cwnd >= self.ssthresh {
                    self.phase = Phase::CongestionAvoidance;
                }
            }
            Phase::CongestionAvoidance => {
                self.avoidance_credit += acked_bytes;

                if self.avoidance_credit >= self.cwnd {
                    self.avoidance_credit -= self.cwnd;
                    self.cwnd = self.cwnd.saturating_add(self.mss);
                }
            }
            Phase::FastRecovery => {
                // The retransmitted segment was delivered; deflate back to
                // ssthresh and resume avoidance.
                self.cwnd = self.ssthresh;
                self.phase = Phase::CongestionAvoidance;
                self.avoidance_credit = 0;
            }
        }
    }

    /// Third duplicate ACK: fast retransmit + fast recovery.
    pub fn on_triple_dup_ack(&mut self) {
        self.ssthresh = (self.cwnd / 2).max(2 * self.mss);
        self.cwnd = self.ssthresh + 3 * self.mss;
        self.phase = Phase::FastRecovery;
    }

    /// A further duplicate ACK while in fast recovery inflates the window.
    pub fn on_dup_ack_in_recovery(&mut self) {
        if self.phase == Phase::FastRecovery {
            self.cwnd = self.cwnd.saturating_add(self.mss);
        }
    }

    /// Retransmission timeout.
    pub fn on_rto(&mut self) {
        self.ssthresh = (self.cwnd / 2).max(2 * self.mss);
        self.cwnd = self.mss;
        self.phase = Phase::SlowStart;
        self.avoidance_credit = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MSS: u32 = 1460;

    #[test]
    fn slow_start_doubles_per_window() {
        let mut reno = Reno::new(MSS, 2, 64 * 1024);
        let before = reno.window();

        // Ack a full window's worth, one MSS at a time.
        reno.on_ack(MSS);
        reno.on_ack(MSS);

        assert_eq!(reno.window(), before * 2);
    }

    #[test]
    fn triple_dup_ack_halves_and_inflates() {
        let mut reno = Reno::new(MSS, 10, 8 * MSS);

        reno.on_triple_dup_ack();

        assert_eq!(reno.ssthresh(), 5 * MSS);
        assert_eq!(reno.window(), 5 * MSS + 3 * MSS);
        assert!(reno.in_fast_recovery());
    }

    #[test]
    fn recovery_deflates_on_new_ack() {
        let mut reno = Reno::new(MSS, 10, 8 * MSS);
        reno.on_triple_dup_ack();

        reno.on_ack(MSS);

        assert_eq!(reno.window(), reno.ssthresh());
        assert!(!reno.in_fast_recovery());
    }

    #[test]
    fn rto_collapses_to_one_segment() {
        let mut reno = Reno::new(MSS, 10, 64 * 1024);

        reno.on_rto();

        assert_eq!(reno.window(), MSS);
        assert_eq!(reno.ssthresh(), 5 * MSS);
    }

    #[test]
    fn ssthresh_floor_is_two_segments() {
        let mut reno = Reno::new(MSS, 1, 64 * 1024);

        reno.on_rto();

        assert_eq!(reno.ssthresh(), 2 * MSS);
    }
}
