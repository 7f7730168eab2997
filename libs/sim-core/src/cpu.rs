//! Per-host CPU delay accounting.
//!
//! Work reported by the syscall surface turns into simulated nanoseconds
//! of processing delay. Once more than a threshold of delay has piled up
//! unabsorbed, the host counts as CPU-blocked: syscalls return
//! `WouldBlock` and retry after the backlog has been absorbed by the
//! advancing clock.

use sim_time::{SimDuration, SimTime};

/// Delay a host may accumulate before it blocks.
pub const BLOCK_THRESHOLD: SimDuration = SimDuration::MILLISECOND;

/// General per-byte processing is this many times the cost of an AES byte.
const PROC_AES_RATIO: u64 = 24;
/// Fraction of a byte's processing cost charged to the reading side.
const READ_FRACTION: f64 = 0.75;
/// The remainder is charged to the writing side.
const WRITE_FRACTION: f64 = 0.25;

#[derive(Debug, Clone)]
pub struct Cpu {
    ns_per_aes_byte: f64,
    ns_per_proc_byte: f64,
    accumulated: SimDuration,
    absorbed: SimDuration,
    /// Clock position at the last absorb; delay drains as time advances.
    last_absorb: SimTime,
}

impl Cpu {
    /// `frequency_khz` comes from the scenario's `cpufrequency` attribute.
    /// Zero disables CPU modelling entirely.
    pub fn new(frequency_khz: u64) -> Self {
        let ns_per_aes_byte = if frequency_khz == 0 {
            0.0
        } else {
            // A 1 GHz host is calibrated to one nanosecond per AES byte;
            // everything else scales inversely with clock speed.
            1_000_000.0 / frequency_khz as f64
        };

        Self {
            ns_per_aes_byte,
            ns_per_proc_byte: ns_per_aes_byte * PROC_AES_RATIO as f64,
            accumulated: SimDuration::ZERO,
            absorbed: SimDuration::ZERO,
            last_absorb: SimTime::ZERO,
        }
    }

    /// A CPU that never blocks, for hosts without a `cpufrequency`.
    pub fn unlimited() -> Self {
        Self::new(0)
    }

    pub fn add_aes(&mut self, bytes: usize) {
        self.charge(self.ns_per_aes_byte * bytes as f64);
    }

    pub fn add_read(&mut self, bytes: usize) {
        self.charge(self.ns_per_proc_byte * bytes as f64 * READ_FRACTION);
    }

    pub fn add_write(&mut self, bytes: usize) {
        self.charge(self.ns_per_proc_byte * bytes as f64 * WRITE_FRACTION);
    }

    fn charge(&mut self, ns: f64) {
        self.accumulated += SimDuration::from_nanos(ns as u64);
    }

    /// Delay accumulated but not yet credited against the clock.
    pub fn unabsorbed(&self) -> SimDuration {
        self.accumulated - self.absorbed
    }

    pub fn is_blocked(&self) -> bool {
        self.unabsorbed() > BLOCK_THRESHOLD
    }

    /// Credit simulated time that has passed since the last event against
    /// the outstanding delay. Called on every event delivery.
    pub fn absorb(&mut self, now: SimTime) {
        let elapsed = now.saturating_sub(self.last_absorb);
        self.last_absorb = self.last_absorb.max(now);

        let credit = elapsed.min(self.unabsorbed());
        self.absorbed += credit;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_cpu_never_blocks() {
        let mut cpu = Cpu::unlimited();

        cpu.add_write(usize::MAX / 2);

        assert!(!cpu.is_blocked());
    }

    #[test]
    fn write_load_blocks_once_threshold_is_crossed() {
        // 1 GHz: 24ns per processed byte, 6ns billed to writes.
        let mut cpu = Cpu::new(1_000_000);

        cpu.add_write(100_000);

        assert_eq!(cpu.unabsorbed(), SimDuration::from_nanos(600_000));
        assert!(!cpu.is_blocked());

        cpu.add_write(100_000);

        assert!(cpu.is_blocked());
    }

    #[test]
    fn read_costs_three_times_write() {
        let mut write = Cpu::new(1_000_000);
        let mut read = Cpu::new(1_000_000);

        write.add_write(1_000);
        read.add_read(1_000);

        assert_eq!(read.unabsorbed().as_nanos(), 3 * write.unabsorbed().as_nanos());
    }

    #[test]
    fn absorbing_time_unblocks() {
        let mut cpu = Cpu::new(1_000_000);
        cpu.add_write(400_000); // 2.4ms of delay
        assert!(cpu.is_blocked());

        cpu.absorb(SimTime::from_nanos(3_000_000));

        assert!(!cpu.is_blocked());
        assert_eq!(cpu.unabsorbed(), SimDuration::ZERO);
    }

    #[test]
    fn absorb_never_credits_more_than_accumulated() {
        let mut cpu = Cpu::new(1_000_000);
        cpu.add_write(100); // 600ns

        cpu.absorb(SimTime::from_nanos(1_000_000_000));
        cpu.add_write(100);

        // The hour of idle time cannot pre-pay future work.
        assert_eq!(cpu.unabsorbed(), SimDuration::from_nanos(600));
    }
}
