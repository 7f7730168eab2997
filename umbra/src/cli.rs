//! Command-line interface.

use std::path::PathBuf;

use clap::Parser;
use sim_core::QDisc;

/// A discrete-event network simulator that runs real application code
/// against a virtual network.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the scenario XML file.
    pub scenario: PathBuf,

    /// Number of worker threads.
    #[arg(short, long, env = "UMBRA_WORKERS", default_value_t = num_cpus::get())]
    pub workers: usize,

    /// Random seed; fixed seed plus fixed scenario reproduces a run
    /// bit-for-bit, regardless of worker count.
    #[arg(short, long, env = "UMBRA_SEED", default_value_t = 1)]
    pub seed: u64,

    /// Base log level: error|critical|warning|message|info|debug.
    #[arg(short, long, env = "UMBRA_LOG_LEVEL", default_value = "message")]
    pub log_level: String,

    /// Interval between per-host heartbeat status lines; 0 disables them.
    #[arg(long, default_value = "1s")]
    pub heartbeat_interval: humantime::Duration,

    /// Level the heartbeat lines log at.
    #[arg(long, default_value = "message")]
    pub heartbeat_log_level: String,

    /// Initial TCP congestion window, in segments.
    #[arg(long, default_value_t = 10)]
    pub tcp_initial_window: u32,

    /// Initial TCP slow-start threshold, in bytes.
    #[arg(long, default_value_t = 64 * 1024)]
    pub tcp_ssthresh: u32,

    /// TCP congestion-control algorithm.
    #[arg(long, default_value = "reno")]
    pub tcp_congestion_control: String,

    /// Disable delay-bandwidth-product socket buffer autotuning.
    #[arg(long)]
    pub disable_autotune: bool,

    /// Interface queuing discipline.
    #[arg(long, default_value = "fifo")]
    pub qdisc: QDisc,

    /// Interface send buffer, in bytes.
    #[arg(long, default_value_t = 1024 * 1024)]
    pub interface_buffer: usize,

    /// Directory for per-host data (private plug-in copies, etc.).
    #[arg(long, default_value = "umbra.data")]
    pub data_dir: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_invocation_parses() {
        let cli = Cli::parse_from(["umbra", "scenario.xml"]);

        assert_eq!(cli.scenario, PathBuf::from("scenario.xml"));
        assert_eq!(cli.seed, 1);
        assert_eq!(cli.qdisc, QDisc::Fifo);
        assert!(!cli.disable_autotune);
    }

    #[test]
    fn qdisc_parses_round_robin() {
        let cli = Cli::parse_from(["umbra", "s.xml", "--qdisc", "rr"]);

        assert_eq!(cli.qdisc, QDisc::RoundRobin);
    }

    #[test]
    fn unknown_qdisc_is_rejected() {
        assert!(Cli::try_parse_from(["umbra", "s.xml", "--qdisc", "cake"]).is_err());
    }
}
