//! Logging setup.
//!
//! Events are stamped with the *simulated* clock of whichever worker
//! emits them, so a log line reads as "when it happened in the
//! simulation", not when the host machine got around to running it.
//! Workers publish their clock through [`set_sim_time`] as they deliver
//! events; anything logged outside a worker (boot, config parsing) falls
//! back to a `-.---------s` marker.

#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::cell::Cell;
use std::fmt;

use anyhow::{Context as _, Result};
use sim_time::SimTime;
use tracing_log::LogTracer;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::{EnvFilter, Layer as _, Registry};

thread_local! {
    static SIM_NOW: Cell<Option<SimTime>> = const { Cell::new(None) };
}

/// Publish the current simulated time for this worker thread.
pub fn set_sim_time(now: SimTime) {
    SIM_NOW.with(|cell| cell.set(Some(now)));
}

pub fn clear_sim_time() {
    SIM_NOW.with(|cell| cell.set(None));
}

/// A [`FormatTime`] that renders the simulated clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimClock;

impl FormatTime for SimClock {
    fn format_time(&self, w: &mut Writer<'_>) -> fmt::Result {
        match SIM_NOW.with(Cell::get) {
            Some(now) => write!(w, "{now}"),
            None => write!(w, "-.---------s"),
        }
    }
}

/// The user-facing log levels, a superset of tracing's.
///
/// `critical` folds into `error` and `message` into `info`; they exist
/// so scenario files can keep their historical vocabulary.
pub fn directive_for_level(level: &str) -> Result<&'static str> {
    match level {
        "error" | "critical" => Ok("error"),
        "warning" => Ok("warn"),
        "message" | "info" => Ok("info"),
        "debug" => Ok("debug"),
        other => anyhow::bail!("unknown log level `{other}`"),
    }
}

/// Install the global subscriber.
///
/// `directives` is the base `EnvFilter` expression; `host_overrides`
/// holds `(hostname, level)` pairs from scenario attributes, turned into
/// span-scoped directives so one chatty host can log at `debug` while
/// the rest stay quiet.
pub fn setup(directives: &str, host_overrides: &[(String, String)]) -> Result<()> {
    let mut filter = directives.to_owned();

    for (host, level) in host_overrides {
        let level = directive_for_level(level)?;
        filter.push_str(&format!(",[host{{name={host}}}]={level}"));
    }

    let env_filter = EnvFilter::try_new(&filter)
        .with_context(|| format!("Failed to parse log directives `{filter}`"))?;

    let layer = tracing_subscriber::fmt::layer()
        .with_timer(SimClock)
        .with_filter(env_filter);

    // A second setup (e.g. from tests sharing a process) keeps the first
    // subscriber; bad directives were already rejected above.
    if Registry::default().with(layer).try_init().is_ok() {
        LogTracer::init().context("Failed to route `log` records into tracing")?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_levels_map_onto_tracing() {
        assert_eq!(directive_for_level("critical").unwrap(), "error");
        assert_eq!(directive_for_level("message").unwrap(), "info");
        assert!(directive_for_level("verbose").is_err());
    }

    #[test]
    fn clock_renders_simulated_time() {
        let mut out = String::new();

        set_sim_time(SimTime::from_nanos(1_500_000_000));
        SimClock.format_time(&mut Writer::new(&mut out)).unwrap();

        assert_eq!(out, "1.500000000s");
        clear_sim_time();
    }
}
