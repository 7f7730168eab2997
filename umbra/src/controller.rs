//! Boot and run: turn a parsed scenario into a live simulation.
//!
//! Boot order matters: the resolver and topology must know every host
//! before the first event fires, because sockets consult them on
//! connect. The controller registers addresses, attaches hosts to the
//! graph, loads each host's private plug-in copies, seeds the
//! process-start/stop and heartbeat events, and only then releases the
//! workers.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context as _, Result, bail};
use resolver::{Bandwidth, Resolver};
use sim_core::{
    CONTROLLER_ID, Event, EventKey, EventPayload, HostConfig, Sim, SimConfig, Scheduler,
};
use sim_time::{SimDuration, SimTime};
use topology::Topology;
use transport::TcpConfig;

use crate::cli::Cli;
use crate::config::{self, Scenario, TopologySource};
use crate::graphml;
use crate::plugin_app::PluginApp;

/// Latency of the implicit single-cloud topology used when a scenario
/// has no `<topology>`.
const DEFAULT_CLOUD_LATENCY: SimDuration = SimDuration::from_millis(10);

const DEFAULT_KBPS: u64 = 10_240;

pub fn run(cli: &Cli) -> Result<()> {
    let text = std::fs::read_to_string(&cli.scenario)
        .with_context(|| format!("Failed to read {}", cli.scenario.display()))?;
    let scenario = config::parse(&text)?;

    init_logging(cli, &scenario)?;

    if cli.tcp_congestion_control != "reno" {
        bail!(
            "unsupported congestion control `{}` (only `reno` is implemented)",
            cli.tcp_congestion_control
        );
    }

    let topology = Arc::new(build_topology(&scenario)?);
    let resolver = Arc::new(Resolver::new());

    let sim_config = SimConfig {
        seed: cli.seed,
        stop_time: SimTime::ZERO + scenario.stop_time,
        tcp: TcpConfig {
            initial_window: cli.tcp_initial_window,
            ssthresh: cli.tcp_ssthresh,
            ..TcpConfig::default()
        },
        autotune: !cli.disable_autotune,
        qdisc: cli.qdisc,
        interface_buffer: cli.interface_buffer,
        heartbeat_interval: heartbeat_interval(cli),
        heartbeat_level: heartbeat_level(&cli.heartbeat_log_level)?,
    };

    let mut sim = Sim::new(sim_config, resolver, topology);
    let mut boot = Boot::new(cli, &scenario);

    for host_decl in &scenario.hosts {
        for _ in 0..host_decl.quantity.max(1) {
            boot.add_host(&mut sim, host_decl)?;
        }
    }

    tracing::info!(
        hosts = sim.hosts().len(),
        stop_time = %scenario.stop_time,
        seed = cli.seed,
        "Scenario loaded"
    );

    Scheduler::new(cli.workers).run(&sim);

    Ok(())
}

fn init_logging(cli: &Cli, scenario: &Scenario) -> Result<()> {
    let base = logging::directive_for_level(&cli.log_level)?;

    let overrides: Vec<(String, String)> = scenario
        .hosts
        .iter()
        .filter_map(|h| h.log_level.clone().map(|level| (h.id.clone(), level)))
        .collect();

    logging::setup(base, &overrides)
}

fn build_topology(scenario: &Scenario) -> Result<Topology> {
    match &scenario.topology {
        TopologySource::Default => Ok(Topology::fully_connected(DEFAULT_CLOUD_LATENCY)),
        TopologySource::Inline(text) => graphml::parse(text),
        TopologySource::Path(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read topology {}", path.display()))?;

            graphml::parse(&text)
        }
    }
}

fn heartbeat_interval(cli: &Cli) -> Option<SimDuration> {
    let interval = SimDuration::from(*cli.heartbeat_interval);

    (!interval.is_zero()).then_some(interval)
}

fn heartbeat_level(name: &str) -> Result<tracing::Level> {
    let level = match logging::directive_for_level(name)? {
        "error" => tracing::Level::ERROR,
        "warn" => tracing::Level::WARN,
        "debug" => tracing::Level::DEBUG,
        _ => tracing::Level::INFO,
    };

    Ok(level)
}

/// Boot-time state: plug-in declarations, loaded per-host plug-in
/// copies, and the controller's event sequence.
struct Boot<'a> {
    cli: &'a Cli,
    plugin_paths: HashMap<&'a str, &'a Path>,
    host_index: usize,
    event_seq: u64,
}

impl<'a> Boot<'a> {
    fn new(cli: &'a Cli, scenario: &'a Scenario) -> Self {
        let plugin_paths = scenario
            .plugins
            .iter()
            .map(|p| (p.id.as_str(), p.path.as_path()))
            .collect();

        Self {
            cli,
            plugin_paths,
            host_index: 0,
            event_seq: 0,
        }
    }

    fn add_host(&mut self, sim: &mut Sim, decl: &config::HostDecl) -> Result<()> {
        let bandwidth = Bandwidth {
            kbps_down: decl.bandwidth_down.unwrap_or(DEFAULT_KBPS),
            kbps_up: decl.bandwidth_up.unwrap_or(DEFAULT_KBPS),
        };

        // Stamped-out hosts get a unique-id prefix and auto-assigned
        // addresses; an iphint only makes sense for a singleton.
        let unique = decl.quantity > 1;
        let requested_ip = (!unique)
            .then_some(decl.iphint)
            .flatten()
            .filter(|ip| sim.resolver.resolve_by_addr(*ip).is_none());

        let entry = sim
            .resolver
            .register(&decl.id, requested_ip, unique, bandwidth)?;

        let vertex = self.pick_vertex(&sim.topology, decl);
        sim.topology.attach(entry.ip, &vertex)?;

        let mut tcp = sim.config.tcp.clone();
        if let Some(recv) = decl.socket_recv_buffer {
            tcp.recv_buffer = recv;
        }
        if let Some(send) = decl.socket_send_buffer {
            tcp.send_buffer = send;
        }

        let data_dir = self.cli.data_dir.join("hosts").join(&entry.hostname);

        let mut config = HostConfig::new(entry.hostname.clone(), entry.ip, &sim.config);
        config.kbps_down = bandwidth.kbps_down;
        config.kbps_up = bandwidth.kbps_up;
        config.cpu_khz = decl.cpu_frequency.unwrap_or(0);
        config.tcp = tcp;
        config.log_level = decl.log_level.clone();
        config.data_dir = Some(data_dir.clone());
        if let Some(buffer) = decl.interface_buffer {
            config.interface_buffer = buffer;
        }

        if decl.log_pcap {
            tracing::warn!(host = %entry.hostname, "Packet capture is not implemented; ignoring logpcap");
        }

        let cell = sim.add_host(config);
        let host_id = cell.id();

        // Each (host, plugin) pair loads its own private library copy.
        let mut loaded: HashMap<&str, Arc<plugin_sandbox::Plugin>> = HashMap::new();

        for process in &decl.processes {
            let path = self
                .plugin_paths
                .get(process.plugin.as_str())
                .copied()
                .with_context(|| format!("Unknown plugin `{}`", process.plugin))?;

            let plugin = match loaded.get(process.plugin.as_str()) {
                Some(plugin) => plugin.clone(),
                None => {
                    let plugin = Arc::new(
                        plugin_sandbox::Plugin::load(path, &data_dir)
                            .with_context(|| format!("Failed to load plugin `{}`", process.plugin))?,
                    );
                    loaded.insert(process.plugin.as_str(), plugin.clone());

                    plugin
                }
            };

            let app = PluginApp::new(plugin, process.arguments.clone());
            let pid = cell
                .lock()
                .add_process(process.plugin.clone(), process.arguments.clone(), Box::new(app));

            self.push(sim, host_id, process.start_time, EventPayload::ProcessStart(pid));

            if let Some(stop) = process.stop_time {
                self.push(sim, host_id, stop, EventPayload::ProcessStop(pid));
            }
        }

        let heartbeat = decl
            .heartbeat_frequency
            .map(SimDuration::from_secs)
            .or(sim.config.heartbeat_interval);
        if let Some(interval) = heartbeat
            && !interval.is_zero()
        {
            self.push(sim, host_id, interval, EventPayload::Heartbeat);
        }

        self.host_index += 1;

        Ok(())
    }

    fn pick_vertex(&self, topology: &Topology, decl: &config::HostDecl) -> String {
        for hint in [&decl.geocodehint, &decl.typehint].into_iter().flatten() {
            if topology.has_vertex(hint) {
                return hint.clone();
            }
        }

        let vertices = topology.vertices();

        vertices[self.host_index % vertices.len()].clone()
    }

    fn push(&mut self, sim: &Sim, dst: sim_core::HostId, at: SimDuration, payload: EventPayload) {
        sim.queue.push(Event {
            time: SimTime::ZERO + at,
            dst,
            key: EventKey {
                src: CONTROLLER_ID,
                seq: self.event_seq,
            },
            payload,
        });

        self.event_seq += 1;
    }
}
