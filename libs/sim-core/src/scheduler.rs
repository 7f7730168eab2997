//! The round-based parallel scheduler.
//!
//! Every round, one thread asks the queue for the safety horizon and the
//! set of hosts with work below it. Workers then claim hosts off a shared
//! list, lock each claimed host and drain its sub-queue up to the horizon.
//! Between rounds everyone meets at a barrier. Because cross-host events
//! always land at or beyond the horizon (the latency floor guarantees
//! it), no event processed this round can affect another host's current
//! round, and results are identical for any worker count.

use std::sync::Barrier;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use sim_time::SimTime;

use crate::worker::Worker;
use crate::{HostId, Sim};

#[derive(Debug, Default)]
struct RoundState {
    horizon: SimTime,
    hosts: Vec<HostId>,
}

pub struct Scheduler {
    workers: usize,
}

impl Scheduler {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    /// Run the simulation to completion: queue empty or stop time reached.
    pub fn run(&self, sim: &Sim) {
        let barrier = Barrier::new(self.workers);
        let round = Mutex::new(RoundState::default());
        let cursor = AtomicUsize::new(0);
        let done = AtomicBool::new(false);

        tracing::info!(
            workers = self.workers,
            hosts = sim.hosts().len(),
            "Starting simulation"
        );

        std::thread::scope(|scope| {
            for index in 0..self.workers {
                let barrier = &barrier;
                let round = &round;
                let cursor = &cursor;
                let done = &done;

                std::thread::Builder::new()
                    .name(format!("worker-{index}"))
                    .spawn_scoped(scope, move || {
                        let worker = Worker::new(sim, index);

                        loop {
                            barrier.wait();

                            if index == 0 {
                                match sim.queue.next_round(sim.config.stop_time) {
                                    Some(next) => {
                                        let mut state = round.lock();
                                        state.horizon = next.horizon;
                                        state.hosts = next.hosts;
                                        cursor.store(0, Ordering::SeqCst);
                                    }
                                    None => done.store(true, Ordering::SeqCst),
                                }
                            }

                            barrier.wait();

                            if done.load(Ordering::SeqCst) {
                                break;
                            }

                            let horizon = round.lock().horizon;

                            loop {
                                let claimed = cursor.fetch_add(1, Ordering::SeqCst);
                                let host_id = {
                                    let state = round.lock();

                                    match state.hosts.get(claimed) {
                                        Some(id) => *id,
                                        None => break,
                                    }
                                };

                                Self::drain_host(&worker, host_id, horizon);
                            }
                        }
                    })
                    .expect("worker threads must spawn");
            }
        });

        tracing::info!(final_time = %sim.queue.peek_time().map(|t| t.to_string()).unwrap_or_else(|| "end".to_owned()), "Simulation finished");
    }

    fn drain_host(worker: &Worker<'_>, host_id: HostId, horizon: SimTime) {
        let cell = worker
            .sim
            .host(host_id)
            .expect("round listed an unknown host");

        let span = tracing::debug_span!("host", name = %cell.hostname());
        let _enter = span.enter();

        let mut host = cell.lock();

        // Events the host schedules for itself during the round are picked
        // up here too; per-host order is total.
        while let Some(event) = worker.sim.queue.pop_next(host_id, horizon) {
            worker.deliver(&mut host, event);
        }
    }
}
