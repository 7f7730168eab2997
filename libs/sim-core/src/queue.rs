//! The shared event queue.
//!
//! One ordered sub-queue per destination host. Rounds work on a safety
//! horizon: `min(queued time) + min inter-host latency`. Events strictly
//! below the horizon cannot be influenced by anything still in flight —
//! any cross-host effect needs at least one minimum-latency hop — so
//! workers may process different hosts' sub-queues in parallel. A host
//! scheduling for *itself* may land inside the current round; its worker
//! keeps draining the sub-queue until the horizon, preserving per-host
//! order.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use sim_time::{SimDuration, SimTime};

use crate::event::{Event, EventKey, EventPayload};
use crate::HostId;

/// A cross-host event was scheduled closer than one minimum-latency hop.
/// This breaks the parallel-safety invariant and is fatal.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("event scheduled {delay} ahead, below the minimum inter-host latency {min_latency}")]
pub struct InvalidSchedule {
    pub delay: SimDuration,
    pub min_latency: SimDuration,
}

#[derive(Debug)]
pub struct Round {
    pub horizon: SimTime,
    pub hosts: Vec<HostId>,
}

#[derive(Debug, Default)]
struct Inner {
    by_host: BTreeMap<HostId, BTreeMap<(SimTime, EventKey), EventPayload>>,
    len: usize,
}

#[derive(Debug)]
pub struct EventQueue {
    inner: Mutex<Inner>,
    min_latency: SimDuration,
}

impl EventQueue {
    pub fn new(min_latency: SimDuration) -> Self {
        debug_assert!(!min_latency.is_zero());

        Self {
            inner: Mutex::new(Inner::default()),
            min_latency,
        }
    }

    pub fn min_latency(&self) -> SimDuration {
        self.min_latency
    }

    /// Insert an event at `now + delay`, addressed to `dst`.
    pub fn schedule(
        &self,
        now: SimTime,
        delay: SimDuration,
        src: HostId,
        dst: HostId,
        seq: u64,
        payload: EventPayload,
    ) -> Result<(), InvalidSchedule> {
        if src != dst && delay < self.min_latency {
            return Err(InvalidSchedule {
                delay,
                min_latency: self.min_latency,
            });
        }

        self.push(Event {
            time: now + delay,
            dst,
            key: EventKey { src, seq },
            payload,
        });

        Ok(())
    }

    pub fn push(&self, event: Event) {
        let mut inner = self.inner.lock();

        inner
            .by_host
            .entry(event.dst)
            .or_default()
            .insert((event.time, event.key), event.payload);
        inner.len += 1;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start the next round: the horizon and the hosts with work below it.
    /// Returns `None` once no event earlier than `stop` remains.
    pub fn next_round(&self, stop: SimTime) -> Option<Round> {
        let inner = self.inner.lock();

        let min_time = inner
            .by_host
            .values()
            .filter_map(|q| q.keys().next())
            .map(|(time, _)| *time)
            .min()?;

        if min_time >= stop {
            return None;
        }

        let horizon = min_time.saturating_add(self.min_latency).min(stop);

        let hosts = inner
            .by_host
            .iter()
            .filter(|(_, q)| matches!(q.keys().next(), Some((time, _)) if *time < horizon))
            .map(|(host, _)| *host)
            .collect();

        Some(Round { horizon, hosts })
    }

    /// Pop `host`'s earliest event if it lies strictly below the horizon.
    pub fn pop_next(&self, host: HostId, horizon: SimTime) -> Option<Event> {
        let mut inner = self.inner.lock();

        let queue = inner.by_host.get_mut(&host)?;
        let (time, key) = *queue.keys().next()?;

        if time >= horizon {
            return None;
        }

        let payload = queue.remove(&(time, key)).expect("key was just observed");
        inner.len -= 1;

        Some(Event {
            time,
            dst: host,
            key,
            payload,
        })
    }

    /// Earliest queued delivery time, if any.
    pub fn peek_time(&self) -> Option<SimTime> {
        self.inner
            .lock()
            .by_host
            .values()
            .filter_map(|q| q.keys().next())
            .map(|(time, _)| *time)
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CONTROLLER_ID;
    use proptest::prelude::*;

    const MS: SimDuration = SimDuration::MILLISECOND;

    fn queue() -> EventQueue {
        EventQueue::new(MS * 10)
    }

    fn heartbeat_at(q: &EventQueue, time_ms: u64, dst: u32, seq: u64) {
        q.push(Event {
            time: SimTime::ZERO + MS * time_ms as u32,
            dst: HostId(dst),
            key: EventKey {
                src: CONTROLLER_ID,
                seq,
            },
            payload: EventPayload::Heartbeat,
        });
    }

    #[test]
    fn cross_host_below_min_latency_is_rejected() {
        let q = queue();

        let err = q
            .schedule(
                SimTime::ZERO,
                MS * 5,
                HostId(1),
                HostId(2),
                0,
                EventPayload::Heartbeat,
            )
            .unwrap_err();

        assert_eq!(err.min_latency, MS * 10);
    }

    #[test]
    fn same_host_may_schedule_arbitrarily_close() {
        let q = queue();

        q.schedule(
            SimTime::ZERO,
            SimDuration::ZERO,
            HostId(1),
            HostId(1),
            0,
            EventPayload::Heartbeat,
        )
        .unwrap();

        assert_eq!(q.len(), 1);
    }

    #[test]
    fn round_covers_min_plus_latency() {
        let q = queue();
        heartbeat_at(&q, 0, 1, 0);
        heartbeat_at(&q, 5, 2, 1);
        heartbeat_at(&q, 15, 3, 2);

        let round = q.next_round(SimTime::MAX).unwrap();

        assert_eq!(round.horizon, SimTime::ZERO + MS * 10);
        assert_eq!(round.hosts, vec![HostId(1), HostId(2)]);
    }

    #[test]
    fn pop_respects_horizon() {
        let q = queue();
        heartbeat_at(&q, 0, 1, 0);
        heartbeat_at(&q, 12, 1, 1);

        let round = q.next_round(SimTime::MAX).unwrap();

        assert!(q.pop_next(HostId(1), round.horizon).is_some());
        assert!(q.pop_next(HostId(1), round.horizon).is_none());
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn stop_time_ends_the_run() {
        let q = queue();
        heartbeat_at(&q, 50, 1, 0);

        assert!(q.next_round(SimTime::ZERO + MS * 50).is_none());
    }

    proptest! {
        #[test]
        fn per_host_pop_order_is_sorted(times in proptest::collection::vec(0u64..1_000, 1..50)) {
            let q = EventQueue::new(SimDuration::SECOND);

            for (seq, t) in times.iter().enumerate() {
                heartbeat_at(&q, *t, 1, seq as u64);
            }

            let mut previous = None;
            while let Some(event) = q.pop_next(HostId(1), SimTime::MAX) {
                if let Some(p) = previous {
                    prop_assert!(p <= (event.time, event.key));
                }
                previous = Some((event.time, event.key));
            }
        }
    }
}
