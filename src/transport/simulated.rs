//! Deterministic in-process transport used to test protocols.
//!
//! All activity is driven from a single thread through a virtual-clock event
//! queue (the "destiny queue"): sends evaluate their writer immediately and
//! enqueue a delivery closure, timers enqueue their callback at `now +
//! delay`. Events at the same virtual instant run in insertion order, which
//! makes every run bit-reproducible given the same configuration, filters,
//! and scheduled callbacks.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::transport::{
    CancelHandle, FleetConfig, ReceiverFn, Transport,
};
use crate::types::{ChannelId, SEQUENTIAL_CHANNEL};
use crate::utils::ReplicoreError;

/// Number of channel IDs round-robined across `spawn_concurrent` callbacks.
/// The simulated transport still runs them one at a time; the IDs only model
/// the sharding a real worker pool would expose.
const N_MODELED_CHANNELS: u64 = 4;

/// Message filter: invoked per (source, dest) pair at send time; returning
/// false drops the message, and the filter may add delivery delay through
/// the mutable duration.
pub type FilterFn =
    Box<dyn FnMut(&str, &str, &mut Duration) -> bool + Send>;

/// Owner of one delivered message's bytes.
pub struct SimulatedDescriptor(Vec<u8>);

impl AsRef<[u8]> for SimulatedDescriptor {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

enum Event {
    Deliver {
        source: String,
        dest: String,
        payload: Vec<u8>,
    },
    Callback {
        channel: ChannelId,
        handle: Option<CancelHandle>,
        callback: Box<dyn FnOnce() + Send>,
    },
}

struct Inner {
    now_us: u64,
    next_seq: u64,
    events: BTreeMap<(u64, u64), Event>,
    receivers: HashMap<String, Arc<Mutex<ReceiverFn<SimulatedTransport>>>>,
    filters: BTreeMap<u32, FilterFn>,
    /// Latest delivery instant scheduled per (source, dest) pair; sends
    /// between the same pair never overtake each other, whatever delays
    /// the filters hand out.
    pair_clock: HashMap<(String, String), u64>,
    current_channel: ChannelId,
    next_concurrent: u64,
    n_allocated: u64,
    terminated: bool,
}

/// Deterministic single-threaded transport. Addresses are arbitrary unique
/// strings. Cloning yields another handle onto the same simulated network.
#[derive(Clone)]
pub struct SimulatedTransport {
    config: Arc<FleetConfig<String>>,
    inner: Arc<Mutex<Inner>>,
}

impl SimulatedTransport {
    /// Creates a simulated network around the given fleet description.
    pub fn new(config: FleetConfig<String>) -> Self {
        SimulatedTransport {
            config: Arc::new(config),
            inner: Arc::new(Mutex::new(Inner {
                now_us: 0,
                next_seq: 0,
                events: BTreeMap::new(),
                receivers: HashMap::new(),
                filters: BTreeMap::new(),
                pair_clock: HashMap::new(),
                current_channel: SEQUENTIAL_CHANNEL,
                next_concurrent: 0,
                n_allocated: 0,
                terminated: false,
            })),
        }
    }

    /// Drives the event queue until it drains or `terminate()` is called.
    /// Reaching `time_limit` with events still pending is a fatal condition
    /// and reported as an error.
    pub fn run(&self, time_limit: Duration) -> Result<(), ReplicoreError> {
        let limit_us = time_limit.as_micros() as u64;
        loop {
            let event = {
                let mut inner = self.inner.lock().unwrap();
                if inner.terminated {
                    inner.terminated = false;
                    return Ok(());
                }
                match inner.events.pop_first() {
                    None => return Ok(()),
                    Some(((time_us, _), event)) => {
                        if time_us > limit_us {
                            return logged_err!(
                                "sim";
                                "event queue still live at time limit {:?}",
                                time_limit
                            );
                        }
                        inner.now_us = time_us;
                        event
                    }
                }
            };
            self.execute(event);
        }
    }

    /// Empties the destiny queue, making a `run` in progress return once the
    /// current event finishes.
    pub fn terminate(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.events.clear();
        inner.terminated = true;
    }

    /// Virtual time elapsed since construction.
    pub fn elapsed(&self) -> Duration {
        Duration::from_micros(self.inner.lock().unwrap().now_us)
    }

    /// Installs a message filter under the given ID; filters run in ID
    /// order. Re-inserting an ID replaces the previous filter.
    pub fn insert_filter(
        &self,
        filter_id: u32,
        filter: impl FnMut(&str, &str, &mut Duration) -> bool + Send + 'static,
    ) {
        let mut inner = self.inner.lock().unwrap();
        inner.filters.insert(filter_id, Box::new(filter));
    }

    /// Removes the filter under the given ID, if any.
    pub fn remove_filter(&self, filter_id: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.filters.remove(&filter_id);
    }

    fn enqueue_at(&self, inner: &mut Inner, time_us: u64, event: Event) {
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.events.insert((time_us, seq), event);
    }

    fn enqueue_unicast(
        &self,
        inner: &mut Inner,
        source: &str,
        dest: &str,
        payload: &[u8],
    ) {
        let mut delay = Duration::ZERO;
        for filter in inner.filters.values_mut() {
            if !filter(source, dest, &mut delay) {
                pf_debug!("sim"; "dropped {} -> {} ({} bytes)",
                                 source, dest, payload.len());
                return;
            }
        }

        let pair = (source.to_string(), dest.to_string());
        let mut time_us = inner.now_us + delay.as_micros() as u64;
        if let Some(&scheduled) = inner.pair_clock.get(&pair) {
            time_us = time_us.max(scheduled);
        }
        inner.pair_clock.insert(pair, time_us);

        self.enqueue_at(
            inner,
            time_us,
            Event::Deliver {
                source: source.to_string(),
                dest: dest.to_string(),
                payload: payload.to_vec(),
            },
        );
    }

    fn execute(&self, event: Event) {
        match event {
            Event::Deliver {
                source,
                dest,
                payload,
            } => {
                let receiver = {
                    let inner = self.inner.lock().unwrap();
                    match inner.receivers.get(&dest) {
                        Some(receiver) => receiver.clone(),
                        // a message to an unknown destination signals a
                        // mis-wired test setup, not a runtime condition
                        None => panic!(
                            "simulated send to unknown destination '{}'",
                            dest
                        ),
                    }
                };
                let mut receiver = receiver.lock().unwrap();
                (receiver)(source, SimulatedDescriptor(payload));
            }
            Event::Callback {
                channel,
                handle,
                callback,
            } => {
                if let Some(handle) = handle {
                    if !handle.try_fire() {
                        return; // cancelled underway
                    }
                }
                self.inner.lock().unwrap().current_channel = channel;
                callback();
                self.inner.lock().unwrap().current_channel =
                    SEQUENTIAL_CHANNEL;
            }
        }
    }
}

impl Transport for SimulatedTransport {
    type Address = String;
    type Descriptor = SimulatedDescriptor;

    const BUFFER_SIZE: usize = 9000;

    fn config(&self) -> &FleetConfig<String> {
        &self.config
    }

    fn allocate_address(&self) -> String {
        let mut inner = self.inner.lock().unwrap();
        inner.n_allocated += 1;
        format!("client-{}", inner.n_allocated)
    }

    fn register_receiver(
        &self,
        address: String,
        receiver: ReceiverFn<Self>,
    ) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .receivers
            .insert(address, Arc::new(Mutex::new(receiver)));
    }

    fn send_buffer(
        &self,
        source: &String,
        dest: &String,
        payload: &[u8],
    ) -> Result<(), ReplicoreError> {
        let mut inner = self.inner.lock().unwrap();
        if Some(dest) == self.config.multicast.as_ref() {
            // multicast fans out to the whole fleet; filters still apply
            // per destination
            for dest in self.config.replicas.iter() {
                self.enqueue_unicast(&mut inner, source, dest, payload);
            }
        } else {
            self.enqueue_unicast(&mut inner, source, dest, payload);
        }
        Ok(())
    }

    fn spawn(&self, callback: impl FnOnce() + Send + 'static) {
        let mut inner = self.inner.lock().unwrap();
        let now_us = inner.now_us;
        self.enqueue_at(
            &mut inner,
            now_us,
            Event::Callback {
                channel: SEQUENTIAL_CHANNEL,
                handle: None,
                callback: Box::new(callback),
            },
        );
    }

    fn spawn_concurrent(&self, callback: impl FnOnce() + Send + 'static) {
        let mut inner = self.inner.lock().unwrap();
        let channel =
            (inner.next_concurrent % N_MODELED_CHANNELS) as ChannelId;
        inner.next_concurrent += 1;
        let now_us = inner.now_us;
        self.enqueue_at(
            &mut inner,
            now_us,
            Event::Callback {
                channel,
                handle: None,
                callback: Box::new(callback),
            },
        );
    }

    fn spawn_after(
        &self,
        delay: Duration,
        callback: impl FnOnce() + Send + 'static,
    ) -> CancelHandle {
        let handle = CancelHandle::new();
        let mut inner = self.inner.lock().unwrap();
        let time_us = inner.now_us + delay.as_micros() as u64;
        self.enqueue_at(
            &mut inner,
            time_us,
            Event::Callback {
                channel: SEQUENTIAL_CHANNEL,
                handle: Some(handle.clone()),
                callback: Box::new(callback),
            },
        );
        handle
    }

    fn channel(&self) -> ChannelId {
        self.inner.lock().unwrap().current_channel
    }
}

#[cfg(test)]
mod simulated_tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn unconfigured() -> SimulatedTransport {
        SimulatedTransport::new(FleetConfig {
            n_fault: 0,
            replicas: vec![],
            multicast: None,
        })
    }

    /// Registers a receiver that records the latest (source, bytes) pair.
    fn recording_receiver(
        transport: &SimulatedTransport,
        address: &str,
    ) -> Arc<Mutex<Option<(String, Vec<u8>)>>> {
        let latest = Arc::new(Mutex::new(None));
        let latest_ref = latest.clone();
        transport.register_receiver(
            address.into(),
            Box::new(move |remote, descriptor| {
                *latest_ref.lock().unwrap() =
                    Some((remote, descriptor.as_ref().to_vec()));
            }),
        );
        latest
    }

    #[test]
    fn one_message() -> Result<(), ReplicoreError> {
        let transport = unconfigured();
        let _unused_a = recording_receiver(&transport, "A");
        let latest_b = recording_receiver(&transport, "B");

        transport.send_buffer(&"A".into(), &"B".into(), &[0, 1, 2, 3])?;
        transport.run(Duration::from_millis(10))?;

        assert_eq!(
            *latest_b.lock().unwrap(),
            Some(("A".to_string(), vec![0, 1, 2, 3]))
        );
        Ok(())
    }

    #[test]
    #[should_panic(expected = "unknown destination")]
    fn unknown_destination_is_fatal() {
        let transport = unconfigured();
        let _latest = recording_receiver(&transport, "A");
        transport
            .send_buffer(&"A".into(), &"nobody".into(), &[9])
            .unwrap();
        let _ = transport.run(Duration::from_millis(1));
    }

    #[test]
    fn same_instant_insertion_order() -> Result<(), ReplicoreError> {
        let transport = unconfigured();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = order.clone();
            transport.spawn(move || order.lock().unwrap().push(i));
        }
        transport.run(Duration::from_millis(1))?;
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        Ok(())
    }

    #[test]
    fn timer_fires_at_deadline() -> Result<(), ReplicoreError> {
        let transport = unconfigured();
        let fired_at = Arc::new(Mutex::new(None));
        let fired_at_ref = fired_at.clone();
        let transport_ref = transport.clone();
        transport.spawn_after(Duration::from_millis(42), move || {
            *fired_at_ref.lock().unwrap() = Some(transport_ref.elapsed());
        });
        transport.run(Duration::from_millis(100))?;
        assert_eq!(
            *fired_at.lock().unwrap(),
            Some(Duration::from_millis(42))
        );
        Ok(())
    }

    #[test]
    fn cancelled_timer_never_fires() -> Result<(), ReplicoreError> {
        let transport = unconfigured();
        let count = Arc::new(AtomicUsize::new(0));
        let count_ref = count.clone();
        let handle = transport.spawn_after(Duration::from_millis(5), move || {
            count_ref.fetch_add(1, Ordering::SeqCst);
        });
        assert!(handle.cancel());
        transport.run(Duration::from_millis(10))?;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[test]
    fn live_queue_at_limit_is_error() {
        let transport = unconfigured();
        transport.spawn_after(Duration::from_millis(20), || {});
        assert!(transport.run(Duration::from_millis(10)).is_err());
    }

    #[test]
    fn filters_drop_and_delay() -> Result<(), ReplicoreError> {
        let transport = unconfigured();
        let latest = recording_receiver(&transport, "B");

        // filter 1 drops everything
        transport.insert_filter(1, |_, _, _| false);
        transport.send_buffer(&"B".into(), &"B".into(), &[1])?;
        transport.run(Duration::from_millis(1))?;
        assert!(latest.lock().unwrap().is_none());

        // replace with a fixed 3 ms delay
        transport.remove_filter(1);
        transport.insert_filter(2, |_, _, delay| {
            *delay += Duration::from_millis(3);
            true
        });
        transport.send_buffer(&"B".into(), &"B".into(), &[2])?;
        let elapsed_before = transport.elapsed();
        transport.run(Duration::from_millis(10))?;
        assert!(latest.lock().unwrap().is_some());
        assert_eq!(
            transport.elapsed() - elapsed_before,
            Duration::from_millis(3)
        );
        Ok(())
    }

    #[test]
    fn concurrent_channel_ids() -> Result<(), ReplicoreError> {
        let transport = unconfigured();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let (transport_ref, seen_ref) = (transport.clone(), seen.clone());
        transport.spawn(move || {
            seen_ref.lock().unwrap().push(transport_ref.channel());
        });
        for _ in 0..2 {
            let (transport_ref, seen_ref) = (transport.clone(), seen.clone());
            transport.spawn_concurrent(move || {
                seen_ref.lock().unwrap().push(transport_ref.channel());
            });
        }

        transport.run(Duration::from_millis(1))?;
        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], SEQUENTIAL_CHANNEL);
        assert!(seen[1] >= 0 && seen[2] >= 0 && seen[1] != seen[2]);
        Ok(())
    }

    /// Filters handing later messages smaller delays must not reorder a
    /// (source, dest) pair's deliveries.
    #[test]
    fn same_pair_fifo_under_delays() -> Result<(), ReplicoreError> {
        let transport = unconfigured();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_ref = seen.clone();
        transport.register_receiver(
            "B".into(),
            Box::new(move |_, descriptor| {
                seen_ref.lock().unwrap().push(descriptor.as_ref()[0]);
            }),
        );

        // shrinking delays: 5 ms, 4 ms, 3 ms, ...
        let mut next_delay = 6;
        transport.insert_filter(1, move |_, _, delay| {
            next_delay -= 1;
            *delay += Duration::from_millis(next_delay);
            true
        });
        for i in 0..5u8 {
            transport.send_buffer(&"A".into(), &"B".into(), &[i])?;
        }
        transport.run(Duration::from_millis(100))?;
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        Ok(())
    }

    /// Two runs with identical configuration, filters, and callbacks must
    /// produce identical event orderings.
    #[test]
    fn deterministic_replay() -> Result<(), ReplicoreError> {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        fn trace_run() -> Result<Vec<(u64, String)>, ReplicoreError> {
            let transport = SimulatedTransport::new(FleetConfig::new(
                0,
                vec!["p".to_string(), "q".to_string()],
            ));
            let trace = Arc::new(Mutex::new(Vec::new()));

            let mut rng = StdRng::seed_from_u64(0x5eed);
            transport.insert_filter(1, move |_, _, delay| {
                *delay += Duration::from_micros(rng.gen_range(100..500));
                true
            });

            for name in ["p", "q"] {
                let trace = trace.clone();
                let transport_ref = transport.clone();
                transport.register_receiver(
                    name.into(),
                    Box::new(move |remote, descriptor| {
                        trace.lock().unwrap().push((
                            transport_ref.elapsed().as_micros() as u64,
                            format!(
                                "{} {:?}",
                                remote,
                                descriptor.as_ref()
                            ),
                        ));
                    }),
                );
            }

            for i in 0..10u8 {
                transport.send_buffer(&"p".into(), &"q".into(), &[i])?;
                transport.send_buffer(&"q".into(), &"p".into(), &[i])?;
            }
            transport.run(Duration::from_millis(10))?;
            let observed = trace.lock().unwrap().clone();
            Ok(observed)
        }

        assert_eq!(trace_run()?, trace_run()?);
        Ok(())
    }
}
