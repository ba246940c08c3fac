//! Actor-model transport substrate: address-based message delivery, timer
//! scheduling with cancellation, and concurrency channeling.
//!
//! A transport implementation is a cheap-to-clone handle; protocol objects
//! move handle clones into the receiver and timer closures that the
//! transport owns. All protocol state is mutated only from callbacks running
//! on the sequential channel.

pub mod config;
pub mod packet;
pub mod simulated;
pub mod timeout;
pub mod udp;
pub mod wire;

use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub use config::FleetConfig;
pub use simulated::SimulatedTransport;
pub use timeout::StatefulTimeout;
pub use udp::UdpTransport;

use crate::types::{ChannelId, ReplicaId};
use crate::utils::ReplicoreError;

/// Receiver callback bound to an address. Runs on an ingress worker and must
/// not block on protocol logic; substantive handling is deferred via
/// [`Transport::spawn`] onto the sequential channel.
pub type ReceiverFn<T> = Box<
    dyn FnMut(<T as Transport>::Address, <T as Transport>::Descriptor) + Send,
>;

// One-shot timer handle states.
const TIMER_ARMED: u8 = 0;
const TIMER_FIRED: u8 = 1;
const TIMER_CANCELLED: u8 = 2;

/// Cancellation handle of a one-shot timer scheduled with
/// [`Transport::spawn_after`]. The firing path and `cancel()` race on an
/// atomic flag: a cancelled timer never runs its callback, and a fired timer
/// clears its own handle, so `is_pending()` turns false either way.
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<AtomicU8>);

impl CancelHandle {
    pub(crate) fn new() -> Self {
        CancelHandle(Arc::new(AtomicU8::new(TIMER_ARMED)))
    }

    /// Disables the pending fire. Returns true if the timer had not fired
    /// (nor been cancelled) yet.
    pub fn cancel(&self) -> bool {
        self.0
            .compare_exchange(
                TIMER_ARMED,
                TIMER_CANCELLED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// True while the timer is armed and has neither fired nor been
    /// cancelled.
    pub fn is_pending(&self) -> bool {
        self.0.load(Ordering::Acquire) == TIMER_ARMED
    }

    /// Claims the fire; the transport's timer path runs the callback only
    /// when this returns true.
    pub(crate) fn try_fire(&self) -> bool {
        self.0
            .compare_exchange(
                TIMER_ARMED,
                TIMER_FIRED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

/// The transport contract every implementation exposes.
///
/// Two channel classes exist: the sequential channel executes timers and
/// `spawn` callbacks one at a time in FIFO order; concurrent channels,
/// dispatched by `spawn_concurrent`, may execute in parallel and are meant
/// for CPU-bound work that does not touch protocol state.
pub trait Transport: Clone + Send + 'static {
    /// Participant address. Equality and hashing must be total.
    type Address: Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + 'static;

    /// Scoped owner of one received message's backing buffer. Receivers may
    /// move a descriptor into a `spawn` closure to defer parsing; the
    /// backing memory is released when the descriptor is dropped. Holding an
    /// unbounded number of live descriptors is a configuration error.
    type Descriptor: AsRef<[u8]> + Send + 'static;

    /// Capacity of one outgoing message buffer; a writer closure must not
    /// produce more than this many bytes.
    const BUFFER_SIZE: usize;

    /// The fleet description this transport was built around.
    fn config(&self) -> &FleetConfig<Self::Address>;

    /// Allocates a fresh unicast address for an ephemeral participant
    /// (i.e., a client).
    fn allocate_address(&self) -> Self::Address;

    /// Binds a receiver callback to an address. Receivers are registered
    /// during startup; one address has at most one receiver.
    fn register_receiver(
        &self,
        address: Self::Address,
        receiver: ReceiverFn<Self>,
    );

    /// Sends an already-serialized payload. Implementation primitive behind
    /// the `send_message*` helpers.
    fn send_buffer(
        &self,
        source: &Self::Address,
        dest: &Self::Address,
        payload: &[u8],
    ) -> Result<(), ReplicoreError>;

    /// Enqueues a callback for execution on the sequential channel.
    fn spawn(&self, callback: impl FnOnce() + Send + 'static);

    /// Enqueues a callback eligible for parallel execution on a concurrent
    /// channel. Must not mutate protocol state; results are handed back via
    /// `spawn`.
    fn spawn_concurrent(&self, callback: impl FnOnce() + Send + 'static);

    /// Schedules a one-shot callback on the sequential channel after
    /// `delay`. The returned handle disables the pending fire when invoked.
    fn spawn_after(
        &self,
        delay: Duration,
        callback: impl FnOnce() + Send + 'static,
    ) -> CancelHandle;

    /// ID of the execution channel the caller currently runs on;
    /// [`crate::types::SEQUENTIAL_CHANNEL`] outside concurrent workers.
    fn channel(&self) -> ChannelId;

    /// Invokes `writer` once with a fixed-capacity buffer and sends the
    /// written prefix to `dest`. The writer is not retained past return.
    fn send_message(
        &self,
        source: &Self::Address,
        dest: &Self::Address,
        writer: impl FnOnce(&mut [u8]) -> usize,
    ) -> Result<(), ReplicoreError> {
        let mut buffer = vec![0u8; Self::BUFFER_SIZE];
        let length = writer(&mut buffer);
        if length > Self::BUFFER_SIZE {
            return Err(ReplicoreError(format!(
                "writer produced {} bytes > buffer size {}",
                length,
                Self::BUFFER_SIZE
            )));
        }
        self.send_buffer(source, dest, &buffer[..length])
    }

    /// Sends to the replica with the given ID.
    fn send_message_to_replica(
        &self,
        source: &Self::Address,
        replica_id: ReplicaId,
        writer: impl FnOnce(&mut [u8]) -> usize,
    ) -> Result<(), ReplicoreError> {
        let dest = self.config().replicas[replica_id as usize].clone();
        self.send_message(source, &dest, writer)
    }

    /// Sends to every replica except the sender itself. The writer is
    /// invoked at most once; the serialized bytes are fanned out.
    fn send_message_to_all(
        &self,
        source: &Self::Address,
        writer: impl FnOnce(&mut [u8]) -> usize,
    ) -> Result<(), ReplicoreError> {
        let mut buffer = vec![0u8; Self::BUFFER_SIZE];
        let length = writer(&mut buffer);
        if length > Self::BUFFER_SIZE {
            return Err(ReplicoreError(format!(
                "writer produced {} bytes > buffer size {}",
                length,
                Self::BUFFER_SIZE
            )));
        }
        for dest in self.config().replicas.clone() {
            if &dest != source {
                self.send_buffer(source, &dest, &buffer[..length])?;
            }
        }
        Ok(())
    }

    /// Sends to the configured multicast address.
    fn send_message_to_multicast(
        &self,
        source: &Self::Address,
        writer: impl FnOnce(&mut [u8]) -> usize,
    ) -> Result<(), ReplicoreError> {
        let dest = match self.config().multicast.clone() {
            Some(dest) => dest,
            None => {
                return Err(ReplicoreError(
                    "no multicast address configured".into(),
                ));
            }
        };
        self.send_message(source, &dest, writer)
    }
}

#[cfg(test)]
mod handle_tests {
    use super::*;

    #[test]
    fn cancel_beats_fire() {
        let handle = CancelHandle::new();
        assert!(handle.is_pending());
        assert!(handle.cancel());
        assert!(!handle.try_fire());
        assert!(!handle.is_pending());
    }

    #[test]
    fn fire_beats_cancel() {
        let handle = CancelHandle::new();
        assert!(handle.try_fire());
        assert!(!handle.cancel());
        assert!(!handle.is_pending());
    }

    #[test]
    fn fire_claims_once() {
        let handle = CancelHandle::new();
        assert!(handle.try_fire());
        assert!(!handle.try_fire());
    }
}
