//! Replication protocol: Viewstamped Replication.
//!
//! The reference protocol of the substrate: primary/backup normal
//! operation with batched prepares, plus the view-change sub-protocol.
//! Cross-view state transfer (a backup discovering a log gap, or a new
//! view whose log is ahead of ours) is not implemented; those paths abort,
//! which is sound on the drop-free test networks this repo targets.

mod messages;
mod request;
mod viewchange;


pub use messages::{
    CommitMessage, DoViewChangeMessage, PrepareMessage, PrepareOkMessage,
    ReplicaMessage, StartViewChangeMessage, StartViewMessage, ZeroLog,
};

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::protocols::{ClientSetup, Protocol, SendStrategy};
use crate::server::clients::ClientTable;
use crate::server::log::{Block, ListLog, BLOCK_SIZE};
use crate::server::quorum::QuorumSet;
use crate::transport::{wire, StatefulTimeout, Transport};
use crate::types::{OpNumber, ReplicaId, ReplyMessage, ViewNumber};
use crate::utils::ReplicoreError;

/// Protocol tag for client wiring: route to the primary, one reply
/// suffices (replicas are trusted).
pub struct Vr;

impl Protocol for Vr {
    type ReplicaMessage = ReplicaMessage;

    const FAULT_MULTIPLIER: usize = 0;

    fn client_setup(n_fault: usize) -> ClientSetup {
        ClientSetup {
            strategy: SendStrategy::PrimaryFirst,
            resend_interval: Duration::from_millis(1000),
            n_matched: Self::n_matched(n_fault),
        }
    }
}

/// Configuration parameters struct.
#[derive(Debug, Clone)]
pub struct VrReplicaConfig {
    /// Number of requests batched under one op number; must stay within
    /// the log's block size.
    pub batch_size: usize,

    /// Primary's idle commit broadcast interval in millisecs.
    pub idle_commit_interval_ms: u64,

    /// Backup's view change timeout in millisecs.
    pub view_change_interval_ms: u64,
}

impl Default for VrReplicaConfig {
    fn default() -> Self {
        VrReplicaConfig {
            batch_size: 1,
            idle_commit_interval_ms: 200,
            view_change_interval_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Status {
    Normal,
    ViewChange,
}

/// VR server replica.
pub struct VrReplica<T: Transport> {
    transport: T,
    address: T::Address,
    replica_id: ReplicaId,
    config: VrReplicaConfig,

    pub(crate) status: Status,
    pub(crate) view_number: ViewNumber,
    op_number: OpNumber,
    commit_number: OpNumber,
    /// Latest view in which this replica's status was normal.
    latest_normal: ViewNumber,

    /// Requests accepted but not yet closed into a prepared block.
    pending_batch: Block,
    client_table: ClientTable<T::Address>,
    pub(crate) log: ListLog,

    prepare_ok_set: QuorumSet<OpNumber, PrepareOkMessage>,
    start_view_change_set: QuorumSet<ViewNumber, StartViewChangeMessage>,
    do_view_change_set: QuorumSet<ViewNumber, DoViewChangeMessage>,

    idle_commit_timeout: StatefulTimeout<T>,
    view_change_timeout: StatefulTimeout<T>,
}

impl<T: Transport> VrReplica<T> {
    /// Creates the replica, arms its role's timer, and registers its
    /// receiver with the transport.
    pub fn new_and_setup(
        transport: T,
        log: ListLog,
        replica_id: ReplicaId,
        config: VrReplicaConfig,
    ) -> Result<Arc<Mutex<Self>>, ReplicoreError> {
        if config.batch_size == 0 || config.batch_size > BLOCK_SIZE {
            return logged_err!(replica_id;
                               "invalid config.batch_size '{}'",
                               config.batch_size);
        }
        let n_fault = transport.config().n_fault;
        if transport.config().n_replicas() != 2 * n_fault + 1 {
            return logged_err!(replica_id;
                               "fleet of {} replicas cannot tolerate {} faults",
                               transport.config().n_replicas(), n_fault);
        }
        let address = transport.config().replicas[replica_id as usize].clone();

        let replica = Arc::new_cyclic(|weak_self: &Weak<Mutex<Self>>| {
            let idle_commit_timeout = Self::protocol_timer(
                &transport,
                weak_self.clone(),
                Duration::from_millis(config.idle_commit_interval_ms),
                Self::on_idle_commit,
            );
            let view_change_timeout = Self::protocol_timer(
                &transport,
                weak_self.clone(),
                Duration::from_millis(config.view_change_interval_ms),
                Self::on_view_change_timer,
            );

            Mutex::new(VrReplica {
                transport: transport.clone(),
                address: address.clone(),
                replica_id,
                config,
                status: Status::Normal,
                view_number: 0,
                op_number: 0,
                commit_number: 0,
                latest_normal: 0,
                pending_batch: Block::default(),
                client_table: ClientTable::new(),
                log,
                prepare_ok_set: QuorumSet::new(n_fault),
                start_view_change_set: QuorumSet::new(n_fault),
                do_view_change_set: QuorumSet::new(n_fault + 1),
                idle_commit_timeout,
                view_change_timeout,
            })
        });

        {
            let mut guard = replica.lock().unwrap();
            if guard.is_primary() {
                guard.idle_commit_timeout.enable();
            } else {
                guard.view_change_timeout.enable();
            }
        }

        let receiver_replica = Arc::downgrade(&replica);
        let receiver_transport = transport.clone();
        transport.register_receiver(
            address,
            Box::new(move |remote, descriptor| {
                // defer parsing and handling onto the sequential channel
                let replica = receiver_replica.clone();
                receiver_transport.spawn(move || {
                    let message = match wire::deserialize::<ReplicaMessage>(
                        descriptor.as_ref(),
                    ) {
                        Ok(message) => message,
                        Err(e) => {
                            pf_warn!("vr"; "dropping undecodable message: {}",
                                           e);
                            return;
                        }
                    };
                    let replica = match replica.upgrade() {
                        Some(replica) => replica,
                        None => return,
                    };
                    let mut replica = replica.lock().unwrap();
                    if let Err(e) = replica.handle_message(remote, message) {
                        let replica_id = replica.replica_id;
                        pf_error!(replica_id; "fatal protocol error: {}", e);
                        panic!("vr replica {} died: {}", replica_id, e);
                    }
                });
            }),
        );

        Ok(replica)
    }

    /// Wraps a `(&mut self) -> Result` protocol step into a stateful-timer
    /// callback that runs it under the replica's lock.
    fn protocol_timer(
        transport: &T,
        weak_self: Weak<Mutex<Self>>,
        delay: Duration,
        step: fn(&mut Self) -> Result<(), ReplicoreError>,
    ) -> StatefulTimeout<T> {
        StatefulTimeout::new(transport.clone(), delay, move || {
            let replica = match weak_self.upgrade() {
                Some(replica) => replica,
                None => return,
            };
            let mut replica = replica.lock().unwrap();
            if let Err(e) = step(&mut replica) {
                let replica_id = replica.replica_id;
                pf_error!(replica_id; "fatal protocol error: {}", e);
                panic!("vr replica {} died: {}", replica_id, e);
            }
        })
    }

    fn handle_message(
        &mut self,
        remote: T::Address,
        message: ReplicaMessage,
    ) -> Result<(), ReplicoreError> {
        match message {
            ReplicaMessage::Request(request) => {
                self.handle_request(remote, request)
            }
            ReplicaMessage::Prepare(prepare) => self.handle_prepare(prepare),
            ReplicaMessage::PrepareOk(prepare_ok) => {
                self.handle_prepare_ok(prepare_ok)
            }
            ReplicaMessage::Commit(commit) => self.handle_commit(commit),
            ReplicaMessage::StartViewChange(start_view_change) => {
                self.handle_start_view_change(start_view_change)
            }
            ReplicaMessage::DoViewChange(do_view_change) => {
                self.handle_do_view_change(do_view_change)
            }
            ReplicaMessage::StartView(start_view) => {
                self.handle_start_view(start_view)
            }
        }
    }

    #[inline]
    fn is_primary(&self) -> bool {
        self.transport.config().primary(self.view_number) == self.replica_id
    }

    /// Commits every op through `up_to`: executes entries in order, caches
    /// replies in the client table, and (on the primary) sends them out.
    fn commit_up_to(
        &mut self,
        up_to: OpNumber,
    ) -> Result<(), ReplicoreError> {
        let is_primary = self.is_primary();
        let view_number = self.view_number;
        let replica_id = self.replica_id;
        let from = self.commit_number + 1;

        let Self {
            ref mut log,
            ref mut client_table,
            ref transport,
            ref address,
            ..
        } = *self;
        for index in from..=up_to {
            log.commit(index, |client_id, request_number, result| {
                let reply = ReplyMessage {
                    request_number,
                    result,
                    view_number,
                    replica_id,
                };
                if let Some((remote, reply)) =
                    client_table.update(client_id, request_number, reply)
                {
                    if is_primary {
                        if let Err(e) = transport.send_message(
                            address,
                            &remote,
                            wire::writer(&reply),
                        ) {
                            pf_error!(replica_id;
                                      "error sending reply: {}", e);
                        }
                    }
                }
            })?;
        }
        self.commit_number = up_to;
        Ok(())
    }
}
