//! Replication protocol: unreplicated.
//!
//! A single replica prepares and commits every client request immediately.
//! Useful as the minimal conformance instance of the log/transport
//! substrate and as a throughput baseline.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocols::{ClientSetup, Protocol, SendStrategy};
use crate::server::clients::{ClientTable, Shortcut};
use crate::server::log::{Block, Entry, ListLog};
use crate::transport::{wire, Transport};
use crate::types::{OpNumber, ReplyMessage, RequestMessage};
use crate::utils::ReplicoreError;

/// Replica-bound message union.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum ReplicaMessage {
    Request(RequestMessage),
}

impl From<RequestMessage> for ReplicaMessage {
    fn from(request: RequestMessage) -> Self {
        ReplicaMessage::Request(request)
    }
}

/// Protocol tag for client wiring.
pub struct Unreplicated;

impl Protocol for Unreplicated {
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

/// The unreplicated server replica. Always replica 0 of its group.
pub struct UnreplicatedReplica<T: Transport> {
    transport: T,
    address: T::Address,

    op_number: OpNumber,
    client_table: ClientTable<T::Address>,
    log: ListLog,
}

impl<T: Transport> UnreplicatedReplica<T> {
    /// Creates the replica and registers it at address index 0.
    pub fn new_and_setup(transport: T, log: ListLog) -> Arc<Mutex<Self>> {
        let address = transport.config().replicas[0].clone();
        let replica = Arc::new(Mutex::new(UnreplicatedReplica {
            transport: transport.clone(),
            address: address.clone(),
            op_number: 0,
            client_table: ClientTable::new(),
            log,
        }));

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
                            pf_warn!(0; "dropping undecodable message: {}",
                                        e);
                            return;
                        }
                    };
                    let replica = match replica.upgrade() {
                        Some(replica) => replica,
                        None => return,
                    };
                    let mut replica = replica.lock().unwrap();
                    let ReplicaMessage::Request(request) = message;
                    if let Err(e) = replica.handle_request(remote, request) {
                        pf_error!(0; "fatal protocol error: {}", e);
                        panic!("unreplicated replica died: {}", e);
                    }
                });
            }),
        );

        replica
    }

    /// Commit frontier of the log, for harness inspection.
    pub fn commit_number(&self) -> OpNumber {
        self.log.commit_number()
    }

    fn handle_request(
        &mut self,
        remote: T::Address,
        request: RequestMessage,
    ) -> Result<(), ReplicoreError> {
        match self.client_table.check(
            &remote,
            request.client_id,
            request.request_number,
        )? {
            Some(Shortcut::Ignore) => return Ok(()),
            Some(Shortcut::Reply(remote, reply)) => {
                return self.send_reply(&remote, &reply);
            }
            None => {}
        }

        self.op_number += 1;
        let block = Block {
            entries: vec![Entry {
                client_id: request.client_id,
                request_number: request.request_number,
                op: request.op,
            }],
        };
        self.log.prepare(self.op_number, block)?;

        let op_number = self.op_number;
        let Self {
            ref mut log,
            ref mut client_table,
            ref transport,
            ref address,
            ..
        } = *self;
        log.commit(op_number, |client_id, request_number, result| {
            let reply = ReplyMessage {
                request_number,
                result,
                view_number: 0,
                replica_id: 0,
            };
            if let Some((remote, reply)) =
                client_table.update(client_id, request_number, reply)
            {
                if let Err(e) = transport.send_message(
                    address,
                    &remote,
                    wire::writer(&reply),
                ) {
                    pf_error!(0; "error sending reply: {}", e);
                }
            }
        })
    }

    fn send_reply(
        &self,
        remote: &T::Address,
        reply: &ReplyMessage,
    ) -> Result<(), ReplicoreError> {
        self.transport
            .send_message(&self.address, remote, wire::writer(reply))
    }
}

#[cfg(test)]
mod unreplicated_tests {
    use super::*;
    use crate::client::{BasicClient, GenericClient};
    use crate::server::statemach::MockApp;
    use crate::transport::{FleetConfig, SimulatedTransport};
    use crate::types::Data;

    fn single_replica_fleet() -> SimulatedTransport {
        SimulatedTransport::new(FleetConfig::new(
            0,
            vec!["replica-0".to_string()],
        ))
    }

    #[test]
    fn ten_clients_end_to_end() -> Result<(), ReplicoreError> {
        let transport = single_replica_fleet();
        let app = MockApp::new_shared();
        let replica = UnreplicatedReplica::new_and_setup(
            transport.clone(),
            ListLog::new(app.clone()),
        );

        let results = Arc::new(Mutex::new(Vec::new()));
        let mut clients = Vec::new();
        for _ in 0..10 {
            let client = BasicClient::<_, Unreplicated>::new_and_setup(
                transport.clone(),
            );
            let results_ref = results.clone();
            client.lock().unwrap().invoke(
                Data::from_slice(b"Test operation"),
                Box::new(move |result| {
                    results_ref.lock().unwrap().push(result);
                }),
            )?;
            clients.push(client);
        }

        transport.run(Duration::from_secs(2))?;

        let results = results.lock().unwrap();
        assert_eq!(results.len(), 10);
        for result in results.iter() {
            assert_eq!(&result[..], b"Re: Test operation");
        }
        assert_eq!(app.lock().unwrap().op_list.len(), 10);
        assert_eq!(replica.lock().unwrap().commit_number(), 10);
        Ok(())
    }

    #[test]
    fn resend_survives_drops() -> Result<(), ReplicoreError> {
        let transport = single_replica_fleet();
        let app = MockApp::new_shared();
        let _replica = UnreplicatedReplica::new_and_setup(
            transport.clone(),
            ListLog::new(app),
        );
        let client =
            BasicClient::<_, Unreplicated>::new_and_setup(transport.clone());

        // drop every packet until the filter is lifted
        transport.insert_filter(1, |_, _, _| false);

        let invoked = Arc::new(Mutex::new(false));
        {
            let client = client.clone();
            let invoked = invoked.clone();
            let transport_ref = transport.clone();
            transport.spawn_after(Duration::from_micros(10), move || {
                client
                    .lock()
                    .unwrap()
                    .invoke(
                        Data::from_slice(b"Test operation"),
                        Box::new(move |_result| {
                            *invoked.lock().unwrap() = true;
                            transport_ref.terminate();
                        }),
                    )
                    .unwrap();
            });
        }
        {
            let transport_ref = transport.clone();
            transport.spawn_after(Duration::from_micros(20), move || {
                transport_ref.remove_filter(1);
            });
        }

        transport.run(Duration::from_secs(5))?;
        assert!(*invoked.lock().unwrap());
        Ok(())
    }
}
