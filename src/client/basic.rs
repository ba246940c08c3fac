//! Basic client: retry loop, primary-first routing, reply quorum matching.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};

use crate::client::{generate_client_id, GenericClient, InvokeCallback};
use crate::protocols::{ClientSetup, Protocol, SendStrategy};
use crate::transport::{wire, Transport};
use crate::types::{
    ClientId, Data, ReplicaId, ReplyMessage, RequestMessage, RequestNumber,
    ViewNumber, MAX_DATA_LEN,
};
use crate::utils::ReplicoreError;

// Bookkeeping of the one in-flight invocation.
struct Pending {
    request_number: RequestNumber,
    op: Data,
    /// reply bytes -> replicas that reported them; used only when more
    /// than one matching reply is required
    result_table: HashMap<Data, HashSet<ReplicaId>>,
    callback: Option<InvokeCallback>,
}

/// Client stub for protocols whose clients follow the common
/// request/reply pattern, parameterized by the protocol tag. At most one
/// invocation may be in flight per client.
pub struct BasicClient<T: Transport, P: Protocol> {
    transport: T,
    address: T::Address,
    client_id: ClientId,
    setup: ClientSetup,

    request_number: RequestNumber,
    /// Highest view number learned from replies; routes primary-first
    /// sends.
    view_number: ViewNumber,
    pending: Option<Pending>,

    weak_self: Weak<Mutex<Self>>,
    _protocol: std::marker::PhantomData<fn() -> P>,
}

impl<T: Transport, P: Protocol> BasicClient<T, P> {
    /// Creates a client, allocates its unicast address, and registers its
    /// reply receiver with the transport.
    pub fn new_and_setup(transport: T) -> Arc<Mutex<Self>> {
        let address = transport.allocate_address();
        let setup = P::client_setup(transport.config().n_fault);

        let client = Arc::new_cyclic(|weak_self| {
            Mutex::new(BasicClient {
                transport: transport.clone(),
                address: address.clone(),
                client_id: generate_client_id(),
                setup,
                request_number: 0,
                view_number: 0,
                pending: None,
                weak_self: weak_self.clone(),
                _protocol: std::marker::PhantomData,
            })
        });

        let receiver_client = Arc::downgrade(&client);
        let receiver_transport = transport.clone();
        transport.register_receiver(
            address,
            Box::new(move |_remote, descriptor| {
                // defer parsing off the ingress worker
                let client = receiver_client.clone();
                receiver_transport.spawn(move || {
                    let reply = match wire::deserialize::<ReplyMessage>(
                        descriptor.as_ref(),
                    ) {
                        Ok(reply) => reply,
                        Err(e) => {
                            pf_warn!("client";
                                     "dropping undecodable reply: {}", e);
                            return;
                        }
                    };
                    if let Some(client) = client.upgrade() {
                        client.lock().unwrap().handle_reply(reply);
                    }
                });
            }),
        );

        client
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    fn send_request(&mut self, resend: bool) -> Result<(), ReplicoreError> {
        let pending = match self.pending.as_ref() {
            Some(pending) => pending,
            None => return Ok(()),
        };
        let request_number = pending.request_number;
        let message = P::ReplicaMessage::from(RequestMessage {
            client_id: self.client_id,
            request_number,
            op: pending.op.clone(),
        });

        match self.setup.strategy {
            SendStrategy::All => {
                self.transport
                    .send_message_to_all(&self.address, wire::writer(&message))?;
            }
            SendStrategy::PrimaryFirst => {
                if resend {
                    self.transport.send_message_to_all(
                        &self.address,
                        wire::writer(&message),
                    )?;
                } else {
                    let primary =
                        self.transport.config().primary(self.view_number);
                    self.transport.send_message_to_replica(
                        &self.address,
                        primary,
                        wire::writer(&message),
                    )?;
                }
            }
        }

        // re-send later unless a reply quorum finalized this number first
        let weak_self = self.weak_self.clone();
        self.transport
            .spawn_after(self.setup.resend_interval, move || {
                let client = match weak_self.upgrade() {
                    Some(client) => client,
                    None => return,
                };
                let mut client = client.lock().unwrap();
                let still_pending = client
                    .pending
                    .as_ref()
                    .is_some_and(|p| p.request_number == request_number);
                if still_pending {
                    pf_warn!(client.client_id;
                             "resending request number {}", request_number);
                    if let Err(e) = client.send_request(true) {
                        pf_error!(client.client_id; "resend failed: {}", e);
                    }
                }
            });
        Ok(())
    }

    fn handle_reply(&mut self, reply: ReplyMessage) {
        let pending = match self.pending.as_mut() {
            Some(pending) => pending,
            None => return,
        };
        if pending.request_number != reply.request_number {
            return;
        }

        self.view_number = self.view_number.max(reply.view_number);

        if self.setup.n_matched > 1 {
            let matched = pending
                .result_table
                .entry(reply.result.clone())
                .or_default();
            matched.insert(reply.replica_id);
            if matched.len() < self.setup.n_matched {
                return;
            }
        }

        let mut pending = self.pending.take().unwrap();
        if let Some(callback) = pending.callback.take() {
            // hand the result over outside this client's lock, so the
            // callback may immediately invoke again (closed-loop callers)
            let result = reply.result;
            self.transport.spawn(move || callback(result));
        }
    }
}

impl<T: Transport, P: Protocol> GenericClient for BasicClient<T, P> {
    fn invoke(
        &mut self,
        op: Data,
        callback: InvokeCallback,
    ) -> Result<(), ReplicoreError> {
        if self.pending.is_some() {
            return logged_err!(self.client_id;
                               "invoke with another request in flight");
        }
        if op.len() > MAX_DATA_LEN {
            return logged_err!(self.client_id;
                               "op of {} bytes exceeds payload bound {}",
                               op.len(), MAX_DATA_LEN);
        }

        self.request_number += 1;
        self.pending = Some(Pending {
            request_number: self.request_number,
            op,
            result_table: HashMap::new(),
            callback: Some(callback),
        });
        self.send_request(false)
    }
}

#[cfg(test)]
mod basic_tests {
    use super::*;
    use crate::transport::{FleetConfig, SimulatedTransport};
    use std::time::Duration;

    // protocol tag with bare (unwrapped) requests, broadcast routing, and
    // a two-reply match threshold at f = 1
    struct MatchTwo;
    impl Protocol for MatchTwo {
        type ReplicaMessage = RequestMessage;
        const FAULT_MULTIPLIER: usize = 1;

        fn client_setup(n_fault: usize) -> ClientSetup {
            ClientSetup {
                strategy: SendStrategy::All,
                resend_interval: Duration::from_millis(100),
                n_matched: Self::n_matched(n_fault),
            }
        }
    }

    /// Registers a fake replica that answers every request with the given
    /// result bytes.
    fn canned_replica(
        transport: &SimulatedTransport,
        replica_id: ReplicaId,
        result: &'static [u8],
    ) {
        let address =
            transport.config().replicas[replica_id as usize].clone();
        let transport_ref = transport.clone();
        let own_address = address.clone();
        transport.register_receiver(
            address,
            Box::new(move |remote, descriptor| {
                let request: RequestMessage =
                    wire::deserialize(descriptor.as_ref()).unwrap();
                let reply = ReplyMessage {
                    request_number: request.request_number,
                    result: Data::from_slice(result),
                    view_number: 0,
                    replica_id,
                };
                transport_ref
                    .send_message(
                        &own_address,
                        &remote,
                        wire::writer(&reply),
                    )
                    .unwrap();
            }),
        );
    }

    #[test]
    fn finalizes_on_reply_quorum() -> Result<(), ReplicoreError> {
        let transport = SimulatedTransport::new(FleetConfig::new(
            1,
            vec![
                "replica-0".to_string(),
                "replica-1".to_string(),
                "replica-2".to_string(),
            ],
        ));
        canned_replica(&transport, 0, b"agreed");
        canned_replica(&transport, 1, b"agreed");
        canned_replica(&transport, 2, b"divergent");

        let client =
            BasicClient::<_, MatchTwo>::new_and_setup(transport.clone());
        let result = Arc::new(Mutex::new(None));
        let result_ref = result.clone();
        let transport_ref = transport.clone();
        client.lock().unwrap().invoke(
            Data::from_slice(b"op"),
            Box::new(move |bytes| {
                *result_ref.lock().unwrap() = Some(bytes);
                transport_ref.terminate();
            }),
        )?;

        transport.run(Duration::from_secs(1))?;
        assert_eq!(
            result.lock().unwrap().as_deref(),
            Some(&b"agreed"[..])
        );
        Ok(())
    }

    #[test]
    fn rejects_overlapping_invokes() -> Result<(), ReplicoreError> {
        let transport = SimulatedTransport::new(FleetConfig::new(
            1,
            vec![
                "replica-0".to_string(),
                "replica-1".to_string(),
                "replica-2".to_string(),
            ],
        ));
        for i in 0..3 {
            canned_replica(&transport, i, b"r");
        }

        let client =
            BasicClient::<_, MatchTwo>::new_and_setup(transport.clone());
        let mut client = client.lock().unwrap();
        client.invoke(Data::from_slice(b"one"), Box::new(|_| {}))?;
        assert!(client
            .invoke(Data::from_slice(b"two"), Box::new(|_| {}))
            .is_err());
        Ok(())
    }

    #[test]
    fn rejects_oversized_op() {
        let transport = SimulatedTransport::new(FleetConfig::new(
            1,
            vec!["replica-0".to_string()],
        ));
        let client =
            BasicClient::<_, MatchTwo>::new_and_setup(transport.clone());
        let op = Data::from_vec(vec![0u8; MAX_DATA_LEN + 1]);
        assert!(client
            .lock()
            .unwrap()
            .invoke(op, Box::new(|_| {}))
            .is_err());
    }
}
