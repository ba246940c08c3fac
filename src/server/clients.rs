//! Per-client dedup/reply cache.

use std::collections::HashMap;

use crate::types::{ClientId, ReplyMessage, RequestNumber};
use crate::utils::ReplicoreError;

/// What to do with a request that is not genuinely new.
#[derive(Debug, PartialEq, Eq)]
pub enum Shortcut<A> {
    /// Request is stale, or in flight without a cached reply: drop it.
    Ignore,

    /// Request already executed: resend the cached reply to this address.
    Reply(A, ReplyMessage),
}

struct Record<A> {
    /// Where the request was received from, when it was received directly.
    remote: Option<A>,
    last_request: RequestNumber,
    last_reply: Option<ReplyMessage>,
}

/// The per-replica cache of each client's latest request number and cached
/// reply, used to deduplicate retries. The reply stays cached until
/// superseded by a strictly higher request number.
pub struct ClientTable<A> {
    records: HashMap<ClientId, Record<A>>,
}

impl<A: Clone> ClientTable<A> {
    pub fn new() -> Self {
        ClientTable {
            records: HashMap::new(),
        }
    }

    /// Called where a request is received directly (the primary). `None`
    /// means the request is genuinely new and the record has been advanced;
    /// otherwise the returned shortcut says how to answer without touching
    /// the log. A request number ahead by more than one is a protocol bug.
    pub fn check(
        &mut self,
        remote: &A,
        client_id: ClientId,
        request_number: RequestNumber,
    ) -> Result<Option<Shortcut<A>>, ReplicoreError> {
        let record = match self.records.get_mut(&client_id) {
            None => {
                self.records.insert(
                    client_id,
                    Record {
                        remote: Some(remote.clone()),
                        last_request: request_number,
                        last_reply: None,
                    },
                );
                return Ok(None);
            }
            Some(record) => record,
        };

        if request_number < record.last_request {
            return Ok(Some(Shortcut::Ignore));
        }
        if request_number == record.last_request {
            return Ok(match record.last_reply {
                Some(ref reply) => {
                    Some(Shortcut::Reply(remote.clone(), reply.clone()))
                }
                None => Some(Shortcut::Ignore),
            });
        }
        if request_number != record.last_request + 1 {
            return Err(ReplicoreError(format!(
                "client {:#x} request number gap: {} -> {}",
                client_id, record.last_request, request_number
            )));
        }

        record.remote = Some(remote.clone());
        record.last_request = request_number;
        record.last_reply = None;
        Ok(None)
    }

    /// Called by backups when a prepared request they didn't see directly
    /// flows past: advances the request number and drops any cached reply.
    /// The remote stays unknown, so no reply will ever be sent from here.
    pub fn observe(
        &mut self,
        client_id: ClientId,
        request_number: RequestNumber,
    ) {
        let record =
            self.records.entry(client_id).or_insert_with(|| Record {
                remote: None,
                last_request: request_number,
                last_reply: None,
            });
        if request_number > record.last_request {
            record.last_request = request_number;
            record.last_reply = None;
        }
    }

    /// Called at commit: caches the reply and returns the send target when
    /// the client's address is known. Stale updates are logged and ignored.
    pub fn update(
        &mut self,
        client_id: ClientId,
        request_number: RequestNumber,
        reply: ReplyMessage,
    ) -> Option<(A, ReplyMessage)> {
        let record = match self.records.get_mut(&client_id) {
            None => {
                pf_warn!(client_id; "reply for unknown client dropped");
                return None;
            }
            Some(record) => record,
        };

        if request_number < record.last_request {
            pf_debug!(client_id; "stale reply update {} < {} ignored",
                                 request_number, record.last_request);
            return None;
        }
        record.last_request = request_number;
        record.last_reply = Some(reply.clone());
        record.remote.clone().map(|remote| (remote, reply))
    }
}

impl<A: Clone> Default for ClientTable<A> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod clients_tests {
    use super::*;
    use crate::types::Data;

    fn reply(request_number: RequestNumber) -> ReplyMessage {
        ReplyMessage {
            request_number,
            result: Data::from_slice(b"r"),
            view_number: 0,
            replica_id: 0,
        }
    }

    #[test]
    fn fresh_then_duplicate_then_replay() -> Result<(), ReplicoreError> {
        let mut table = ClientTable::<String>::new();
        let remote = "client-1".to_string();

        // genuinely new
        assert_eq!(table.check(&remote, 7, 1)?, None);
        // in flight, nothing cached yet: idempotent lookups say drop
        assert_eq!(table.check(&remote, 7, 1)?, Some(Shortcut::Ignore));
        assert_eq!(table.check(&remote, 7, 1)?, Some(Shortcut::Ignore));

        // commit records the reply and reports the send target
        let sent = table.update(7, 1, reply(1));
        assert_eq!(sent, Some((remote.clone(), reply(1))));

        // the duplicate now replays the cached reply
        assert_eq!(
            table.check(&remote, 7, 1)?,
            Some(Shortcut::Reply(remote.clone(), reply(1)))
        );

        // next request supersedes the cache
        assert_eq!(table.check(&remote, 7, 2)?, None);
        assert_eq!(table.check(&remote, 7, 1)?, Some(Shortcut::Ignore));
        Ok(())
    }

    #[test]
    fn request_number_gap_is_error() -> Result<(), ReplicoreError> {
        let mut table = ClientTable::<String>::new();
        let remote = "client-1".to_string();
        table.check(&remote, 7, 1)?;
        assert!(table.check(&remote, 7, 3).is_err());
        Ok(())
    }

    #[test]
    fn observed_requests_never_reply() {
        let mut table = ClientTable::<String>::new();
        table.observe(7, 1);
        // remote unknown: reply cached but not sendable
        assert_eq!(table.update(7, 1, reply(1)), None);
    }

    #[test]
    fn stale_update_ignored() -> Result<(), ReplicoreError> {
        let mut table = ClientTable::<String>::new();
        let remote = "client-1".to_string();
        table.check(&remote, 7, 1)?;
        table.update(7, 1, reply(1));
        table.check(&remote, 7, 2)?;
        assert_eq!(table.update(7, 1, reply(1)), None);
        Ok(())
    }
}
