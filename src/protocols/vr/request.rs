//! VR -- client request handling and batching (primary side).

use super::{PrepareMessage, ReplicaMessage, Status, VrReplica};
use crate::server::clients::Shortcut;
use crate::server::log::Entry;
use crate::transport::{wire, Transport};
use crate::types::{ReplyMessage, RequestMessage};
use crate::utils::ReplicoreError;

impl<T: Transport> VrReplica<T> {
    /// Handler of Request message from client.
    pub(super) fn handle_request(
        &mut self,
        remote: T::Address,
        request: RequestMessage,
    ) -> Result<(), ReplicoreError> {
        if self.status != Status::Normal || !self.is_primary() {
            return Ok(()); // resends reach the primary of the next view
        }

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

        self.pending_batch.entries.push(Entry {
            client_id: request.client_id,
            request_number: request.request_number,
            op: request.op,
        });
        if self.pending_batch.n_entry() >= self.config.batch_size {
            self.close_batch()?;
        }
        Ok(())
    }

    /// Assigns the pending batch the next op number, prepares it locally,
    /// and broadcasts the Prepare.
    pub(super) fn close_batch(&mut self) -> Result<(), ReplicoreError> {
        self.op_number += 1;
        let block = std::mem::take(&mut self.pending_batch);
        self.log.prepare(self.op_number, block.clone())?;

        let message = ReplicaMessage::Prepare(PrepareMessage {
            view_number: self.view_number,
            op_number: self.op_number,
            block,
            commit_number: self.commit_number,
        });
        self.transport
            .send_message_to_all(&self.address, wire::writer(&message))?;
        self.idle_commit_timeout.reset();

        // PrepareOks may have raced ahead of this batch closing
        if self.prepare_ok_set.threshold() == 0
            || self.prepare_ok_set.check(&self.op_number).is_some()
        {
            self.commit_up_to(self.op_number)?;
        }
        Ok(())
    }

    pub(super) fn send_reply(
        &self,
        remote: &T::Address,
        reply: &ReplyMessage,
    ) -> Result<(), ReplicoreError> {
        self.transport
            .send_message(&self.address, remote, wire::writer(reply))
    }
}
