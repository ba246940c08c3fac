//! VR -- message set and peer-peer message handling.

use serde::{Deserialize, Serialize};

use super::{Status, VrReplica};
use crate::server::log::Block;
use crate::transport::{wire, Transport};
use crate::types::{OpNumber, ReplicaId, RequestMessage, ViewNumber};
use crate::utils::ReplicoreError;

#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct PrepareMessage {
    pub view_number: ViewNumber,
    pub op_number: OpNumber,
    pub block: Block,
    pub commit_number: OpNumber,
}

#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct PrepareOkMessage {
    pub view_number: ViewNumber,
    pub op_number: OpNumber,
    pub replica_id: ReplicaId,
}

#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct CommitMessage {
    pub view_number: ViewNumber,
    pub commit_number: OpNumber,
}

#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct StartViewChangeMessage {
    pub view_number: ViewNumber,
    pub replica_id: ReplicaId,
}

/// Placeholder carried where the textbook protocol ships log suffixes.
/// View changes here only complete when no log transfer is needed; a
/// mismatch is detected from the op numbers alongside and aborts.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ZeroLog;

#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct DoViewChangeMessage {
    pub view_number: ViewNumber,
    pub log: ZeroLog,
    pub latest_normal: ViewNumber,
    pub op_number: OpNumber,
    pub commit_number: OpNumber,
    pub replica_id: ReplicaId,
}

#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct StartViewMessage {
    pub view_number: ViewNumber,
    pub log: ZeroLog,
    pub op_number: OpNumber,
    pub commit_number: OpNumber,
}

/// Replica-bound message union.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum ReplicaMessage {
    Request(RequestMessage),
    Prepare(PrepareMessage),
    PrepareOk(PrepareOkMessage),
    Commit(CommitMessage),
    StartViewChange(StartViewChangeMessage),
    DoViewChange(DoViewChangeMessage),
    StartView(StartViewMessage),
}

impl From<RequestMessage> for ReplicaMessage {
    fn from(request: RequestMessage) -> Self {
        ReplicaMessage::Request(request)
    }
}

// VrReplica peer-peer messages handling (normal operation)
impl<T: Transport> VrReplica<T> {
    /// Handler of Prepare message from primary.
    pub(super) fn handle_prepare(
        &mut self,
        prepare: PrepareMessage,
    ) -> Result<(), ReplicoreError> {
        if self.status != Status::Normal
            || prepare.view_number < self.view_number
        {
            return Ok(());
        }
        if prepare.view_number > self.view_number {
            return logged_err!(self.replica_id;
                               "state transfer into view {} not supported",
                               prepare.view_number);
        }
        if self.is_primary() {
            return logged_err!(self.replica_id;
                               "Prepare arrived at the primary");
        }
        self.view_change_timeout.reset();

        if prepare.op_number <= self.op_number {
            // duplicate of something already prepared; re-ack
            return self.send_prepare_ok(prepare.op_number);
        }
        if prepare.op_number != self.op_number + 1 {
            return logged_err!(self.replica_id;
                               "state transfer for op gap {} -> {} not supported",
                               self.op_number, prepare.op_number);
        }

        self.op_number += 1;
        for entry in &prepare.block.entries {
            self.client_table
                .observe(entry.client_id, entry.request_number);
        }
        self.log.prepare(self.op_number, prepare.block)?;
        self.send_prepare_ok(self.op_number)?;

        if prepare.commit_number > self.commit_number {
            self.commit_up_to(prepare.commit_number)?;
        }
        Ok(())
    }

    /// Handler of PrepareOk message from backup.
    pub(super) fn handle_prepare_ok(
        &mut self,
        prepare_ok: PrepareOkMessage,
    ) -> Result<(), ReplicoreError> {
        if self.status != Status::Normal
            || prepare_ok.view_number < self.view_number
        {
            return Ok(());
        }
        if prepare_ok.view_number > self.view_number {
            return logged_err!(self.replica_id;
                               "state transfer into view {} not supported",
                               prepare_ok.view_number);
        }
        if !self.is_primary() {
            return logged_err!(self.replica_id;
                               "PrepareOk arrived at a backup");
        }
        if prepare_ok.op_number <= self.commit_number {
            return Ok(()); // already committed
        }

        let op_number = prepare_ok.op_number;
        if self
            .prepare_ok_set
            .add_and_check(op_number, prepare_ok.replica_id, prepare_ok)
            .is_some()
        {
            self.commit_up_to(op_number)?;
        }
        Ok(())
    }

    /// Handler of Commit message from primary; keeps backups progressing
    /// when client load is thin.
    pub(super) fn handle_commit(
        &mut self,
        commit: CommitMessage,
    ) -> Result<(), ReplicoreError> {
        if self.status != Status::Normal
            || commit.view_number < self.view_number
        {
            return Ok(());
        }
        if commit.view_number > self.view_number {
            return logged_err!(self.replica_id;
                               "state transfer into view {} not supported",
                               commit.view_number);
        }
        self.view_change_timeout.reset();

        if commit.commit_number > self.commit_number {
            self.commit_up_to(commit.commit_number)?;
        }
        Ok(())
    }

    pub(super) fn send_prepare_ok(
        &self,
        op_number: OpNumber,
    ) -> Result<(), ReplicoreError> {
        let message = ReplicaMessage::PrepareOk(PrepareOkMessage {
            view_number: self.view_number,
            op_number,
            replica_id: self.replica_id,
        });
        self.transport.send_message_to_replica(
            &self.address,
            self.transport.config().primary(self.view_number),
            wire::writer(&message),
        )
    }
}
