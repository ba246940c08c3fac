//! VR -- timers and the view change sub-protocol.

use super::{
    CommitMessage, DoViewChangeMessage, ReplicaMessage,
    StartViewChangeMessage, StartViewMessage, Status, VrReplica, ZeroLog,
};
use crate::server::log::Block;
use crate::transport::{wire, Transport};
use crate::types::ViewNumber;
use crate::utils::ReplicoreError;

impl<T: Transport> VrReplica<T> {
    /// Primary's idle commit timer: rebroadcast the commit frontier so
    /// backups keep progressing without client load.
    pub(super) fn on_idle_commit(&mut self) -> Result<(), ReplicoreError> {
        if self.status != Status::Normal {
            return Ok(());
        }
        let message = ReplicaMessage::Commit(CommitMessage {
            view_number: self.view_number,
            commit_number: self.commit_number,
        });
        self.transport
            .send_message_to_all(&self.address, wire::writer(&message))?;
        self.idle_commit_timeout.reset();
        Ok(())
    }

    /// Backup's view change timer: the primary has gone quiet for too
    /// long, try to move the group to the next view.
    pub(super) fn on_view_change_timer(
        &mut self,
    ) -> Result<(), ReplicoreError> {
        let next_view = self.view_number + 1;
        self.start_view_change(next_view)
    }

    fn start_view_change(
        &mut self,
        view_number: ViewNumber,
    ) -> Result<(), ReplicoreError> {
        pf_info!(self.replica_id; "starting view change into view {}",
                                  view_number);
        self.status = Status::ViewChange;
        self.view_number = view_number;
        self.idle_commit_timeout.disable();
        self.view_change_timeout.reset();

        let message =
            ReplicaMessage::StartViewChange(StartViewChangeMessage {
                view_number,
                replica_id: self.replica_id,
            });
        self.transport
            .send_message_to_all(&self.address, wire::writer(&message))
    }

    /// Handler of StartViewChange message from peer.
    pub(super) fn handle_start_view_change(
        &mut self,
        start_view_change: StartViewChangeMessage,
    ) -> Result<(), ReplicoreError> {
        if start_view_change.view_number < self.view_number {
            return Ok(());
        }
        if start_view_change.view_number > self.view_number {
            self.start_view_change(start_view_change.view_number)?;
        }

        let view_number = self.view_number;
        if self
            .start_view_change_set
            .add_and_check(
                view_number,
                start_view_change.replica_id,
                start_view_change,
            )
            .is_some()
        {
            self.send_do_view_change()?;
        }
        Ok(())
    }

    /// Enough peers agreed to leave the old view: hand the new primary
    /// this replica's log coordinates.
    fn send_do_view_change(&mut self) -> Result<(), ReplicoreError> {
        let message = DoViewChangeMessage {
            view_number: self.view_number,
            log: ZeroLog,
            latest_normal: self.latest_normal,
            op_number: self.op_number,
            commit_number: self.commit_number,
            replica_id: self.replica_id,
        };
        let primary = self.transport.config().primary(self.view_number);
        if primary == self.replica_id {
            self.note_do_view_change(message)
        } else {
            let message = ReplicaMessage::DoViewChange(message);
            self.transport.send_message_to_replica(
                &self.address,
                primary,
                wire::writer(&message),
            )
        }
    }

    /// Handler of DoViewChange message from peer (new primary only).
    pub(super) fn handle_do_view_change(
        &mut self,
        do_view_change: DoViewChangeMessage,
    ) -> Result<(), ReplicoreError> {
        if do_view_change.view_number < self.view_number {
            return Ok(());
        }
        if do_view_change.view_number > self.view_number {
            // lagging behind the view change itself; catch up first
            self.start_view_change(do_view_change.view_number)?;
        }
        if self.transport.config().primary(self.view_number)
            != self.replica_id
        {
            return logged_err!(self.replica_id;
                               "DoViewChange for view {} at a backup",
                               do_view_change.view_number);
        }
        self.note_do_view_change(do_view_change)
    }

    fn note_do_view_change(
        &mut self,
        do_view_change: DoViewChangeMessage,
    ) -> Result<(), ReplicoreError> {
        if self.status != Status::ViewChange {
            return Ok(()); // this view has already started
        }
        let view_number = self.view_number;
        let quorum = match self.do_view_change_set.add_and_check(
            view_number,
            do_view_change.replica_id,
            do_view_change,
        ) {
            Some(quorum) => quorum.values().cloned().collect::<Vec<_>>(),
            None => return Ok(()),
        };
        self.start_view(quorum)
    }

    /// The new primary has a DoViewChange quorum (its own included):
    /// announce the new view, unless a quorum member's log is ahead of
    /// ours, in which case give up and let the timers try a later view.
    fn start_view(
        &mut self,
        quorum: Vec<DoViewChangeMessage>,
    ) -> Result<(), ReplicoreError> {
        let mut max_commit = self.commit_number;
        for peer in &quorum {
            if peer.op_number > self.op_number {
                pf_error!(self.replica_id;
                          "giving up view {}: replica {} has op {} > own {}, \
                           log transfer not supported",
                          self.view_number, peer.replica_id,
                          peer.op_number, self.op_number);
                return Ok(());
            }
            max_commit = max_commit.max(peer.commit_number);
        }

        let start_view = StartViewMessage {
            view_number: self.view_number,
            log: ZeroLog,
            op_number: self.op_number,
            commit_number: max_commit,
        };
        let message = ReplicaMessage::StartView(start_view.clone());
        self.transport
            .send_message_to_all(&self.address, wire::writer(&message))?;
        self.enter_view(start_view)
    }

    /// Handler of StartView message from the new primary.
    pub(super) fn handle_start_view(
        &mut self,
        start_view: StartViewMessage,
    ) -> Result<(), ReplicoreError> {
        if start_view.view_number < self.view_number
            || (start_view.view_number == self.view_number
                && self.status == Status::Normal)
        {
            return Ok(());
        }
        self.enter_view(start_view)
    }

    /// Switches into the announced view and resumes normal operation.
    fn enter_view(
        &mut self,
        start_view: StartViewMessage,
    ) -> Result<(), ReplicoreError> {
        pf_info!(self.replica_id; "entering view {}",
                                  start_view.view_number);
        self.view_number = start_view.view_number;
        self.status = Status::Normal;
        self.latest_normal = start_view.view_number;
        self.pending_batch = Block::default();
        self.prepare_ok_set.clear_all();

        if self.is_primary() {
            self.view_change_timeout.disable();
            self.idle_commit_timeout.enable();
        } else {
            self.idle_commit_timeout.disable();
            self.view_change_timeout.reset();
        }

        if self.op_number < start_view.op_number {
            return logged_err!(self.replica_id;
                               "log transfer for ops {} -> {} not supported",
                               self.op_number, start_view.op_number);
        }
        if start_view.commit_number > self.commit_number {
            self.commit_up_to(start_view.commit_number)?;
        }
        Ok(())
    }
}
