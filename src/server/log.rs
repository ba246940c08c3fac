//! The replicated-log abstraction: batch-aware prepare/commit semantics,
//! speculative execution, and rollback.

use serde::{Deserialize, Serialize};

use crate::server::statemach::App;
use crate::types::{ClientId, Data, OpNumber, RequestNumber};
use crate::utils::ReplicoreError;

/// Upper bound on the number of entries consensus-ordered under one
/// `OpNumber`. Protocol batch sizes must stay within this.
pub const BLOCK_SIZE: usize = 50;

/// One client request as recorded in the log.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub client_id: ClientId,
    pub request_number: RequestNumber,
    pub op: Data,
}

/// A batch of entries ordered together under one `OpNumber`.
#[derive(Debug, PartialEq, Eq, Clone, Default, Serialize, Deserialize)]
pub struct Block {
    pub entries: Vec<Entry>,
}

impl Block {
    #[inline]
    pub fn n_entry(&self) -> usize {
        self.entries.len()
    }
}

// Per-block bookkeeping; entries live in the flat vector.
struct Slot {
    committed: bool,
    entry_offset: usize,
    n_entry: usize,
}

/// Append-only list log. Blocks are indexed by `OpNumber` starting at
/// `start_number`; committing walks the flat entry vector contiguously and
/// upcalls into the owned application.
pub struct ListLog {
    app: Box<dyn App + Send>,

    start_number: OpNumber,
    slots: Vec<Slot>,
    entries: Vec<Entry>,

    /// Greatest index such that its block and all predecessors are
    /// committed; 0 when nothing is.
    commit_number: OpNumber,

    /// Greatest index whose entries have been delivered to the app.
    delivered_number: OpNumber,

    upcall_enabled: bool,
}

impl ListLog {
    /// Creates an empty log owning the given application.
    pub fn new(app: impl App + Send + 'static) -> Self {
        ListLog {
            app: Box::new(app),
            start_number: 0,
            slots: Vec::new(),
            entries: Vec::new(),
            commit_number: 0,
            delivered_number: 0,
            upcall_enabled: true,
        }
    }

    /// Highest prepared index; 0 when nothing is prepared.
    #[inline]
    pub fn op_number(&self) -> OpNumber {
        if self.slots.is_empty() {
            0
        } else {
            self.start_number + self.slots.len() as OpNumber - 1
        }
    }

    /// Greatest contiguously-committed index.
    #[inline]
    pub fn commit_number(&self) -> OpNumber {
        self.commit_number
    }

    /// Reconstructs the block at an index, if prepared.
    pub fn block_at(&self, index: OpNumber) -> Option<Block> {
        let slot = self.slot_at(index)?;
        let entries = self.entries
            [slot.entry_offset..slot.entry_offset + slot.n_entry]
            .to_vec();
        Some(Block { entries })
    }

    fn slot_at(&self, index: OpNumber) -> Option<&Slot> {
        if self.slots.is_empty()
            || index < self.start_number
            || index > self.op_number()
        {
            return None;
        }
        Some(&self.slots[(index - self.start_number) as usize])
    }

    /// Installs a block at the next index. The first prepare fixes
    /// `start_number`; afterwards every prepare must append exactly at
    /// `op_number() + 1` (prepare gaps signal a protocol bug).
    pub fn prepare(
        &mut self,
        index: OpNumber,
        block: Block,
    ) -> Result<(), ReplicoreError> {
        if block.n_entry() > BLOCK_SIZE {
            return Err(ReplicoreError(format!(
                "block of {} entries exceeds block size {}",
                block.n_entry(),
                BLOCK_SIZE
            )));
        }

        if self.slots.is_empty() {
            self.start_number = index;
        } else if index != self.op_number() + 1 {
            return Err(ReplicoreError(format!(
                "prepare at {} but next expected index is {}",
                index,
                self.op_number() + 1
            )));
        }

        self.slots.push(Slot {
            committed: false,
            entry_offset: self.entries.len(),
            n_entry: block.n_entry(),
        });
        self.entries.extend(block.entries);
        Ok(())
    }

    /// Flags the block at `index` committed, then advances the commit
    /// frontier over every contiguously-committed block, delivering its
    /// entries to the app in order and reporting each result through
    /// `reply`.
    pub fn commit(
        &mut self,
        index: OpNumber,
        mut reply: impl FnMut(ClientId, RequestNumber, Data),
    ) -> Result<(), ReplicoreError> {
        if self.slot_at(index).is_none() {
            return Err(ReplicoreError(format!(
                "commit at {} but prepared range is [{}, {}]",
                index,
                self.start_number,
                self.op_number()
            )));
        }
        self.slots[(index - self.start_number) as usize].committed = true;

        loop {
            let next = (self.commit_number + 1).max(self.start_number);
            match self.slot_at(next) {
                Some(slot) if slot.committed => {
                    let range = slot.entry_offset
                        ..slot.entry_offset + slot.n_entry;
                    if self.upcall_enabled {
                        for i in range {
                            let entry = self.entries[i].clone();
                            let result = self.app.commit(entry.op);
                            reply(
                                entry.client_id,
                                entry.request_number,
                                result,
                            );
                        }
                        self.delivered_number = next;
                    }
                    self.commit_number = next;
                }
                _ => break,
            }
        }
        Ok(())
    }

    /// Truncates the block at `index` and all following ones. Entries
    /// already delivered to the app are rolled back in reverse. Only
    /// speculative protocols take this path; crossing the commit frontier
    /// of a non-speculative protocol is that protocol's bug.
    pub fn rollback_to(&mut self, index: OpNumber) {
        if self.slots.is_empty() || index > self.op_number() {
            return;
        }
        let index = index.max(self.start_number);

        if self.delivered_number >= index {
            pf_debug!("log"; "rolling back delivered ops {} down to {}",
                             self.delivered_number, index);
            for op in (index..=self.delivered_number).rev() {
                let slot = &self.slots[(op - self.start_number) as usize];
                let range =
                    slot.entry_offset..slot.entry_offset + slot.n_entry;
                for i in range.rev() {
                    let entry = self.entries[i].clone();
                    self.app.rollback(entry.op);
                }
            }
            self.delivered_number = index - 1;
        }
        self.commit_number = self.commit_number.min(index - 1);

        let keep = (index - self.start_number) as usize;
        let cut_offset = self.slots[keep].entry_offset;
        self.slots.truncate(keep);
        self.entries.truncate(cut_offset);
    }

    /// Suspends delivery to the application; blocks still commit, their
    /// entries just stay undelivered.
    pub fn disable_upcall(&mut self) {
        self.upcall_enabled = false;
    }

    /// Resumes delivery. Any committed-but-undelivered range is replayed
    /// silently: those replies were already emitted or are no longer
    /// meaningful.
    pub fn enable_upcall(&mut self) {
        self.upcall_enabled = true;
        while self.delivered_number < self.commit_number {
            let next = (self.delivered_number + 1).max(self.start_number);
            let slot = &self.slots[(next - self.start_number) as usize];
            let range = slot.entry_offset..slot.entry_offset + slot.n_entry;
            for i in range {
                let entry = self.entries[i].clone();
                self.app.commit(entry.op);
            }
            self.delivered_number = next;
        }
    }
}

#[cfg(test)]
mod log_tests {
    use super::*;
    use crate::server::statemach::MockApp;
    use std::sync::{Arc, Mutex};

    fn entry(client_id: ClientId, request_number: RequestNumber) -> Entry {
        Entry {
            client_id,
            request_number,
            op: Data::from_slice(b"op"),
        }
    }

    fn single(client_id: ClientId, request_number: RequestNumber) -> Block {
        Block {
            entries: vec![entry(client_id, request_number)],
        }
    }

    fn new_log() -> (ListLog, Arc<Mutex<MockApp>>) {
        let app = MockApp::new_shared();
        (ListLog::new(app.clone()), app)
    }

    #[test]
    fn prepare_then_commit_delivers() -> Result<(), ReplicoreError> {
        let (mut log, app) = new_log();
        log.prepare(1, single(7, 1))?;
        log.prepare(2, single(7, 2))?;
        assert_eq!(log.op_number(), 2);
        assert_eq!(log.commit_number(), 0);

        let mut replies = Vec::new();
        log.commit(1, |client_id, request_number, result| {
            replies.push((client_id, request_number, result));
        })?;
        assert_eq!(log.commit_number(), 1);
        assert_eq!(replies.len(), 1);
        assert_eq!(&replies[0].2[..], b"Re: op");
        assert_eq!(app.lock().unwrap().op_list.len(), 1);
        Ok(())
    }

    #[test]
    fn commit_frontier_waits_for_predecessor() -> Result<(), ReplicoreError>
    {
        let (mut log, app) = new_log();
        log.prepare(1, single(7, 1))?;
        log.prepare(2, single(7, 2))?;

        // committing 2 first delivers nothing yet
        log.commit(2, |_, _, _| {})?;
        assert_eq!(log.commit_number(), 0);
        assert_eq!(app.lock().unwrap().op_list.len(), 0);

        // committing 1 releases both
        log.commit(1, |_, _, _| {})?;
        assert_eq!(log.commit_number(), 2);
        assert_eq!(app.lock().unwrap().op_list.len(), 2);
        Ok(())
    }

    #[test]
    fn prepare_gap_is_error() -> Result<(), ReplicoreError> {
        let (mut log, _app) = new_log();
        log.prepare(1, single(7, 1))?;
        assert!(log.prepare(3, single(7, 2)).is_err());
        Ok(())
    }

    #[test]
    fn commit_beyond_prepared_is_error() {
        let (mut log, _app) = new_log();
        assert!(log.commit(1, |_, _, _| {}).is_err());
    }

    #[test]
    fn oversized_block_is_error() {
        let (mut log, _app) = new_log();
        let block = Block {
            entries: (0..=BLOCK_SIZE as u32).map(|i| entry(7, i)).collect(),
        };
        assert!(log.prepare(1, block).is_err());
    }

    #[test]
    fn rollback_reverts_app_in_reverse() -> Result<(), ReplicoreError> {
        let (mut log, app) = new_log();
        for i in 1..=3 {
            log.prepare(i, single(7, i as RequestNumber))?;
            log.commit(i, |_, _, _| {})?;
        }
        assert_eq!(app.lock().unwrap().op_list.len(), 3);

        log.rollback_to(2);
        assert_eq!(log.op_number(), 1);
        assert_eq!(log.commit_number(), 1);
        assert_eq!(app.lock().unwrap().op_list.len(), 1);

        // the same indices can be prepared again after rollback
        log.prepare(2, single(7, 9))?;
        assert_eq!(log.op_number(), 2);
        Ok(())
    }

    #[test]
    fn upcall_toggle_replays_silently() -> Result<(), ReplicoreError> {
        let (mut log, app) = new_log();
        log.disable_upcall();

        let mut n_replies = 0;
        for i in 1..=2 {
            log.prepare(i, single(7, i as RequestNumber))?;
            log.commit(i, |_, _, _| n_replies += 1)?;
        }
        // committed but not delivered, and no replies emitted
        assert_eq!(log.commit_number(), 2);
        assert_eq!(app.lock().unwrap().op_list.len(), 0);
        assert_eq!(n_replies, 0);

        // re-enabling replays into the app, still without replies
        log.enable_upcall();
        assert_eq!(app.lock().unwrap().op_list.len(), 2);
        Ok(())
    }
}
