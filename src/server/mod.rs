//! Replica-side building blocks shared by all protocols: the replicated
//! log, the client dedup table, quorum tracking, and the application state
//! machines.

pub mod clients;
pub mod log;
pub mod quorum;
pub mod statemach;

pub use clients::{ClientTable, Shortcut};
pub use log::{Block, Entry, ListLog, BLOCK_SIZE};
pub use quorum::QuorumSet;
pub use statemach::{App, Command, CommandResult, KvStore, MockApp, NullApp};
