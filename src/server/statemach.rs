//! Application state machines living behind the replicated log.
//!
//! The protocol layer never talks to an application directly; the log owns
//! it and drives it through the narrow commit/rollback interface below.
//! This keeps the op-log and the state machine in lockstep and leaves a
//! natural seam for a future persistence layer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::transport::wire;
use crate::types::Data;

/// The application interface: commit an op and produce its reply bytes,
/// or revert the most recent committed op (speculative modes only).
pub trait App {
    fn commit(&mut self, op: Data) -> Data;

    fn rollback(&mut self, _op: Data) {
        panic!("rollback unsupported by this app");
    }
}

// Shared-handle form, for tests and drivers that keep a handle for
// inspection while the log owns the app.
impl<A: App> App for Arc<Mutex<A>> {
    fn commit(&mut self, op: Data) -> Data {
        self.lock().unwrap().commit(op)
    }

    fn rollback(&mut self, op: Data) {
        self.lock().unwrap().rollback(op)
    }
}

/// Test app that records every committed op and echoes it back prefixed
/// with `"Re: "`.
#[derive(Debug, Default)]
pub struct MockApp {
    pub op_list: Vec<Data>,
}

impl MockApp {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience constructor yielding a handle usable both as the log's
    /// app and for later inspection.
    pub fn new_shared() -> Arc<Mutex<MockApp>> {
        Arc::new(Mutex::new(MockApp::new()))
    }
}

impl App for MockApp {
    fn commit(&mut self, op: Data) -> Data {
        self.op_list.push(op.clone());
        let mut reply = Data::from_slice(b"Re: ");
        reply.extend_from_slice(&op);
        reply
    }

    fn rollback(&mut self, op: Data) {
        let undone = self.op_list.pop();
        debug_assert_eq!(undone, Some(op));
    }
}

/// App that ignores every op.
#[derive(Debug, Default)]
pub struct NullApp;

impl App for NullApp {
    fn commit(&mut self, _op: Data) -> Data {
        Data::new()
    }

    fn rollback(&mut self, _op: Data) {}
}

/// Command to the key-value store.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum Command {
    /// Get the value of given key.
    Get { key: String },

    /// Put a new value into key.
    Put { key: String, value: String },
}

/// Command execution result returned by the key-value store.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum CommandResult {
    /// `Some(value)` if key is found, else `None`.
    Get { value: Option<String> },

    /// `Some(old_value)` if key was present, else `None`.
    Put { old_value: Option<String> },
}

/// The volatile key-value state machine used by the drivers: ops carry
/// wire-encoded `Command`s, replies carry wire-encoded `CommandResult`s.
#[derive(Debug, Default)]
pub struct KvStore {
    state: HashMap<String, String>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn apply(&mut self, command: Command) -> CommandResult {
        match command {
            Command::Get { key } => CommandResult::Get {
                value: self.state.get(&key).cloned(),
            },
            Command::Put { key, value } => CommandResult::Put {
                old_value: self.state.insert(key, value),
            },
        }
    }
}

impl App for KvStore {
    fn commit(&mut self, op: Data) -> Data {
        let command = match wire::deserialize::<Command>(&op) {
            Ok(command) => command,
            Err(e) => {
                pf_warn!("kv"; "dropping undecodable command: {}", e);
                return Data::new();
            }
        };
        let result = self.apply(command);
        Data::from_vec(
            rmp_serde::to_vec(&result).expect("command result encodable"),
        )
    }
}
