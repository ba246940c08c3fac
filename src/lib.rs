//! Public interface to the replicore library: a common substrate for
//! implementing and evaluating state-machine replication protocols
//! against a uniform transport.

#[macro_use]
pub mod utils;

pub mod client;
pub mod protocols;
pub mod server;
pub mod transport;
pub mod types;

pub use client::{BasicClient, GenericClient, InvokeCallback};
pub use protocols::SmrProtocol;
pub use transport::{
    FleetConfig, SimulatedTransport, StatefulTimeout, Transport,
    UdpTransport,
};
pub use types::{
    ClientId, Data, OpNumber, ReplicaId, RequestNumber, ViewNumber,
};
pub use utils::ReplicoreError;
