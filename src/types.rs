//! Identifier types and common message structs shared by every protocol.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Client ID type, randomly drawn at client construction.
pub type ClientId = u32;

/// Server replica ID type (an index into the fleet's address list).
pub type ReplicaId = i8;

/// Index into a replicated log, 1-origin; 0 means "nothing yet".
pub type OpNumber = u64;

/// Per-client request sequence number, 1-origin and monotonic.
pub type RequestNumber = u32;

/// View (i.e., leadership epoch) number, 0-origin.
pub type ViewNumber = u32;

/// Transport execution channel ID; `SEQUENTIAL_CHANNEL` denotes the
/// sequential/timer channel, non-negative IDs mark concurrent workers.
pub type ChannelId = i32;

/// ID of the sequential execution channel.
pub const SEQUENTIAL_CHANNEL: ChannelId = -1;

/// Opaque operation/result payload. Small payloads (<= 16 bytes) are stored
/// inline without heap allocation.
pub type Data = SmallVec<[u8; 16]>;

/// Upper bound on the length of a `Data` payload on the wire.
pub const MAX_DATA_LEN: usize = 240;

/// Request sent from a client to replica(s). Every protocol wraps this into
/// its own replica-bound message union.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct RequestMessage {
    pub client_id: ClientId,
    pub request_number: RequestNumber,
    pub op: Data,
}

/// Reply sent from a replica back to the requesting client.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ReplyMessage {
    pub request_number: RequestNumber,
    pub result: Data,
    pub view_number: ViewNumber,
    pub replica_id: ReplicaId,
}
