//! Client-side machinery: the generic invocation interface and the basic
//! retrying client shared by the non-speculative protocols.

pub mod basic;

pub use basic::BasicClient;

use crate::types::{ClientId, Data};
use crate::utils::ReplicoreError;

/// Continuation invoked with the result bytes once a request's reply
/// quorum is met. A callback either fires or never fires; callers wrap
/// their own timeout around `invoke` if they need one.
pub type InvokeCallback = Box<dyn FnOnce(Data) + Send>;

/// Client interface to be implemented by all protocol client stubs.
pub trait GenericClient {
    /// Submits one operation. Errors when another invocation is still in
    /// flight or the op exceeds the wire payload bound.
    fn invoke(
        &mut self,
        op: Data,
        callback: InvokeCallback,
    ) -> Result<(), ReplicoreError>;
}

/// Draws the random identity of a freshly-constructed client.
pub(crate) fn generate_client_id() -> ClientId {
    rand::random()
}
