//! The collection of replication protocols built on the common substrate.

pub mod unreplicated;
pub mod vr;

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::types::RequestMessage;

/// Enum of supported replication protocol types. `Pbft`, `HotStuff`, and
/// `Zyzzyva` are registered names whose replicas are not implemented yet.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SmrProtocol {
    Unreplicated,
    Vr,
    Pbft,
    HotStuff,
    Zyzzyva,
}

impl SmrProtocol {
    /// Parse command line string into SmrProtocol enum.
    pub fn parse_name(name: &str) -> Option<Self> {
        match name {
            "unreplicated" => Some(Self::Unreplicated),
            "vr" => Some(Self::Vr),
            "pbft" => Some(Self::Pbft),
            "hotstuff" => Some(Self::HotStuff),
            "zyzzyva" => Some(Self::Zyzzyva),
            _ => None,
        }
    }

    /// Whether a replica implementation exists for this protocol.
    pub fn implemented(&self) -> bool {
        matches!(self, Self::Unreplicated | Self::Vr)
    }
}

/// How the basic client routes requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStrategy {
    /// Broadcast every request to the whole fleet.
    All,

    /// Send to the believed primary first; broadcast on resends.
    PrimaryFirst,
}

/// Per-protocol parameters of the basic client.
#[derive(Debug, Clone)]
pub struct ClientSetup {
    pub strategy: SendStrategy,
    pub resend_interval: Duration,

    /// Number of matching replies that finalize an invocation, derived
    /// from the protocol's fault multiplier as `m * f + 1`.
    pub n_matched: usize,
}

/// Compile-time wiring a protocol exposes to the client side: the
/// replica-bound message union its replicas speak, and how replies are
/// gathered.
pub trait Protocol: 'static {
    /// Message type replicas of this protocol receive; client requests are
    /// wrapped into it.
    type ReplicaMessage: From<RequestMessage>
        + Serialize
        + DeserializeOwned
        + Send
        + 'static;

    /// Fault multiplier `m` in the reply-match threshold `m * f + 1`.
    const FAULT_MULTIPLIER: usize;

    fn client_setup(n_fault: usize) -> ClientSetup;

    /// Reply-match threshold for a group with the given fault bound.
    fn n_matched(n_fault: usize) -> usize {
        Self::FAULT_MULTIPLIER * n_fault + 1
    }
}

#[cfg(test)]
mod protocols_tests {
    use super::SmrProtocol;

    macro_rules! valid_name_test {
        ($name:literal, $variant:ident) => {
            assert_eq!(
                SmrProtocol::parse_name($name),
                Some(SmrProtocol::$variant)
            );
        };
    }

    #[test]
    fn parse_valid_names() {
        valid_name_test!("unreplicated", Unreplicated);
        valid_name_test!("vr", Vr);
        valid_name_test!("pbft", Pbft);
        valid_name_test!("hotstuff", HotStuff);
        valid_name_test!("zyzzyva", Zyzzyva);
    }

    #[test]
    fn parse_invalid_name() {
        assert_eq!(SmrProtocol::parse_name("raft"), None);
    }

    #[test]
    fn scaffolding_not_implemented() {
        assert!(SmrProtocol::Vr.implemented());
        assert!(!SmrProtocol::Pbft.implemented());
    }
}
