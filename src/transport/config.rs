//! Global fleet description: fault bound, replica addresses, multicast.

use std::fmt;
use std::str::FromStr;

use crate::types::{ReplicaId, ViewNumber};
use crate::utils::ReplicoreError;

/// Value record describing one replication group (one shard). The position
/// of an address in `replicas` is that replica's `ReplicaId`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetConfig<A> {
    /// Fault bound `f` this group is sized for.
    pub n_fault: usize,

    /// Ordered replica addresses; index = `ReplicaId`.
    pub replicas: Vec<A>,

    /// Optional multicast address of the group.
    pub multicast: Option<A>,
}

impl<A> FleetConfig<A> {
    /// Creates a fleet description without a multicast address.
    pub fn new(n_fault: usize, replicas: Vec<A>) -> Self {
        FleetConfig {
            n_fault,
            replicas,
            multicast: None,
        }
    }

    /// Number of replicas in the group.
    #[inline]
    pub fn n_replicas(&self) -> usize {
        self.replicas.len()
    }

    /// ID of the replica that is primary in the given view.
    #[inline]
    pub fn primary(&self, view_number: ViewNumber) -> ReplicaId {
        (view_number as usize % self.replicas.len()) as ReplicaId
    }
}

impl<A> FleetConfig<A>
where
    A: FromStr,
    <A as FromStr>::Err: fmt::Display,
{
    /// Parses a fleet description from its config-file form:
    ///
    /// ```text
    /// f <int>
    /// replica <address>
    /// replica <address>
    /// ...
    /// [multicast <address>]
    /// ```
    pub fn from_config_text(text: &str) -> Result<Self, ReplicoreError> {
        let mut n_fault = None;
        let mut replicas = Vec::new();
        let mut multicast = None;

        for (line_num, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let (keyword, value) =
                line.split_once(char::is_whitespace).ok_or_else(|| {
                    ReplicoreError(format!(
                        "config line {} has no value: '{}'",
                        line_num + 1,
                        line
                    ))
                })?;
            let value = value.trim();

            match keyword {
                "f" => {
                    n_fault = Some(value.parse::<usize>()?);
                }
                "replica" => {
                    replicas.push(Self::parse_address(value)?);
                }
                "multicast" => {
                    multicast = Some(Self::parse_address(value)?);
                }
                _ => {
                    return Err(ReplicoreError(format!(
                        "unexpected config keyword '{}'",
                        keyword
                    )));
                }
            }
        }

        let n_fault = n_fault.ok_or_else(|| {
            ReplicoreError("config text misses the 'f' line".into())
        })?;
        if replicas.is_empty() {
            return Err(ReplicoreError(
                "config text lists no replica address".into(),
            ));
        }

        Ok(FleetConfig {
            n_fault,
            replicas,
            multicast,
        })
    }

    fn parse_address(value: &str) -> Result<A, ReplicoreError> {
        value.parse::<A>().map_err(|e| {
            ReplicoreError(format!("invalid address '{}': {}", value, e))
        })
    }
}
