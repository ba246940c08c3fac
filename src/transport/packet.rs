//! Address type and wire framing of the userspace-NIC packet transport.
//!
//! Frames ride a custom ethertype directly on L2: after the 14-byte
//! Ethernet header come a destination port ID and a source port ID (one
//! byte each), then the serialized message. Port IDs `0..n_replicas` are
//! replicas (a replica's port ID is its `ReplicaId`); clients allocate IDs
//! above the replicas. The NIC driver glue itself (mempool, rx/tx queues,
//! timer wheel) lives outside this crate and consumes the codec below.

use std::fmt;
use std::str::FromStr;

use crate::utils::ReplicoreError;

/// Ethertype marking replicore frames.
pub const ETHERTYPE: u16 = 0x88d5;

/// Bytes of L2 framing around one payload; frame capacity is the NIC MTU
/// minus this.
pub const FRAMING_OVERHEAD: usize = 18;

/// Byte length of the header prefix in front of the payload.
pub const HEADER_LEN: usize = 16;

/// Assumed NIC MTU.
pub const MTU: usize = 1500;

/// Payload capacity of one frame.
pub const BUFFER_SIZE: usize = MTU - FRAMING_OVERHEAD;

/// Destination MAC of multicast frames (a locally-administered L2
/// multicast group; the low bytes mirror the ethertype).
pub const MULTICAST_MAC: [u8; 6] = [0x01, 0x00, 0x88, 0xd5, 0x00, 0x00];

/// Address of one packet-transport participant: a NIC plus a port ID
/// multiplexing the participants behind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketAddress {
    pub mac: [u8; 6],
    pub port_id: u8,
}

impl fmt::Display for PacketAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}%{}",
            self.mac[0],
            self.mac[1],
            self.mac[2],
            self.mac[3],
            self.mac[4],
            self.mac[5],
            self.port_id
        )
    }
}

impl FromStr for PacketAddress {
    type Err = ReplicoreError;

    /// Parses the `aa:bb:cc:dd:ee:ff%<port-id>` syntax used in config
    /// files.
    fn from_str(s: &str) -> Result<Self, ReplicoreError> {
        let (mac_str, port_str) = s.split_once('%').ok_or_else(|| {
            ReplicoreError(format!("missing '%<port-id>' in '{}'", s))
        })?;

        let mut mac = [0u8; 6];
        let mut octets = mac_str.split(':');
        for byte in mac.iter_mut() {
            let octet = octets.next().ok_or_else(|| {
                ReplicoreError(format!("short MAC address in '{}'", s))
            })?;
            *byte = u8::from_str_radix(octet, 16).map_err(|e| {
                ReplicoreError(format!("bad MAC octet '{}': {}", octet, e))
            })?;
        }
        if octets.next().is_some() {
            return Err(ReplicoreError(format!(
                "overlong MAC address in '{}'",
                s
            )));
        }

        Ok(PacketAddress {
            mac,
            port_id: port_str.parse::<u8>()?,
        })
    }
}

/// Builds one frame: `{dest_mac, src_mac, ethertype, dest_port, src_port,
/// payload}`.
pub fn encode_frame(
    dest: &PacketAddress,
    source: &PacketAddress,
    payload: &[u8],
) -> Result<Vec<u8>, ReplicoreError> {
    if payload.len() > BUFFER_SIZE {
        return Err(ReplicoreError(format!(
            "payload of {} bytes exceeds frame capacity {}",
            payload.len(),
            BUFFER_SIZE
        )));
    }

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&dest.mac);
    frame.extend_from_slice(&source.mac);
    frame.extend_from_slice(&ETHERTYPE.to_be_bytes());
    frame.push(dest.port_id);
    frame.push(source.port_id);
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Splits one received frame into `(dest, source, payload)`. Frames with a
/// foreign ethertype are rejected (the NIC filter should already have
/// dropped them).
pub fn decode_frame(
    frame: &[u8],
) -> Result<(PacketAddress, PacketAddress, &[u8]), ReplicoreError> {
    if frame.len() < HEADER_LEN {
        return Err(ReplicoreError(format!(
            "frame of {} bytes shorter than header",
            frame.len()
        )));
    }
    let ethertype = u16::from_be_bytes([frame[12], frame[13]]);
    if ethertype != ETHERTYPE {
        return Err(ReplicoreError(format!(
            "foreign ethertype {:#06x}",
            ethertype
        )));
    }

    let dest = PacketAddress {
        mac: frame[0..6].try_into().unwrap(),
        port_id: frame[14],
    };
    let source = PacketAddress {
        mac: frame[6..12].try_into().unwrap(),
        port_id: frame[15],
    };
    Ok((dest, source, &frame[HEADER_LEN..]))
}
