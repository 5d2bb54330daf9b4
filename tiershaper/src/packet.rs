// Packet input for the shaping pipeline

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use tiershaper_common::Direction;

/// Source and destination addresses of an IP packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrPair {
    pub src: IpAddr,
    pub dst: IpAddr,
}

impl AddrPair {
    /// Pull the addresses out of a raw IPv4 or IPv6 header.
    /// Returns `None` for anything too short or of another version.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let version = bytes.first()? >> 4;
        match version {
            4 => {
                if bytes.len() < 20 {
                    return None;
                }
                let src: [u8; 4] = bytes[12..16].try_into().ok()?;
                let dst: [u8; 4] = bytes[16..20].try_into().ok()?;
                Some(Self {
                    src: IpAddr::V4(Ipv4Addr::from(src)),
                    dst: IpAddr::V4(Ipv4Addr::from(dst)),
                })
            }
            6 => {
                if bytes.len() < 40 {
                    return None;
                }
                let src: [u8; 16] = bytes[8..24].try_into().ok()?;
                let dst: [u8; 16] = bytes[24..40].try_into().ok()?;
                Some(Self {
                    src: IpAddr::V6(Ipv6Addr::from(src)),
                    dst: IpAddr::V6(Ipv6Addr::from(dst)),
                })
            }
            _ => None,
        }
    }
}

/// A packet as seen by the hook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet {
    /// Wire length in bytes
    pub len: u64,
    pub direction: Direction,
    /// Departure timestamp in nanoseconds, 0 for "as soon as possible"
    pub tstamp: u64,
    /// `None` when the headers could not be parsed
    pub headers: Option<AddrPair>,
    /// Class id carried by the packet (cgroup classid / skb priority)
    pub class_id: u32,
}

impl Packet {
    pub fn new(direction: Direction, len: u64, headers: AddrPair, class_id: u32) -> Self {
        Self {
            len,
            direction,
            tstamp: 0,
            headers: Some(headers),
            class_id,
        }
    }

    /// Build from a raw IP packet; the wire length is the buffer length
    pub fn from_ip_bytes(direction: Direction, bytes: &[u8], class_id: u32) -> Self {
        Self {
            len: bytes.len() as u64,
            direction,
            tstamp: 0,
            headers: AddrPair::parse(bytes),
            class_id,
        }
    }

    /// The local end of the flow: source on egress, destination on ingress
    pub fn lookup_addr(&self) -> Option<IpAddr> {
        let headers = self.headers?;
        Some(match self.direction {
            Direction::Egress => headers.src,
            Direction::Ingress => headers.dst,
        })
    }
}
