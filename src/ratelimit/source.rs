//! Source identity for query accounting.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Opaque identity of a query source.
///
/// The limiter attaches no meaning to the value beyond equality and
/// ordering. Keys built from network addresses use the IP only, never the
/// port, so a flooder cannot escape accounting by churning source ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceKey(u64);

impl SourceKey {
    /// Build a key from a raw 64-bit value.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw 64-bit value of this key.
    pub const fn as_raw(self) -> u64 {
        self.0
    }

    /// Derive a key from an IP address.
    ///
    /// IPv4 addresses occupy the low 32 bits. IPv6 addresses are folded to
    /// 64 bits by XOR of the two halves; IPv4-mapped IPv6 addresses are
    /// canonicalized first so dual-stack sockets yield the same key as a
    /// plain IPv4 socket.
    pub fn from_ip(ip: IpAddr) -> Self {
        match ip.to_canonical() {
            IpAddr::V4(v4) => Self(u32::from_be_bytes(v4.octets()) as u64),
            IpAddr::V6(v6) => {
                let bits = u128::from_be_bytes(v6.octets());
                Self(((bits >> 64) ^ bits) as u64)
            }
        }
    }
}

impl From<IpAddr> for SourceKey {
    fn from(ip: IpAddr) -> Self {
        Self::from_ip(ip)
    }
}

impl From<SocketAddr> for SourceKey {
    fn from(addr: SocketAddr) -> Self {
        Self::from_ip(addr.ip())
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}
