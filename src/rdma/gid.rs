use std::fmt;
use std::net::Ipv6Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An 128-bit identifier used to identify a port on a network adapter, a port
/// on a router, or a multicast group.
///
/// The textual form is eight colon-separated groups of four hex digits
/// (`fe80:0000:0000:0000:0000:0000:0000:0001`). Parsing also accepts 32
/// contiguous hex digits.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Gid([u8; 16]);

/// Error of parsing a [`Gid`] from text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GidParseError {
    #[error("expected 8 colon-separated groups or 32 hex digits, got {0:?}")]
    Malformed(String),

    #[error("invalid hex digit in {0:?}")]
    BadHex(String),
}

impl Gid {
    /// The all-zero GID.
    pub const ZERO: Gid = Gid([0; 16]);

    /// Get the raw bytes of this GID.
    #[inline]
    pub fn raw(&self) -> [u8; 16] {
        self.0
    }

    /// Whether every byte of this GID is zero. InfiniBand ports without a
    /// configured subnet prefix, and unused GID table entries, report this.
    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0 == [0; 16]
    }
}

impl fmt::Debug for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let addr = Ipv6Addr::from(*self);
        f.debug_tuple("Gid").field(&addr.to_string()).finish()
    }
}

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, pair) in self.0.chunks_exact(2).enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{:02x}{:02x}", pair[0], pair[1])?;
        }
        Ok(())
    }
}

impl FromStr for Gid {
    type Err = GidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let digits: Vec<u8> = if s.contains(':') {
            let groups = s.split(':').collect::<Vec<_>>();
            if groups.len() != 8 || groups.iter().any(|g| g.len() != 4) {
                return Err(GidParseError::Malformed(s.to_owned()));
            }
            groups.concat().into_bytes()
        } else {
            s.as_bytes().to_vec()
        };
        if digits.len() != 32 {
            return Err(GidParseError::Malformed(s.to_owned()));
        }

        let mut raw = [0u8; 16];
        hex::decode_to_slice(&digits, &mut raw).map_err(|_| GidParseError::BadHex(s.to_owned()))?;
        Ok(Gid(raw))
    }
}

impl From<[u8; 16]> for Gid {
    #[inline]
    fn from(raw: [u8; 16]) -> Self {
        Self(raw)
    }
}

impl From<Gid> for [u8; 16] {
    #[inline]
    fn from(gid: Gid) -> Self {
        gid.0
    }
}

impl From<Ipv6Addr> for Gid {
    #[inline]
    fn from(addr: Ipv6Addr) -> Self {
        Self(addr.octets())
    }
}

impl From<Gid> for Ipv6Addr {
    #[inline]
    fn from(gid: Gid) -> Self {
        Ipv6Addr::from(gid.0)
    }
}

impl Serialize for Gid {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Gid {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
