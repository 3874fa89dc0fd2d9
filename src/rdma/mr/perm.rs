use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Sub};

use serde::{Deserialize, Serialize};

/// Access permissions of a memory region, or of a queue pair for incoming
/// remote operations.
///
/// Bit values are the libibverbs `ibv_access_flags` values. In configuration
/// files a permission is written as a list of flag names, e.g.
/// `["local_write", "remote_read"]`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
#[repr(transparent)]
pub struct Permission(u32);

const NAMES: [(&str, Permission); 4] = [
    ("local_write", Permission::LOCAL_WRITE),
    ("remote_write", Permission::REMOTE_WRITE),
    ("remote_read", Permission::REMOTE_READ),
    ("remote_atomic", Permission::REMOTE_ATOMIC),
];

impl Permission {
    pub const EMPTY: Self = Self(0);
    pub const LOCAL_WRITE: Self = Self(1);
    pub const REMOTE_WRITE: Self = Self(1 << 1);
    pub const REMOTE_READ: Self = Self(1 << 2);
    pub const REMOTE_ATOMIC: Self = Self(1 << 3);

    /// Get the raw `ibv_access_flags` bits.
    #[inline]
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Build from raw bits, discarding unknown flags.
    #[inline]
    pub fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & 0xf)
    }

    /// Whether every flag of `other` is set in `self`.
    #[inline]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether any flag of `other` is set in `self`.
    #[inline]
    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Whether the combination can be granted to a memory region.
    /// Remote write and remote atomic require local write.
    #[inline]
    pub fn is_valid_for_mr(self) -> bool {
        !self.intersects(Self::REMOTE_WRITE | Self::REMOTE_ATOMIC) || self.contains(Self::LOCAL_WRITE)
    }
}

impl Default for Permission {
    /// Allow local write, and remote read/write.
    fn default() -> Self {
        Self::LOCAL_WRITE | Self::REMOTE_READ | Self::REMOTE_WRITE
    }
}

impl BitOr for Permission {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Permission {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Permission {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self::Output {
        Self(self.0 & rhs.0)
    }
}

impl Sub for Permission {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 & !rhs.0)
    }
}

impl fmt::Debug for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set()
            .entries(NAMES.iter().filter(|(_, p)| self.contains(*p)).map(|(n, _)| n))
            .finish()
    }
}

impl TryFrom<Vec<String>> for Permission {
    type Error = String;

    fn try_from(names: Vec<String>) -> Result<Self, Self::Error> {
        names.iter().try_fold(Permission::EMPTY, |acc, name| {
            NAMES
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
                .map(|(_, p)| acc | *p)
                .ok_or_else(|| format!("unknown access flag `{}`", name))
        })
    }
}

impl From<Permission> for Vec<String> {
    fn from(p: Permission) -> Self {
        NAMES
            .iter()
            .filter(|(_, flag)| p.contains(*flag))
            .map(|(n, _)| n.to_string())
            .collect()
    }
}
