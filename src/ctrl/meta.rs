use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::rdma::gid::{Gid, GidParseError};
use crate::rdma::type_alias::*;

/// Error of decoding [`ConnectionMetadata`] from text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The text does not hold exactly four comma-separated fields.
    #[error("expected 4 fields, got {0}")]
    FieldCount(usize),

    /// A field is missing its key, or fields are out of order.
    #[error("expected field `{expected}`, got {got:?}")]
    UnexpectedField { expected: &'static str, got: String },

    /// A numeric field is not a decimal number in range.
    #[error("bad value of `{field}`: {value:?}")]
    BadNumber { field: &'static str, value: String },

    /// The GID field is malformed.
    #[error("bad gid")]
    BadGid(#[source] GidParseError),
}

/// What one endpoint tells the other to connect a queue pair.
///
/// The text form is `qpn=<u32>, spn=<u32>, lid=<u16>, gid=<gid>` with the GID
/// written as eight colon-separated groups of four hex digits. It is meant to
/// travel over any channel, including copy-paste.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionMetadata {
    qpn: Qpn,
    psn: Psn,
    lid: Lid,
    gid: Gid,
}

impl ConnectionMetadata {
    pub fn new(qpn: Qpn, psn: Psn, lid: Lid, gid: Gid) -> Self {
        Self { qpn, psn, lid, gid }
    }

    /// Get the queue pair number.
    #[inline]
    pub fn qpn(&self) -> Qpn {
        self.qpn
    }

    /// Get the start packet sequence number.
    #[inline]
    pub fn psn(&self) -> Psn {
        self.psn
    }

    /// Get the port LID.
    #[inline]
    pub fn lid(&self) -> Lid {
        self.lid
    }

    /// Get the port GID.
    #[inline]
    pub fn gid(&self) -> Gid {
        self.gid
    }

    /// Encode into the text form.
    pub fn encode(&self) -> String {
        self.to_string()
    }

    /// Decode from the text form. Whitespace around fields is ignored.
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let fields = text.trim().split(',').map(str::trim).collect::<Vec<_>>();
        if fields.len() != 4 {
            return Err(DecodeError::FieldCount(fields.len()));
        }

        fn value<'a>(field: &'a str, key: &'static str) -> Result<&'a str, DecodeError> {
            match field.split_once('=') {
                Some((k, v)) if k.trim() == key => Ok(v.trim()),
                _ => Err(DecodeError::UnexpectedField {
                    expected: key,
                    got: field.to_owned(),
                }),
            }
        }

        fn number<T: FromStr>(field: &str, key: &'static str) -> Result<T, DecodeError> {
            let v = value(field, key)?;
            v.parse().map_err(|_| DecodeError::BadNumber {
                field: key,
                value: v.to_owned(),
            })
        }

        Ok(Self {
            qpn: number(fields[0], "qpn")?,
            psn: number(fields[1], "spn")?,
            lid: number(fields[2], "lid")?,
            gid: value(fields[3], "gid")?.parse().map_err(DecodeError::BadGid)?,
        })
    }
}

impl fmt::Display for ConnectionMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "qpn={}, spn={}, lid={}, gid={}",
            self.qpn, self.psn, self.lid, self.gid
        )
    }
}

impl FromStr for ConnectionMetadata {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}
