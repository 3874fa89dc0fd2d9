use serde::{Deserialize, Serialize};

use crate::rdma::gid::Gid;
use crate::rdma::mr::Permission;
use crate::rdma::type_alias::*;

/// Queue pair capability attributes.
///
/// This type corresponds to `struct ibv_qp_cap` in the `ibverbs` C driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QpCaps {
    /// The maximum number of outstanding work requests in the send queue.
    /// Unsignaled requests count until a later signaled completion is polled.
    ///
    /// Value can be [0..`dev_cap.max_qp_wr`].
    pub max_send_wr: u32,

    /// The maximum number of outstanding work requests in the receive queue.
    ///
    /// Value can be [0..`dev_cap.max_qp_wr`].
    pub max_recv_wr: u32,

    /// The maximum number of scatter/gather elements of a send request.
    ///
    /// Value can be [0..`dev_cap.max_sge`].
    pub max_send_sge: u32,

    /// The maximum number of scatter/gather elements of a receive request.
    ///
    /// Value can be [0..`dev_cap.max_sge`].
    pub max_recv_sge: u32,

    /// The maximum message size (in bytes) that can be posted inline.
    pub max_inline_data: u32,
}

impl Default for QpCaps {
    /// 32 outstanding send/recv work requests each, 30 SGEs per work request,
    /// no inline data.
    ///
    /// **NOTE:** Such a setting might *not* be supported by the underlying
    /// RDMA device.
    fn default() -> Self {
        QpCaps {
            max_send_wr: 32,
            max_recv_wr: 32,
            max_send_sge: 30,
            max_recv_sge: 30,
            max_inline_data: 0,
        }
    }
}

impl QpCaps {
    /// Capabilities with the same depth for both queues and the same SGE limit
    /// for both kinds of request.
    pub fn symmetric(depth: u32, max_sge: u32) -> Self {
        QpCaps {
            max_send_wr: depth,
            max_recv_wr: depth,
            max_send_sge: max_sge,
            max_recv_sge: max_sge,
            max_inline_data: 0,
        }
    }
}

/// Path MTU.
///
/// Discriminants are the libibverbs `ibv_mtu` values; configuration files
/// use the size in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
#[repr(u32)]
pub enum Mtu {
    Mtu256 = 1,
    Mtu512 = 2,
    Mtu1024 = 3,
    Mtu2048 = 4,
    Mtu4096 = 5,
}

impl Mtu {
    /// Decode a raw `ibv_mtu` value.
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            1 => Mtu::Mtu256,
            2 => Mtu::Mtu512,
            3 => Mtu::Mtu1024,
            4 => Mtu::Mtu2048,
            5 => Mtu::Mtu4096,
            _ => return None,
        })
    }

    /// Size in bytes.
    #[inline]
    pub fn bytes(self) -> u32 {
        128 << (self as u32)
    }
}

impl TryFrom<u32> for Mtu {
    type Error = String;

    fn try_from(bytes: u32) -> Result<Self, Self::Error> {
        match bytes {
            256 => Ok(Mtu::Mtu256),
            512 => Ok(Mtu::Mtu512),
            1024 => Ok(Mtu::Mtu1024),
            2048 => Ok(Mtu::Mtu2048),
            4096 => Ok(Mtu::Mtu4096),
            _ => Err(format!("invalid path MTU {}", bytes)),
        }
    }
}

impl From<Mtu> for u32 {
    fn from(mtu: Mtu) -> Self {
        mtu.bytes()
    }
}

/// Addressing of the path towards the peer port.
///
/// This type corresponds to `struct ibv_ah_attr` in the `ibverbs` C driver.
/// With `is_global` unset the packet carries no global routing header and is
/// forwarded inside the local subnet by `dlid`; RoCE ports always require it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressVector {
    /// Whether to carry a global routing header (route by `dgid`).
    pub is_global: bool,
    /// Hop limit of the global routing header.
    pub hop_limit: u8,
    /// Index of the local GID used as the source GID.
    pub sgid_index: GidIndex,
    /// Traffic class of the global routing header.
    pub traffic_class: u8,
    /// Flow label of the global routing header.
    pub flow_label: u32,
    /// Service level.
    pub sl: u8,
    /// Source path bits.
    pub src_path_bits: u8,
    /// Destination LID.
    pub dlid: Lid,
    /// Destination GID.
    pub dgid: Gid,
    /// Local port to send through.
    pub port_num: PortNum,
}

impl AddressVector {
    /// Globally-routed path to the given peer port, with hop limit 1, service
    /// level 0, through local port 1 and GID index 1.
    pub fn to_peer(dlid: Lid, dgid: Gid) -> Self {
        AddressVector {
            is_global: true,
            hop_limit: 1,
            sgid_index: 1,
            traffic_class: 0,
            flow_label: 0,
            sl: 0,
            src_path_bits: 0,
            dlid,
            dgid,
            port_num: 1,
        }
    }
}

/// Parameters of the RESET to INIT transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitAttr {
    /// Local port this queue pair is bound to.
    pub port_num: PortNum,
    /// P_Key table index.
    pub pkey_index: u16,
    /// Remote operations allowed against this queue pair.
    pub access: Permission,
}

impl Default for InitAttr {
    fn default() -> Self {
        InitAttr {
            port_num: 1,
            pkey_index: 0,
            access: Permission::default(),
        }
    }
}

/// Parameters of the INIT to RTR transition. Fixes the peer queue pair and
/// the path; cannot be undone without destroying the queue pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtrAttr {
    /// Peer queue pair number.
    pub dest_qpn: Qpn,
    /// Expected PSN of the first incoming packet, i.e. the peer's start PSN.
    pub rq_psn: Psn,
    /// Path MTU.
    pub path_mtu: Mtu,
    /// Maximum outstanding RDMA reads/atomics the peer may issue to us.
    pub max_dest_rd_atomic: u8,
    /// Minimum RNR NAK timer code (0..=31).
    pub min_rnr_timer: u8,
    /// Path to the peer.
    pub av: AddressVector,
}

impl RtrAttr {
    /// RTR parameters with MTU 4096, one outstanding read and RNR timer code 12.
    pub fn new(dest_qpn: Qpn, rq_psn: Psn, av: AddressVector) -> Self {
        RtrAttr {
            dest_qpn,
            rq_psn,
            path_mtu: Mtu::Mtu4096,
            max_dest_rd_atomic: 1,
            min_rnr_timer: 12,
            av,
        }
    }
}

/// Parameters of the RTR to RTS transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtsAttr {
    /// Start PSN of our outgoing packets, i.e. the PSN advertised to the peer.
    pub sq_psn: Psn,
    /// Local ACK timeout code (0..=31); the wait is `4.096us * 2^timeout`.
    pub timeout: u8,
    /// Transport retry count (0..=7).
    pub retry_cnt: u8,
    /// RNR retry count (0..=7, 7 meaning infinite). Zero fails a send that
    /// finds no posted receive at the peer.
    pub rnr_retry: u8,
    /// Maximum outstanding RDMA reads/atomics we may issue.
    pub max_rd_atomic: u8,
}

impl RtsAttr {
    /// RTS parameters with timeout code 10, 5 retries, 4 RNR retries and one
    /// outstanding read.
    pub fn new(sq_psn: Psn) -> Self {
        RtsAttr {
            sq_psn,
            timeout: 10,
            retry_cnt: 5,
            rnr_retry: 4,
            max_rd_atomic: 1,
        }
    }
}

/// A queue pair state transition with its parameter bundle, as handed to a
/// [`Provider`](crate::provider::Provider).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpTransition {
    ToInit(InitAttr),
    ToRtr(RtrAttr),
    ToRts(RtsAttr),
    ToError,
}
