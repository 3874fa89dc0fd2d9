//! Hardware providers.
//!
//! A [`Provider`] is the verbs surface of one opened RDMA device. Resource
//! wrappers in this crate ([`Context`](crate::Context), [`Pd`](crate::Pd),
//! [`Cq`](crate::Cq), [`Mr`](crate::Mr), [`Qp`](crate::Qp)) own opaque
//! handles issued by a provider and never see raw device structures.
//!
//! Errors follow libibverbs: an [`io::Error`] carrying the errno the verb
//! would return. In particular, `ENOMEM` from a post verb means the work queue
//! is full, and `EINVAL` means the request is invalid in the current state.
//!
//! Two providers ship with the crate:
//!
//! - [`soft::SoftFabric`], an in-process emulation of an RC fabric. Always
//!   available.
//! - `verbs::VerbsDevice`, libibverbs-backed. Requires the `ibverbs` feature.

use std::fmt;
use std::io;

use crate::rdma::cq::Wc;
use crate::rdma::gid::Gid;
use crate::rdma::mr::{Permission, Sge};
use crate::rdma::qp::{Mtu, QpCaps, QpState, QpTransition};
use crate::rdma::type_alias::*;

pub mod soft;

#[cfg(feature = "ibverbs")]
pub mod verbs;

define_handles! {
    /// Handle of a protection domain.
    PdHandle;
    /// Handle of a completion queue.
    CqHandle;
    /// Handle of a memory registration.
    MrHandle;
    /// Handle of a queue pair.
    QpHandle;
}

/// Device attributes the data path cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceAttr {
    /// Maximum depth of a work queue.
    pub max_qp_wr: u32,
    /// Maximum scatter/gather entries per work request.
    pub max_sge: u32,
    /// Maximum depth of a completion queue.
    pub max_cqe: u32,
    /// Maximum outstanding RDMA reads/atomics a queue pair may be the target of.
    pub max_qp_rd_atom: u8,
    /// Maximum outstanding RDMA reads/atomics a queue pair may initiate.
    pub max_qp_init_rd_atom: u8,
    /// Number of physical ports.
    pub phys_port_cnt: u8,
}

/// Link layer of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkLayer {
    InfiniBand,
    /// RoCE. Every packet needs a global routing header.
    Ethernet,
}

/// Attributes of one port and one entry of its GID table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortAttr {
    /// Whether the port is in the `ACTIVE` state.
    pub active: bool,
    /// LID of the port. Zero on RoCE.
    pub lid: Lid,
    /// GID at the queried index.
    pub gid: Gid,
    /// Active MTU.
    pub active_mtu: Mtu,
    /// Link layer.
    pub link_layer: LinkLayer,
}

/// Memory registration as issued by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawMr {
    pub handle: MrHandle,
    pub lkey: LKey,
    pub rkey: RKey,
}

/// Queue pair as issued by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawQp {
    pub handle: QpHandle,
    pub qpn: Qpn,
}

/// Creation attributes of a reliable-connection queue pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpInitAttr {
    pub send_cq: CqHandle,
    pub recv_cq: CqHandle,
    pub caps: QpCaps,
    /// Whether every send request generates a completion regardless of its
    /// own signaled flag.
    pub sq_sig_all: bool,
}

/// A send work request.
#[derive(Debug, Clone, Copy)]
pub struct SendWr<'a> {
    pub wr_id: WrId,
    pub sgl: &'a [Sge],
    pub signaled: bool,
}

/// A receive work request.
#[derive(Debug, Clone, Copy)]
pub struct RecvWr<'a> {
    pub wr_id: WrId,
    pub sgl: &'a [Sge],
}

/// Verbs of one opened RDMA device.
///
/// Implementations must be usable from several threads at once: posts from
/// submission threads run concurrently with polls from a reactor.
pub trait Provider: Send + Sync + fmt::Debug {
    /// Device name.
    fn name(&self) -> &str;

    /// Query device attributes.
    fn query_device(&self) -> io::Result<DeviceAttr>;

    /// Query a port and the GID at `gid_index` of its GID table.
    fn query_port(&self, port_num: PortNum, gid_index: GidIndex) -> io::Result<PortAttr>;

    fn alloc_pd(&self) -> io::Result<PdHandle>;

    /// Deallocate a protection domain. Fails with `EBUSY` while resources
    /// still reference it.
    fn dealloc_pd(&self, pd: PdHandle) -> io::Result<()>;

    fn create_cq(&self, capacity: u32) -> io::Result<CqHandle>;

    /// Destroy a completion queue. Fails with `EBUSY` while queue pairs still
    /// reference it.
    fn destroy_cq(&self, cq: CqHandle) -> io::Result<()>;

    /// Non-blockingly poll at most `max` completions, appending them to `out`.
    /// Return the number of completions appended.
    fn poll_cq(&self, cq: CqHandle, out: &mut Vec<Wc>, max: usize) -> io::Result<usize>;

    /// Register `len` bytes at `addr`.
    ///
    /// # Safety
    ///
    /// The memory must stay valid, and must not be moved or freed, until the
    /// registration is deregistered. While a work request referencing it is
    /// outstanding, the device may read or write it at any time.
    unsafe fn reg_mr(
        &self,
        pd: PdHandle,
        addr: *mut u8,
        len: usize,
        access: Permission,
    ) -> io::Result<RawMr>;

    fn dereg_mr(&self, mr: MrHandle) -> io::Result<()>;

    fn create_qp(&self, pd: PdHandle, init_attr: &QpInitAttr) -> io::Result<RawQp>;

    /// Apply a state transition. Fails with `EINVAL` if the queue pair is not in
    /// the transition's source state or an attribute is invalid.
    fn modify_qp(&self, qp: QpHandle, transition: &QpTransition) -> io::Result<()>;

    fn query_qp_state(&self, qp: QpHandle) -> io::Result<QpState>;

    /// Destroy a queue pair. Outstanding work requests are dropped without
    /// generating completions.
    fn destroy_qp(&self, qp: QpHandle) -> io::Result<()>;

    fn post_send(&self, qp: QpHandle, wr: &SendWr<'_>) -> io::Result<()>;

    fn post_recv(&self, qp: QpHandle, wr: &RecvWr<'_>) -> io::Result<()>;
}
