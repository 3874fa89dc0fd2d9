//! In-process software RC fabric.
//!
//! A [`SoftFabric`] connects any number of emulated devices. It follows the
//! observable behavior of an RC transport closely enough to exercise the whole
//! data path without hardware:
//!
//! - QP state machine and per-transition attribute checks; RoCE ports refuse
//!   paths without a global routing header.
//! - Work queue depth accounting. A slot is freed only when its completion is
//!   polled; unsignaled sends are freed with the next signaled completion.
//! - Delivery of a send into the peer's oldest posted receive, through
//!   registered memory, with 24-bit PSN checking.
//! - Receiver-not-ready: the send waits for a receive if `rnr_retry > 0`, and
//!   fails with `RnrRetryExcErr` otherwise.
//! - Sends towards a missing, misbound or unroutable peer fail with
//!   `RetryExcErr`. A peer that has not reached RTR yet is waited for.
//! - Any error completion moves the QP to ERR and flushes its outstanding
//!   requests with `WrFlushErr`.
//!
//! Delivery happens synchronously inside the post verb that makes it possible.

mod engine;

use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use self::engine::{DevId, FabricState};
use super::*;

/// Configuration of one emulated device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoftDeviceConfig {
    /// Device name. Empty for `soft<index>`.
    pub name: String,
    pub link_layer: LinkLayer,
    /// Port LID on InfiniBand. `None` for `index + 1`.
    pub lid: Option<Lid>,
    /// GID table. Empty for a link-local GID at index 0 and an IPv4-mapped GID
    /// at index 1.
    pub gids: Vec<Gid>,
    pub active_mtu: Mtu,
    pub port_active: bool,
    pub max_qp_wr: u32,
    pub max_sge: u32,
    pub max_cqe: u32,
    pub max_qp_rd_atom: u8,
}

impl Default for SoftDeviceConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            link_layer: LinkLayer::InfiniBand,
            lid: None,
            gids: Vec::new(),
            active_mtu: Mtu::Mtu4096,
            port_active: true,
            max_qp_wr: 16384,
            max_sge: 30,
            max_cqe: 65536,
            max_qp_rd_atom: 16,
        }
    }
}

impl SoftDeviceConfig {
    /// A RoCE device: Ethernet link layer, LID 0.
    pub fn roce() -> Self {
        Self {
            link_layer: LinkLayer::Ethernet,
            ..Default::default()
        }
    }
}

/// An in-process RC fabric.
///
/// Cloning yields another handle to the same fabric.
#[derive(Clone)]
pub struct SoftFabric {
    state: Arc<Mutex<FabricState>>,
}

impl SoftFabric {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FabricState::new())),
        }
    }

    /// Attach a new device with default configuration.
    pub fn open_device(&self) -> Arc<SoftDevice> {
        self.open_device_with(SoftDeviceConfig::default())
    }

    /// Attach a new device.
    pub fn open_device_with(&self, config: SoftDeviceConfig) -> Arc<SoftDevice> {
        let (id, name) = lock(&self.state).add_device(config);
        log::debug!("soft fabric: attached device {}", name);
        Arc::new(SoftDevice {
            state: self.state.clone(),
            id,
            name,
        })
    }
}

impl Default for SoftFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SoftFabric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftFabric").finish_non_exhaustive()
    }
}

fn lock(state: &Mutex<FabricState>) -> MutexGuard<'_, FabricState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A device attached to a [`SoftFabric`].
pub struct SoftDevice {
    state: Arc<Mutex<FabricState>>,
    id: DevId,
    name: String,
}

impl SoftDevice {
    fn state(&self) -> MutexGuard<'_, FabricState> {
        lock(&self.state)
    }
}

impl fmt::Debug for SoftDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftDevice").field("name", &self.name).finish()
    }
}

impl Provider for SoftDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn query_device(&self) -> io::Result<DeviceAttr> {
        Ok(self.state().query_device(self.id))
    }

    fn query_port(&self, port_num: PortNum, gid_index: GidIndex) -> io::Result<PortAttr> {
        self.state().query_port(self.id, port_num, gid_index)
    }

    fn alloc_pd(&self) -> io::Result<PdHandle> {
        Ok(self.state().alloc_pd(self.id))
    }

    fn dealloc_pd(&self, pd: PdHandle) -> io::Result<()> {
        self.state().dealloc_pd(self.id, pd)
    }

    fn create_cq(&self, capacity: u32) -> io::Result<CqHandle> {
        self.state().create_cq(self.id, capacity)
    }

    fn destroy_cq(&self, cq: CqHandle) -> io::Result<()> {
        self.state().destroy_cq(self.id, cq)
    }

    fn poll_cq(&self, cq: CqHandle, out: &mut Vec<Wc>, max: usize) -> io::Result<usize> {
        self.state().poll_cq(self.id, cq, out, max)
    }

    unsafe fn reg_mr(
        &self,
        pd: PdHandle,
        addr: *mut u8,
        len: usize,
        access: Permission,
    ) -> io::Result<RawMr> {
        self.state().reg_mr(self.id, pd, addr, len, access)
    }

    fn dereg_mr(&self, mr: MrHandle) -> io::Result<()> {
        self.state().dereg_mr(self.id, mr)
    }

    fn create_qp(&self, pd: PdHandle, init_attr: &QpInitAttr) -> io::Result<RawQp> {
        self.state().create_qp(self.id, pd, init_attr)
    }

    fn modify_qp(&self, qp: QpHandle, transition: &QpTransition) -> io::Result<()> {
        self.state().modify_qp(self.id, qp, transition)
    }

    fn query_qp_state(&self, qp: QpHandle) -> io::Result<QpState> {
        self.state().query_qp_state(self.id, qp)
    }

    fn destroy_qp(&self, qp: QpHandle) -> io::Result<()> {
        self.state().destroy_qp(self.id, qp)
    }

    fn post_send(&self, qp: QpHandle, wr: &SendWr<'_>) -> io::Result<()> {
        self.state().post_send(self.id, qp, wr)
    }

    fn post_recv(&self, qp: QpHandle, wr: &RecvWr<'_>) -> io::Result<()> {
        self.state().post_recv(self.id, qp, wr)
    }
}
