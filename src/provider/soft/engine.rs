//! State of the software fabric: every device, resource and in-flight message
//! lives here, behind one lock held by [`SoftDevice`](super::SoftDevice).

use std::collections::{HashMap, VecDeque};
use std::io;
use std::ptr;

use crate::provider::*;
use crate::rdma::cq::{Wc, WcOpcode, WcStatus};
use crate::rdma::gid::Gid;
use crate::rdma::mr::{Permission, Sge};
use crate::rdma::qp::*;
use crate::utils::interop::errno;

use super::SoftDeviceConfig;

pub(super) type DevId = usize;

const FIRST_QPN: Qpn = 0x100;
const KEY_STRIDE: u32 = 0x100;
const MAX_INLINE_DATA: u32 = 256;

fn einval() -> io::Error {
    errno(libc::EINVAL)
}

/// Vendor syndrome reported with error completions.
fn vendor_err(status: WcStatus) -> u32 {
    match status {
        WcStatus::Success => 0,
        WcStatus::WrFlushErr => 0xf9,
        status => 0x100 | status as u32,
    }
}

struct Device {
    config: SoftDeviceConfig,
    lid: Lid,
    gids: Vec<Gid>,
}

struct CqEntry {
    dev: DevId,
    capacity: usize,
    entries: VecDeque<Cqe>,
    overrun: bool,
}

/// A completion plus the work queue slots it frees once polled.
struct Cqe {
    wc: Wc,
    qp: u64,
    sq_release: u32,
    rq_release: u32,
}

struct MrEntry {
    dev: DevId,
    pd: u64,
    addr: usize,
    len: usize,
    access: Permission,
    lkey: LKey,
}

struct PostedRecv {
    wr_id: WrId,
    sgl: Vec<Sge>,
}

/// A message that left its sender and waits at the receiver for RTR or for a
/// posted receive.
struct Inbound {
    src: u64,
    wr_id: WrId,
    signaled: bool,
    psn: Psn,
    payload: Vec<u8>,
}

struct QpEntry {
    dev: DevId,
    pd: u64,
    qpn: Qpn,
    send_cq: u64,
    recv_cq: u64,
    caps: QpCaps,
    sq_sig_all: bool,
    state: QpState,
    rtr: Option<RtrAttr>,
    rts: Option<RtsAttr>,

    sq_used: u32,
    rq_used: u32,
    /// Unsignaled sends finished since the last signaled send completion.
    unsignaled: u32,

    recvs: VecDeque<PostedRecv>,
    inbound: VecDeque<Inbound>,
    send_psn: Psn,
    recv_psn: Psn,
}

pub(super) struct FabricState {
    next_handle: u64,
    next_qpn: Qpn,
    next_key: u32,
    devices: Vec<Device>,
    pds: HashMap<u64, DevId>,
    cqs: HashMap<u64, CqEntry>,
    mrs: HashMap<u64, MrEntry>,
    keys: HashMap<LKey, u64>,
    qps: HashMap<u64, QpEntry>,
    qpns: HashMap<Qpn, u64>,
}

impl FabricState {
    pub(super) fn new() -> Self {
        Self {
            next_handle: 1,
            next_qpn: FIRST_QPN,
            next_key: KEY_STRIDE,
            devices: Vec::new(),
            pds: HashMap::new(),
            cqs: HashMap::new(),
            mrs: HashMap::new(),
            keys: HashMap::new(),
            qps: HashMap::new(),
            qpns: HashMap::new(),
        }
    }

    /// Attach a new device. Unset addresses are derived from the device index:
    /// LID `index + 1` on InfiniBand, and a GID table of a link-local GID
    /// followed by an IPv4-mapped one.
    pub(super) fn add_device(&mut self, mut config: SoftDeviceConfig) -> (DevId, String) {
        let id = self.devices.len();
        let host = (id + 1) as u16;
        if config.name.is_empty() {
            config.name = format!("soft{}", id);
        }
        let lid = match config.link_layer {
            LinkLayer::InfiniBand => config.lid.unwrap_or(host),
            LinkLayer::Ethernet => 0,
        };
        let gids = if config.gids.is_empty() {
            let [hi, lo] = host.to_be_bytes();
            let mut link_local = [0u8; 16];
            link_local[..2].copy_from_slice(&[0xfe, 0x80]);
            link_local[14..].copy_from_slice(&[hi, lo]);
            let mut v4_mapped = [0u8; 16];
            v4_mapped[10..12].copy_from_slice(&[0xff, 0xff]);
            v4_mapped[12..].copy_from_slice(&[10, 0, hi, lo]);
            vec![Gid::from(link_local), Gid::from(v4_mapped)]
        } else {
            config.gids.clone()
        };
        let name = config.name.clone();
        self.devices.push(Device { config, lid, gids });
        (id, name)
    }

    fn alloc_handle(&mut self) -> u64 {
        let h = self.next_handle;
        self.next_handle += 1;
        h
    }

    fn qp(&self, dev: DevId, qp: QpHandle) -> io::Result<&QpEntry> {
        self.qps.get(&qp.0).filter(|q| q.dev == dev).ok_or_else(einval)
    }

    fn qp_mut(&mut self, dev: DevId, qp: QpHandle) -> io::Result<&mut QpEntry> {
        self.qps
            .get_mut(&qp.0)
            .filter(|q| q.dev == dev)
            .ok_or_else(einval)
    }

    fn check_pd(&self, dev: DevId, pd: PdHandle) -> io::Result<()> {
        match self.pds.get(&pd.0) {
            Some(&d) if d == dev => Ok(()),
            _ => Err(einval()),
        }
    }

    fn check_cq(&self, dev: DevId, cq: CqHandle) -> io::Result<()> {
        match self.cqs.get(&cq.0) {
            Some(c) if c.dev == dev => Ok(()),
            _ => Err(einval()),
        }
    }

    pub(super) fn query_device(&self, dev: DevId) -> DeviceAttr {
        let c = &self.devices[dev].config;
        DeviceAttr {
            max_qp_wr: c.max_qp_wr,
            max_sge: c.max_sge,
            max_cqe: c.max_cqe,
            max_qp_rd_atom: c.max_qp_rd_atom,
            max_qp_init_rd_atom: c.max_qp_rd_atom,
            phys_port_cnt: 1,
        }
    }

    pub(super) fn query_port(
        &self,
        dev: DevId,
        port_num: PortNum,
        gid_index: GidIndex,
    ) -> io::Result<PortAttr> {
        let d = &self.devices[dev];
        if port_num != 1 {
            return Err(einval());
        }
        let gid = *d.gids.get(gid_index as usize).ok_or_else(einval)?;
        Ok(PortAttr {
            active: d.config.port_active,
            lid: d.lid,
            gid,
            active_mtu: d.config.active_mtu,
            link_layer: d.config.link_layer,
        })
    }

    pub(super) fn alloc_pd(&mut self, dev: DevId) -> PdHandle {
        let h = self.alloc_handle();
        self.pds.insert(h, dev);
        PdHandle(h)
    }

    pub(super) fn dealloc_pd(&mut self, dev: DevId, pd: PdHandle) -> io::Result<()> {
        self.check_pd(dev, pd)?;
        if self.mrs.values().any(|m| m.pd == pd.0) || self.qps.values().any(|q| q.pd == pd.0) {
            return Err(errno(libc::EBUSY));
        }
        self.pds.remove(&pd.0);
        Ok(())
    }

    pub(super) fn create_cq(&mut self, dev: DevId, capacity: u32) -> io::Result<CqHandle> {
        if capacity == 0 || capacity > self.devices[dev].config.max_cqe {
            return Err(einval());
        }
        let h = self.alloc_handle();
        self.cqs.insert(
            h,
            CqEntry {
                dev,
                capacity: capacity as usize,
                entries: VecDeque::new(),
                overrun: false,
            },
        );
        Ok(CqHandle(h))
    }

    pub(super) fn destroy_cq(&mut self, dev: DevId, cq: CqHandle) -> io::Result<()> {
        self.check_cq(dev, cq)?;
        if self.qps.values().any(|q| q.send_cq == cq.0 || q.recv_cq == cq.0) {
            return Err(errno(libc::EBUSY));
        }
        self.cqs.remove(&cq.0);
        Ok(())
    }

    pub(super) fn poll_cq(
        &mut self,
        dev: DevId,
        cq: CqHandle,
        out: &mut Vec<Wc>,
        max: usize,
    ) -> io::Result<usize> {
        self.check_cq(dev, cq)?;
        let Some(entry) = self.cqs.get_mut(&cq.0) else {
            return Err(einval());
        };
        if entry.overrun {
            return Err(errno(libc::EOVERFLOW));
        }

        let n = max.min(entry.entries.len());
        let polled = entry.entries.drain(..n).collect::<Vec<_>>();
        for cqe in polled {
            if let Some(q) = self.qps.get_mut(&cqe.qp) {
                q.sq_used = q.sq_used.saturating_sub(cqe.sq_release);
                q.rq_used = q.rq_used.saturating_sub(cqe.rq_release);
            }
            out.push(cqe.wc);
        }
        Ok(n)
    }

    pub(super) fn reg_mr(
        &mut self,
        dev: DevId,
        pd: PdHandle,
        addr: *mut u8,
        len: usize,
        access: Permission,
    ) -> io::Result<RawMr> {
        self.check_pd(dev, pd)?;
        if addr.is_null() {
            return Err(errno(libc::EFAULT));
        }
        if len == 0 || !access.is_valid_for_mr() {
            return Err(einval());
        }

        let key = self.next_key;
        self.next_key = self.next_key.wrapping_add(KEY_STRIDE).max(KEY_STRIDE);
        let h = self.alloc_handle();
        self.mrs.insert(
            h,
            MrEntry {
                dev,
                pd: pd.0,
                addr: addr as usize,
                len,
                access,
                lkey: key,
            },
        );
        self.keys.insert(key, h);
        Ok(RawMr {
            handle: MrHandle(h),
            lkey: key,
            rkey: key,
        })
    }

    pub(super) fn dereg_mr(&mut self, dev: DevId, mr: MrHandle) -> io::Result<()> {
        match self.mrs.get(&mr.0) {
            Some(m) if m.dev == dev => {
                let lkey = m.lkey;
                self.mrs.remove(&mr.0);
                self.keys.remove(&lkey);
                Ok(())
            }
            _ => Err(einval()),
        }
    }

    pub(super) fn create_qp(
        &mut self,
        dev: DevId,
        pd: PdHandle,
        attr: &QpInitAttr,
    ) -> io::Result<RawQp> {
        self.check_pd(dev, pd)?;
        self.check_cq(dev, attr.send_cq)?;
        self.check_cq(dev, attr.recv_cq)?;

        let c = &self.devices[dev].config;
        let caps = attr.caps;
        if caps.max_send_wr > c.max_qp_wr
            || caps.max_recv_wr > c.max_qp_wr
            || caps.max_send_sge > c.max_sge
            || caps.max_recv_sge > c.max_sge
            || caps.max_inline_data > MAX_INLINE_DATA
        {
            return Err(einval());
        }

        let qpn = self.next_qpn;
        self.next_qpn = (self.next_qpn + 1) & PSN_MASK;
        let h = self.alloc_handle();
        self.qps.insert(
            h,
            QpEntry {
                dev,
                pd: pd.0,
                qpn,
                send_cq: attr.send_cq.0,
                recv_cq: attr.recv_cq.0,
                caps,
                sq_sig_all: attr.sq_sig_all,
                state: QpState::Reset,
                rtr: None,
                rts: None,
                sq_used: 0,
                rq_used: 0,
                unsignaled: 0,
                recvs: VecDeque::new(),
                inbound: VecDeque::new(),
                send_psn: 0,
                recv_psn: 0,
            },
        );
        self.qpns.insert(qpn, h);
        Ok(RawQp {
            handle: QpHandle(h),
            qpn,
        })
    }

    pub(super) fn modify_qp(
        &mut self,
        dev: DevId,
        qp: QpHandle,
        transition: &QpTransition,
    ) -> io::Result<()> {
        let device = &self.devices[dev];
        let q = self.qps.get(&qp.0).filter(|q| q.dev == dev).ok_or_else(einval)?;

        match transition {
            QpTransition::ToInit(attr) => {
                if q.state != QpState::Reset || attr.port_num != 1 || attr.pkey_index != 0 {
                    return Err(einval());
                }
                self.qp_mut(dev, qp)?.state = QpState::Init;
            }
            QpTransition::ToRtr(attr) => {
                let av = &attr.av;
                let path_ok = if av.is_global {
                    (av.sgid_index as usize) < device.gids.len()
                } else {
                    device.config.link_layer == LinkLayer::InfiniBand
                };
                if q.state != QpState::Init
                    || av.port_num != 1
                    || !path_ok
                    || attr.path_mtu > device.config.active_mtu
                    || attr.max_dest_rd_atomic > device.config.max_qp_rd_atom
                    || attr.min_rnr_timer > 31
                {
                    return Err(einval());
                }
                let q = self.qp_mut(dev, qp)?;
                q.rtr = Some(*attr);
                q.recv_psn = attr.rq_psn & PSN_MASK;
                q.state = QpState::Rtr;
                self.progress(qp.0);
            }
            QpTransition::ToRts(attr) => {
                if q.state != QpState::Rtr
                    || attr.timeout > 31
                    || attr.retry_cnt > 7
                    || attr.rnr_retry > 7
                    || attr.max_rd_atomic > device.config.max_qp_rd_atom
                {
                    return Err(einval());
                }
                let q = self.qp_mut(dev, qp)?;
                q.rts = Some(*attr);
                q.send_psn = attr.sq_psn & PSN_MASK;
                q.state = QpState::Rts;
            }
            QpTransition::ToError => self.fail_qps(vec![qp.0]),
        }
        Ok(())
    }

    pub(super) fn query_qp_state(&self, dev: DevId, qp: QpHandle) -> io::Result<QpState> {
        Ok(self.qp(dev, qp)?.state)
    }

    pub(super) fn destroy_qp(&mut self, dev: DevId, qp: QpHandle) -> io::Result<()> {
        let q = self.qp(dev, qp)?;
        let qpn = q.qpn;
        let Some(q) = self.qps.remove(&qp.0) else {
            return Err(einval());
        };
        self.qpns.remove(&qpn);

        // Our own messages still parked at a peer vanish with us.
        for other in self.qps.values_mut() {
            other.inbound.retain(|m| m.src != qp.0);
        }

        // Peers whose messages were parked here lose their connection.
        let mut senders = Vec::new();
        for m in q.inbound {
            self.complete_send(m.src, m.wr_id, m.signaled, Err(WcStatus::RetryExcErr));
            if !senders.contains(&m.src) {
                senders.push(m.src);
            }
        }
        self.fail_qps(senders);
        Ok(())
    }

    pub(super) fn post_recv(&mut self, dev: DevId, qp: QpHandle, wr: &RecvWr<'_>) -> io::Result<()> {
        let q = self.qp_mut(dev, qp)?;
        match q.state {
            QpState::Init | QpState::Rtr | QpState::Rts | QpState::Sqd | QpState::Sqe => {}
            QpState::Error => {}
            QpState::Reset | QpState::Unknown => return Err(einval()),
        }
        if wr.sgl.len() > q.caps.max_recv_sge as usize {
            return Err(einval());
        }
        if q.rq_used >= q.caps.max_recv_wr {
            return Err(errno(libc::ENOMEM));
        }
        q.rq_used += 1;

        if q.state == QpState::Error {
            self.complete_recv(qp.0, wr.wr_id, Err(WcStatus::WrFlushErr));
            return Ok(());
        }
        q.recvs.push_back(PostedRecv {
            wr_id: wr.wr_id,
            sgl: wr.sgl.to_vec(),
        });
        self.progress(qp.0);
        Ok(())
    }

    pub(super) fn post_send(&mut self, dev: DevId, qp: QpHandle, wr: &SendWr<'_>) -> io::Result<()> {
        let q = self.qp_mut(dev, qp)?;
        if !matches!(q.state, QpState::Rts | QpState::Error) {
            return Err(einval());
        }
        if wr.sgl.len() > q.caps.max_send_sge as usize {
            return Err(einval());
        }
        if q.sq_used >= q.caps.max_send_wr {
            return Err(errno(libc::ENOMEM));
        }
        q.sq_used += 1;
        let signaled = wr.signaled || q.sq_sig_all;

        if q.state == QpState::Error {
            self.complete_send(qp.0, wr.wr_id, signaled, Err(WcStatus::WrFlushErr));
            return Ok(());
        }

        let psn = q.send_psn;
        q.send_psn = (psn + 1) & PSN_MASK;
        let (pd, dev) = (q.pd, q.dev);

        let payload = match self.gather(dev, pd, wr.sgl) {
            Ok(payload) => payload,
            Err(status) => {
                self.complete_send(qp.0, wr.wr_id, signaled, Err(status));
                self.fail_qps(vec![qp.0]);
                return Ok(());
            }
        };

        match self.route(qp.0) {
            Some(dest) => {
                if let Some(d) = self.qps.get_mut(&dest) {
                    d.inbound.push_back(Inbound {
                        src: qp.0,
                        wr_id: wr.wr_id,
                        signaled,
                        psn,
                        payload,
                    });
                }
                self.progress(dest);
            }
            None => {
                self.complete_send(qp.0, wr.wr_id, signaled, Err(WcStatus::RetryExcErr));
                self.fail_qps(vec![qp.0]);
            }
        }
        Ok(())
    }

    /// Resolve the peer of a connected queue pair, if its path routes to it
    /// and the peer is not bound elsewhere.
    fn route(&self, src: u64) -> Option<u64> {
        let s = self.qps.get(&src)?;
        let rtr = s.rtr?;
        let dest = *self.qpns.get(&rtr.dest_qpn)?;
        let d = self.qps.get(&dest)?;
        let ddev = &self.devices[d.dev];

        let routed = if rtr.av.is_global {
            ddev.gids.contains(&rtr.av.dgid)
        } else {
            ddev.config.link_layer == LinkLayer::InfiniBand
                && self.devices[s.dev].config.link_layer == LinkLayer::InfiniBand
                && ddev.lid == rtr.av.dlid
        };
        if !routed || d.state == QpState::Error {
            return None;
        }
        match d.rtr {
            Some(peer) if peer.dest_qpn != s.qpn => None,
            _ => Some(dest),
        }
    }

    /// Find the registration covering an SGE in the given protection domain.
    fn lookup(&self, dev: DevId, pd: u64, sge: &Sge) -> Option<&MrEntry> {
        let mr = self.mrs.get(self.keys.get(&sge.lkey)?)?;
        let start = sge.addr as usize;
        let end = start.checked_add(sge.len as usize)?;
        (mr.dev == dev && mr.pd == pd && start >= mr.addr && end <= mr.addr + mr.len).then_some(mr)
    }

    fn gather(&self, dev: DevId, pd: u64, sgl: &[Sge]) -> Result<Vec<u8>, WcStatus> {
        let total = sgl.iter().map(|s| s.len as usize).sum();
        let mut payload = Vec::with_capacity(total);
        for sge in sgl {
            self.lookup(dev, pd, sge).ok_or(WcStatus::LocProtErr)?;
            // SAFETY: the range lies inside a live registration, whose owner
            // keeps the memory valid until deregistration.
            let src = unsafe { std::slice::from_raw_parts(sge.addr as *const u8, sge.len as usize) };
            payload.extend_from_slice(src);
        }
        Ok(payload)
    }

    fn scatter(&self, dev: DevId, pd: u64, sgl: &[Sge], payload: &[u8]) -> Result<(), WcStatus> {
        for sge in sgl {
            let mr = self.lookup(dev, pd, sge).ok_or(WcStatus::LocProtErr)?;
            if !mr.access.contains(Permission::LOCAL_WRITE) {
                return Err(WcStatus::LocProtErr);
            }
        }
        let capacity: usize = sgl.iter().map(|s| s.len as usize).sum();
        if payload.len() > capacity {
            return Err(WcStatus::LocLenErr);
        }

        let mut rest = payload;
        for sge in sgl {
            let n = rest.len().min(sge.len as usize);
            // SAFETY: validated against a live registration with local write
            // access above; `payload` is an owned copy so ranges cannot overlap.
            unsafe { ptr::copy_nonoverlapping(rest.as_ptr(), sge.addr as *mut u8, n) };
            rest = &rest[n..];
        }
        Ok(())
    }

    /// Deliver as many messages parked at `dest` as its state and posted
    /// receives allow.
    fn progress(&mut self, dest: u64) {
        loop {
            let Some(d) = self.qps.get(&dest) else {
                return;
            };
            if !d.state.accepts_recv() {
                return;
            }
            let Some(front) = d.inbound.front() else {
                return;
            };
            let src = front.src;
            let psn_ok = front.psn == d.recv_psn;
            let rnr_wait = d.recvs.is_empty()
                && self
                    .qps
                    .get(&src)
                    .and_then(|s| s.rts)
                    .is_some_and(|rts| rts.rnr_retry > 0);
            if psn_ok && rnr_wait {
                return;
            }

            let Some(d) = self.qps.get_mut(&dest) else {
                return;
            };
            let Some(msg) = d.inbound.pop_front() else {
                return;
            };
            if !psn_ok {
                self.complete_send(src, msg.wr_id, msg.signaled, Err(WcStatus::RetryExcErr));
                self.fail_qps(vec![src]);
                continue;
            }
            let Some(recv) = d.recvs.pop_front() else {
                self.complete_send(src, msg.wr_id, msg.signaled, Err(WcStatus::RnrRetryExcErr));
                self.fail_qps(vec![src]);
                continue;
            };

            let (dev, pd) = (d.dev, d.pd);
            match self.scatter(dev, pd, &recv.sgl, &msg.payload) {
                Ok(()) => {
                    if let Some(d) = self.qps.get_mut(&dest) {
                        d.recv_psn = (d.recv_psn + 1) & PSN_MASK;
                    }
                    let len = msg.payload.len() as u32;
                    self.complete_recv(dest, recv.wr_id, Ok(len));
                    self.complete_send(src, msg.wr_id, msg.signaled, Ok(len));
                }
                Err(status) => {
                    let remote = match status {
                        WcStatus::LocLenErr => WcStatus::RemInvReqErr,
                        _ => WcStatus::RemOpErr,
                    };
                    self.complete_recv(dest, recv.wr_id, Err(status));
                    self.complete_send(src, msg.wr_id, msg.signaled, Err(remote));
                    self.fail_qps(vec![dest, src]);
                }
            }
        }
    }

    /// Move queue pairs into the error state, flushing everything outstanding
    /// on them, and breaking the connections of peers with messages parked here.
    fn fail_qps(&mut self, mut work: Vec<u64>) {
        while let Some(h) = work.pop() {
            let Some(q) = self.qps.get_mut(&h) else {
                continue;
            };
            q.state = QpState::Error;
            let recvs = q.recvs.drain(..).collect::<Vec<_>>();
            let inbound = q.inbound.drain(..).collect::<Vec<_>>();

            for r in recvs {
                self.complete_recv(h, r.wr_id, Err(WcStatus::WrFlushErr));
            }
            for m in inbound {
                self.complete_send(m.src, m.wr_id, m.signaled, Err(WcStatus::RetryExcErr));
                let alive = self.qps.get(&m.src).is_some_and(|s| s.state != QpState::Error);
                if alive && !work.contains(&m.src) {
                    work.push(m.src);
                }
            }

            let mut own = Vec::new();
            for other in self.qps.values_mut() {
                while let Some(pos) = other.inbound.iter().position(|m| m.src == h) {
                    if let Some(m) = other.inbound.remove(pos) {
                        own.push(m);
                    }
                }
            }
            for m in own {
                self.complete_send(h, m.wr_id, m.signaled, Err(WcStatus::WrFlushErr));
            }
        }
    }

    fn complete_send(&mut self, qp: u64, wr_id: WrId, signaled: bool, result: Result<u32, WcStatus>) {
        let Some(q) = self.qps.get_mut(&qp) else {
            return;
        };
        if !signaled {
            q.unsignaled += 1;
            return;
        }
        let release = 1 + std::mem::take(&mut q.unsignaled);
        let wc = match result {
            Ok(len) => Wc::success(wr_id, q.qpn, Some(WcOpcode::Send), len),
            Err(status) => Wc::failure(wr_id, status, q.qpn, vendor_err(status)),
        };
        let cq = q.send_cq;
        self.push_cqe(
            cq,
            Cqe {
                wc,
                qp,
                sq_release: release,
                rq_release: 0,
            },
        );
    }

    fn complete_recv(&mut self, qp: u64, wr_id: WrId, result: Result<u32, WcStatus>) {
        let Some(q) = self.qps.get(&qp) else {
            return;
        };
        let wc = match result {
            Ok(len) => Wc::success(wr_id, q.qpn, Some(WcOpcode::Recv), len),
            Err(status) => Wc::failure(wr_id, status, q.qpn, vendor_err(status)),
        };
        let cq = q.recv_cq;
        self.push_cqe(
            cq,
            Cqe {
                wc,
                qp,
                sq_release: 0,
                rq_release: 1,
            },
        );
    }

    fn push_cqe(&mut self, cq: u64, cqe: Cqe) {
        let Some(cq) = self.cqs.get_mut(&cq) else {
            return;
        };
        if cq.entries.len() >= cq.capacity {
            if !cq.overrun {
                log::error!("soft CQ overrun, capacity {}", cq.capacity);
            }
            cq.overrun = true;
            return;
        }
        cq.entries.push_back(cqe);
    }
}
