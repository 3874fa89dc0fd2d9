//! libibverbs-backed provider.
//!
//! Handles are the addresses of the underlying libibverbs objects.

use std::ffi::CStr;
use std::ptr::{self, NonNull};
use std::{fmt, io, mem};

use libc::c_void;
use regex::Regex;

use super::*;
use crate::bindings::*;
use crate::rdma::cq::{WcOpcode, WcStatus};
use crate::utils::interop::*;

/// Upper bound on work completions drained by a single `ibv_poll_cq`.
const MAX_POLL_BATCH: usize = 1 << 16;

/// An opened libibverbs device.
pub struct VerbsDevice {
    ctx: NonNull<ibv_context>,
    name: String,
}

// SAFETY: libibverbs objects are thread-safe.
unsafe impl Send for VerbsDevice {}
unsafe impl Sync for VerbsDevice {}

impl fmt::Debug for VerbsDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerbsDevice").field("name", &self.name).finish()
    }
}

fn handle_of<T>(p: *mut T) -> u64 {
    p as usize as u64
}

fn ptr_of<T>(h: impl Into<u64>) -> *mut T {
    h.into() as usize as *mut T
}

fn null_err<T>(p: *mut T) -> io::Result<NonNull<T>> {
    NonNull::new(p).ok_or_else(io::Error::last_os_error)
}

/// Keep `ENOMEM` intact for back-pressure detection; explain other codes.
fn post_ret(ret: i32, explain: fn(i32) -> Option<&'static str>) -> io::Result<()> {
    if ret.abs() == libc::ENOMEM {
        return from_c_ret(ret);
    }
    from_c_ret_explained(ret, explain)
}

impl VerbsDevice {
    /// Open the first device whose name matches the regular expression, or
    /// the first device if `dev_name` is `None`.
    pub fn open(dev_name: Option<&str>) -> io::Result<Self> {
        let pattern = dev_name
            .map(Regex::new)
            .transpose()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let mut num_devices = 0;
        // SAFETY: FFI.
        let list = unsafe { ibv_get_device_list(&mut num_devices) };
        if list.is_null() {
            return Err(io::Error::last_os_error());
        }

        let mut result = Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no RDMA device matches {:?}", dev_name),
        ));
        for i in 0..num_devices.max(0) as usize {
            // SAFETY: `list` holds `num_devices` valid device pointers.
            let dev = unsafe { *list.add(i) };
            // SAFETY: device names are NUL-terminated strings owned by the list.
            let name = unsafe { CStr::from_ptr(ibv_get_device_name(dev)) }
                .to_string_lossy()
                .into_owned();
            if pattern.as_ref().is_some_and(|re| !re.is_match(&name)) {
                continue;
            }

            // SAFETY: FFI.
            result = null_err(unsafe { ibv_open_device(dev) }).map(|ctx| VerbsDevice { ctx, name });
            break;
        }

        // SAFETY: opened contexts outlive the device list.
        unsafe { ibv_free_device_list(list) };
        if let Ok(dev) = &result {
            log::debug!("opened RDMA device {}", dev.name);
        }
        result
    }

    fn ctx(&self) -> *mut ibv_context {
        self.ctx.as_ptr()
    }
}

impl Drop for VerbsDevice {
    fn drop(&mut self) {
        // SAFETY: FFI.
        let ret = unsafe { ibv_close_device(self.ctx()) };
        if let Err(e) = from_c_ret(ret) {
            log::error!("cannot close device {}: {}", self.name, e);
        }
    }
}

fn convert_wc(wc: &ibv_wc) -> Wc {
    let status = WcStatus::from_raw(wc.status).unwrap_or(WcStatus::GeneralErr);
    if status.is_success() {
        Wc::success(wc.wr_id, wc.qp_num, WcOpcode::from_raw(wc.opcode), wc.byte_len)
    } else {
        Wc::failure(wc.wr_id, status, wc.qp_num, wc.vendor_err)
    }
}

impl Provider for VerbsDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn query_device(&self) -> io::Result<DeviceAttr> {
        // SAFETY: POD type.
        let mut attr = unsafe { mem::zeroed::<ibv_device_attr>() };
        // SAFETY: FFI.
        from_c_ret(unsafe { ibv_query_device(self.ctx(), &mut attr) })?;
        Ok(DeviceAttr {
            max_qp_wr: attr.max_qp_wr as u32,
            max_sge: attr.max_sge as u32,
            max_cqe: attr.max_cqe as u32,
            max_qp_rd_atom: attr.max_qp_rd_atom.clamp(0, u8::MAX as i32) as u8,
            max_qp_init_rd_atom: attr.max_qp_init_rd_atom.clamp(0, u8::MAX as i32) as u8,
            phys_port_cnt: attr.phys_port_cnt,
        })
    }

    fn query_port(&self, port_num: PortNum, gid_index: GidIndex) -> io::Result<PortAttr> {
        // SAFETY: POD type.
        let mut attr = unsafe { mem::zeroed::<ibv_port_attr>() };
        // SAFETY: FFI.
        from_c_ret(unsafe { ___ibv_query_port(self.ctx(), port_num, &mut attr) })?;

        // SAFETY: POD type.
        let mut gid = unsafe { mem::zeroed::<ibv_gid>() };
        // SAFETY: FFI.
        from_c_ret(unsafe { ibv_query_gid(self.ctx(), port_num, gid_index as i32, &mut gid) })?;

        let active_mtu = Mtu::from_raw(attr.active_mtu).ok_or_else(|| errno(libc::EINVAL))?;
        Ok(PortAttr {
            active: attr.state == IBV_PORT_ACTIVE,
            lid: attr.lid,
            // SAFETY: every bit pattern is a valid byte array.
            gid: Gid::from(unsafe { gid.raw }),
            active_mtu,
            link_layer: if attr.link_layer == IBV_LINK_LAYER_ETHERNET {
                LinkLayer::Ethernet
            } else {
                LinkLayer::InfiniBand
            },
        })
    }

    fn alloc_pd(&self) -> io::Result<PdHandle> {
        // SAFETY: FFI.
        let pd = null_err(unsafe { ibv_alloc_pd(self.ctx()) })?;
        Ok(PdHandle(handle_of(pd.as_ptr())))
    }

    fn dealloc_pd(&self, pd: PdHandle) -> io::Result<()> {
        // SAFETY: FFI.
        from_c_ret(unsafe { ibv_dealloc_pd(ptr_of(pd)) })
    }

    fn create_cq(&self, capacity: u32) -> io::Result<CqHandle> {
        // SAFETY: FFI.
        let cq = null_err(unsafe {
            ibv_create_cq(
                self.ctx(),
                capacity as i32,
                ptr::null_mut(),
                ptr::null_mut(),
                0,
            )
        })?;
        Ok(CqHandle(handle_of(cq.as_ptr())))
    }

    fn destroy_cq(&self, cq: CqHandle) -> io::Result<()> {
        // SAFETY: FFI.
        from_c_ret(unsafe { ibv_destroy_cq(ptr_of(cq)) })
    }

    fn poll_cq(&self, cq: CqHandle, out: &mut Vec<Wc>, max: usize) -> io::Result<usize> {
        // Never ask the device for more than it can report in one call.
        let max = i32::try_from(max.min(MAX_POLL_BATCH)).unwrap_or(i32::MAX);
        let mut wcs = Vec::<ibv_wc>::with_capacity(max as usize);
        // SAFETY: FFI; `wcs` has room for `max` entries.
        let n = unsafe { ibv_poll_cq(ptr_of(cq), max, wcs.as_mut_ptr()) };
        if n < 0 {
            return Err(errno(libc::EIO));
        }
        // SAFETY: the first `n` entries are initialized by the device.
        unsafe { wcs.set_len(n as usize) };
        out.extend(wcs.iter().map(convert_wc));
        Ok(n as usize)
    }

    unsafe fn reg_mr(&self, pd: PdHandle, addr: *mut u8, len: usize, access: Permission) -> io::Result<RawMr> {
        let mr = null_err(ibv_reg_mr(ptr_of(pd), addr as *mut c_void, len, access.bits() as i32))?;
        let mr = mr.as_ptr();
        Ok(RawMr {
            handle: MrHandle(handle_of(mr)),
            lkey: (*mr).lkey,
            rkey: (*mr).rkey,
        })
    }

    fn dereg_mr(&self, mr: MrHandle) -> io::Result<()> {
        // SAFETY: FFI.
        from_c_ret(unsafe { ibv_dereg_mr(ptr_of(mr)) })
    }

    fn create_qp(&self, pd: PdHandle, init_attr: &QpInitAttr) -> io::Result<RawQp> {
        // SAFETY: POD type.
        let mut attr = unsafe { mem::zeroed::<ibv_qp_init_attr>() };
        attr.send_cq = ptr_of(init_attr.send_cq);
        attr.recv_cq = ptr_of(init_attr.recv_cq);
        attr.cap.max_send_wr = init_attr.caps.max_send_wr;
        attr.cap.max_recv_wr = init_attr.caps.max_recv_wr;
        attr.cap.max_send_sge = init_attr.caps.max_send_sge;
        attr.cap.max_recv_sge = init_attr.caps.max_recv_sge;
        attr.cap.max_inline_data = init_attr.caps.max_inline_data;
        attr.qp_type = IBV_QPT_RC;
        attr.sq_sig_all = init_attr.sq_sig_all as i32;

        // SAFETY: FFI.
        let qp = null_err(unsafe { ibv_create_qp(ptr_of(pd), &mut attr) })?;
        Ok(RawQp {
            handle: QpHandle(handle_of(qp.as_ptr())),
            // SAFETY: `qp` is valid.
            qpn: unsafe { (*qp.as_ptr()).qp_num },
        })
    }

    fn modify_qp(&self, qp: QpHandle, transition: &QpTransition) -> io::Result<()> {
        // SAFETY: POD type.
        let mut attr = unsafe { mem::zeroed::<ibv_qp_attr>() };
        let mask = match transition {
            QpTransition::ToInit(init) => {
                attr.qp_state = QpState::Init as u32;
                attr.pkey_index = init.pkey_index;
                attr.port_num = init.port_num;
                attr.qp_access_flags = init.access.bits();
                IBV_QP_STATE | IBV_QP_PKEY_INDEX | IBV_QP_PORT | IBV_QP_ACCESS_FLAGS
            }
            QpTransition::ToRtr(rtr) => {
                attr.qp_state = QpState::Rtr as u32;
                attr.path_mtu = rtr.path_mtu as u32;
                attr.dest_qp_num = rtr.dest_qpn;
                attr.rq_psn = rtr.rq_psn & PSN_MASK;
                attr.max_dest_rd_atomic = rtr.max_dest_rd_atomic;
                attr.min_rnr_timer = rtr.min_rnr_timer;

                let av = &rtr.av;
                attr.ah_attr.is_global = av.is_global as u8;
                attr.ah_attr.dlid = av.dlid;
                attr.ah_attr.sl = av.sl;
                attr.ah_attr.src_path_bits = av.src_path_bits;
                attr.ah_attr.port_num = av.port_num;
                attr.ah_attr.grh.dgid.raw = av.dgid.raw();
                attr.ah_attr.grh.flow_label = av.flow_label;
                attr.ah_attr.grh.sgid_index = av.sgid_index;
                attr.ah_attr.grh.hop_limit = av.hop_limit;
                attr.ah_attr.grh.traffic_class = av.traffic_class;
                IBV_QP_STATE
                    | IBV_QP_AV
                    | IBV_QP_PATH_MTU
                    | IBV_QP_DEST_QPN
                    | IBV_QP_RQ_PSN
                    | IBV_QP_MAX_DEST_RD_ATOMIC
                    | IBV_QP_MIN_RNR_TIMER
            }
            QpTransition::ToRts(rts) => {
                attr.qp_state = QpState::Rts as u32;
                attr.sq_psn = rts.sq_psn & PSN_MASK;
                attr.timeout = rts.timeout;
                attr.retry_cnt = rts.retry_cnt;
                attr.rnr_retry = rts.rnr_retry;
                attr.max_rd_atomic = rts.max_rd_atomic;
                IBV_QP_STATE
                    | IBV_QP_SQ_PSN
                    | IBV_QP_TIMEOUT
                    | IBV_QP_RETRY_CNT
                    | IBV_QP_RNR_RETRY
                    | IBV_QP_MAX_QP_RD_ATOMIC
            }
            QpTransition::ToError => {
                attr.qp_state = QpState::Error as u32;
                IBV_QP_STATE
            }
        };
        // SAFETY: FFI.
        from_c_ret(unsafe { ibv_modify_qp(ptr_of(qp), &mut attr, mask) })
    }

    fn query_qp_state(&self, qp: QpHandle) -> io::Result<QpState> {
        // SAFETY: POD types.
        let mut attr = unsafe { mem::zeroed::<ibv_qp_attr>() };
        let mut init_attr = unsafe { mem::zeroed::<ibv_qp_init_attr>() };
        // SAFETY: FFI.
        from_c_ret(unsafe { ibv_query_qp(ptr_of(qp), &mut attr, IBV_QP_STATE, &mut init_attr) })?;
        Ok(QpState::from_raw(attr.qp_state))
    }

    fn destroy_qp(&self, qp: QpHandle) -> io::Result<()> {
        // SAFETY: FFI.
        from_c_ret(unsafe { ibv_destroy_qp(ptr_of(qp)) })
    }

    fn post_send(&self, qp: QpHandle, wr: &SendWr<'_>) -> io::Result<()> {
        // SAFETY: POD type.
        let mut raw = unsafe { mem::zeroed::<ibv_send_wr>() };
        raw.wr_id = wr.wr_id;
        raw.sg_list = wr.sgl.as_ptr() as *mut ibv_sge;
        raw.num_sge = wr.sgl.len() as i32;
        raw.opcode = IBV_WR_SEND;
        raw.send_flags = if wr.signaled { IBV_SEND_SIGNALED } else { 0 };

        let mut bad_wr = ptr::null_mut();
        // SAFETY: FFI; `Sge` has the layout of `ibv_sge` and the device only
        // reads the list during the call.
        post_ret(
            unsafe { ibv_post_send(ptr_of(qp), &mut raw, &mut bad_wr) },
            send_err_explanation,
        )
    }

    fn post_recv(&self, qp: QpHandle, wr: &RecvWr<'_>) -> io::Result<()> {
        // SAFETY: POD type.
        let mut raw = unsafe { mem::zeroed::<ibv_recv_wr>() };
        raw.wr_id = wr.wr_id;
        raw.sg_list = wr.sgl.as_ptr() as *mut ibv_sge;
        raw.num_sge = wr.sgl.len() as i32;

        let mut bad_wr = ptr::null_mut();
        // SAFETY: FFI, as in `post_send`.
        post_ret(
            unsafe { ibv_post_recv(ptr_of(qp), &mut raw, &mut bad_wr) },
            recv_err_explanation,
        )
    }
}
