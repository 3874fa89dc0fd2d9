//! Bindings of libibverbs C interfaces.

#![allow(non_snake_case)]
#![allow(non_camel_case_types)]
#![allow(non_upper_case_globals)]
#![allow(deref_nullptr)]
#![allow(clippy::missing_safety_doc)]
#![allow(clippy::too_many_arguments)]
#![allow(unused)]

mod private {
    use libc::*;
    include!(concat!(env!("OUT_DIR"), "/verbs_bindings.rs"));
}

pub(crate) use self::private::*;

// Enum values of `verbs.h` used by the provider. Fixed by the libibverbs ABI.
pub(crate) const IBV_QPT_RC: u32 = 2;
pub(crate) const IBV_WR_SEND: u32 = 2;
pub(crate) const IBV_SEND_SIGNALED: u32 = 1 << 1;
pub(crate) const IBV_PORT_ACTIVE: u32 = 4;
pub(crate) const IBV_LINK_LAYER_ETHERNET: u8 = 2;

pub(crate) const IBV_QP_STATE: i32 = 1 << 0;
pub(crate) const IBV_QP_ACCESS_FLAGS: i32 = 1 << 3;
pub(crate) const IBV_QP_PKEY_INDEX: i32 = 1 << 4;
pub(crate) const IBV_QP_PORT: i32 = 1 << 5;
pub(crate) const IBV_QP_AV: i32 = 1 << 7;
pub(crate) const IBV_QP_PATH_MTU: i32 = 1 << 8;
pub(crate) const IBV_QP_TIMEOUT: i32 = 1 << 9;
pub(crate) const IBV_QP_RETRY_CNT: i32 = 1 << 10;
pub(crate) const IBV_QP_RNR_RETRY: i32 = 1 << 11;
pub(crate) const IBV_QP_RQ_PSN: i32 = 1 << 12;
pub(crate) const IBV_QP_MAX_QP_RD_ATOMIC: i32 = 1 << 13;
pub(crate) const IBV_QP_MIN_RNR_TIMER: i32 = 1 << 15;
pub(crate) const IBV_QP_SQ_PSN: i32 = 1 << 16;
pub(crate) const IBV_QP_MAX_DEST_RD_ATOMIC: i32 = 1 << 17;
pub(crate) const IBV_QP_DEST_QPN: i32 = 1 << 20;

/// Poll (possibly multiple) completions from a completion queue.
///
/// Return the number of completions polled, or a negative value on failure.
#[inline]
pub unsafe fn ibv_poll_cq(
    cq: *mut ibv_cq,
    num_entries: ::std::os::raw::c_int,
    wc: *mut ibv_wc,
) -> ::std::os::raw::c_int {
    (*(*cq).context).ops.poll_cq.unwrap_unchecked()(cq, num_entries, wc)
}

/// Post a list of work requests to a send queue.
#[inline]
pub unsafe fn ibv_post_send(
    qp: *mut ibv_qp,
    wr: *mut ibv_send_wr,
    bad_wr: *mut *mut ibv_send_wr,
) -> ::std::os::raw::c_int {
    (*(*qp).context).ops.post_send.unwrap_unchecked()(qp, wr, bad_wr)
}

/// Post a list of work requests to a receive queue.
#[inline]
pub unsafe fn ibv_post_recv(
    qp: *mut ibv_qp,
    wr: *mut ibv_recv_wr,
    bad_wr: *mut *mut ibv_recv_wr,
) -> ::std::os::raw::c_int {
    (*(*qp).context).ops.post_recv.unwrap_unchecked()(qp, wr, bad_wr)
}

/// Query a port through the compatibility entry point, which every
/// libibverbs version exports.
#[inline]
pub unsafe fn ___ibv_query_port(
    context: *mut ibv_context,
    port_num: u8,
    port_attr: *mut ibv_port_attr,
) -> ::std::os::raw::c_int {
    std::ptr::write_bytes(port_attr, 0, 1);
    ibv_query_port(context, port_num, port_attr as *mut _compat_ibv_port_attr)
}
