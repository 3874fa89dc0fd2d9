use std::fmt;

use thiserror::Error;

use crate::rdma::type_alias::*;

/// Opcode of a completion queue entry.
///
/// Discriminants are the libibverbs `ibv_wc_opcode` values.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[repr(u32)]
pub enum WcOpcode {
    /// Send request.
    Send = 0,
    /// RDMA write request.
    RdmaWrite = 1,
    /// RDMA read request.
    RdmaRead = 2,
    /// RDMA compare-and-swap request.
    CompSwap = 3,
    /// RDMA fetch-and-add request.
    FetchAdd = 4,
    /// Memory window bind request.
    BindMw = 5,
    /// Receive request.
    Recv = 128,
    /// Receive request with immediate data.
    RecvRdmaImm = 129,
}

impl WcOpcode {
    /// Decode a raw `ibv_wc_opcode` value.
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => WcOpcode::Send,
            1 => WcOpcode::RdmaWrite,
            2 => WcOpcode::RdmaRead,
            3 => WcOpcode::CompSwap,
            4 => WcOpcode::FetchAdd,
            5 => WcOpcode::BindMw,
            128 => WcOpcode::Recv,
            129 => WcOpcode::RecvRdmaImm,
            _ => return None,
        })
    }
}

/// Status of a completion queue entry.
///
/// Discriminants are the libibverbs `ibv_wc_status` values. Any status other
/// than [`WcStatus::Success`] moves the queue pair into the error state, and
/// every request still outstanding on it completes with
/// [`WcStatus::WrFlushErr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[repr(u32)]
pub enum WcStatus {
    /// The request and every unsignaled request posted before it have ended;
    /// their buffers may be reused.
    #[error("success")]
    Success = 0,

    /// A posted message exceeds the port's maximum message size, or an
    /// incoming message does not fit into the receive request's buffers.
    #[error("local length error")]
    LocLenErr = 1,

    /// Internal queue pair consistency error while processing the request.
    #[error("local QP operation error")]
    LocQpOpErr = 2,

    /// Internal EE context consistency error (RD only).
    #[error("local EE context operation error")]
    LocEecOpErr = 3,

    /// A scatter/gather entry referenced memory that is not registered for the
    /// requested access or belongs to another protection domain.
    #[error("local protection error")]
    LocProtErr = 4,

    /// The request was flushed because the queue pair entered the error state.
    #[error("work request flushed")]
    WrFlushErr = 5,

    /// Memory window binding failed.
    #[error("memory window bind error")]
    MwBindErr = 6,

    /// The responder returned an unexpected transport opcode.
    #[error("bad response error")]
    BadRespErr = 7,

    /// A protection error on a local buffer targeted by an RDMA read or atomic response.
    #[error("local access error")]
    LocAccessErr = 8,

    /// The responder found the request invalid, e.g. the message did not fit
    /// into the posted receive.
    #[error("remote invalid request error")]
    RemInvReqErr = 9,

    /// The remote memory key or address was not valid for the operation.
    #[error("remote access error")]
    RemAccessErr = 10,

    /// The responder could not complete the operation.
    #[error("remote operation error")]
    RemOpErr = 11,

    /// The transport retry counter was exceeded without an acknowledgement:
    /// the peer is gone, unreachable, or not bound to this queue pair.
    #[error("transport retry counter exceeded")]
    RetryExcErr = 12,

    /// The receiver-not-ready retry counter was exceeded: the peer had no
    /// receive request posted.
    #[error("RNR retry counter exceeded")]
    RnrRetryExcErr = 13,

    /// RDD violation (RD only).
    #[error("local RDD violation error")]
    LocRddViolErr = 14,

    /// Invalid RD request (RD only).
    #[error("remote invalid RD request")]
    RemInvRdReqErr = 15,

    /// The operation was aborted by the responder.
    #[error("remote aborted error")]
    RemAbortErr = 16,

    /// Invalid EE context number (RD only).
    #[error("invalid EE context number")]
    InvEecnErr = 17,

    /// Invalid EE context state (RD only).
    #[error("invalid EE context state")]
    InvEecStateErr = 18,

    /// Fatal device error.
    #[error("fatal error")]
    FatalErr = 19,

    /// Response timeout.
    #[error("response timeout error")]
    RespTimeoutErr = 20,

    /// Any other error.
    #[error("general error")]
    GeneralErr = 21,
}

impl WcStatus {
    /// Decode a raw `ibv_wc_status` value.
    pub fn from_raw(raw: u32) -> Option<Self> {
        use WcStatus::*;
        const ALL: [WcStatus; 22] = [
            Success,
            LocLenErr,
            LocQpOpErr,
            LocEecOpErr,
            LocProtErr,
            WrFlushErr,
            MwBindErr,
            BadRespErr,
            LocAccessErr,
            RemInvReqErr,
            RemAccessErr,
            RemOpErr,
            RetryExcErr,
            RnrRetryExcErr,
            LocRddViolErr,
            RemInvRdReqErr,
            RemAbortErr,
            InvEecnErr,
            InvEecStateErr,
            FatalErr,
            RespTimeoutErr,
            GeneralErr,
        ];
        ALL.get(raw as usize).copied()
    }

    /// Whether this status reports success.
    #[inline]
    pub fn is_success(self) -> bool {
        self == WcStatus::Success
    }
}

/// Work completion entry, as polled from a completion queue.
///
/// On failure the hardware only guarantees `wr_id`, `status`, `qp_num` and
/// `vendor_err`; the accessors of every other field return `None` then.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Wc {
    wr_id: WrId,
    status: WcStatus,
    qp_num: Qpn,
    vendor_err: u32,
    opcode: Option<WcOpcode>,
    byte_len: u32,
}

impl Wc {
    /// Build a successful work completion.
    pub fn success(wr_id: WrId, qp_num: Qpn, opcode: Option<WcOpcode>, byte_len: u32) -> Self {
        Self {
            wr_id,
            status: WcStatus::Success,
            qp_num,
            vendor_err: 0,
            opcode,
            byte_len,
        }
    }

    /// Build a failed work completion. Fields that are undefined on failure
    /// are not recorded.
    pub fn failure(wr_id: WrId, status: WcStatus, qp_num: Qpn, vendor_err: u32) -> Self {
        Self {
            wr_id,
            status,
            qp_num,
            vendor_err,
            opcode: None,
            byte_len: 0,
        }
    }

    /// Get the work request ID.
    #[inline]
    pub fn wr_id(&self) -> WrId {
        self.wr_id
    }

    /// Get the completion status.
    #[inline]
    pub fn status(&self) -> WcStatus {
        self.status
    }

    /// Get the number of the queue pair the request was posted to.
    #[inline]
    pub fn qp_num(&self) -> Qpn {
        self.qp_num
    }

    /// Get the vendor-specific error syndrome. Zero on success.
    #[inline]
    pub fn vendor_err(&self) -> u32 {
        self.vendor_err
    }

    /// Get the completion status as a `Result`: the number of bytes on
    /// success, the failing status otherwise.
    #[inline]
    pub fn ok(&self) -> Result<usize, WcStatus> {
        match self.status {
            WcStatus::Success => Ok(self.byte_len as usize),
            status => Err(status),
        }
    }

    /// Get the opcode. `None` if the request failed.
    #[inline]
    pub fn opcode(&self) -> Option<WcOpcode> {
        self.status.is_success().then_some(self.opcode).flatten()
    }

    /// Get the number of bytes transferred. `None` if the request failed.
    #[inline]
    pub fn bytes(&self) -> Option<usize> {
        self.ok().ok()
    }
}

impl fmt::Debug for Wc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Wc");
        d.field("wr_id", &self.wr_id)
            .field("status", &self.status)
            .field("qp_num", &self.qp_num);
        if self.status.is_success() {
            d.field("opcode", &self.opcode).field("byte_len", &self.byte_len);
        } else {
            d.field("vendor_err", &format_args!("{:#x}", self.vendor_err));
        }
        d.finish()
    }
}
