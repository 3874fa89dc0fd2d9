use std::sync::Arc;

use super::{Qp, QpCaps, QpCreationError, QpShared};
use crate::provider::QpInitAttr;
use crate::rdma::context::Context;
use crate::rdma::cq::Cq;
use crate::rdma::pd::Pd;

/// Queue pair builder.
#[derive(Clone)]
pub struct QpBuilder<'a> {
    /// Send completion queue for this QP.
    send_cq: Option<&'a Cq>,

    /// Receive completion queue for this QP. Can be the same to send CQ.
    recv_cq: Option<&'a Cq>,

    /// Capabilities of this QP.
    caps: QpCaps,

    /// Whether to signal for all send work requests.
    sq_sig_all: bool,
}

impl Default for QpBuilder<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> QpBuilder<'a> {
    /// Create a new queue pair builder with default capabilities.
    pub fn new() -> Self {
        Self {
            send_cq: None,
            recv_cq: None,
            caps: QpCaps::default(),
            sq_sig_all: false,
        }
    }

    /// Set the send completion queue for this QP.
    pub fn send_cq(mut self, send_cq: &'a Cq) -> Self {
        self.send_cq = Some(send_cq);
        self
    }

    /// Set the receive completion queue for this QP.
    pub fn recv_cq(mut self, recv_cq: &'a Cq) -> Self {
        self.recv_cq = Some(recv_cq);
        self
    }

    /// Use one completion queue for both sends and receives.
    pub fn cq(self, cq: &'a Cq) -> Self {
        self.send_cq(cq).recv_cq(cq)
    }

    /// Set the capabilities of this QP.
    pub fn caps(mut self, caps: QpCaps) -> Self {
        self.caps = caps;
        self
    }

    /// Set whether to signal for all send work requests.
    pub fn sq_sig_all(mut self, sq_sig_all: bool) -> Self {
        self.sq_sig_all = sq_sig_all;
        self
    }

    fn check_caps(ctx: &Context, caps: &QpCaps) -> Result<(), QpCreationError> {
        let attr = ctx.attr();
        let checks = [
            ("max_send_wr", attr.max_qp_wr, caps.max_send_wr),
            ("max_recv_wr", attr.max_qp_wr, caps.max_recv_wr),
            ("max_send_sge", attr.max_sge, caps.max_send_sge),
            ("max_recv_sge", attr.max_sge, caps.max_recv_sge),
        ];
        for (name, max, requested) in checks {
            if requested > max {
                return Err(QpCreationError::CapabilityNotEnough(name.to_string(), max, requested));
            }
        }
        Ok(())
    }

    /// Create the queue pair in the RESET state.
    pub fn build(self, pd: &Pd) -> Result<Qp, QpCreationError> {
        let send_cq = self.send_cq.ok_or(QpCreationError::MissingCq("send"))?;
        let recv_cq = self.recv_cq.ok_or(QpCreationError::MissingCq("receive"))?;
        Self::check_caps(pd.context(), &self.caps)?;

        let raw = pd.context().provider().create_qp(
            pd.handle(),
            &QpInitAttr {
                send_cq: send_cq.handle(),
                recv_cq: recv_cq.handle(),
                caps: self.caps,
                sq_sig_all: self.sq_sig_all,
            },
        )?;

        let shared = Arc::new(QpShared::new(raw.qpn));
        send_cq.register(&shared);
        if !recv_cq.same_as(send_cq) {
            recv_cq.register(&shared);
        }
        log::debug!("created QP {:#x} with {:?}", raw.qpn, self.caps);

        Ok(Qp {
            pd: pd.clone(),
            scq: send_cq.clone(),
            rcq: recv_cq.clone(),
            raw,
            caps: self.caps,
            sq_sig_all: self.sq_sig_all,
            shared,
            alive: true,
        })
    }
}
