//! Work request submission and retirement.

use std::collections::VecDeque;
use std::fmt;
use std::io;

use thiserror::Error;

use super::cq::{Wc, WcOpcode};
use super::mr::{MrPin, MrSlice, Sge};
use super::qp::{Qp, QpShared, QpState};
use super::type_alias::WrId;
use crate::provider::{RecvWr, SendWr};
use crate::utils::interop::is_queue_full;

/// Kind of a work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WrKind {
    Send,
    Recv,
}

impl fmt::Display for WrKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WrKind::Send => f.write_str("send"),
            WrKind::Recv => f.write_str("recv"),
        }
    }
}

/// Work request submission error type.
#[derive(Debug, Error)]
pub enum SubmissionError {
    /// The queue pair is not in a state accepting this kind of request.
    #[error("cannot post {kind} in QP state {state}")]
    InvalidState { kind: WrKind, state: QpState },

    /// The scatter/gather list is longer than the queue pair allows.
    #[error("too many SGEs: up to {max} supported, {got} given")]
    TooManySges { max: u32, got: usize },

    /// A scatter/gather entry is longer than its 32-bit length field holds.
    #[error("SGE too long: up to {max} bytes supported, {got} given")]
    SgeTooLong { max: usize, got: usize },

    /// The work queue is full. Retry after draining completions.
    #[error("{kind} queue full ({depth} outstanding)")]
    QueueFull { kind: WrKind, depth: u32 },

    /// The device rejected the request.
    #[error("I/O error from ibverbs")]
    Hardware(#[source] io::Error),
}

impl SubmissionError {
    /// Whether this error only signals back-pressure, so that the same request
    /// may be submitted again later.
    #[inline]
    pub fn is_back_pressure(&self) -> bool {
        matches!(self, SubmissionError::QueueFull { .. })
    }
}

/// An accepted work request that has not been retired yet. Holds the memory
/// regions it references.
pub(crate) struct Outstanding {
    wr_id: WrId,
    signaled: bool,
    _pins: Vec<MrPin>,
}

impl fmt::Debug for Outstanding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Outstanding")
            .field("wr_id", &self.wr_id)
            .field("signaled", &self.signaled)
            .finish()
    }
}

/// Longest scatter/gather entry a work request can carry.
pub const MAX_SGE_LEN: usize = u32::MAX as usize;

fn check_sge_lens(lens: impl IntoIterator<Item = usize>) -> Result<(), SubmissionError> {
    match lens.into_iter().find(|&len| len > MAX_SGE_LEN) {
        Some(got) => Err(SubmissionError::SgeTooLong { max: MAX_SGE_LEN, got }),
        None => Ok(()),
    }
}

fn build_sgl(local: &[MrSlice<'_>]) -> (Vec<Sge>, Vec<MrPin>) {
    local.iter().map(|s| (s.sge(), s.pin())).unzip()
}

impl Qp {
    fn check_sgl(&self, kind: WrKind, local: &[MrSlice<'_>]) -> Result<(), SubmissionError> {
        let max = match kind {
            WrKind::Send => self.caps.max_send_sge,
            WrKind::Recv => self.caps.max_recv_sge,
        };
        if local.len() > max as usize {
            return Err(SubmissionError::TooManySges { max, got: local.len() });
        }
        check_sge_lens(local.iter().map(|s| s.len()))
    }

    fn map_post_err(kind: WrKind, depth: u32, e: io::Error) -> SubmissionError {
        if is_queue_full(&e) {
            SubmissionError::QueueFull { kind, depth }
        } else {
            SubmissionError::Hardware(e)
        }
    }

    /// Post a receive request targeting the given local memory areas.
    ///
    /// Allowed from RTR on. The regions stay pinned until the completion of
    /// this request is retired by a [`Reactor`](crate::Reactor), or until the
    /// queue pair is destroyed.
    pub fn post_recv(&self, wr_id: WrId, local: &[MrSlice<'_>]) -> Result<(), SubmissionError> {
        let state = self.shared.cached_state();
        if !state.accepts_recv() {
            return Err(SubmissionError::InvalidState {
                kind: WrKind::Recv,
                state,
            });
        }
        self.check_sgl(WrKind::Recv, local)?;

        let depth = self.caps.max_recv_wr;
        let mut rq = QpShared::lock_queue(&self.shared.rq);
        if rq.len() >= depth as usize {
            return Err(SubmissionError::QueueFull {
                kind: WrKind::Recv,
                depth,
            });
        }

        let (sgl, pins) = build_sgl(local);
        self.context()
            .provider()
            .post_recv(self.raw.handle, &RecvWr { wr_id, sgl: &sgl })
            .map_err(|e| Self::map_post_err(WrKind::Recv, depth, e))?;
        rq.push_back(Outstanding {
            wr_id,
            signaled: true,
            _pins: pins,
        });
        Ok(())
    }

    /// Post a send request gathering the given local memory areas.
    ///
    /// Allowed in RTS only. An unsignaled send never produces a completion of
    /// its own; it is retired along with the next signaled send that
    /// completes, and counts towards the send queue depth until then.
    pub fn post_send(&self, wr_id: WrId, local: &[MrSlice<'_>], signaled: bool) -> Result<(), SubmissionError> {
        let state = self.shared.cached_state();
        if !state.accepts_send() {
            return Err(SubmissionError::InvalidState {
                kind: WrKind::Send,
                state,
            });
        }
        self.check_sgl(WrKind::Send, local)?;

        let depth = self.caps.max_send_wr;
        let signaled = signaled || self.sq_sig_all;
        let mut sq = QpShared::lock_queue(&self.shared.sq);
        if sq.len() >= depth as usize {
            return Err(SubmissionError::QueueFull {
                kind: WrKind::Send,
                depth,
            });
        }

        let (sgl, pins) = build_sgl(local);
        self.context()
            .provider()
            .post_send(
                self.raw.handle,
                &SendWr {
                    wr_id,
                    sgl: &sgl,
                    signaled,
                },
            )
            .map_err(|e| Self::map_post_err(WrKind::Send, depth, e))?;
        sq.push_back(Outstanding {
            wr_id,
            signaled,
            _pins: pins,
        });
        Ok(())
    }

    /// Get the number of outstanding send and receive requests.
    pub fn outstanding(&self) -> (usize, usize) {
        let sq = QpShared::lock_queue(&self.shared.sq).len();
        let rq = QpShared::lock_queue(&self.shared.rq).len();
        (sq, rq)
    }
}

/// Remove the requests up to and including the first signaled one carrying
/// `wr_id`. Earlier unsignaled requests completed implicitly.
fn retire_send(sq: &mut VecDeque<Outstanding>, wr_id: WrId) -> bool {
    match sq.iter().position(|o| o.signaled && o.wr_id == wr_id) {
        Some(pos) => {
            sq.drain(..=pos);
            true
        }
        None => false,
    }
}

impl QpShared {
    /// Retire the work request a completion refers to, releasing its memory
    /// regions. Return the kind of the retired request, or `None` if no
    /// outstanding request matches.
    ///
    /// A failed completion does not say which queue it came from. Receives
    /// complete in order, so the head of the receive queue is tried first.
    /// Any failure moves the cached state to ERR.
    pub(crate) fn retire(&self, wc: &Wc) -> Option<WrKind> {
        match (wc.status().is_success(), wc.opcode()) {
            (true, Some(WcOpcode::Recv | WcOpcode::RecvRdmaImm)) => {
                let mut rq = Self::lock_queue(&self.rq);
                let pos = rq.iter().position(|o| o.wr_id == wc.wr_id())?;
                rq.remove(pos);
                Some(WrKind::Recv)
            }
            (true, _) => {
                let mut sq = Self::lock_queue(&self.sq);
                retire_send(&mut sq, wc.wr_id()).then_some(WrKind::Send)
            }
            (false, _) => {
                self.set_state(QpState::Error);
                let mut rq = Self::lock_queue(&self.rq);
                if rq.front().is_some_and(|o| o.wr_id == wc.wr_id()) {
                    rq.pop_front();
                    return Some(WrKind::Recv);
                }
                if retire_send(&mut Self::lock_queue(&self.sq), wc.wr_id()) {
                    return Some(WrKind::Send);
                }
                let pos = rq.iter().position(|o| o.wr_id == wc.wr_id())?;
                rq.remove(pos);
                Some(WrKind::Recv)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::soft::SoftFabric;
    use crate::rdma::cq::{Cq, WcStatus};
    use crate::rdma::mr::{Mr, Permission};
    use crate::rdma::pd::Pd;
    use crate::rdma::qp::{AddressVector, InitAttr, QpCaps, RtrAttr, RtsAttr};
    use crate::Context;

    fn loopback(caps: QpCaps) -> (Pd, Cq, Qp) {
        let fabric = SoftFabric::new();
        let ctx = Context::new(fabric.open_device(), 1, 1).unwrap();
        let pd = Pd::new(&ctx).unwrap();
        let cq = Cq::new(&ctx, Cq::DEFAULT_CQ_DEPTH).unwrap();
        let qp = Qp::create(&pd, &cq, caps).unwrap();
        (pd, cq, qp)
    }

    fn connect_to_self(qp: &mut Qp) {
        let av = AddressVector::to_peer(qp.context().lid(), qp.context().gid());
        qp.to_init(&InitAttr::default()).unwrap();
        qp.to_rtr(&RtrAttr::new(qp.qp_num(), 0, av)).unwrap();
        qp.to_rts(&RtsAttr::new(0)).unwrap();
    }

    #[test]
    fn state_gates_submission() {
        let (pd, _cq, mut qp) = loopback(QpCaps::default());
        let mr = Mr::alloc(&pd, 64, Permission::default()).unwrap();

        let err = qp.post_recv(1, &[mr.as_slice()]).unwrap_err();
        assert!(matches!(
            err,
            SubmissionError::InvalidState {
                kind: WrKind::Recv,
                state: QpState::Reset
            }
        ));
        qp.to_init(&InitAttr::default()).unwrap();
        assert!(qp.post_recv(1, &[mr.as_slice()]).is_err());

        let av = AddressVector::to_peer(qp.context().lid(), qp.context().gid());
        qp.to_rtr(&RtrAttr::new(qp.qp_num(), 0, av)).unwrap();
        qp.post_recv(1, &[mr.as_slice()]).unwrap();
        assert!(matches!(
            qp.post_send(2, &[mr.as_slice()], true),
            Err(SubmissionError::InvalidState { kind: WrKind::Send, .. })
        ));
        assert_eq!(mr.pins(), 1);
    }

    #[test]
    fn sge_limit() {
        let (pd, _cq, mut qp) = loopback(QpCaps::symmetric(8, 2));
        connect_to_self(&mut qp);
        let mr = Mr::alloc(&pd, 64, Permission::default()).unwrap();
        let sgl = [mr.slice(0, 8).unwrap(), mr.slice(8, 8).unwrap(), mr.slice(16, 8).unwrap()];
        assert!(matches!(
            qp.post_recv(1, &sgl),
            Err(SubmissionError::TooManySges { max: 2, got: 3 })
        ));
        qp.post_recv(1, &sgl[..2]).unwrap();
        assert_eq!(qp.outstanding(), (0, 1));
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn sge_longer_than_32_bits_is_rejected() {
        assert!(check_sge_lens([8, MAX_SGE_LEN]).is_ok());
        assert!(matches!(
            check_sge_lens([8, (1 << 32) + 8]),
            Err(SubmissionError::SgeTooLong { got, .. }) if got == (1 << 32) + 8
        ));
    }

    #[test]
    fn full_queue_is_back_pressure() {
        let (pd, _cq, mut qp) = loopback(QpCaps::symmetric(4, 1));
        connect_to_self(&mut qp);
        let mr = Mr::alloc(&pd, 64, Permission::default()).unwrap();
        for i in 0..4 {
            qp.post_recv(i, &[mr.as_slice()]).unwrap();
        }
        let err = qp.post_recv(4, &[mr.as_slice()]).unwrap_err();
        assert!(err.is_back_pressure());
        assert_eq!(qp.outstanding(), (0, 4));
        assert_eq!(mr.pins(), 4);
    }

    #[test]
    fn retire_send_drains_unsignaled_prefix() {
        let (pd, cq, mut qp) = loopback(QpCaps::default());
        connect_to_self(&mut qp);
        let mr = Mr::alloc(&pd, 64, Permission::default()).unwrap();
        for i in 0..3 {
            qp.post_recv(100 + i, &[mr.as_slice()]).unwrap();
        }
        qp.post_send(1, &[mr.slice(0, 8).unwrap()], false).unwrap();
        qp.post_send(2, &[mr.slice(0, 8).unwrap()], false).unwrap();
        qp.post_send(3, &[mr.slice(0, 8).unwrap()], true).unwrap();
        assert_eq!(qp.outstanding(), (3, 0));

        let mut wcs = Vec::new();
        cq.poll_into(&mut wcs, 16).unwrap();
        let kinds: Vec<_> = wcs.iter().filter_map(|wc| qp.shared.retire(wc)).collect();
        assert_eq!(kinds.iter().filter(|k| **k == WrKind::Recv).count(), 3);
        assert_eq!(kinds.iter().filter(|k| **k == WrKind::Send).count(), 1);
        assert_eq!(qp.outstanding(), (0, 0));
        assert_eq!(mr.pins(), 0);
    }

    #[test]
    fn failed_completion_moves_to_error() {
        let (pd, _cq, mut qp) = loopback(QpCaps::default());
        connect_to_self(&mut qp);
        let mr = Mr::alloc(&pd, 64, Permission::default()).unwrap();
        qp.post_recv(7, &[mr.as_slice()]).unwrap();
        qp.post_recv(8, &[mr.as_slice()]).unwrap();

        let wc = Wc::failure(8, WcStatus::WrFlushErr, qp.qp_num(), 0xf9);
        assert_eq!(qp.shared.retire(&wc), Some(WrKind::Recv));
        assert_eq!(qp.cached_state(), QpState::Error);
        assert_eq!(qp.outstanding(), (0, 1));

        let unknown = Wc::failure(42, WcStatus::WrFlushErr, qp.qp_num(), 0xf9);
        assert_eq!(qp.shared.retire(&unknown), None);
    }
}
