//! Queue pair and its connection state machine.

mod attr;
mod builder;
mod state;

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard};

use thiserror::Error;

pub use self::attr::*;
pub use self::builder::QpBuilder;
pub use self::state::QpState;
use super::context::Context;
use super::cq::Cq;
use super::pd::Pd;
use super::type_alias::*;
use super::wr::Outstanding;
use crate::provider::{LinkLayer, QpHandle, RawQp};

/// Queue pair creation error type.
#[derive(Debug, Error)]
pub enum QpCreationError {
    /// `libibverbs` interfaces returned an error.
    #[error("I/O error from ibverbs")]
    IoError(#[from] io::Error),

    /// Specified capabilities are not supported by the device.
    /// The three fields are for the capability name, the maximum supported
    /// value, and the required value.
    #[error("capability not enough: {0} supports up to {1}, {2} required")]
    CapabilityNotEnough(String, u32, u32),

    /// The builder was not given a send or receive completion queue.
    #[error("{0} completion queue not set")]
    MissingCq(&'static str),
}

/// Queue pair state transition error type. Each variant names the violated
/// precondition; transitions are never retried.
#[derive(Debug, Error)]
pub enum TransitionError {
    /// The queue pair is not in the source state of the transition.
    #[error("QP must be in {expected} state, but is in {actual}")]
    InvalidState { expected: QpState, actual: QpState },

    /// An attribute exceeds what the device or the port supports.
    #[error("unsupported {what}: up to {max} supported, {requested} requested")]
    Unsupported {
        what: &'static str,
        max: u32,
        requested: u32,
    },

    /// RoCE ports only route packets carrying a global routing header.
    #[error("link layer is Ethernet, path must be globally routed")]
    GlobalRouteRequired,

    /// The device rejected the transition.
    #[error("I/O error from ibverbs")]
    Hardware(#[from] io::Error),
}

/// State of a queue pair shared with the completion side: the cached state and
/// the bookkeeping of outstanding work requests.
pub(crate) struct QpShared {
    qpn: Qpn,
    state: AtomicU32,
    /// Cleared on teardown. Readers hold it while dispatching a record.
    live: RwLock<bool>,
    pub(crate) sq: Mutex<VecDeque<Outstanding>>,
    pub(crate) rq: Mutex<VecDeque<Outstanding>>,
}

impl QpShared {
    pub(crate) fn new(qpn: Qpn) -> Self {
        Self {
            qpn,
            state: AtomicU32::new(QpState::Reset as u32),
            live: RwLock::new(true),
            sq: Mutex::new(VecDeque::new()),
            rq: Mutex::new(VecDeque::new()),
        }
    }

    #[inline]
    pub(crate) fn qpn(&self) -> Qpn {
        self.qpn
    }

    #[inline]
    pub(crate) fn cached_state(&self) -> QpState {
        QpState::from_raw(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_state(&self, state: QpState) {
        self.state.store(state as u32, Ordering::Release);
    }

    /// Keep the queue pair from being torn down while the guard lives.
    /// `None` once teardown has started.
    pub(crate) fn live(&self) -> Option<RwLockReadGuard<'_, bool>> {
        let guard = self.live.read().unwrap_or_else(PoisonError::into_inner);
        let live = *guard;
        live.then_some(guard)
    }

    /// Mark the queue pair torn down, waiting for records being dispatched.
    pub(crate) fn close(&self) {
        *self.live.write().unwrap_or_else(PoisonError::into_inner) = false;
    }

    pub(crate) fn lock_queue(queue: &Mutex<VecDeque<Outstanding>>) -> MutexGuard<'_, VecDeque<Outstanding>> {
        queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Reliable-connection queue pair.
///
/// A queue pair is created in the RESET state and driven through
/// `to_init`, `to_rtr` and `to_rts` by its owner; each transition needs
/// exclusive access. Work submission ([`Qp::post_send`], [`Qp::post_recv`])
/// only needs a shared reference, so the queue pair can be shared with
/// submitting threads once connected.
///
/// Dropping a queue pair destroys it. Outstanding work requests are dropped
/// with it, and completions of them polled afterwards are discarded.
pub struct Qp {
    pub(crate) pd: Pd,
    pub(crate) scq: Cq,
    pub(crate) rcq: Cq,
    pub(crate) raw: RawQp,
    pub(crate) caps: QpCaps,
    pub(crate) sq_sig_all: bool,
    pub(crate) shared: Arc<QpShared>,
    alive: bool,
}

impl std::fmt::Debug for Qp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Qp")
            .field("qpn", &self.raw.qpn)
            .field("state", &self.shared.cached_state())
            .field("caps", &self.caps)
            .finish()
    }
}

impl Qp {
    /// Create a new queue pair builder.
    pub fn builder<'a>() -> QpBuilder<'a> {
        QpBuilder::new()
    }

    /// Create a queue pair in the RESET state with one completion queue for
    /// both sends and receives.
    pub fn create(pd: &Pd, cq: &Cq, caps: QpCaps) -> Result<Qp, QpCreationError> {
        QpBuilder::new().cq(cq).caps(caps).build(pd)
    }

    /// Get the queue pair number.
    #[inline]
    pub fn qp_num(&self) -> Qpn {
        self.raw.qpn
    }

    /// Get the provider handle of this queue pair.
    #[inline]
    pub fn handle(&self) -> QpHandle {
        self.raw.handle
    }

    /// Get the capabilities of this queue pair.
    #[inline]
    pub fn caps(&self) -> &QpCaps {
        &self.caps
    }

    /// Get the underlying [`Pd`].
    #[inline]
    pub fn pd(&self) -> &Pd {
        &self.pd
    }

    /// Get the underlying [`Context`].
    #[inline]
    pub fn context(&self) -> &Context {
        self.pd.context()
    }

    /// Get the send completion queue.
    #[inline]
    pub fn scq(&self) -> &Cq {
        &self.scq
    }

    /// Get the receive completion queue.
    #[inline]
    pub fn rcq(&self) -> &Cq {
        &self.rcq
    }

    /// Whether every send request generates a completion.
    #[inline]
    pub fn sq_sig_all(&self) -> bool {
        self.sq_sig_all
    }

    /// Query the current state from the device. Available in every state;
    /// returns [`QpState::Unknown`] if the device cannot be queried.
    pub fn state(&self) -> QpState {
        match self.context().provider().query_qp_state(self.raw.handle) {
            Ok(state) => {
                self.shared.set_state(state);
                state
            }
            Err(e) => {
                log::warn!("cannot query state of QP {:#x}: {}", self.raw.qpn, e);
                QpState::Unknown
            }
        }
    }

    /// Get the last known state without querying the device. Updated by
    /// transitions, queries, and error completions seen by a reactor.
    #[inline]
    pub fn cached_state(&self) -> QpState {
        self.shared.cached_state()
    }

    fn expect_state(&self, expected: QpState) -> Result<(), TransitionError> {
        let actual = self.state();
        if actual != expected {
            return Err(TransitionError::InvalidState { expected, actual });
        }
        Ok(())
    }

    fn check_port(&self, port_num: PortNum) -> Result<(), TransitionError> {
        let max = self.context().attr().phys_port_cnt;
        if port_num == 0 || port_num > max {
            return Err(TransitionError::Unsupported {
                what: "port number",
                max: max as u32,
                requested: port_num as u32,
            });
        }
        Ok(())
    }

    fn check_limit(what: &'static str, max: u32, requested: u32) -> Result<(), TransitionError> {
        if requested > max {
            return Err(TransitionError::Unsupported { what, max, requested });
        }
        Ok(())
    }

    fn apply(&mut self, transition: QpTransition, from: QpState, to: QpState) -> Result<(), TransitionError> {
        self.context().provider().modify_qp(self.raw.handle, &transition)?;
        self.shared.set_state(to);
        log::debug!("QP {:#x}: {} -> {}", self.raw.qpn, from, to);
        Ok(())
    }

    /// RESET -> INIT. Binds the queue pair to a port and sets which remote
    /// operations are allowed against it.
    pub fn to_init(&mut self, attr: &InitAttr) -> Result<(), TransitionError> {
        self.expect_state(QpState::Reset)?;
        self.check_port(attr.port_num)?;
        self.apply(QpTransition::ToInit(*attr), QpState::Reset, QpState::Init)
    }

    /// INIT -> RTR. Commits to the peer queue pair and the path towards it.
    pub fn to_rtr(&mut self, attr: &RtrAttr) -> Result<(), TransitionError> {
        self.expect_state(QpState::Init)?;
        self.check_port(attr.av.port_num)?;

        let ctx = self.context();
        Self::check_limit("path MTU", ctx.active_mtu().bytes(), attr.path_mtu.bytes())?;
        Self::check_limit(
            "max_dest_rd_atomic",
            ctx.attr().max_qp_rd_atom as u32,
            attr.max_dest_rd_atomic as u32,
        )?;
        Self::check_limit("min_rnr_timer", 31, attr.min_rnr_timer as u32)?;
        if !attr.av.is_global && ctx.link_layer() == LinkLayer::Ethernet {
            return Err(TransitionError::GlobalRouteRequired);
        }

        self.apply(QpTransition::ToRtr(*attr), QpState::Init, QpState::Rtr)
    }

    /// RTR -> RTS. Enables sending.
    pub fn to_rts(&mut self, attr: &RtsAttr) -> Result<(), TransitionError> {
        self.expect_state(QpState::Rtr)?;
        Self::check_limit("timeout", 31, attr.timeout as u32)?;
        Self::check_limit("retry_cnt", 7, attr.retry_cnt as u32)?;
        Self::check_limit("rnr_retry", 7, attr.rnr_retry as u32)?;
        Self::check_limit(
            "max_rd_atomic",
            self.context().attr().max_qp_init_rd_atom as u32,
            attr.max_rd_atomic as u32,
        )?;
        self.apply(QpTransition::ToRts(*attr), QpState::Rtr, QpState::Rts)
    }

    /// Any state -> ERR. Every outstanding work request completes with
    /// [`WcStatus::WrFlushErr`](crate::WcStatus::WrFlushErr).
    pub fn to_error(&mut self) -> Result<(), TransitionError> {
        let from = self.state();
        self.apply(QpTransition::ToError, from, QpState::Error)
    }

    fn teardown(&mut self) -> io::Result<()> {
        if !self.alive {
            return Ok(());
        }
        self.alive = false;
        self.shared.close();
        self.scq.unregister(self.raw.qpn);
        self.rcq.unregister(self.raw.qpn);

        if let Err(e) = self.context().provider().destroy_qp(self.raw.handle) {
            // The device may still access buffers of outstanding requests.
            std::mem::forget(self.shared.clone());
            return Err(e);
        }
        log::debug!("destroyed QP {:#x}", self.raw.qpn);
        Ok(())
    }

    /// Destroy the queue pair. Outstanding work requests are dropped without
    /// completions.
    pub fn destroy(mut self) -> io::Result<()> {
        self.teardown()
    }
}

impl Drop for Qp {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            log::error!("cannot destroy QP {:#x} on drop: {}", self.raw.qpn, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::soft::{SoftDeviceConfig, SoftFabric};
    use crate::rdma::gid::Gid;

    fn setup(config: SoftDeviceConfig) -> (Pd, Cq) {
        let fabric = SoftFabric::new();
        let ctx = Context::new(fabric.open_device_with(config), 1, 1).unwrap();
        let pd = Pd::new(&ctx).unwrap();
        let cq = Cq::new(&ctx, Cq::DEFAULT_CQ_DEPTH).unwrap();
        (pd, cq)
    }

    fn self_rtr(qp: &Qp) -> RtrAttr {
        let ctx = qp.context();
        RtrAttr::new(qp.qp_num(), 0, AddressVector::to_peer(ctx.lid(), ctx.gid()))
    }

    #[test]
    fn create_in_reset() {
        let (pd, cq) = setup(Default::default());
        let qp = Qp::create(&pd, &cq, QpCaps::default()).unwrap();
        assert_eq!(qp.state(), QpState::Reset);
        assert_eq!(qp.caps().max_send_wr, 32);
        assert!(cq.lookup(qp.qp_num()).is_some());
    }

    #[test]
    fn builder_needs_cqs() {
        let (pd, cq) = setup(Default::default());
        let err = Qp::builder().send_cq(&cq).build(&pd).unwrap_err();
        assert!(matches!(err, QpCreationError::MissingCq("receive")));
        let err = Qp::create(&pd, &cq, QpCaps::symmetric(32, 31)).unwrap_err();
        assert!(matches!(err, QpCreationError::CapabilityNotEnough(ref name, 30, 31) if name == "max_send_sge"));
    }

    #[test]
    fn transitions_follow_the_state_machine() {
        let (pd, cq) = setup(Default::default());
        let mut qp = Qp::create(&pd, &cq, QpCaps::default()).unwrap();

        let rtr = self_rtr(&qp);
        let err = qp.to_rtr(&rtr).unwrap_err();
        assert!(matches!(
            err,
            TransitionError::InvalidState {
                expected: QpState::Init,
                actual: QpState::Reset
            }
        ));
        assert!(qp.to_rts(&RtsAttr::new(0)).is_err());

        qp.to_init(&InitAttr::default()).unwrap();
        assert!(qp.to_rts(&RtsAttr::new(0)).is_err());
        qp.to_rtr(&rtr).unwrap();
        qp.to_rts(&RtsAttr::new(0)).unwrap();
        assert_eq!(qp.state(), QpState::Rts);
        assert!(qp.to_init(&InitAttr::default()).is_err());
    }

    #[test]
    fn nothing_leaves_error() {
        let (pd, cq) = setup(Default::default());
        let mut qp = Qp::create(&pd, &cq, QpCaps::default()).unwrap();
        qp.to_init(&InitAttr::default()).unwrap();
        qp.to_error().unwrap();
        assert_eq!(qp.state(), QpState::Error);
        assert_eq!(qp.cached_state(), QpState::Error);

        let rtr = self_rtr(&qp);
        assert!(qp.to_init(&InitAttr::default()).is_err());
        assert!(qp.to_rtr(&rtr).is_err());
        assert!(qp.to_rts(&RtsAttr::new(0)).is_err());
    }

    #[test]
    fn unsupported_attributes() {
        let (pd, cq) = setup(SoftDeviceConfig {
            active_mtu: Mtu::Mtu1024,
            ..Default::default()
        });
        let mut qp = Qp::create(&pd, &cq, QpCaps::default()).unwrap();
        let bad_port = InitAttr {
            port_num: 2,
            ..Default::default()
        };
        assert!(matches!(
            qp.to_init(&bad_port),
            Err(TransitionError::Unsupported { what: "port number", .. })
        ));
        qp.to_init(&InitAttr::default()).unwrap();

        let rtr = self_rtr(&qp);
        assert!(matches!(
            qp.to_rtr(&rtr),
            Err(TransitionError::Unsupported {
                what: "path MTU",
                max: 1024,
                requested: 4096
            })
        ));
        let rtr = RtrAttr {
            path_mtu: Mtu::Mtu1024,
            ..rtr
        };
        qp.to_rtr(&rtr).unwrap();

        let rts = RtsAttr {
            rnr_retry: 8,
            ..RtsAttr::new(0)
        };
        assert!(matches!(
            qp.to_rts(&rts),
            Err(TransitionError::Unsupported { what: "rnr_retry", .. })
        ));
        assert_eq!(qp.state(), QpState::Rtr);
    }

    #[test]
    fn roce_needs_global_route() {
        let (pd, cq) = setup(SoftDeviceConfig::roce());
        let mut qp = Qp::create(&pd, &cq, QpCaps::default()).unwrap();
        qp.to_init(&InitAttr::default()).unwrap();
        let mut rtr = RtrAttr::new(qp.qp_num(), 0, AddressVector::to_peer(0, Gid::ZERO));
        rtr.av.is_global = false;
        assert!(matches!(qp.to_rtr(&rtr), Err(TransitionError::GlobalRouteRequired)));
    }

    #[test]
    fn destroy_unregisters() {
        let (pd, cq) = setup(Default::default());
        let qp = Qp::create(&pd, &cq, QpCaps::default()).unwrap();
        let qpn = qp.qp_num();
        qp.destroy().unwrap();
        assert!(cq.lookup(qpn).is_none());
    }

    #[test]
    fn looked_up_qp_goes_dead_on_destroy() {
        let (pd, cq) = setup(Default::default());
        let qp = Qp::create(&pd, &cq, QpCaps::default()).unwrap();
        let shared = cq.lookup(qp.qp_num()).unwrap();
        assert!(shared.live().is_some());
        qp.destroy().unwrap();
        assert!(shared.live().is_none());
    }
}
