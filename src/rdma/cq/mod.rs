//! Completion queue and Work completion.

mod wc;

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use thiserror::Error;

pub use self::wc::*;
use super::context::Context;
use super::qp::QpShared;
use super::type_alias::Qpn;
use crate::provider::CqHandle;

/// Completion queue creation error type.
#[derive(Debug, Error)]
pub enum CqCreationError {
    /// Requested more CQ entries than the device supports.
    #[error("too many CQEs (maximum {0}, requested {1})")]
    TooManyCqes(u32, u32),

    /// `ibv_create_cq` call failed.
    #[error("I/O error from ibverbs")]
    IoError(#[from] io::Error),
}

/// Ownership holder of completion queue.
struct CqInner {
    ctx: Context,
    handle: CqHandle,
    capacity: u32,

    /// Queue pairs whose completions may show up here. Entries vanish when the
    /// queue pair is destroyed.
    qps: Mutex<HashMap<Qpn, Weak<QpShared>>>,

    /// Set while a reactor owns the consumer side.
    polled: AtomicBool,
}

impl Drop for CqInner {
    fn drop(&mut self) {
        if let Err(e) = self.ctx.provider().destroy_cq(self.handle) {
            log::error!("cannot destroy CQ on drop: {}", e);
        }
    }
}

/// Completion queue.
///
/// Cloning yields another reference to the same completion queue. Queue pairs
/// keep their completion queues alive.
#[derive(Clone)]
pub struct Cq {
    inner: Arc<CqInner>,
}

impl std::fmt::Debug for Cq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cq")
            .field("handle", &self.inner.handle)
            .field("capacity", &self.inner.capacity)
            .finish()
    }
}

impl Cq {
    /// The default CQ depth.
    pub const DEFAULT_CQ_DEPTH: u32 = 128;

    /// Create a new completion queue.
    pub fn new(ctx: &Context, capacity: u32) -> Result<Cq, CqCreationError> {
        let max_capacity = ctx.attr().max_cqe;
        if capacity > max_capacity {
            return Err(CqCreationError::TooManyCqes(max_capacity, capacity));
        }

        let handle = ctx.provider().create_cq(capacity)?;
        Ok(Self {
            inner: Arc::new(CqInner {
                ctx: ctx.clone(),
                handle,
                capacity,
                qps: Mutex::new(HashMap::new()),
                polled: AtomicBool::new(false),
            }),
        })
    }

    /// Get the provider handle of this completion queue.
    #[inline]
    pub fn handle(&self) -> CqHandle {
        self.inner.handle
    }

    /// Get the underlying [`Context`].
    #[inline]
    pub fn context(&self) -> &Context {
        &self.inner.ctx
    }

    /// Get the capacity of the completion queue.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.inner.capacity
    }

    /// Non-blockingly poll at most `max` work completions into `buf`. Return
    /// the number of work completions polled.
    ///
    /// It is the caller's responsibility to check the status codes of the
    /// returned work completion entries.
    pub(crate) fn poll_into(&self, buf: &mut Vec<Wc>, max: usize) -> io::Result<usize> {
        self.inner.ctx.provider().poll_cq(self.inner.handle, buf, max)
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<Qpn, Weak<QpShared>>> {
        self.inner.qps.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register(&self, qp: &Arc<QpShared>) {
        self.registry().insert(qp.qpn(), Arc::downgrade(qp));
    }

    pub(crate) fn unregister(&self, qpn: Qpn) {
        self.registry().remove(&qpn);
    }

    /// Look up a live queue pair attached to this completion queue.
    pub(crate) fn lookup(&self, qpn: Qpn) -> Option<Arc<QpShared>> {
        self.registry().get(&qpn).and_then(Weak::upgrade)
    }

    /// Claim the consumer side. Return `false` if already claimed.
    pub(crate) fn claim(&self) -> bool {
        self.inner
            .polled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn release(&self) {
        self.inner.polled.store(false, Ordering::Release);
    }

    /// Whether two handles refer to the same completion queue.
    #[inline]
    pub fn same_as(&self, other: &Cq) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
