//! Completion reactor: drains a completion queue and reports the outcome of
//! every work request.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use std::{hint, io, thread};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::cq::{Cq, Wc, WcStatus};
use super::qp::QpShared;
use super::type_alias::*;
use super::wr::WrKind;

/// Outcome of one work request.
///
/// On failure only [`wr_id`](Self::wr_id), [`status`](Self::status),
/// [`qpn`](Self::qpn) and [`vendor_err`](Self::vendor_err) come from the
/// device. [`kind`](Self::kind) is always valid since it is known from
/// submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionRecord {
    wr_id: WrId,
    status: WcStatus,
    kind: WrKind,
    qpn: Qpn,
    vendor_err: u32,
    byte_len: Option<usize>,
}

impl CompletionRecord {
    fn new(wc: &Wc, kind: WrKind) -> Self {
        Self {
            wr_id: wc.wr_id(),
            status: wc.status(),
            kind,
            qpn: wc.qp_num(),
            vendor_err: wc.vendor_err(),
            byte_len: match kind {
                WrKind::Recv => wc.bytes(),
                WrKind::Send => None,
            },
        }
    }

    /// Get the caller-supplied work request ID.
    #[inline]
    pub fn wr_id(&self) -> WrId {
        self.wr_id
    }

    #[inline]
    pub fn status(&self) -> WcStatus {
        self.status
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Get the kind of the completed work request.
    #[inline]
    pub fn kind(&self) -> WrKind {
        self.kind
    }

    /// Get the number of the queue pair the request was posted to.
    #[inline]
    pub fn qpn(&self) -> Qpn {
        self.qpn
    }

    /// Get the vendor error syndrome. Meaningful on failure only.
    #[inline]
    pub fn vendor_err(&self) -> u32 {
        self.vendor_err
    }

    /// Get the number of bytes received. `None` unless this is a successful
    /// receive.
    #[inline]
    pub fn byte_len(&self) -> Option<usize> {
        self.byte_len
    }
}

/// Reactor tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReactorConfig {
    /// Maximum completions taken per poll.
    pub max_batch: usize,
    /// Consecutive empty polls spent spinning before yielding the thread.
    pub spin_before_yield: u32,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            max_batch: 16,
            spin_before_yield: 64,
        }
    }
}

/// Completion polling error type.
#[derive(Debug, Error)]
pub enum PollError {
    /// Another reactor already polls this completion queue.
    #[error("completion queue is already polled by another reactor")]
    AlreadyPolled,

    /// `max_batch` is zero, so the reactor would never take a completion.
    #[error("reactor batch size must be positive")]
    ZeroBatch,

    /// The completion queue is unusable, e.g. it overran.
    #[error("fatal completion queue error")]
    Fatal(#[from] io::Error),
}

/// Cooperative stop signal for a running reactor. Cloning yields another
/// handle to the same signal.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the reactor to return after its current poll.
    #[inline]
    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// The single consumer of a completion queue.
///
/// Each work completion is matched with the outstanding request it retires,
/// which releases the memory regions of that request, and turned into a
/// [`CompletionRecord`]. Completions of destroyed queue pairs are discarded.
/// An error completion marks its queue pair as ERR in the cached state.
///
/// The handler runs while the queue pair of the record is kept from being
/// destroyed; it must not destroy that queue pair itself.
pub struct Reactor {
    cq: Cq,
    cfg: ReactorConfig,
    buf: Vec<Wc>,
    idle: u32,
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("cq", &self.cq)
            .field("cfg", &self.cfg)
            .finish()
    }
}

impl Reactor {
    /// Create a reactor polling the given completion queue.
    pub fn new(cq: &Cq, cfg: ReactorConfig) -> Result<Self, PollError> {
        if cfg.max_batch == 0 {
            return Err(PollError::ZeroBatch);
        }
        if !cq.claim() {
            return Err(PollError::AlreadyPolled);
        }
        log::info!("reactor started on {:?}", cq);
        Ok(Self {
            cq: cq.clone(),
            cfg,
            buf: Vec::with_capacity(cfg.max_batch.min(cq.capacity() as usize)),
            idle: 0,
        })
    }

    /// Get the polled completion queue.
    #[inline]
    pub fn cq(&self) -> &Cq {
        &self.cq
    }

    #[inline]
    pub fn config(&self) -> &ReactorConfig {
        &self.cfg
    }

    /// Clamp a caller-supplied batch size to what the queue can hold.
    #[inline]
    fn clamp_batch(&self, max_batch: usize) -> usize {
        max_batch.min(self.cq.capacity() as usize)
    }

    fn classify(&self, wc: &Wc) -> Option<(Arc<QpShared>, CompletionRecord)> {
        let Some(qp) = self.cq.lookup(wc.qp_num()) else {
            log::debug!(
                "discarding completion of wr_id {} on destroyed QP {:#x}",
                wc.wr_id(),
                wc.qp_num()
            );
            return None;
        };
        let Some(kind) = qp.retire(wc) else {
            log::warn!(
                "no outstanding request of wr_id {} on QP {:#x}, skipping {:?}",
                wc.wr_id(),
                wc.qp_num(),
                wc
            );
            return None;
        };
        if !wc.status().is_success() {
            log::warn!(
                "{} wr_id {} on QP {:#x} failed: {} (vendor error {:#x})",
                kind,
                wc.wr_id(),
                wc.qp_num(),
                wc.status(),
                wc.vendor_err()
            );
        }
        Some((qp, CompletionRecord::new(wc, kind)))
    }

    /// Poll at most `max_batch` completions and hand the records to `handler`.
    /// Return the number of completions taken from the queue, which may exceed
    /// the number of records when some are discarded.
    fn dispatch(&mut self, max_batch: usize, handler: &mut impl FnMut(CompletionRecord)) -> Result<usize, PollError> {
        let max_batch = self.clamp_batch(max_batch);
        self.buf.clear();
        let n = self.cq.poll_into(&mut self.buf, max_batch).map_err(|e| {
            log::error!("polling {:?} failed: {}", self.cq, e);
            PollError::Fatal(e)
        })?;

        let wcs = std::mem::take(&mut self.buf);
        for wc in &wcs {
            let Some((qp, record)) = self.classify(wc) else {
                continue;
            };
            match qp.live() {
                Some(_live) => handler(record),
                None => log::debug!(
                    "discarding completion of wr_id {} on QP {:#x} torn down meanwhile",
                    record.wr_id(),
                    record.qpn()
                ),
            };
        }
        self.buf = wcs;
        Ok(n)
    }

    /// Non-blockingly poll at most `max_batch` completions.
    pub fn poll(&mut self, max_batch: usize) -> Result<Vec<CompletionRecord>, PollError> {
        let mut records = Vec::with_capacity(self.clamp_batch(max_batch));
        self.dispatch(max_batch, &mut |r| records.push(r))?;
        Ok(records)
    }

    fn backoff(&mut self, polled: usize) {
        if polled > 0 {
            self.idle = 0;
        } else if self.idle < self.cfg.spin_before_yield {
            self.idle += 1;
            hint::spin_loop();
        } else {
            thread::yield_now();
        }
    }

    /// Poll until `stop` is signaled, handing every record to `handler`.
    /// The stop signal is checked between polls.
    pub fn run(&mut self, stop: &StopSignal, mut handler: impl FnMut(CompletionRecord)) -> Result<(), PollError> {
        while !stop.is_stopped() {
            let n = self.dispatch(self.cfg.max_batch, &mut handler)?;
            self.backoff(n);
        }
        Ok(())
    }

    /// Same as [`run`](Self::run), but suspends the task instead of spinning
    /// when no completion is available.
    pub async fn run_async(
        &mut self,
        stop: &StopSignal,
        mut handler: impl FnMut(CompletionRecord),
    ) -> Result<(), PollError> {
        while !stop.is_stopped() {
            if self.dispatch(self.cfg.max_batch, &mut handler)? == 0 {
                tokio::task::yield_now().await;
            }
        }
        Ok(())
    }

    /// Poll until `n` records are collected or `timeout` expires. Return the
    /// records collected so far in either case.
    pub fn collect(&mut self, n: usize, timeout: Duration) -> Result<Vec<CompletionRecord>, PollError> {
        let deadline = quanta::Instant::now() + timeout;
        let mut records = Vec::with_capacity(self.clamp_batch(n));
        while records.len() < n && quanta::Instant::now() < deadline {
            let max = self.cfg.max_batch.min(n - records.len());
            let polled = self.dispatch(max, &mut |r| records.push(r))?;
            self.backoff(polled);
        }
        Ok(records)
    }

    /// Run the reactor in a dedicated thread.
    pub fn spawn<F>(mut self, mut handler: F) -> ReactorHandle
    where
        F: FnMut(CompletionRecord) + Send + 'static,
    {
        let stop = StopSignal::new();
        let signal = stop.clone();
        let thread = thread::spawn(move || {
            self.run(&signal, &mut handler)?;
            Ok(self)
        });
        ReactorHandle { stop, thread }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.cq.release();
        log::info!("reactor stopped on {:?}", self.cq);
    }
}

/// Handle of a reactor running in its own thread.
#[derive(Debug)]
pub struct ReactorHandle {
    stop: StopSignal,
    thread: thread::JoinHandle<Result<Reactor, PollError>>,
}

impl ReactorHandle {
    /// Get the stop signal of the reactor.
    #[inline]
    pub fn signal(&self) -> &StopSignal {
        &self.stop
    }

    /// Ask the reactor to stop.
    #[inline]
    pub fn stop(&self) {
        self.stop.stop();
    }

    /// Wait for the reactor thread to return and get the reactor back.
    /// Panics of the handler are propagated.
    pub fn join(self) -> Result<Reactor, PollError> {
        match self.thread.join() {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    /// Stop the reactor and wait for it.
    pub fn stop_and_join(self) -> Result<Reactor, PollError> {
        self.stop();
        self.join()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::soft::SoftFabric;
    use crate::rdma::mr::{Mr, Permission};
    use crate::rdma::pd::Pd;
    use crate::rdma::qp::{AddressVector, InitAttr, Qp, QpCaps, RtrAttr, RtsAttr};
    use crate::Context;

    fn loopback() -> (Pd, Cq, Qp) {
        let fabric = SoftFabric::new();
        let ctx = Context::new(fabric.open_device(), 1, 1).unwrap();
        let pd = Pd::new(&ctx).unwrap();
        let cq = Cq::new(&ctx, Cq::DEFAULT_CQ_DEPTH).unwrap();
        let mut qp = Qp::create(&pd, &cq, QpCaps::default()).unwrap();
        let av = AddressVector::to_peer(ctx.lid(), ctx.gid());
        qp.to_init(&InitAttr::default()).unwrap();
        qp.to_rtr(&RtrAttr::new(qp.qp_num(), 0, av)).unwrap();
        qp.to_rts(&RtsAttr::new(0)).unwrap();
        (pd, cq, qp)
    }

    #[test]
    fn exclusive_consumer() {
        let (_pd, cq, _qp) = loopback();
        let reactor = Reactor::new(&cq, ReactorConfig::default()).unwrap();
        assert!(matches!(
            Reactor::new(&cq, ReactorConfig::default()),
            Err(PollError::AlreadyPolled)
        ));
        drop(reactor);
        assert!(Reactor::new(&cq, ReactorConfig::default()).is_ok());
    }

    #[test]
    fn empty_poll_is_not_an_error() {
        let (_pd, cq, _qp) = loopback();
        let mut reactor = Reactor::new(&cq, ReactorConfig::default()).unwrap();
        assert!(reactor.poll(16).unwrap().is_empty());
    }

    #[test]
    fn records_carry_kind_and_length() {
        let (pd, cq, qp) = loopback();
        let src = Mr::reg(&pd, b"ping".to_vec(), Permission::default()).unwrap();
        let dst = Mr::alloc(&pd, 64, Permission::default()).unwrap();
        qp.post_recv(1, &[dst.as_slice()]).unwrap();
        qp.post_send(2, &[src.as_slice()], true).unwrap();

        let mut reactor = Reactor::new(&cq, ReactorConfig::default()).unwrap();
        let records = reactor.collect(2, Duration::from_secs(1)).unwrap();
        assert_eq!(records.len(), 2);

        let recv = records.iter().find(|r| r.wr_id() == 1).unwrap();
        assert!(recv.is_success());
        assert_eq!(recv.kind(), WrKind::Recv);
        assert_eq!(recv.byte_len(), Some(4));
        assert_eq!(recv.qpn(), qp.qp_num());

        let send = records.iter().find(|r| r.wr_id() == 2).unwrap();
        assert!(send.is_success());
        assert_eq!(send.kind(), WrKind::Send);
        assert_eq!(send.byte_len(), None);
        assert_eq!((src.pins(), dst.pins()), (0, 0));
    }

    #[test]
    fn flushed_requests_are_reported_once() {
        let (pd, cq, mut qp) = loopback();
        let dst = Mr::alloc(&pd, 64, Permission::default()).unwrap();
        for i in 0..3 {
            qp.post_recv(i, &[dst.as_slice()]).unwrap();
        }
        qp.to_error().unwrap();

        let mut reactor = Reactor::new(&cq, ReactorConfig::default()).unwrap();
        let records = reactor.collect(3, Duration::from_secs(1)).unwrap();
        let mut ids: Vec<_> = records.iter().map(|r| r.wr_id()).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 2]);
        assert!(records
            .iter()
            .all(|r| r.status() == WcStatus::WrFlushErr && r.kind() == WrKind::Recv));
        assert!(reactor.poll(16).unwrap().is_empty());
    }

    #[test]
    fn oversized_batch_is_clamped() {
        let (pd, cq, mut qp) = loopback();
        let mut reactor = Reactor::new(&cq, ReactorConfig::default()).unwrap();
        assert!(reactor.poll(usize::MAX).unwrap().is_empty());

        let dst = Mr::alloc(&pd, 64, Permission::default()).unwrap();
        for i in 0..3 {
            qp.post_recv(i, &[dst.as_slice()]).unwrap();
        }
        qp.to_error().unwrap();
        assert_eq!(reactor.poll(usize::MAX).unwrap().len(), 3);
        assert_eq!(reactor.collect(usize::MAX, Duration::from_millis(10)).unwrap().len(), 0);
    }

    #[test]
    fn zero_batch_is_rejected() {
        let (_pd, cq, _qp) = loopback();
        let cfg = ReactorConfig {
            max_batch: 0,
            ..Default::default()
        };
        assert!(matches!(Reactor::new(&cq, cfg), Err(PollError::ZeroBatch)));
        assert!(Reactor::new(&cq, ReactorConfig::default()).is_ok());
    }

    #[test]
    fn overrun_is_fatal() {
        let fabric = SoftFabric::new();
        let ctx = Context::new(fabric.open_device(), 1, 1).unwrap();
        let pd = Pd::new(&ctx).unwrap();
        let cq = Cq::new(&ctx, 2).unwrap();
        let mut qp = Qp::create(&pd, &cq, QpCaps::default()).unwrap();
        let av = AddressVector::to_peer(ctx.lid(), ctx.gid());
        qp.to_init(&InitAttr::default()).unwrap();
        qp.to_rtr(&RtrAttr::new(qp.qp_num(), 0, av)).unwrap();

        let dst = Mr::alloc(&pd, 64, Permission::default()).unwrap();
        for i in 0..4 {
            qp.post_recv(i, &[dst.as_slice()]).unwrap();
        }
        qp.to_error().unwrap();

        let mut reactor = Reactor::new(&cq, ReactorConfig::default()).unwrap();
        assert!(matches!(reactor.poll(8), Err(PollError::Fatal(_))));
    }

    #[test]
    fn destroy_waits_for_the_record_in_flight() {
        use std::sync::atomic::AtomicU32;

        let (pd, cq, mut qp) = loopback();
        let dst = Mr::alloc(&pd, 64, Permission::default()).unwrap();
        qp.post_recv(1, &[dst.as_slice()]).unwrap();
        qp.post_recv(2, &[dst.as_slice()]).unwrap();

        // 0: idle, 1: handler running, 2: handler returned.
        let step = Arc::new(AtomicU32::new(0));
        let seen = step.clone();
        let handle = Reactor::new(&cq, ReactorConfig::default()).unwrap().spawn(move |_| {
            if seen.compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire).is_ok() {
                thread::sleep(Duration::from_millis(100));
                seen.store(2, Ordering::Release);
            }
        });

        qp.to_error().unwrap();
        let deadline = quanta::Instant::now() + Duration::from_secs(5);
        while step.load(Ordering::Acquire) == 0 && quanta::Instant::now() < deadline {
            thread::yield_now();
        }
        assert_eq!(step.load(Ordering::Acquire), 1);
        qp.destroy().unwrap();
        assert_eq!(step.load(Ordering::Acquire), 2);
        handle.stop_and_join().unwrap();
    }

    #[test]
    fn spawned_reactor_stops() {
        let (_pd, cq, _qp) = loopback();
        let reactor = Reactor::new(&cq, ReactorConfig::default()).unwrap();
        let handle = reactor.spawn(|_| {});
        let reactor = handle.stop_and_join().unwrap();
        assert!(reactor.cq().same_as(&cq));
    }
}
