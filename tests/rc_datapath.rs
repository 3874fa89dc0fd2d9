use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Result};
use rcverbs::ctrl::{ChannelExchange, ConnConfig, Connecter, Connection, ConnectionMetadata};
use rcverbs::provider::soft::{SoftDeviceConfig, SoftFabric};
use rcverbs::*;

const TIMEOUT: Duration = Duration::from_secs(5);

struct Endpoint {
    pd: Pd,
    cq: Cq,
}

impl Endpoint {
    fn open(fabric: &SoftFabric, config: SoftDeviceConfig) -> Result<Self> {
        let ctx = Context::new(fabric.open_device_with(config), 1, 1)?;
        let pd = Pd::new(&ctx)?;
        let cq = Cq::new(&ctx, Cq::DEFAULT_CQ_DEPTH)?;
        Ok(Self { pd, cq })
    }

    fn qp(&self, caps: QpCaps) -> Result<Qp> {
        Ok(Qp::create(&self.pd, &self.cq, caps)?)
    }
}

fn local_pair(caps: QpCaps, cfg: &ConnConfig) -> Result<(Endpoint, Endpoint, Connection, Connection)> {
    let fabric = SoftFabric::new();
    let a = Endpoint::open(&fabric, Default::default())?;
    let b = Endpoint::open(&fabric, Default::default())?;
    let (qa, qb) = Connecter::connect_local(a.qp(caps)?, b.qp(caps)?, cfg)?;
    Ok((a, b, qa, qb))
}

#[test]
fn metadata_codec_scenario() -> Result<()> {
    let text = ConnectionMetadata::new(5, 100, 0, Gid::ZERO).encode();
    let decoded: ConnectionMetadata = text.parse()?;
    assert_eq!(decoded.qpn(), 5);
    assert_eq!(decoded.psn(), 100);
    assert_eq!(decoded.lid(), 0);
    assert_eq!(decoded.gid().raw(), [0u8; 16]);

    let compact: ConnectionMetadata = "qpn=5, spn=100, lid=0, gid=00000000000000000000000000000000".parse()?;
    assert_eq!(compact, decoded);
    Ok(())
}

fn two_endpoints(config: SoftDeviceConfig) -> Result<()> {
    let fabric = SoftFabric::new();
    let a = Endpoint::open(&fabric, config.clone())?;
    let b = Endpoint::open(&fabric, config)?;
    let (ex_a, ex_b) = ChannelExchange::pair();
    let payload = b"rdma says hello";

    let mut dst = Mr::alloc(&b.pd, 64, Permission::default())?;
    let src = Mr::reg(&a.pd, payload.to_vec(), Permission::default())?;

    let (conn_a, conn_b) = thread::scope(|s| -> Result<(Connection, Connection)> {
        let peer = s.spawn(|| {
            let mut connecter = Connecter::new(ex_b, ConnConfig::default());
            connecter.connect_with(&b.pd, &b.cq, |qp| qp.post_recv(0xb0b, &[dst.as_slice()]))
        });
        let conn_a = Connecter::new(ex_a, ConnConfig::default()).connect(&a.pd, &a.cq)?;
        let conn_b = peer.join().map_err(|_| anyhow!("peer panicked"))??;
        Ok((conn_a, conn_b))
    })?;
    assert_eq!(conn_a.peer(), conn_b.local());
    assert_eq!(conn_b.peer(), conn_a.local());
    assert_eq!(conn_a.qp().state(), QpState::Rts);
    assert_eq!(conn_b.qp().state(), QpState::Rts);

    conn_a.qp().post_send(0xa11ce, &[src.as_slice()], true)?;

    let mut reactor_b = Reactor::new(&b.cq, ReactorConfig::default())?;
    let records = reactor_b.collect(1, TIMEOUT)?;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].wr_id(), 0xb0b);
    assert_eq!(records[0].status(), WcStatus::Success);
    assert_eq!(records[0].kind(), WrKind::Recv);
    assert_eq!(records[0].qpn(), conn_b.qp().qp_num());
    assert_eq!(records[0].byte_len(), Some(payload.len()));

    let mut reactor_a = Reactor::new(&a.cq, ReactorConfig::default())?;
    let records = reactor_a.collect(1, TIMEOUT)?;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].wr_id(), 0xa11ce);
    assert_eq!(records[0].status(), WcStatus::Success);
    assert_eq!(records[0].kind(), WrKind::Send);

    assert_eq!(&dst.bytes()?[..payload.len()], payload);
    Ok(())
}

#[test]
fn two_endpoint_scenario_infiniband() -> Result<()> {
    two_endpoints(SoftDeviceConfig::default())
}

#[test]
fn two_endpoint_scenario_roce() -> Result<()> {
    two_endpoints(SoftDeviceConfig::roce())
}

#[test]
fn transitions_fail_out_of_order() -> Result<()> {
    let fabric = SoftFabric::new();
    let ep = Endpoint::open(&fabric, Default::default())?;
    let mut qp = ep.qp(QpCaps::default())?;
    let cfg = ConnConfig::default();
    let me = ConnectionMetadata::new(qp.qp_num(), 0, qp.context().lid(), qp.context().gid());

    assert!(matches!(
        qp.to_rtr(&cfg.rtr_attr(&me)),
        Err(TransitionError::InvalidState { .. })
    ));
    assert!(qp.to_rts(&cfg.rts_attr(0)).is_err());
    qp.to_init(&cfg.init_attr())?;
    assert!(qp.to_rts(&cfg.rts_attr(0)).is_err());
    qp.to_error()?;
    assert!(qp.to_init(&cfg.init_attr()).is_err());
    assert!(qp.to_rtr(&cfg.rtr_attr(&me)).is_err());
    assert!(qp.to_rts(&cfg.rts_attr(0)).is_err());
    assert_eq!(qp.state(), QpState::Error);
    Ok(())
}

#[test]
fn every_request_completes_exactly_once() -> Result<()> {
    const N: u64 = 500;
    let caps = QpCaps::symmetric(16, 1);
    let (a, b, qa, qb) = local_pair(caps, &ConnConfig::default())?;
    assert!(!a.cq.same_as(&b.cq));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let reactor_a = Reactor::new(&a.cq, ReactorConfig::default())?.spawn(move |r| {
        sink.lock().unwrap().push(r);
    });
    let sink = seen.clone();
    let reactor_b = Reactor::new(&b.cq, ReactorConfig::default())?.spawn(move |r| {
        sink.lock().unwrap().push(r);
    });

    let src = Mr::alloc(&a.pd, 8, Permission::default())?;
    let dst = Mr::alloc(&b.pd, 8, Permission::default())?;
    let deadline = quanta::Instant::now() + TIMEOUT;
    let (mut recvs, mut sends) = (0, 0);
    while sends < N {
        if quanta::Instant::now() > deadline {
            return Err(anyhow!("stuck after {} sends", sends));
        }
        if recvs < N {
            match qb.qp().post_recv(recvs, &[dst.as_slice()]) {
                Ok(()) => recvs += 1,
                Err(e) if e.is_back_pressure() => {}
                Err(e) => return Err(e.into()),
            }
        }
        if sends < recvs {
            match qa.qp().post_send(N + sends, &[src.as_slice()], true) {
                Ok(()) => sends += 1,
                Err(e) if e.is_back_pressure() => thread::yield_now(),
                Err(e) => return Err(e.into()),
            }
        }
    }

    while seen.lock().unwrap().len() < 2 * N as usize {
        if quanta::Instant::now() > deadline {
            break;
        }
        thread::yield_now();
    }
    reactor_a.stop_and_join()?;
    reactor_b.stop_and_join()?;

    let mut ids = seen.lock().unwrap().iter().map(|r| r.wr_id()).collect::<Vec<_>>();
    ids.sort_unstable();
    assert_eq!(ids, (0..2 * N).collect::<Vec<_>>());
    assert!(seen.lock().unwrap().iter().all(|r| r.is_success()));
    assert_eq!(qa.qp().outstanding(), (0, 0));
    assert_eq!(qb.qp().outstanding(), (0, 0));
    Ok(())
}

#[test]
fn full_send_queue_is_back_pressure() -> Result<()> {
    let caps = QpCaps::symmetric(4, 1);
    let (a, b, qa, qb) = local_pair(caps, &ConnConfig::default())?;
    let src = Mr::alloc(&a.pd, 8, Permission::default())?;
    let dst = Mr::alloc(&b.pd, 8, Permission::default())?;

    // No receive is posted yet, so the sends wait for the receiver.
    for i in 0..4 {
        qa.qp().post_send(i, &[src.as_slice()], true)?;
    }
    let err = qa.qp().post_send(4, &[src.as_slice()], true).unwrap_err();
    assert!(err.is_back_pressure());
    assert!(matches!(err, SubmissionError::QueueFull { kind: WrKind::Send, depth: 4 }));
    assert_eq!(qa.qp().state(), QpState::Rts);
    assert_eq!(qa.qp().outstanding(), (4, 0));

    for i in 0..4 {
        qb.qp().post_recv(100 + i, &[dst.as_slice()])?;
    }
    let mut reactor = Reactor::new(&a.cq, ReactorConfig::default())?;
    let records = reactor.collect(4, TIMEOUT)?;
    assert_eq!(records.iter().map(|r| r.wr_id()).collect::<Vec<_>>(), vec![0, 1, 2, 3]);

    let mut reactor_b = Reactor::new(&b.cq, ReactorConfig::default())?;
    assert_eq!(reactor_b.collect(4, TIMEOUT)?.len(), 4);
    qb.qp().post_recv(104, &[dst.as_slice()])?;
    qa.qp().post_send(4, &[src.as_slice()], true)?;
    assert_eq!(reactor.collect(1, TIMEOUT)?.len(), 1);
    Ok(())
}

#[test]
fn failed_completions_expose_only_reliable_fields() -> Result<()> {
    let (a, b, qa, qb) = local_pair(QpCaps::default(), &ConnConfig::default())?;
    let src = Mr::alloc(&a.pd, 32, Permission::default())?;
    let short = Mr::alloc(&b.pd, 8, Permission::default())?;

    qb.qp().post_recv(1, &[short.as_slice()])?;
    qb.qp().post_recv(2, &[short.as_slice()])?;
    qa.qp().post_send(10, &[src.as_slice()], true)?;

    let mut reactor_b = Reactor::new(&b.cq, ReactorConfig::default())?;
    let records = reactor_b.collect(2, TIMEOUT)?;
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].wr_id(), 1);
    assert_eq!(records[0].status(), WcStatus::LocLenErr);
    assert_eq!(records[0].qpn(), qb.qp().qp_num());
    assert_ne!(records[0].vendor_err(), 0);
    assert_eq!(records[0].kind(), WrKind::Recv);
    assert_eq!(records[1].wr_id(), 2);
    assert_eq!(records[1].status(), WcStatus::WrFlushErr);
    assert_eq!(qb.qp().cached_state(), QpState::Error);

    let mut reactor_a = Reactor::new(&a.cq, ReactorConfig::default())?;
    let records = reactor_a.collect(1, TIMEOUT)?;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].wr_id(), 10);
    assert!(!records[0].is_success());
    assert_eq!(records[0].qpn(), qa.qp().qp_num());
    assert_eq!(records[0].kind(), WrKind::Send);

    assert!(matches!(
        qa.qp().post_send(11, &[src.as_slice()], true),
        Err(SubmissionError::InvalidState { .. })
    ));
    Ok(())
}

#[test]
fn teardown_discards_outstanding_requests() -> Result<()> {
    let (_a, b, qa, qb) = local_pair(QpCaps::default(), &ConnConfig::default())?;
    let dst = Mr::alloc(&b.pd, 64, Permission::default())?;
    qb.qp().post_recv(7, &[dst.as_slice()])?;
    assert_eq!(dst.pins(), 1);

    let mut reactor = Reactor::new(&b.cq, ReactorConfig::default())?;
    qb.close()?;
    assert_eq!(dst.pins(), 0);
    assert!(reactor.collect(1, Duration::from_millis(50))?.is_empty());
    dst.deregister().map_err(|(_, e)| e)?;
    drop(qa);
    Ok(())
}

#[test]
fn teardown_discards_queued_completions() -> Result<()> {
    let (_a, b, qa, qb) = local_pair(QpCaps::default(), &ConnConfig::default())?;
    let dst = Mr::alloc(&b.pd, 64, Permission::default())?;
    let mut qp = qb.into_qp();
    qp.post_recv(7, &[dst.as_slice()])?;
    qp.to_error()?;
    qp.destroy()?;

    let mut reactor = Reactor::new(&b.cq, ReactorConfig::default())?;
    assert!(reactor.collect(1, Duration::from_millis(50))?.is_empty());
    drop(qa);
    Ok(())
}

#[test]
fn pinned_memory_refuses_deregistration() -> Result<()> {
    let (_a, b, _qa, qb) = local_pair(QpCaps::default(), &ConnConfig::default())?;
    let dst = Mr::alloc(&b.pd, 64, Permission::default())?;
    qb.qp().post_recv(1, &[dst.as_slice()])?;

    let (dst, err) = dst.deregister().unwrap_err();
    assert!(matches!(err, RegistrationError::InUse(1)));

    let mut qp = qb.into_qp();
    qp.to_error()?;
    let mut reactor = Reactor::new(&b.cq, ReactorConfig::default())?;
    let records = reactor.collect(1, TIMEOUT)?;
    assert_eq!(records[0].status(), WcStatus::WrFlushErr);
    assert_eq!(dst.deregister().map_err(|(_, e)| e)?.len(), 64);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn async_reactor_stops_cooperatively() -> Result<()> {
    let (a, b, qa, qb) = local_pair(QpCaps::default(), &ConnConfig::default())?;
    let src = Mr::reg(&a.pd, b"async".to_vec(), Permission::default())?;
    let dst = Mr::alloc(&b.pd, 16, Permission::default())?;

    let stop = StopSignal::new();
    let mut reactor = Reactor::new(&b.cq, ReactorConfig::default())?;
    let task = {
        let stop = stop.clone();
        tokio::spawn(async move {
            let mut records = Vec::new();
            let signal = stop.clone();
            reactor
                .run_async(&signal, |r| {
                    records.push(r);
                    if records.len() == 3 {
                        stop.stop();
                    }
                })
                .await?;
            Ok::<_, PollError>(records)
        })
    };

    for i in 0..3 {
        qb.qp().post_recv(i, &[dst.as_slice()])?;
        qa.qp().post_send(100 + i, &[src.as_slice()], false)?;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let records = tokio::time::timeout(TIMEOUT, task).await???;
    assert!(stop.is_stopped());
    assert_eq!(records.iter().map(|r| r.wr_id()).collect::<Vec<_>>(), vec![0, 1, 2]);
    assert!(records.iter().all(|r| r.kind() == WrKind::Recv && r.byte_len() == Some(5)));
    Ok(())
}
