use std::io;

use thiserror::Error;

use super::config::ConnConfig;
use super::exchange::Exchange;
use super::meta::{ConnectionMetadata, DecodeError};
use crate::rdma::cq::Cq;
use crate::rdma::pd::Pd;
use crate::rdma::qp::{Qp, QpCreationError, RtrAttr, TransitionError};
use crate::rdma::wr::SubmissionError;

/// Connection setup error type. Every variant aborts the attempt; the queue
/// pair involved is destroyed.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("cannot create QP")]
    Creation(#[from] QpCreationError),

    #[error("metadata exchange failed")]
    Exchange(#[source] io::Error),

    #[error("cannot decode peer metadata")]
    Decode(#[from] DecodeError),

    #[error("QP state transition failed")]
    Transition(#[from] TransitionError),

    #[error("cannot post work requests before RTS")]
    Submission(#[from] SubmissionError),
}

/// A queue pair in RTS together with the metadata both sides advertised.
#[derive(Debug)]
pub struct Connection {
    qp: Qp,
    local: ConnectionMetadata,
    peer: ConnectionMetadata,
}

impl Connection {
    /// Get the connected queue pair.
    #[inline]
    pub fn qp(&self) -> &Qp {
        &self.qp
    }

    /// Get the metadata sent to the peer.
    #[inline]
    pub fn local(&self) -> &ConnectionMetadata {
        &self.local
    }

    /// Get the metadata received from the peer.
    #[inline]
    pub fn peer(&self) -> &ConnectionMetadata {
        &self.peer
    }

    /// Take the queue pair out of the connection.
    pub fn into_qp(self) -> Qp {
        self.qp
    }

    /// Tear the connection down by destroying the queue pair. Outstanding
    /// work requests are dropped without completions.
    pub fn close(self) -> io::Result<()> {
        log::info!(
            "closing connection QP {:#x} -> {:#x}",
            self.local.qpn(),
            self.peer.qpn()
        );
        self.qp.destroy()
    }
}

fn local_metadata(qp: &Qp, cfg: &ConnConfig) -> ConnectionMetadata {
    let ctx = qp.context();
    ConnectionMetadata::new(qp.qp_num(), cfg.start_psn(), ctx.lid(), ctx.gid())
}

fn rtr_attr(qp: &Qp, cfg: &ConnConfig, peer: &ConnectionMetadata) -> RtrAttr {
    let mut attr = cfg.rtr_attr(peer);
    attr.av.sgid_index = qp.context().gid_index();
    attr.av.port_num = qp.context().port_num();
    attr
}

/// Runs the connection handshake of a reliable-connection queue pair over an
/// [`Exchange`].
///
/// Both sides bring their queue pair to INIT, swap [`ConnectionMetadata`],
/// move to RTR with the peer's metadata, and finally to RTS.
#[derive(Debug)]
pub struct Connecter<E> {
    exchange: E,
    cfg: ConnConfig,
}

impl<E: Exchange> Connecter<E> {
    pub fn new(exchange: E, cfg: ConnConfig) -> Self {
        Self { exchange, cfg }
    }

    #[inline]
    pub fn config(&self) -> &ConnConfig {
        &self.cfg
    }

    /// Create a queue pair on `pd` and `cq` and connect it.
    pub fn connect(&mut self, pd: &Pd, cq: &Cq) -> Result<Connection, ConnectError> {
        self.connect_with(pd, cq, |_| Ok(()))
    }

    /// Create a queue pair on `pd` and `cq` and connect it, running
    /// `before_rts` once the queue pair is in RTR. Receives posted there are
    /// in place before the peer can send.
    pub fn connect_with(
        &mut self,
        pd: &Pd,
        cq: &Cq,
        before_rts: impl FnOnce(&Qp) -> Result<(), SubmissionError>,
    ) -> Result<Connection, ConnectError> {
        let qp = Qp::builder().cq(cq).caps(self.cfg.caps).build(pd)?;
        self.establish(qp, before_rts)
    }

    /// Connect a queue pair in the RESET state.
    pub fn establish(
        &mut self,
        mut qp: Qp,
        before_rts: impl FnOnce(&Qp) -> Result<(), SubmissionError>,
    ) -> Result<Connection, ConnectError> {
        let local = local_metadata(&qp, &self.cfg);
        qp.to_init(&self.cfg.init_attr())?;

        let peer = self
            .exchange
            .exchange(&local.encode())
            .map_err(ConnectError::Exchange)?;
        let peer = ConnectionMetadata::decode(&peer)?;
        log::debug!("local {} / peer {}", local, peer);

        qp.to_rtr(&rtr_attr(&qp, &self.cfg, &peer))?;
        before_rts(&qp)?;
        qp.to_rts(&self.cfg.rts_attr(local.psn()))?;

        log::info!("connected QP {:#x} with peer QP {:#x}", local.qpn(), peer.qpn());
        Ok(Connection { qp, local, peer })
    }
}

impl Connecter<()> {
    /// Locally connect two queue pairs in the RESET state, without involving
    /// any exchange.
    pub fn connect_local(mut a: Qp, mut b: Qp, cfg: &ConnConfig) -> Result<(Connection, Connection), ConnectError> {
        let meta_a = local_metadata(&a, cfg);
        let meta_b = local_metadata(&b, cfg);

        a.to_init(&cfg.init_attr())?;
        b.to_init(&cfg.init_attr())?;
        a.to_rtr(&rtr_attr(&a, cfg, &meta_b))?;
        b.to_rtr(&rtr_attr(&b, cfg, &meta_a))?;
        a.to_rts(&cfg.rts_attr(meta_a.psn()))?;
        b.to_rts(&cfg.rts_attr(meta_b.psn()))?;

        log::info!("connected QP {:#x} with local QP {:#x}", meta_a.qpn(), meta_b.qpn());
        Ok((
            Connection {
                qp: a,
                local: meta_a,
                peer: meta_b,
            },
            Connection {
                qp: b,
                local: meta_b,
                peer: meta_a,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctrl::exchange::ChannelExchange;
    use crate::provider::soft::SoftFabric;
    use crate::rdma::qp::{QpCaps, QpState};
    use crate::Context;

    struct Scripted(&'static str);

    impl Exchange for Scripted {
        fn exchange(&mut self, _local: &str) -> io::Result<String> {
            Ok(self.0.to_owned())
        }
    }

    fn resources(fabric: &SoftFabric) -> (Pd, Cq) {
        let ctx = Context::new(fabric.open_device(), 1, 1).unwrap();
        let pd = Pd::new(&ctx).unwrap();
        let cq = Cq::new(&ctx, 128).unwrap();
        (pd, cq)
    }

    #[test]
    fn local_pair_reaches_rts() {
        let fabric = SoftFabric::new();
        let (pd, cq) = resources(&fabric);
        let a = Qp::create(&pd, &cq, QpCaps::default()).unwrap();
        let b = Qp::create(&pd, &cq, QpCaps::default()).unwrap();
        let (a, b) = Connecter::connect_local(a, b, &ConnConfig::default()).unwrap();
        assert_eq!(a.qp().state(), QpState::Rts);
        assert_eq!(b.qp().state(), QpState::Rts);
        assert_eq!(a.peer(), b.local());
        assert_eq!(a.local().psn() & !crate::PSN_MASK, 0);
        a.close().unwrap();
        b.close().unwrap();
    }

    #[test]
    fn handshake_over_channels() {
        let fabric = SoftFabric::new();
        let (ex_a, ex_b) = ChannelExchange::pair();
        let peer_fabric = fabric.clone();
        let t = std::thread::spawn(move || {
            let (pd, cq) = resources(&peer_fabric);
            let mut connecter = Connecter::new(ex_b, ConnConfig::default());
            let conn = connecter.connect(&pd, &cq).unwrap();
            (*conn.local(), *conn.peer())
        });

        let (pd, cq) = resources(&fabric);
        let mut connecter = Connecter::new(ex_a, ConnConfig::default());
        let conn = connecter.connect(&pd, &cq).unwrap();
        let (b_local, b_peer) = t.join().unwrap();
        assert_eq!(conn.peer(), &b_local);
        assert_eq!(conn.local(), &b_peer);
        assert_eq!(conn.qp().state(), QpState::Rts);
    }

    #[test]
    fn garbage_from_peer_aborts() {
        let fabric = SoftFabric::new();
        let (pd, cq) = resources(&fabric);
        let mut connecter = Connecter::new(Scripted("qpn=1, spn=2"), ConnConfig::default());
        let err = connecter.connect(&pd, &cq).unwrap_err();
        assert!(matches!(err, ConnectError::Decode(DecodeError::FieldCount(2))));
    }
}
