use std::path::Path;
use std::{fs, io};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::meta::ConnectionMetadata;
use crate::rdma::context::Context;
use crate::rdma::cq::{Cq, CqCreationError};
use crate::rdma::mr::Permission;
use crate::rdma::qp::{AddressVector, InitAttr, Mtu, QpCaps, RtrAttr, RtsAttr};
use crate::rdma::reactor::{PollError, Reactor, ReactorConfig};
use crate::rdma::type_alias::*;

/// Configuration loading error type.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration file")]
    Io(#[from] io::Error),

    #[error("malformed configuration")]
    Parse(#[from] toml::de::Error),

    /// The file has no `[rcverbs]` table.
    #[error("rcverbs configuration not found")]
    MissingTable,

    /// A value is well-formed but unusable.
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Everything needed to set up one reliable connection. Every field has a
/// default, so a configuration file only names what it changes.
///
/// ```toml
/// [rcverbs]
/// port_num = 1
/// gid_index = 3
/// path_mtu = 1024
/// access = ["local_write", "remote_read"]
///
/// [rcverbs.caps]
/// max_send_wr = 64
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnConfig {
    /// Local port.
    pub port_num: PortNum,
    /// Local GID index, used both as the advertised GID and the source GID.
    pub gid_index: GidIndex,
    /// Queue pair capabilities.
    pub caps: QpCaps,
    /// Completion queue depth.
    pub cq_depth: u32,
    /// Remote operations allowed against the queue pair.
    pub access: Permission,

    /// Start PSN. Random if unset.
    pub psn: Option<Psn>,
    pub path_mtu: Mtu,
    pub max_dest_rd_atomic: u8,
    pub min_rnr_timer: u8,
    /// Route with a global routing header. Required on RoCE.
    pub is_global: bool,
    pub hop_limit: u8,
    pub sl: u8,

    pub timeout: u8,
    pub retry_cnt: u8,
    pub rnr_retry: u8,
    pub max_rd_atomic: u8,

    pub reactor: ReactorConfig,
}

impl Default for ConnConfig {
    fn default() -> Self {
        let rtr = RtrAttr::new(0, 0, AddressVector::to_peer(0, Default::default()));
        let rts = RtsAttr::new(0);
        Self {
            port_num: 1,
            gid_index: 1,
            caps: QpCaps::default(),
            cq_depth: 128,
            access: Permission::default(),
            psn: None,
            path_mtu: rtr.path_mtu,
            max_dest_rd_atomic: rtr.max_dest_rd_atomic,
            min_rnr_timer: rtr.min_rnr_timer,
            is_global: rtr.av.is_global,
            hop_limit: rtr.av.hop_limit,
            sl: rtr.av.sl,
            timeout: rts.timeout,
            retry_cnt: rts.retry_cnt,
            rnr_retry: rts.rnr_retry,
            max_rd_atomic: rts.max_rd_atomic,
            reactor: ReactorConfig::default(),
        }
    }
}

#[derive(Deserialize)]
struct ConfigFile {
    rcverbs: Option<ConnConfig>,
}

/// Pick a random 24-bit PSN.
pub fn random_psn() -> Psn {
    rand::random::<Psn>() & PSN_MASK
}

impl ConnConfig {
    /// Parse the `[rcverbs]` table of a TOML document.
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(toml_str)?;
        let cfg = file.rcverbs.ok_or(ConfigError::MissingTable)?;
        if cfg.cq_depth == 0 {
            return Err(ConfigError::Invalid("cq_depth must be positive"));
        }
        if cfg.reactor.max_batch == 0 {
            return Err(ConfigError::Invalid("reactor.max_batch must be positive"));
        }
        Ok(cfg)
    }

    /// Load the `[rcverbs]` table of a TOML file.
    pub fn load_toml(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let toml_str = fs::read_to_string(path)?;
        Self::from_toml_str(&toml_str)
    }

    /// Create a completion queue of the configured depth.
    pub fn new_cq(&self, ctx: &Context) -> Result<Cq, CqCreationError> {
        Cq::new(ctx, self.cq_depth)
    }

    /// Create a reactor with the configured tuning.
    pub fn new_reactor(&self, cq: &Cq) -> Result<Reactor, PollError> {
        Reactor::new(cq, self.reactor)
    }

    /// The configured start PSN, or a random one.
    pub fn start_psn(&self) -> Psn {
        self.psn.map_or_else(random_psn, |psn| psn & PSN_MASK)
    }

    pub fn init_attr(&self) -> InitAttr {
        InitAttr {
            port_num: self.port_num,
            pkey_index: 0,
            access: self.access,
        }
    }

    /// RTR parameters towards the given peer.
    pub fn rtr_attr(&self, peer: &ConnectionMetadata) -> RtrAttr {
        let mut av = AddressVector::to_peer(peer.lid(), peer.gid());
        av.is_global = self.is_global;
        av.hop_limit = self.hop_limit;
        av.sgid_index = self.gid_index;
        av.sl = self.sl;
        av.port_num = self.port_num;
        RtrAttr {
            path_mtu: self.path_mtu,
            max_dest_rd_atomic: self.max_dest_rd_atomic,
            min_rnr_timer: self.min_rnr_timer,
            ..RtrAttr::new(peer.qpn(), peer.psn(), av)
        }
    }

    /// RTS parameters with the given local start PSN.
    pub fn rts_attr(&self, psn: Psn) -> RtsAttr {
        RtsAttr {
            timeout: self.timeout,
            retry_cnt: self.retry_cnt,
            rnr_retry: self.rnr_retry,
            max_rd_atomic: self.max_rd_atomic,
            ..RtsAttr::new(psn)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdma::gid::Gid;

    #[test]
    fn defaults() {
        let cfg = ConnConfig::default();
        assert_eq!((cfg.port_num, cfg.gid_index, cfg.cq_depth), (1, 1, 128));
        assert_eq!(cfg.caps, QpCaps::default());
        assert_eq!(cfg.path_mtu, Mtu::Mtu4096);
        assert_eq!((cfg.timeout, cfg.retry_cnt, cfg.rnr_retry), (10, 5, 4));
        assert!(cfg.is_global);
    }

    #[test]
    fn partial_table_keeps_defaults() {
        let cfg = ConnConfig::from_toml_str(
            r#"
            [rcverbs]
            gid_index = 3
            path_mtu = 1024
            psn = 100
            access = ["local_write", "remote_read"]

            [rcverbs.caps]
            max_send_wr = 64

            [rcverbs.reactor]
            max_batch = 4
            "#,
        )
        .unwrap();
        assert_eq!(cfg.gid_index, 3);
        assert_eq!(cfg.path_mtu, Mtu::Mtu1024);
        assert_eq!(cfg.start_psn(), 100);
        assert_eq!(cfg.access, Permission::LOCAL_WRITE | Permission::REMOTE_READ);
        assert_eq!(cfg.caps.max_send_wr, 64);
        assert_eq!(cfg.caps.max_recv_wr, 32);
        assert_eq!(cfg.reactor.max_batch, 4);
        assert_eq!(cfg.reactor.spin_before_yield, 64);
        assert_eq!(cfg.rnr_retry, 4);
    }

    #[test]
    fn missing_table_or_bad_values() {
        assert!(matches!(
            ConnConfig::from_toml_str("[other]\nx = 1\n"),
            Err(ConfigError::MissingTable)
        ));
        assert!(matches!(
            ConnConfig::from_toml_str("[rcverbs]\npath_mtu = 1500\n"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            ConnConfig::load_toml("/nonexistent/rcverbs.toml"),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn attributes_follow_config() {
        let cfg = ConnConfig {
            gid_index: 2,
            min_rnr_timer: 1,
            rnr_retry: 0,
            ..Default::default()
        };
        let peer = ConnectionMetadata::new(9, 0x1234, 3, Gid::ZERO);
        let rtr = cfg.rtr_attr(&peer);
        assert_eq!((rtr.dest_qpn, rtr.rq_psn, rtr.min_rnr_timer), (9, 0x1234, 1));
        assert_eq!((rtr.av.dlid, rtr.av.sgid_index), (3, 2));
        assert_eq!(cfg.rts_attr(7).rnr_retry, 0);
        assert_eq!(cfg.rts_attr(7).sq_psn, 7);
    }

    #[test]
    fn random_psn_fits_24_bits() {
        for _ in 0..64 {
            assert_eq!(random_psn() & !PSN_MASK, 0);
        }
    }

    #[test]
    fn unset_psn_is_drawn_at_random() {
        let cfg = ConnConfig::default();
        let psns = (0..16).map(|_| cfg.start_psn()).collect::<std::collections::HashSet<_>>();
        assert!(psns.len() > 1);
    }

    #[test]
    fn zero_sizes_are_rejected() {
        assert!(matches!(
            ConnConfig::from_toml_str("[rcverbs]\ncq_depth = 0\n"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            ConnConfig::from_toml_str("[rcverbs.reactor]\nmax_batch = 0\n"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn cq_and_reactor_follow_config() {
        use crate::provider::soft::SoftFabric;

        let cfg = ConnConfig::from_toml_str(
            r#"
            [rcverbs]
            cq_depth = 16

            [rcverbs.reactor]
            max_batch = 4
            spin_before_yield = 8
            "#,
        )
        .unwrap();
        let fabric = SoftFabric::new();
        let ctx = Context::new(fabric.open_device(), cfg.port_num, cfg.gid_index).unwrap();
        let cq = cfg.new_cq(&ctx).unwrap();
        assert_eq!(cq.capacity(), 16);
        let reactor = cfg.new_reactor(&cq).unwrap();
        assert_eq!(reactor.config(), &cfg.reactor);
        assert_eq!(reactor.config().max_batch, 4);
    }
}
