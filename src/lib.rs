//! A reliable-connection RDMA data path: out-of-band connection handshake,
//! queue pair lifecycle, memory registration, work submission, and a
//! completion reactor.
//!
//! All resource holder types ([`Context`], [`Pd`], [`Cq`], [`Mr`]) are
//! references to the underlying resources, kept alive by whoever uses them:
//! a [`Qp`] keeps its completion queues and protection domain alive, and an
//! outstanding work request keeps the memory regions it references alive.
//! A [`Qp`] itself is exclusively owned. State transitions need `&mut Qp`;
//! posting work requests only needs `&Qp`.
//!
//! Devices are reached through a [`provider::Provider`]. The default
//! [`provider::soft::SoftFabric`] emulates an RC fabric in-process; the
//! `ibverbs` feature adds a libibverbs-backed provider.
//!
//! Connection management lives in the [`ctrl`] mod: the text codec of
//! [`ctrl::ConnectionMetadata`], peer exchanges, and [`ctrl::Connecter`]
//! running the handshake.
//!
//! # Example
//!
//! ```rust
//! use rcverbs::provider::soft::SoftFabric;
//! use rcverbs::ctrl::{ConnConfig, Connecter};
//! use rcverbs::*;
//! use std::time::Duration;
//!
//! fn main() -> anyhow::Result<()> {
//!     let fabric = SoftFabric::new();
//!     let ctx = Context::new(fabric.open_device(), 1, 1)?;
//!     let pd = Pd::new(&ctx)?;
//!     let cq = Cq::new(&ctx, Cq::DEFAULT_CQ_DEPTH)?;
//!
//!     let a = Qp::create(&pd, &cq, QpCaps::default())?;
//!     let b = Qp::create(&pd, &cq, QpCaps::default())?;
//!     let (a, b) = Connecter::connect_local(a, b, &ConnConfig::default())?;
//!
//!     let src = Mr::reg(&pd, b"hello".to_vec(), Permission::default())?;
//!     let dst = Mr::alloc(&pd, 64, Permission::default())?;
//!     b.qp().post_recv(1, &[dst.as_slice()])?;
//!     a.qp().post_send(2, &[src.as_slice()], true)?;
//!
//!     let mut reactor = Reactor::new(&cq, ReactorConfig::default())?;
//!     let records = reactor.collect(2, Duration::from_secs(1))?;
//!     assert!(records.iter().all(|r| r.is_success()));
//!     Ok(())
//! }
//! ```

#[macro_use]
mod utils;

#[cfg(feature = "ibverbs")]
mod bindings;

mod rdma;
pub use rdma::gid::{Gid, GidParseError};
pub use rdma::type_alias::*;
pub use rdma::{context::Context, cq::*, mr::*, pd::Pd, qp::*, reactor::*, wr::*};

/// Connection management utilities.
pub mod ctrl;

pub mod prelude;
pub mod provider;
