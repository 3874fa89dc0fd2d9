//! The RDMA prelude.
//!
//! The purpose of this module is to alleviate imports of common RDMA
//! functionalities.

pub use crate::ctrl::{ConnConfig, Connecter, Connection, ConnectionMetadata, Exchange};
pub use crate::rdma::context::Context;
pub use crate::rdma::cq::{Cq, WcStatus};
pub use crate::rdma::mr::{Mr, MrSlice, Permission};
pub use crate::rdma::pd::Pd;
pub use crate::rdma::qp::{Qp, QpCaps, QpState};
pub use crate::rdma::reactor::{CompletionRecord, Reactor, ReactorConfig, StopSignal};
pub use crate::rdma::wr::{SubmissionError, WrKind};
