//! RDMA functionalities.

pub mod context;
pub mod cq;
pub mod gid;
pub mod mr;
pub mod pd;
pub mod qp;
pub mod reactor;
pub mod type_alias;
pub mod wr;
