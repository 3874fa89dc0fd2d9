mod config;
mod connecter;
mod exchange;
mod meta;

pub use config::{random_psn, ConfigError, ConnConfig};
pub use connecter::{ConnectError, Connecter, Connection};
pub use exchange::{ChannelExchange, Exchange, TcpExchange};
pub use meta::{ConnectionMetadata, DecodeError};
