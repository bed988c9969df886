//! Forward a local port to a port on a remote host over SSH.
//!
//! Traffic is relayed either as raw TCP or through an HTTP reverse proxy
//! with an optional on-disk response cache.

pub mod cache;
pub mod capture;
pub mod config;
pub mod error;
pub mod key;
pub mod proxy;
pub mod ssh;
pub mod tcp;
pub mod tunnel;

pub use cache::ResponseCache;
pub use config::{Config, Options, Protocol};
pub use error::TunnelError;
pub use key::load_private_key;
pub use proxy::HttpRelay;
pub use ssh::{BoundConnection, Dialer, SshDialer};
pub use tcp::TcpRelay;
pub use tunnel::Tunneler;
