//! SSH client side: dialing through sessions and binding their lifetime to
//! the connections they carry.

mod conn;
mod dialer;
mod handler;

/// Port the remote SSH daemon listens on.
pub const SSH_PORT: u16 = 22;

pub use conn::{BoundConnection, SessionHandle};
pub use dialer::{split_host_port, Dialer, SshDialer};
pub use handler::ClientHandler;
