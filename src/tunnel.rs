//! The contract shared by the TCP and HTTP relays.

use async_trait::async_trait;

use crate::error::TunnelError;

/// A relay from a local port to the remote side.
///
/// `tunnel` runs until the listener fails; it only returns on error.
#[async_trait]
pub trait Tunneler: Send + Sync {
    async fn tunnel(&self) -> Result<(), TunnelError>;
}
