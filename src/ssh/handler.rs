//! SSH client handler with known_hosts verification.

use std::path::PathBuf;

use async_trait::async_trait;
use log::{debug, warn};
use russh::client;
use russh::keys::PublicKey;
use russh_keys::HashAlg;

use crate::error::TunnelError;

/// Handler for a single outbound SSH session.
///
/// The only callback the relay cares about is server key verification: the
/// presented key must match an entry for the host in the known_hosts file.
/// Unknown hosts are rejected the same way as changed keys.
pub struct ClientHandler {
    host: String,
    port: u16,
    known_hosts: PathBuf,
}

impl ClientHandler {
    pub fn new(host: impl Into<String>, port: u16, known_hosts: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            port,
            known_hosts: known_hosts.into(),
        }
    }
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = TunnelError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint(HashAlg::Sha256);

        match russh_keys::check_known_hosts_path(
            &self.host,
            self.port,
            server_public_key,
            &self.known_hosts,
        ) {
            Ok(true) => {
                debug!("Host key for {} verified: {}", self.host, fingerprint);
                Ok(true)
            }
            Ok(false) => {
                warn!(
                    "No known_hosts entry for {} in {} (presented {})",
                    self.host,
                    self.known_hosts.display(),
                    fingerprint
                );
                Ok(false)
            }
            Err(e) => {
                warn!(
                    "Host key verification failed for {} (presented {}): {}",
                    self.host, fingerprint, e
                );
                Ok(false)
            }
        }
    }
}
