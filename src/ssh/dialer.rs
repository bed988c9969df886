//! Dialing remote addresses through SSH sessions.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use russh::client;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::Config;
use crate::error::TunnelError;
use crate::key::load_private_key;

use super::conn::{BoundConnection, SessionHandle};
use super::handler::ClientHandler;
use super::SSH_PORT;

/// Anything that can establish an outbound connection to `address`.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Conn: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn dial(&self, network: &str, address: &str) -> Result<Self::Conn, TunnelError>;
}

/// Dials over a fresh SSH session to a fixed remote host.
///
/// Every call to `dial` performs a full handshake; the session is owned by
/// the returned connection and torn down with it.
pub struct SshDialer {
    config: Arc<client::Config>,
    key: Arc<russh_keys::PrivateKey>,
    known_hosts: PathBuf,
    username: String,
    host: String,
    port: u16,
}

impl SshDialer {
    pub fn new(
        key_path: &Path,
        known_hosts: &Path,
        username: &str,
        host: &str,
    ) -> Result<Self, TunnelError> {
        Self::with_port(key_path, known_hosts, username, host, SSH_PORT)
    }

    /// Same as `new`, for an SSH daemon on a port other than 22.
    pub fn with_port(
        key_path: &Path,
        known_hosts: &Path,
        username: &str,
        host: &str,
        port: u16,
    ) -> Result<Self, TunnelError> {
        let key = load_private_key(key_path)?;

        // Surface an unreadable known_hosts file now rather than on every dial.
        let known_hosts_error = |e: &dyn std::fmt::Display| {
            TunnelError::Credential(format!(
                "could not load known hosts {}: {}",
                known_hosts.display(),
                e
            ))
        };
        std::fs::File::open(known_hosts).map_err(|e| known_hosts_error(&e))?;
        let known = russh_keys::known_hosts::known_host_keys_path(host, port, known_hosts)
            .map_err(|e| known_hosts_error(&e))?;
        if known.is_empty() {
            warn!(
                "{} has no entry for {}, connections will be rejected",
                known_hosts.display(),
                host
            );
        }

        let config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            ..Default::default()
        };

        Ok(Self {
            config: Arc::new(config),
            key: Arc::new(key),
            known_hosts: known_hosts.to_path_buf(),
            username: username.to_string(),
            host: host.to_string(),
            port,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, TunnelError> {
        Self::new(
            &config.ssh_key_path,
            &config.known_hosts_path,
            &config.user,
            &config.remote_host,
        )
    }

    /// Open and authenticate a new session to the remote host.
    async fn connect(&self) -> Result<client::Handle<ClientHandler>, TunnelError> {
        debug!("Dialing {} via SSH on port {}", self.host, self.port);

        let handler = ClientHandler::new(&self.host, self.port, &self.known_hosts);
        let mut session = client::connect(
            self.config.clone(),
            (self.host.as_str(), self.port),
            handler,
        )
        .await
        .map_err(|e| self.handshake_error(e))?;

        let authenticated = session
            .authenticate_publickey(&self.username, self.key.clone())
            .await
            .map_err(|e| self.handshake_error(e))?;

        if !authenticated {
            let _ = session.close().await;
            return Err(TunnelError::AuthRejected(self.username.clone()));
        }

        debug!("SSH session established with {}@{}", self.username, self.host);
        Ok(session)
    }

    fn handshake_error(&self, e: impl std::fmt::Display) -> TunnelError {
        TunnelError::Handshake {
            host: self.host.clone(),
            port: self.port,
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl Dialer for SshDialer {
    type Conn = BoundConnection<russh::ChannelStream<client::Msg>>;

    async fn dial(&self, network: &str, address: &str) -> Result<Self::Conn, TunnelError> {
        if network != "tcp" {
            return Err(TunnelError::UnsupportedNetwork(network.to_string()));
        }
        let (host, port) = split_host_port(address)?;

        let session = self.connect().await?;

        let channel = match session
            .channel_open_direct_tcpip(host, u32::from(port), "127.0.0.1", 0)
            .await
        {
            Ok(channel) => channel,
            Err(e) => {
                let _ = session.close().await;
                return Err(TunnelError::Channel {
                    address: address.to_string(),
                    source: e,
                });
            }
        };

        debug!("Opened channel {:?} to {}, passing SSH connection", channel.id(), address);
        Ok(BoundConnection::new(channel.into_stream(), Box::new(session)))
    }
}

/// Split `host:port`, accepting bracketed IPv6 hosts.
pub fn split_host_port(address: &str) -> Result<(&str, u16), TunnelError> {
    let invalid = || TunnelError::InvalidAddress(address.to_string());

    let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(invalid());
    }
    let port = port.parse::<u16>().map_err(|_| invalid())?;
    Ok((host, port))
}
