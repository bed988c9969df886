//! Raw TCP relay: every local connection is piped to the remote port over
//! its own SSH session.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

use crate::error::TunnelError;
use crate::ssh::Dialer;
use crate::tunnel::Tunneler;

pub struct TcpRelay<D> {
    dialer: Arc<D>,
    local_port: u16,
    remote_port: u16,
}

impl<D: Dialer> TcpRelay<D> {
    pub fn new(dialer: Arc<D>, local_port: u16, remote_port: u16) -> Self {
        Self {
            dialer,
            local_port,
            remote_port,
        }
    }

    /// Address dialed on the far side of the SSH session.
    fn remote_address(&self) -> String {
        format!("localhost:{}", self.remote_port)
    }

    /// Accept connections from `listener` until accepting fails.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), TunnelError> {
        loop {
            let (stream, peer_addr) = listener.accept().await.map_err(|e| {
                error!("Couldn't accept connection: {}", e);
                TunnelError::Accept(e)
            })?;
            let dialer = self.dialer.clone();
            let address = self.remote_address();

            tokio::spawn(async move {
                debug!("TCP connection from {}", peer_addr);
                relay_connection(stream, dialer, address).await;
            });
        }
    }
}

#[async_trait]
impl<D: Dialer> Tunneler for TcpRelay<D> {
    async fn tunnel(&self) -> Result<(), TunnelError> {
        let listener = TcpListener::bind(("0.0.0.0", self.local_port))
            .await
            .map_err(|e| {
                error!("Could not start listener: {}", e);
                TunnelError::Listen {
                    port: self.local_port,
                    source: e,
                }
            })?;
        info!(
            "TCP relay listening on port {} -> {}",
            self.local_port,
            self.remote_address()
        );

        self.serve(listener).await
    }
}

/// Pipe one local connection to the remote side.
///
/// EOF from the local client is forwarded as a write shutdown on the channel
/// and the remote keeps answering until it is done. Once the remote side is
/// finished, or either direction fails, both ends are dropped and the SSH
/// session with them, whether or not the client still holds its socket.
async fn relay_connection<D: Dialer>(mut local: TcpStream, dialer: Arc<D>, address: String) {
    let remote = match dialer.dial("tcp", &address).await {
        Ok(conn) => conn,
        Err(e) => {
            warn!("Could not dial remote server: {}", e);
            let _ = local.shutdown().await;
            return;
        }
    };

    let (mut local_rd, mut local_wr) = local.split();
    let (mut remote_rd, mut remote_wr) = tokio::io::split(remote);

    let to_remote = async {
        let n = tokio::io::copy(&mut local_rd, &mut remote_wr).await?;
        remote_wr.shutdown().await?;
        Ok::<_, io::Error>(n)
    };
    let to_local = async {
        let n = tokio::io::copy(&mut remote_rd, &mut local_wr).await?;
        local_wr.shutdown().await?;
        Ok::<_, io::Error>(n)
    };
    tokio::pin!(to_remote, to_local);

    let mut sent = None;
    let outcome = loop {
        tokio::select! {
            result = &mut to_remote, if sent.is_none() => match result {
                Ok(n) => {
                    debug!("[{}] Local side finished sending after {} bytes", address, n);
                    sent = Some(n);
                }
                Err(e) => break Err(e),
            },
            result = &mut to_local => break result,
        }
    };

    match outcome {
        Ok(received) => {
            debug!(
                "[{}] Connection completed: {} bytes to remote, {} bytes to local",
                address,
                sent.map_or_else(|| "unfinished".to_string(), |n| n.to_string()),
                received
            );
        }
        Err(e) => {
            debug!("[{}] Copy error (may be normal on close): {}", address, e);
        }
    }
}
