//! Transport connections bound to the SSH session that produced them.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use log::debug;
use russh::{client, Disconnect};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::error::TunnelError;

use super::handler::ClientHandler;

/// Something that can tear down an SSH session.
#[async_trait]
pub trait SessionHandle: Send + Sync + 'static {
    async fn close(&self) -> Result<(), TunnelError>;
}

#[async_trait]
impl SessionHandle for client::Handle<ClientHandler> {
    async fn close(&self) -> Result<(), TunnelError> {
        self.disconnect(Disconnect::ByApplication, "", "English")
            .await?;
        Ok(())
    }
}

/// A stream that owns the SSH session it was opened on.
///
/// Closing the connection (`close`, or dropping it) closes the session
/// exactly once. `AsyncWrite::poll_shutdown` only half-closes the stream so
/// relays can propagate EOF while the other direction is still running.
pub struct BoundConnection<T> {
    stream: T,
    session: Option<Box<dyn SessionHandle>>,
}

impl<T> BoundConnection<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: T, session: Box<dyn SessionHandle>) -> Self {
        Self {
            stream,
            session: Some(session),
        }
    }

    /// Shut the stream down, then close the session regardless of how that
    /// went. The session's own close error is swallowed; the stream's error
    /// is what the caller gets back.
    pub async fn close(mut self) -> io::Result<()> {
        debug!("Connection received close");
        let result = self.stream.shutdown().await;
        if let Some(session) = self.session.take() {
            if let Err(e) = session.close().await {
                debug!("Ignoring SSH session close error: {}", e);
            }
        }
        result
    }
}

impl<T> Drop for BoundConnection<T> {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = session.close().await {
                        debug!("Ignoring SSH session close error: {}", e);
                    }
                });
            }
            // Dropping the handle ends the session once its task notices.
            Err(_) => debug!("No runtime to close SSH session on, dropping handle"),
        }
    }
}

impl<T> AsyncRead for BoundConnection<T>
where
    T: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl<T> AsyncWrite for BoundConnection<T>
where
    T: AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.stream.is_write_vectored()
    }
}
