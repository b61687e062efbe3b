//! In-memory transports
//!
//! A [`PipeNetwork`] connects any number of [`PipeFactory`] instances through
//! `tokio::io::duplex` streams. It gives the manager a second link type to
//! multiplex and lets whole meshes run inside one test process.

use super::{BoxTransport, Transport, TransportFactory, PIPE_TYPE};
use crate::crypto::PubKey;
use crate::error::{Result, TransportError};
use async_trait::async_trait;
use dashmap::DashMap;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::debug;

const PIPE_BUFFER: usize = 64 * 1024;
const ACCEPT_BACKLOG: usize = 16;

/// Shared switchboard for pipe factories
#[derive(Clone, Default)]
pub struct PipeNetwork {
    listeners: Arc<DashMap<PubKey, mpsc::Sender<PipeTransport>>>,
}

impl PipeNetwork {
    /// Create an empty network
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node and return its factory
    ///
    /// Attaching the same key again replaces the previous listener.
    pub fn factory(&self, local_pk: PubKey) -> PipeFactory {
        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        self.listeners.insert(local_pk, tx.clone());
        let (closed, _) = watch::channel(false);

        PipeFactory {
            local_pk,
            network: self.clone(),
            registration: tx,
            inbound: Mutex::new(rx),
            closed,
        }
    }

    /// Number of attached nodes
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    /// Whether no node is attached
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

/// [`TransportFactory`] over a [`PipeNetwork`]
pub struct PipeFactory {
    local_pk: PubKey,
    network: PipeNetwork,
    // Compared on close so a newer registration of the same key survives.
    registration: mpsc::Sender<PipeTransport>,
    inbound: Mutex<mpsc::Receiver<PipeTransport>>,
    closed: watch::Sender<bool>,
}

impl PipeFactory {
    /// Two factories connected to each other
    ///
    /// # Example
    ///
    /// ```
    /// use meshwire::crypto::KeyPair;
    /// use meshwire::transport::{PipeFactory, TransportFactory};
    ///
    /// let (a, b) = PipeFactory::pair(KeyPair::generate().pub_key(), KeyPair::generate().pub_key());
    /// assert_eq!(a.transport_type(), "pipe");
    /// assert_ne!(a.local_pk(), b.local_pk());
    /// ```
    pub fn pair(a: PubKey, b: PubKey) -> (Self, Self) {
        let network = PipeNetwork::new();
        (network.factory(a), network.factory(b))
    }
}

#[async_trait]
impl TransportFactory for PipeFactory {
    async fn accept(&self) -> Result<BoxTransport> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(TransportError::Closed.into());
        }

        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            transport = inbound.recv() => match transport {
                Some(t) => Ok(Box::new(t) as BoxTransport),
                None => Err(TransportError::Closed.into()),
            },
            _ = closed.changed() => Err(TransportError::Closed.into()),
        }
    }

    async fn dial(&self, remote: PubKey) -> Result<BoxTransport> {
        if *self.closed.borrow() {
            return Err(TransportError::Closed.into());
        }

        let listener = self
            .network
            .listeners
            .get(&remote)
            .map(|entry| entry.value().clone())
            .ok_or(TransportError::UnknownRemote)?;

        let (near, far) = tokio::io::duplex(PIPE_BUFFER);
        listener
            .send(PipeTransport {
                stream: far,
                local_pk: remote,
                remote_pk: self.local_pk,
            })
            .await
            .map_err(|_| TransportError::ConnectionFailed {
                remote: remote.to_string(),
                reason: "listener is gone".to_string(),
            })?;

        debug!(remote = %remote, "Dialed pipe transport");
        Ok(Box::new(PipeTransport {
            stream: near,
            local_pk: self.local_pk,
            remote_pk: remote,
        }))
    }

    async fn close(&self) -> Result<()> {
        self.closed.send_replace(true);
        self.network
            .listeners
            .remove_if(&self.local_pk, |_, tx| tx.same_channel(&self.registration));
        Ok(())
    }

    fn local_pk(&self) -> PubKey {
        self.local_pk
    }

    fn transport_type(&self) -> &'static str {
        PIPE_TYPE
    }
}

/// One end of an in-memory link
pub struct PipeTransport {
    stream: DuplexStream,
    local_pk: PubKey,
    remote_pk: PubKey,
}

impl Transport for PipeTransport {
    fn local_pk(&self) -> PubKey {
        self.local_pk
    }

    fn remote_pk(&self) -> PubKey {
        self.remote_pk
    }

    fn transport_type(&self) -> &'static str {
        PIPE_TYPE
    }
}

impl AsyncRead for PipeTransport {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for PipeTransport {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::error::MeshwireError;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_pair_dial_and_accept() {
        let a = KeyPair::generate().pub_key();
        let b = KeyPair::generate().pub_key();
        let (fa, fb) = PipeFactory::pair(a, b);

        let mut out = fa.dial(b).await.unwrap();
        let mut inc = timeout(Duration::from_secs(1), fb.accept()).await.unwrap().unwrap();

        assert_eq!(out.local_pk(), a);
        assert_eq!(out.remote_pk(), b);
        assert_eq!(inc.local_pk(), b);
        assert_eq!(inc.remote_pk(), a);

        out.write_all(b"abc").await.unwrap();
        let mut buf = [0u8; 3];
        inc.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abc");
    }

    #[tokio::test]
    async fn test_dial_unattached_key() {
        let (fa, _fb) = PipeFactory::pair(KeyPair::generate().pub_key(), KeyPair::generate().pub_key());
        let err = fa.dial(KeyPair::generate().pub_key()).await.err().unwrap();
        assert!(matches!(err, MeshwireError::Transport(TransportError::UnknownRemote)));
    }

    #[tokio::test]
    async fn test_close_unblocks_accept_and_detaches() {
        let network = PipeNetwork::new();
        let a = KeyPair::generate().pub_key();
        let b = KeyPair::generate().pub_key();
        let fa = network.factory(a);
        let fb = Arc::new(network.factory(b));

        let accepting = fb.clone();
        let pending = tokio::spawn(async move { accepting.accept().await.is_err() });
        tokio::time::sleep(Duration::from_millis(10)).await;

        fb.close().await.unwrap();
        assert!(timeout(Duration::from_secs(1), pending).await.unwrap().unwrap());
        assert_eq!(network.len(), 1);
        assert!(fa.dial(b).await.is_err());

        fb.close().await.unwrap();
    }
}
