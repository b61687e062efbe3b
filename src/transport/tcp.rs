//! TCP transport factory
//!
//! Peers are identified through a [`PubKeyTable`]: dialing resolves the
//! remote key to an address, accepting resolves the caller's address back to
//! a key. Outbound sockets are bound to the listener's IP so the remote side
//! sees the same host it has in its own table.

use super::{BoxTransport, PubKeyTable, Transport, TransportFactory, TCP_TYPE};
use crate::crypto::PubKey;
use crate::error::{Result, TransportError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;
use tracing::{debug, warn};

/// [`TransportFactory`] over TCP
pub struct TcpFactory {
    local_pk: PubKey,
    table: Arc<dyn PubKeyTable>,
    listener: Mutex<Option<Arc<TcpListener>>>,
    local_addr: SocketAddr,
    closed: watch::Sender<bool>,
}

impl TcpFactory {
    /// Create a factory serving `listener`
    ///
    /// # Errors
    ///
    /// Fails if the listener's local address cannot be read.
    pub fn new(local_pk: PubKey, table: Arc<dyn PubKeyTable>, listener: TcpListener) -> Result<Self> {
        let local_addr = listener.local_addr().map_err(TransportError::Io)?;
        let (closed, _) = watch::channel(false);

        Ok(Self {
            local_pk,
            table,
            listener: Mutex::new(Some(Arc::new(listener))),
            local_addr,
            closed,
        })
    }

    /// Bind a listener on `addr` and create a factory for it
    pub async fn bind(local_pk: PubKey, table: Arc<dyn PubKeyTable>, addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::InvalidAddress {
                address: addr.to_string(),
                reason: e.to_string(),
            })?;
        Self::new(local_pk, table, listener)
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn current_listener(&self) -> Result<Arc<TcpListener>> {
        self.listener
            .lock()
            .as_ref()
            .cloned()
            .ok_or_else(|| TransportError::Closed.into())
    }
}

#[async_trait]
impl TransportFactory for TcpFactory {
    async fn accept(&self) -> Result<BoxTransport> {
        let listener = self.current_listener()?;
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(TransportError::Closed.into());
        }

        let (stream, raddr) = tokio::select! {
            res = listener.accept() => res.map_err(TransportError::Io)?,
            _ = closed.changed() => return Err(TransportError::Closed.into()),
        };

        let remote_pk = self.table.remote_pk(&raddr.to_string());
        if remote_pk.is_null() {
            // Dropping the stream closes the socket.
            warn!(%raddr, "Rejecting connection from unknown address");
            return Err(TransportError::UnknownRemoteAddr {
                address: raddr.to_string(),
            }
            .into());
        }

        debug!(%raddr, remote = %remote_pk, "Accepted TCP connection");
        Ok(Box::new(TcpTransport::new(stream, self.local_pk, remote_pk)))
    }

    async fn dial(&self, remote: PubKey) -> Result<BoxTransport> {
        if *self.closed.borrow() {
            return Err(TransportError::Closed.into());
        }

        let address = self.table.remote_addr(&remote);
        if address.is_empty() {
            return Err(TransportError::UnknownRemote.into());
        }

        let raddr = lookup_host(address.as_str())
            .await
            .map_err(|e| TransportError::InvalidAddress {
                address: address.clone(),
                reason: e.to_string(),
            })?
            .next()
            .ok_or_else(|| TransportError::InvalidAddress {
                address: address.clone(),
                reason: "no addresses resolved".to_string(),
            })?;

        let socket = if raddr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(TransportError::Io)?;

        let bind_ip = match (self.local_addr, raddr) {
            (SocketAddr::V4(l), SocketAddr::V4(_)) => SocketAddr::new((*l.ip()).into(), 0),
            (SocketAddr::V6(l), SocketAddr::V6(_)) => SocketAddr::new((*l.ip()).into(), 0),
            (_, r) if r.is_ipv4() => SocketAddr::from(([0, 0, 0, 0], 0)),
            _ => SocketAddr::from(([0u16; 8], 0)),
        };
        socket.bind(bind_ip).map_err(TransportError::Io)?;

        let stream = socket
            .connect(raddr)
            .await
            .map_err(|e| TransportError::ConnectionFailed {
                remote: address.clone(),
                reason: e.to_string(),
            })?;

        debug!(%raddr, remote = %remote, "Dialed TCP connection");
        Ok(Box::new(TcpTransport::new(stream, self.local_pk, remote)))
    }

    async fn close(&self) -> Result<()> {
        self.closed.send_replace(true);
        // The in-flight accept holds the last clone and drops it on return.
        self.listener.lock().take();
        Ok(())
    }

    fn local_pk(&self) -> PubKey {
        self.local_pk
    }

    fn transport_type(&self) -> &'static str {
        TCP_TYPE
    }
}

/// TCP stream tagged with both node identities
pub struct TcpTransport {
    stream: TcpStream,
    local_pk: PubKey,
    remote_pk: PubKey,
}

impl TcpTransport {
    /// Wrap an established stream
    pub fn new(stream: TcpStream, local_pk: PubKey, remote_pk: PubKey) -> Self {
        let _ = stream.set_nodelay(true);
        Self {
            stream,
            local_pk,
            remote_pk,
        }
    }

    /// Remote socket address
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }
}

impl Transport for TcpTransport {
    fn local_pk(&self) -> PubKey {
        self.local_pk
    }

    fn remote_pk(&self) -> PubKey {
        self.remote_pk
    }

    fn transport_type(&self) -> &'static str {
        TCP_TYPE
    }
}

impl AsyncRead for TcpTransport {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TcpTransport {
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
    use crate::transport::MemoryPubKeyTable;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;

    async fn factory_on_loopback(
        local: PubKey,
        peers: HashMap<PubKey, String>,
    ) -> TcpFactory {
        let table = Arc::new(MemoryPubKeyTable::new(peers).unwrap());
        TcpFactory::bind(local, table, "127.0.0.1:0").await.unwrap()
    }

    #[tokio::test]
    async fn test_dial_unknown_remote() {
        let local = KeyPair::generate().pub_key();
        let factory = factory_on_loopback(local, HashMap::new()).await;

        let err = factory.dial(KeyPair::generate().pub_key()).await.err().unwrap();
        assert!(matches!(
            err,
            MeshwireError::Transport(TransportError::UnknownRemote)
        ));
        assert_eq!(err.to_string(), "unknown remote");
    }

    #[tokio::test]
    async fn test_round_trip_over_loopback() {
        let a = KeyPair::generate().pub_key();
        let b = KeyPair::generate().pub_key();

        let b_table = Arc::new(
            MemoryPubKeyTable::new(HashMap::from([(a, "127.0.0.1:1".to_string())])).unwrap(),
        );
        let fb = TcpFactory::bind(b, b_table, "127.0.0.1:0").await.unwrap();
        let fa = factory_on_loopback(a, HashMap::from([(b, fb.local_addr().to_string())])).await;

        let accept = tokio::spawn(async move {
            let t = fb.accept().await;
            (fb, t)
        });

        let mut outbound = timeout(Duration::from_secs(5), fa.dial(b)).await.unwrap().unwrap();
        let (_fb, inbound) = timeout(Duration::from_secs(5), accept).await.unwrap().unwrap();
        let mut inbound = inbound.unwrap();

        assert_eq!(outbound.remote_pk(), b);
        assert_eq!(inbound.remote_pk(), a);
        assert_eq!(inbound.transport_type(), TCP_TYPE);

        outbound.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        inbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_accept_rejects_unknown_address() {
        let b = KeyPair::generate().pub_key();
        let fb = factory_on_loopback(b, HashMap::new()).await;
        let addr = fb.local_addr();

        let accept = tokio::spawn(async move { fb.accept().await.err() });
        let _conn = TcpStream::connect(addr).await.unwrap();

        let err = timeout(Duration::from_secs(5), accept).await.unwrap().unwrap().unwrap();
        assert!(matches!(
            err,
            MeshwireError::Transport(TransportError::UnknownRemoteAddr { .. })
        ));
    }

    #[tokio::test]
    async fn test_close_unblocks_accept() {
        let b = KeyPair::generate().pub_key();
        let fb = Arc::new(factory_on_loopback(b, HashMap::new()).await);

        let accepting = fb.clone();
        let accept = tokio::spawn(async move { accepting.accept().await.err() });
        tokio::time::sleep(Duration::from_millis(20)).await;

        fb.close().await.unwrap();
        let err = timeout(Duration::from_secs(5), accept).await.unwrap().unwrap().unwrap();
        assert!(matches!(err, MeshwireError::Transport(TransportError::Closed)));

        // Closing twice is fine and accept keeps reporting closed.
        fb.close().await.unwrap();
        assert!(fb.accept().await.is_err());
    }
}
