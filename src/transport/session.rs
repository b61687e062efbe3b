//! Authenticated, encrypted session over a raw transport
//!
//! Both ends send one handshake frame: an ephemeral X25519 key followed by an
//! Ed25519 signature over that key and both identities. A peer that cannot
//! sign for the key the factory resolved is rejected. After the handshake
//! every frame is sealed with the direction's [`FrameCipher`] and sent with a
//! 4-byte big-endian length prefix.
//!
//! Outgoing frames go through a bounded queue to one writer task per
//! session. Only that task seals and writes, so a caller that gives up on
//! [`ManagedTransport::write_frame`] never leaves a half-written frame or a
//! skipped nonce behind.

use super::{BoxTransport, TransportEntry, TransportId};
use crate::crypto::encryption::TAG_LEN;
use crate::crypto::{
    sign_message, verify_signature, EphemeralKey, FrameCipher, KeyPair, PubKey, Signature,
    SIGNATURE_LEN,
};
use crate::error::{CryptoError, Result, TransportError};
use crate::shutdown::stopped;
use parking_lot::Mutex as SyncMutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Maximum plaintext frame size (1 MiB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

const HANDSHAKE_CONTEXT: &[u8] = b"meshwire-session-v1";
const HELLO_LEN: usize = 32 + SIGNATURE_LEN;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Frames accepted for sending before `write_frame` waits
pub const WRITE_QUEUE_DEPTH: usize = 16;

/// Which side opened the link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkDirection {
    /// Remote dialed us
    Inbound,
    /// We dialed the remote
    Outbound,
}

struct ReadState {
    half: ReadHalf<BoxTransport>,
    cipher: FrameCipher,
}

struct WriteState {
    half: WriteHalf<BoxTransport>,
    cipher: FrameCipher,
}

impl WriteState {
    /// Drain `queue` until the session closes or a write fails
    ///
    /// Frames queued before a close are still flushed, within
    /// [`SHUTDOWN_GRACE`].
    async fn run(
        mut self,
        mut queue: mpsc::Receiver<Vec<u8>>,
        closed: Arc<watch::Sender<bool>>,
        remote: PubKey,
    ) {
        let mut stop = closed.subscribe();
        let mut healthy = true;
        loop {
            let payload = tokio::select! {
                _ = stopped(&mut stop) => break,
                next = queue.recv() => match next {
                    Some(payload) => payload,
                    None => break,
                },
            };

            let write = self.seal_and_send(&payload);
            tokio::pin!(write);
            let res = tokio::select! {
                res = &mut write => res,
                _ = stopped(&mut stop) => match tokio::time::timeout(SHUTDOWN_GRACE, write).await {
                    Ok(res) => res,
                    Err(_) => Err(TransportError::Timeout.into()),
                },
            };
            if let Err(e) = res {
                debug!(remote = %remote, error = %e, "Session write failed");
                healthy = false;
                break;
            }
            trace!(remote = %remote, len = payload.len(), "Frame sent");
        }

        // A failed write leaves the stream unusable.
        closed.send_replace(true);

        if healthy {
            queue.close();
            let flush = async {
                while let Some(payload) = queue.recv().await {
                    if self.seal_and_send(&payload).await.is_err() {
                        break;
                    }
                }
            };
            if tokio::time::timeout(SHUTDOWN_GRACE, flush).await.is_err() {
                warn!(remote = %remote, "Dropped frames queued before close");
            }
        }
        // Ignore errors during shutdown
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, self.half.shutdown()).await;
    }

    async fn seal_and_send(&mut self, payload: &[u8]) -> Result<()> {
        let sealed = self.cipher.seal(payload)?;
        send_framed_message(&mut self.half, &sealed).await
    }
}

/// A live, authenticated link to a peer
///
/// Owned by the [`TransportManager`](super::TransportManager). Other
/// components hold an `Arc` to send and receive but never close it.
pub struct ManagedTransport {
    entry: TransportEntry,
    local_pk: PubKey,
    remote_pk: PubKey,
    transport_type: &'static str,
    direction: LinkDirection,
    reader: Mutex<ReadState>,
    outbox: mpsc::Sender<Vec<u8>>,
    writer_task: SyncMutex<Option<JoinHandle<()>>>,
    closed: Arc<watch::Sender<bool>>,
    created_at: Instant,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl ManagedTransport {
    /// Run the session handshake over `raw`
    ///
    /// Callers bound this with a timeout; the handshake itself waits as long
    /// as the raw stream does.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::HandshakeFailed`] if the peer's hello is
    /// malformed or not signed by the expected key.
    pub async fn establish(
        raw: BoxTransport,
        keys: &KeyPair,
        direction: LinkDirection,
        public: bool,
    ) -> Result<Self> {
        let local_pk = keys.pub_key();
        let remote_pk = raw.remote_pk();
        let transport_type = raw.transport_type();

        if raw.local_pk() != local_pk {
            return Err(CryptoError::HandshakeFailed {
                reason: "raw transport belongs to another identity".to_string(),
            }
            .into());
        }

        let ephemeral = EphemeralKey::generate();
        let local_eph = ephemeral.public_bytes();
        let signature = sign_message(
            keys.sec_key(),
            &signed_hello(&local_eph, &local_pk, &remote_pk),
        );

        let mut hello = Vec::with_capacity(HELLO_LEN);
        hello.extend_from_slice(&local_eph);
        hello.extend_from_slice(&signature.to_bytes());

        let (mut read_half, mut write_half) = tokio::io::split(raw);
        let (_, remote_hello) = tokio::try_join!(
            send_framed_message(&mut write_half, &hello),
            receive_framed_message(&mut read_half, HELLO_LEN),
        )?;

        if remote_hello.len() != HELLO_LEN {
            return Err(CryptoError::HandshakeFailed {
                reason: format!("hello of {} bytes", remote_hello.len()),
            }
            .into());
        }

        let mut remote_eph = [0u8; 32];
        remote_eph.copy_from_slice(&remote_hello[..32]);
        let mut sig_bytes = [0u8; SIGNATURE_LEN];
        sig_bytes.copy_from_slice(&remote_hello[32..]);

        verify_signature(
            &remote_pk,
            &signed_hello(&remote_eph, &remote_pk, &local_pk),
            &Signature::from_bytes(&sig_bytes),
        )
        .map_err(|e| CryptoError::HandshakeFailed {
            reason: format!("peer failed to prove {}: {}", remote_pk, e),
        })?;

        let initiator = direction == LinkDirection::Outbound;
        let transcript = if initiator {
            transcript(&local_pk, &remote_pk, &local_eph, &remote_eph)
        } else {
            transcript(&remote_pk, &local_pk, &remote_eph, &local_eph)
        };
        let (send, recv) = ephemeral.into_session(remote_eph, &transcript, initiator)?;

        let closed = Arc::new(watch::channel(false).0);
        let (outbox, queue) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let writer = WriteState {
            half: write_half,
            cipher: send,
        };
        let writer_task = tokio::spawn(writer.run(queue, closed.clone(), remote_pk));

        debug!(remote = %remote_pk, transport_type, ?direction, "Session established");

        Ok(Self {
            entry: TransportEntry::new(local_pk, remote_pk, transport_type, public),
            local_pk,
            remote_pk,
            transport_type,
            direction,
            reader: Mutex::new(ReadState {
                half: read_half,
                cipher: recv,
            }),
            outbox,
            writer_task: SyncMutex::new(Some(writer_task)),
            closed,
            created_at: Instant::now(),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        })
    }

    /// Queue one frame for sending
    ///
    /// Waits while the queue is full, which happens once the peer stops
    /// reading. Cancelling the call before it returns drops the frame
    /// whole. Returns [`TransportError::Closed`] promptly once the session is
    /// closed.
    pub async fn write_frame(&self, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_FRAME_SIZE {
            return Err(TransportError::FrameTooLarge {
                size: payload.len(),
                max: MAX_FRAME_SIZE,
            }
            .into());
        }

        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(TransportError::Closed.into());
        }

        tokio::select! {
            res = self.outbox.send(payload.to_vec()) => {
                res.map_err(|_| TransportError::Closed)?;
            },
            _ = stopped(&mut closed) => return Err(TransportError::Closed.into()),
        }

        let written = payload.len() + TAG_LEN + 4;
        self.bytes_sent.fetch_add(written as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Receive and open one frame
    pub async fn read_frame(&self) -> Result<Vec<u8>> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(TransportError::Closed.into());
        }

        let read = async {
            let mut state = self.reader.lock().await;
            let sealed =
                receive_framed_message(&mut state.half, MAX_FRAME_SIZE + TAG_LEN).await?;
            let len = sealed.len() + 4;
            Ok::<_, crate::error::MeshwireError>((state.cipher.open(&sealed)?, len))
        };

        let (frame, len) = tokio::select! {
            res = read => res?,
            _ = stopped(&mut closed) => return Err(TransportError::Closed.into()),
        };

        self.bytes_received.fetch_add(len as u64, Ordering::Relaxed);
        Ok(frame)
    }

    /// Close the session
    ///
    /// Pending reads and writes return [`TransportError::Closed`]. Calling
    /// close again is a no-op.
    pub async fn close(&self) -> Result<()> {
        if self.closed.send_replace(true) {
            return Ok(());
        }

        let writer = self.writer_task.lock().take();
        if let Some(writer) = writer {
            let _ = tokio::time::timeout(SHUTDOWN_GRACE * 3, writer).await;
        }

        debug!(remote = %self.remote_pk, id = %self.entry.id, "Session closed");
        Ok(())
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the session is closed
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        // The sender lives as long as self, so wait_for only fails after drop.
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Transport id shared by both ends
    pub fn id(&self) -> TransportId {
        self.entry.id
    }

    /// Discovery descriptor
    pub fn entry(&self) -> &TransportEntry {
        &self.entry
    }

    /// Key of the local node
    pub fn local_pk(&self) -> PubKey {
        self.local_pk
    }

    /// Key of the remote node
    pub fn remote_pk(&self) -> PubKey {
        self.remote_pk
    }

    /// Link type name
    pub fn transport_type(&self) -> &'static str {
        self.transport_type
    }

    /// Which side dialed
    pub fn direction(&self) -> LinkDirection {
        self.direction
    }

    /// Key of the node that dialed this link
    pub fn initiator(&self) -> PubKey {
        match self.direction {
            LinkDirection::Outbound => self.local_pk,
            LinkDirection::Inbound => self.remote_pk,
        }
    }

    /// Total bytes queued for sending, framing included
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Total bytes read, framing included
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Time since establishment
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

impl std::fmt::Debug for ManagedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedTransport")
            .field("id", &self.entry.id)
            .field("remote_pk", &self.remote_pk)
            .field("type", &self.transport_type)
            .field("direction", &self.direction)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn signed_hello(eph: &[u8; 32], signer: &PubKey, peer: &PubKey) -> Vec<u8> {
    let mut msg = Vec::with_capacity(HANDSHAKE_CONTEXT.len() + 96);
    msg.extend_from_slice(HANDSHAKE_CONTEXT);
    msg.extend_from_slice(eph);
    msg.extend_from_slice(signer.as_bytes());
    msg.extend_from_slice(peer.as_bytes());
    msg
}

fn transcript(initiator: &PubKey, responder: &PubKey, i_eph: &[u8; 32], r_eph: &[u8; 32]) -> Vec<u8> {
    let mut t = Vec::with_capacity(128);
    t.extend_from_slice(initiator.as_bytes());
    t.extend_from_slice(responder.as_bytes());
    t.extend_from_slice(i_eph);
    t.extend_from_slice(r_eph);
    t
}

/// Send a framed message (length prefix + data)
pub(crate) async fn send_framed_message<S>(stream: &mut S, message: &[u8]) -> Result<()>
where
    S: AsyncWriteExt + Unpin,
{
    let len = u32::try_from(message.len()).map_err(|_| TransportError::FrameTooLarge {
        size: message.len(),
        max: u32::MAX as usize,
    })?;

    stream
        .write_all(&len.to_be_bytes())
        .await
        .map_err(TransportError::Io)?;
    stream.write_all(message).await.map_err(TransportError::Io)?;
    stream.flush().await.map_err(TransportError::Io)?;

    Ok(())
}

/// Receive a framed message (length prefix + data)
pub(crate) async fn receive_framed_message<S>(stream: &mut S, max: usize) -> Result<Vec<u8>>
where
    S: AsyncReadExt + Unpin,
{
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await.map_err(map_read_error)?;

    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > max {
        return Err(TransportError::FrameTooLarge { size: len, max }.into());
    }

    let mut message = vec![0u8; len];
    stream.read_exact(&mut message).await.map_err(map_read_error)?;

    Ok(message)
}

fn map_read_error(e: std::io::Error) -> TransportError {
    match e.kind() {
        std::io::ErrorKind::UnexpectedEof
        | std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::BrokenPipe => TransportError::ConnectionReset,
        _ => TransportError::Io(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MeshwireError;
    use crate::transport::{PipeNetwork, TransportFactory};
    use std::sync::Arc;
    use tokio::time::timeout;

    async fn session_pair() -> (ManagedTransport, ManagedTransport) {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let network = PipeNetwork::new();
        let fa = network.factory(a.pub_key());
        let fb = network.factory(b.pub_key());

        let raw_out = fa.dial(b.pub_key()).await.unwrap();
        let raw_in = fb.accept().await.unwrap();

        let (out, inc) = tokio::join!(
            ManagedTransport::establish(raw_out, &a, LinkDirection::Outbound, true),
            ManagedTransport::establish(raw_in, &b, LinkDirection::Inbound, true),
        );
        (out.unwrap(), inc.unwrap())
    }

    #[tokio::test]
    async fn test_frames_both_ways() {
        let (a, b) = session_pair().await;

        assert_eq!(a.id(), b.id());
        assert_eq!(a.initiator(), b.initiator());
        assert_eq!(a.initiator(), a.local_pk());

        a.write_frame(b"ping").await.unwrap();
        assert_eq!(b.read_frame().await.unwrap(), b"ping");

        b.write_frame(b"pong").await.unwrap();
        assert_eq!(a.read_frame().await.unwrap(), b"pong");

        assert!(a.bytes_sent() > 4);
        assert_eq!(a.bytes_sent(), b.bytes_received());
    }

    #[tokio::test]
    async fn test_impersonation_rejected() {
        let a = KeyPair::generate();
        let (a_pk, b_pk) = (a.pub_key(), KeyPair::generate().pub_key());
        let mallory = KeyPair::generate();

        // Mallory answers for B's key on the pipe network.
        let network = PipeNetwork::new();
        let fa = network.factory(a_pk);
        let fm = network.factory(b_pk);

        let raw_out = fa.dial(b_pk).await.unwrap();
        let raw_in = fm.accept().await.unwrap();

        let forger = tokio::spawn(async move {
            let (mut r, mut w) = tokio::io::split(raw_in);
            let eph = EphemeralKey::generate().public_bytes();
            let sig = sign_message(mallory.sec_key(), &signed_hello(&eph, &b_pk, &a_pk));
            let mut hello = eph.to_vec();
            hello.extend_from_slice(&sig.to_bytes());
            send_framed_message(&mut w, &hello).await.unwrap();
            let _ = receive_framed_message(&mut r, HELLO_LEN).await;
        });

        let err = timeout(
            Duration::from_secs(1),
            ManagedTransport::establish(raw_out, &a, LinkDirection::Outbound, false),
        )
        .await
        .unwrap()
        .err()
        .unwrap();
        assert!(matches!(
            err,
            MeshwireError::Crypto(CryptoError::HandshakeFailed { .. })
        ));
        forger.abort();
    }

    #[tokio::test]
    async fn test_wrong_local_identity_rejected() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let (fa, _fb) = crate::transport::PipeFactory::pair(a.pub_key(), b.pub_key());

        let raw = fa.dial(b.pub_key()).await.unwrap();
        let result =
            ManagedTransport::establish(raw, &KeyPair::generate(), LinkDirection::Outbound, false).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_close_unblocks_reader() {
        let (a, _b) = session_pair().await;
        let a = Arc::new(a);

        let reader = a.clone();
        let pending = tokio::spawn(async move { reader.read_frame().await.err() });
        tokio::time::sleep(Duration::from_millis(10)).await;

        a.close().await.unwrap();
        let err = timeout(Duration::from_secs(1), pending).await.unwrap().unwrap().unwrap();
        assert!(matches!(err, MeshwireError::Transport(TransportError::Closed)));

        assert!(a.is_closed());
        a.close().await.unwrap();
        assert!(a.write_frame(b"late").await.is_err());
    }

    #[tokio::test]
    async fn test_peer_sees_reset_after_close() {
        let (a, b) = session_pair().await;
        a.close().await.unwrap();

        let err = timeout(Duration::from_secs(1), b.read_frame()).await.unwrap().err().unwrap();
        assert!(matches!(
            err,
            MeshwireError::Transport(TransportError::ConnectionReset)
        ));
    }

    #[tokio::test]
    async fn test_abandoned_write_keeps_stream_in_sync() {
        const FRAME: usize = 256 * 1024;
        let (a, b) = session_pair().await;

        // Fill the pipe and the queue while the peer is not reading, until a
        // bounded write gives up.
        let mut queued = 0u8;
        loop {
            match timeout(Duration::from_millis(100), a.write_frame(&vec![queued; FRAME])).await {
                Ok(res) => {
                    res.unwrap();
                    queued += 1;
                },
                Err(_) => break,
            }
            assert!(queued < 100, "writes never waited");
        }

        let a = Arc::new(a);
        let writer = a.clone();
        let after = tokio::spawn(async move { writer.write_frame(b"after").await });

        for i in 0..queued {
            let frame = timeout(Duration::from_secs(2), b.read_frame()).await.unwrap().unwrap();
            assert_eq!(frame.len(), FRAME);
            assert!(frame.iter().all(|&x| x == i));
        }
        let last = timeout(Duration::from_secs(2), b.read_frame()).await.unwrap().unwrap();
        assert_eq!(last, b"after");
        after.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (a, _b) = session_pair().await;
        let big = vec![0u8; MAX_FRAME_SIZE + 1];
        let err = a.write_frame(&big).await.err().unwrap();
        assert!(matches!(
            err,
            MeshwireError::Transport(TransportError::FrameTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_message_framing() {
        let message_bytes = b"Hello, mesh!";
        let mut buffer = Vec::new();

        send_framed_message(&mut buffer, message_bytes).await.unwrap();
        assert_eq!(buffer.len(), 4 + message_bytes.len());
        assert_eq!(&buffer[0..4], &(message_bytes.len() as u32).to_be_bytes());

        let mut cursor = &buffer[..];
        let received = receive_framed_message(&mut cursor, 64).await.unwrap();
        assert_eq!(received, message_bytes);
    }

    #[tokio::test]
    async fn test_message_framing_oversized_prefix() {
        let mut buffer = 1000u32.to_be_bytes().to_vec();
        buffer.extend_from_slice(&[0u8; 100]);

        let mut cursor = &buffer[..];
        let err = receive_framed_message(&mut cursor, 64).await.err().unwrap();
        assert!(matches!(
            err,
            MeshwireError::Transport(TransportError::FrameTooLarge { size: 1000, max: 64 })
        ));
    }

    #[tokio::test]
    async fn test_truncated_stream_is_reset() {
        let buffer = 10u32.to_be_bytes().to_vec();
        let mut cursor = &buffer[..];
        let err = receive_framed_message(&mut cursor, 64).await.err().unwrap();
        assert!(matches!(
            err,
            MeshwireError::Transport(TransportError::ConnectionReset)
        ));
    }
}
