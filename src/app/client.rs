//! App-side handle on a node connection

use super::frame::{
    app_frame, loop_addr_of, read_app_frame, write_app_frame, CloseLoop, CreateLoop, Data, Hello,
};
use crate::error::{ProtocolError, Result, SetupError, TransportError};
use crate::routing::{Addr, LoopAddr};
use std::collections::VecDeque;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// Something the node pushed to the app
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppEvent {
    /// A remote app opened a loop to this app
    LoopCreated(LoopAddr),
    /// Payload on a loop
    Data {
        /// Loop the payload arrived on
        loop_addr: LoopAddr,
        /// Bytes
        payload: Vec<u8>,
    },
    /// The loop is gone
    LoopClosed {
        /// The closed loop
        loop_addr: LoopAddr,
        /// Why it closed
        reason: String,
    },
}

/// Client end of an app connection
///
/// Events that arrive while [`create_loop`](Self::create_loop) waits for its
/// answer are queued and returned by later [`recv`](Self::recv) calls.
pub struct AppClient<S> {
    conn: S,
    next_request: u64,
    backlog: VecDeque<AppEvent>,
}

impl AppClient<TcpStream> {
    /// Connect to a node's app listener and bind `port` as `name`
    pub async fn connect(addr: SocketAddr, name: &str, version: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect(addr).await.map_err(TransportError::Io)?;
        stream.set_nodelay(true).map_err(TransportError::Io)?;

        let mut client = Self::new(stream);
        client
            .write(app_frame::Body::Hello(Hello {
                name: name.to_string(),
                version: version.to_string(),
                port: port as u32,
            }))
            .await?;
        Ok(client)
    }
}

impl<S> AppClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap a connection already bound by the node
    pub fn new(conn: S) -> Self {
        Self {
            conn,
            next_request: 1,
            backlog: VecDeque::new(),
        }
    }

    /// Open a loop to `remote` and wait for the node's answer
    pub async fn create_loop(&mut self, remote: Addr) -> Result<LoopAddr> {
        let request_id = self.next_request;
        self.next_request += 1;

        self.write(app_frame::Body::CreateLoop(CreateLoop {
            request_id,
            remote_pk: remote.pk.as_bytes().to_vec(),
            remote_port: remote.port as u32,
        }))
        .await?;

        loop {
            let body = self
                .read()
                .await?
                .ok_or(TransportError::ConnectionReset)?;
            match body {
                app_frame::Body::LoopConfirmed(c) if c.request_id == request_id => {
                    return loop_addr_of(&c.loop_ref);
                },
                app_frame::Body::LoopFailed(f) if f.request_id == request_id => {
                    return Err(SetupError::Rejected(f.reason).into());
                },
                other => {
                    if let Some(event) = to_event(other)? {
                        self.backlog.push_back(event);
                    }
                },
            }
        }
    }

    /// Send `payload` on a loop
    pub async fn send(&mut self, loop_addr: &LoopAddr, payload: &[u8]) -> Result<()> {
        self.write(app_frame::Body::Data(Data {
            loop_ref: Some((*loop_addr).into()),
            payload: payload.to_vec(),
        }))
        .await
    }

    /// Close a loop
    pub async fn close_loop(&mut self, loop_addr: &LoopAddr) -> Result<()> {
        self.write(app_frame::Body::CloseLoop(CloseLoop {
            loop_ref: Some((*loop_addr).into()),
        }))
        .await
    }

    /// Next event; `None` once the node hung up
    pub async fn recv(&mut self) -> Result<Option<AppEvent>> {
        if let Some(event) = self.backlog.pop_front() {
            return Ok(Some(event));
        }

        loop {
            let Some(body) = self.read().await? else {
                return Ok(None);
            };
            if let Some(event) = to_event(body)? {
                return Ok(Some(event));
            }
        }
    }

    async fn write(&mut self, body: app_frame::Body) -> Result<()> {
        write_app_frame(&mut self.conn, body).await
    }

    async fn read(&mut self) -> Result<Option<app_frame::Body>> {
        read_app_frame(&mut self.conn).await
    }
}

fn to_event(body: app_frame::Body) -> Result<Option<AppEvent>> {
    let event = match body {
        app_frame::Body::LoopCreated(c) => AppEvent::LoopCreated(loop_addr_of(&c.loop_ref)?),
        app_frame::Body::Data(d) => AppEvent::Data {
            loop_addr: loop_addr_of(&d.loop_ref)?,
            payload: d.payload,
        },
        app_frame::Body::LoopClosed(c) => AppEvent::LoopClosed {
            loop_addr: loop_addr_of(&c.loop_ref)?,
            reason: c.reason,
        },
        app_frame::Body::LoopFailed(f) => {
            // Answer to a create_loop that already gave up.
            debug!(request_id = f.request_id, reason = %f.reason, "Stale loop failure");
            return Ok(None);
        },
        app_frame::Body::LoopConfirmed(c) => {
            debug!(request_id = c.request_id, "Stale loop confirmation");
            return Ok(None);
        },
        app_frame::Body::Hello(_) | app_frame::Body::CreateLoop(_) | app_frame::Body::CloseLoop(_) => {
            return Err(
                ProtocolError::MalformedPacket("node sent an app-side frame".to_string()).into(),
            );
        },
    };
    Ok(Some(event))
}
