//! TCP transport shared by every service.
//!
//! Each socket gets a reader task and a writer task. Readers reassemble
//! frames and push them onto the owning service's event queue; writers drain
//! a per-connection outgoing queue. Services never touch sockets directly.

use log::{debug, error, info, warn};
use shared::{encode_frame, FrameDecoder};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Work queued for a connection's writer task
#[derive(Debug)]
pub enum Outgoing {
    Frame(Vec<u8>),
    Close,
}

/// Messages sent from connection tasks to a service's main loop
#[derive(Debug)]
pub enum NetworkEvent {
    Connected { handle: ConnectionHandle },
    Frame { id: ConnectionId, bytes: Vec<u8> },
    Disconnected { id: ConnectionId },
}

/// Sending half of a connection, cheap to clone.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    peer: SocketAddr,
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, peer: SocketAddr, tx: mpsc::UnboundedSender<Outgoing>) -> Self {
        Self { id, peer, tx }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Queues a datagram. Returns false once the writer task is gone.
    pub fn send(&self, bytes: Vec<u8>) -> bool {
        self.tx.send(Outgoing::Frame(bytes)).is_ok()
    }

    /// Flushes what is queued, then closes the socket.
    pub fn close(&self) {
        let _ = self.tx.send(Outgoing::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Reads frames until EOF or error, then reports the disconnect.
pub async fn read_frames<R>(id: ConnectionId, mut reader: R, events: mpsc::UnboundedSender<NetworkEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut decoder = FrameDecoder::new();
    let mut buffer = [0u8; 4096];

    loop {
        match reader.read(&mut buffer).await {
            Ok(0) => {
                debug!("Connection {} reached EOF", id);
                break;
            }
            Ok(len) => {
                decoder.extend(&buffer[..len]);
                while let Some(bytes) = decoder.next_frame() {
                    if events.send(NetworkEvent::Frame { id, bytes }).is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                warn!("Read error on connection {}: {}", id, e);
                break;
            }
        }
    }

    if decoder.buffered() > 0 {
        debug!(
            "Connection {} closed with {} bytes of a partial frame",
            id,
            decoder.buffered()
        );
    }
    let _ = events.send(NetworkEvent::Disconnected { id });
}

/// Writes queued frames until the queue closes or `Outgoing::Close` arrives.
pub async fn write_frames<W>(id: ConnectionId, mut writer: W, mut outgoing: mpsc::UnboundedReceiver<Outgoing>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = outgoing.recv().await {
        match message {
            Outgoing::Frame(bytes) => {
                let frame = match encode_frame(&bytes) {
                    Ok(frame) => frame,
                    Err(e) => {
                        error!("Dropping datagram for connection {}: {}", id, e);
                        continue;
                    }
                };
                if let Err(e) = writer.write_all(&frame).await {
                    error!("Failed to write to connection {}: {}", id, e);
                    break;
                }
            }
            Outgoing::Close => break,
        }
    }

    let _ = writer.shutdown().await;
}

/// Spawns the reader and writer tasks for an established stream.
pub fn spawn_connection(
    id: ConnectionId,
    stream: TcpStream,
    peer: SocketAddr,
    events: mpsc::UnboundedSender<NetworkEvent>,
) -> ConnectionHandle {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Could not set TCP_NODELAY for {}: {}", peer, e);
    }

    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(write_frames(id, write_half, rx));
    tokio::spawn(read_frames(id, read_half, events));

    ConnectionHandle::new(id, peer, tx)
}

/// Binds a listener and spawns its accept loop.
///
/// Returns the bound address (useful with port 0) and the queue every
/// accepted connection reports to.
pub async fn spawn_listener(
    addr: &str,
) -> Result<(SocketAddr, mpsc::UnboundedReceiver<NetworkEvent>), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    info!("Listening on {}", local);

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let next_id = Arc::new(AtomicU64::new(1));

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let id = ConnectionId(next_id.fetch_add(1, Ordering::Relaxed));
                    info!("Accepted connection {} from {}", id, peer);

                    // Connected is queued before the reader can queue frames.
                    let (read_half, write_half) = stream.into_split();
                    let (tx, rx) = mpsc::unbounded_channel();
                    let handle = ConnectionHandle::new(id, peer, tx);
                    if events_tx.send(NetworkEvent::Connected { handle }).is_err() {
                        break;
                    }
                    tokio::spawn(write_frames(id, write_half, rx));
                    tokio::spawn(read_frames(id, read_half, events_tx.clone()));
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                }
            }
        }
    });

    Ok((local, events_rx))
}

/// Connects a service to its message director.
pub async fn connect_upstream(
    addr: &str,
) -> Result<(ConnectionHandle, mpsc::UnboundedReceiver<NetworkEvent>), Box<dyn std::error::Error>> {
    let stream = TcpStream::connect(addr).await?;
    let peer = stream.peer_addr()?;
    info!("Connected to message director at {}", peer);

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let handle = spawn_connection(ConnectionId(0), stream, peer, events_tx);
    Ok((handle, events_rx))
}
