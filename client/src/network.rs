use crate::protocol::{self, ServerEvent};
use crate::ClientError;
use log::{debug, info, warn};
use shared::{encode_frame, FrameDecoder};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};

/// A framed connection to the client agent.
pub struct Connection<S = TcpStream> {
    stream: S,
    decoder: FrameDecoder,
    buffer: Vec<u8>,
    /// Simulated one-way latency applied to sends and receives.
    fake_ping_ms: u64,
}

impl Connection<TcpStream> {
    pub async fn connect(addr: &str) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        info!("Connected to client agent at {}", addr);
        Ok(Self::new(stream))
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            decoder: FrameDecoder::new(),
            buffer: vec![0u8; 4096],
            fake_ping_ms: 0,
        }
    }

    pub fn with_fake_ping(mut self, fake_ping_ms: u64) -> Self {
        self.fake_ping_ms = fake_ping_ms;
        self
    }

    pub async fn send(&mut self, datagram: &[u8]) -> Result<(), ClientError> {
        if self.fake_ping_ms > 0 {
            sleep(Duration::from_millis(self.fake_ping_ms / 2)).await;
        }
        let frame = encode_frame(datagram)?;
        self.stream.write_all(&frame).await?;
        Ok(())
    }

    /// Next raw datagram from the server.
    pub async fn recv_raw(&mut self) -> Result<Vec<u8>, ClientError> {
        loop {
            if let Some(frame) = self.decoder.next_frame() {
                if self.fake_ping_ms > 0 {
                    sleep(Duration::from_millis(self.fake_ping_ms / 2)).await;
                }
                return Ok(frame);
            }
            let n = self.stream.read(&mut self.buffer).await?;
            if n == 0 {
                return Err(ClientError::Closed);
            }
            self.decoder.extend(&self.buffer[..n]);
        }
    }

    pub async fn recv(&mut self) -> Result<ServerEvent, ClientError> {
        let bytes = self.recv_raw().await?;
        ServerEvent::parse(&bytes)
    }

    pub async fn recv_timeout(&mut self, limit: Duration) -> Result<ServerEvent, ClientError> {
        timeout(limit, self.recv()).await.map_err(|_| ClientError::Timeout)?
    }

    /// Skips events until one matches. Being kicked while waiting is an
    /// error unless the caller was waiting for exactly that.
    pub async fn wait_for<F>(&mut self, limit: Duration, mut predicate: F) -> Result<ServerEvent, ClientError>
    where
        F: FnMut(&ServerEvent) -> bool,
    {
        let deadline = Instant::now() + limit;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            let event = self.recv_timeout(left).await?;
            if predicate(&event) {
                return Ok(event);
            }
            if let ServerEvent::GoGetLost { code, reason } = event {
                return Err(ClientError::Rejected { code, reason });
            }
            debug!("Skipping {:?}", event);
        }
    }

    /// Logs in and waits for the answer.
    pub async fn login(&mut self, play_token: &str, server_version: &str) -> Result<(), ClientError> {
        self.send(&protocol::login(play_token, server_version)?).await?;
        match self
            .wait_for(Duration::from_secs(10), |e| matches!(e, ServerEvent::LoginResponse { .. }))
            .await?
        {
            ServerEvent::LoginResponse { return_code: 0, .. } => {
                info!("Logged in as {}", play_token);
                Ok(())
            }
            ServerEvent::LoginResponse { return_code, error, .. } => {
                warn!("Login refused ({}): {}", return_code, error);
                Err(ClientError::Protocol(format!("login refused: {}", error)))
            }
            other => Err(ClientError::Protocol(format!("unexpected {:?}", other))),
        }
    }

    /// Sends `CLIENT_DISCONNECT` and shuts the write half.
    pub async fn close(mut self) -> Result<(), ClientError> {
        self.send(&protocol::disconnect()).await?;
        self.stream.shutdown().await?;
        Ok(())
    }
}
