//! # Headless Game Client Library
//!
//! Speaks the client side of the client agent protocol over TCP. There is no
//! rendering and no game logic beyond what a test driver or a load bot needs.
//!
//! ## Module Organization
//!
//! ### Protocol Module (`protocol`)
//! Builders for every request a client may send (login, avatar selection,
//! interests, field updates, location changes) and `ServerEvent`, the typed
//! form of everything the client agent sends back.
//!
//! ### Network Module (`network`)
//! A framed connection to the client agent with optional simulated latency,
//! plus helpers that wait for a particular event.
//!
//! ### Bot Module (`bot`)
//! A scripted player: logs in, picks or creates an avatar, joins a district
//! zone and wanders around sending position updates.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::network::Connection;
//! use client::protocol::{self, ServerEvent};
//! use std::time::Duration;
//!
//! # async fn demo() -> Result<(), client::ClientError> {
//! let mut conn = Connection::connect("127.0.0.1:6667").await?;
//! conn.login("alice", protocol::DEFAULT_SERVER_VERSION).await?;
//!
//! conn.send(&protocol::get_avatars()).await?;
//! let event = conn
//!     .wait_for(Duration::from_secs(5), |e| matches!(e, ServerEvent::AvatarList { .. }))
//!     .await?;
//! println!("{:?}", event);
//! # Ok(())
//! # }
//! ```

pub mod bot;
pub mod network;
pub mod protocol;

use shared::{DatagramError, FrameError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed message: {0}")]
    Datagram(#[from] DatagramError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("connection closed by the server")]
    Closed,
    #[error("timed out waiting for the server")]
    Timeout,
    #[error("disconnected by the server ({code}): {reason}")]
    Rejected { code: u16, reason: String },
    #[error("{0}")]
    Protocol(String),
}
