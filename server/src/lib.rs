//! # Distributed Object Server Library
//!
//! The server side of a distributed-object game network. A cluster is a set
//! of cooperating services that talk to each other only through datagrams
//! routed by channel.
//!
//! ## Services
//!
//! ### Message Director (`director`)
//! The pub/sub core. Every other service connects to it as a participant,
//! subscribes to channels and ranges with control datagrams, and has its
//! datagrams fanned out to every participant subscribed to any recipient
//! channel, never back to the sender. Post-remove datagrams registered by a
//! participant are routed when its connection drops.
//!
//! ### State Server (`state_server`)
//! Owns the canonical copy of every distributed object: its location in the
//! parent/zone tree, its stored fields, and its AI and owner channels. It
//! generates, moves and deletes objects, answers zone queries and activates
//! database-backed objects on demand.
//!
//! ### Client Agent (`client_agent`, `client_session`)
//! Accepts game clients, runs the login and avatar flows against the database
//! server, and translates internal traffic into the client protocol while
//! enforcing interest-based visibility and field send permissions. Each
//! session is a pure state machine; the agent applies the effects it emits.
//!
//! ### Database Server (`db_server`)
//! Stores `db` fields of persistent objects and account records, in memory
//! with an optional `bincode` snapshot on disk.
//!
//! ### Uberdogs and AI (`uberdog`, `ai`)
//! The wire glue of the game logic processes: cluster-global objects that
//! generate themselves under the root, and the district AI repository that
//! generates objects, pins itself as their AI and keeps a table of what it
//! hears about.
//!
//! ## Plumbing
//!
//! - `network`: TCP reader/writer tasks around `[u16 length][payload]`
//!   frames, feeding a per-service event queue.
//! - `router`: the channel/range subscription table the director and the
//!   local shim share.
//! - `local`: a service-side mini director that keeps local subscribers and
//!   mirrors subscriptions upstream.
//! - `names`: wish-name checks and pattern names for new avatars.
//! - `config`, `context`: per-service configuration and the `AppContext`
//!   built once in `main`.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::context::AppContext;
//! use server::director::MessageDirector;
//! use server::state_server::StateServer;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut ctx = AppContext::builtin()?;
//!     let md_addr = MessageDirector::new(ctx.config.message_director.clone())
//!         .spawn()
//!         .await?;
//!     ctx.config = ctx.config.with_md_addr(&md_addr.to_string());
//!     StateServer::run(ctx).await
//! }
//! ```
//!
//! Every service loop owns its state outright. Sockets never share state
//! with a loop except through unbounded mpsc queues, so there are no locks.

pub mod ai;
pub mod client_agent;
pub mod client_session;
pub mod client_state;
pub mod config;
pub mod context;
pub mod db_server;
pub mod director;
pub mod interest;
pub mod local;
pub mod names;
pub mod network;
pub mod object;
pub mod router;
pub mod state_server;
pub mod uberdog;
