//! Per-service configuration.
//!
//! Every struct carries working defaults so a full cluster can be started
//! with `server all` and nothing else. The binary overlays command line and
//! `OTP_*` environment values on top of these.

use shared::channels::OTP_DO_ID_TOONTOWN;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_MD_ADDR: &str = "127.0.0.1:46668";
pub const DEFAULT_CA_ADDR: &str = "0.0.0.0:6667";
pub const DEFAULT_SERVER_VERSION: &str = "sv1.0.47.38";

#[derive(Debug, Clone)]
pub struct MessageDirectorConfig {
    /// Address the director listens on for service connections.
    pub bind_addr: String,
    /// How often routing statistics are logged.
    pub stats_interval: Duration,
}

impl Default for MessageDirectorConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_MD_ADDR.into(),
            stats_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StateServerConfig {
    pub md_addr: String,
    /// The object every location tree hangs off.
    pub root_do_id: u32,
    /// How long a DB-backed activation may wait for its stored values.
    pub db_timeout: Duration,
}

impl Default for StateServerConfig {
    fn default() -> Self {
        Self {
            md_addr: DEFAULT_MD_ADDR.into(),
            root_do_id: OTP_DO_ID_TOONTOWN,
            db_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientAgentConfig {
    pub md_addr: String,
    /// Address game clients connect to.
    pub bind_addr: String,
    /// Range session channels are allocated from, `[min, max)`.
    pub channel_min: u64,
    pub channel_max: u64,
    /// Version string a client must present at login.
    pub server_version: String,
    /// Allows logins with an empty play token.
    pub allow_anonymous: bool,
    /// Deadline for replies to correlated requests (login, avatar creation).
    pub request_timeout: Duration,
    /// Class used for newly created avatars.
    pub avatar_class: String,
}

impl Default for ClientAgentConfig {
    fn default() -> Self {
        Self {
            md_addr: DEFAULT_MD_ADDR.into(),
            bind_addr: DEFAULT_CA_ADDR.into(),
            channel_min: 1_000_000_000,
            channel_max: 1_001_000_000,
            server_version: DEFAULT_SERVER_VERSION.into(),
            allow_anonymous: false,
            request_timeout: Duration::from_secs(10),
            avatar_class: "DistributedToon".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DbServerConfig {
    pub md_addr: String,
    /// Range row ids (and therefore DB-backed do_ids) are allocated from.
    pub id_min: u64,
    pub id_max: u64,
    /// First account id handed out.
    pub first_disl_id: u32,
    /// Snapshot file; rows live only in memory when unset.
    pub snapshot_path: Option<PathBuf>,
}

impl Default for DbServerConfig {
    fn default() -> Self {
        Self {
            md_addr: DEFAULT_MD_ADDR.into(),
            id_min: 100_000_000,
            id_max: 200_000_000,
            first_disl_id: 1,
            snapshot_path: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AiConfig {
    pub md_addr: String,
    /// Range the AI picks its own channel and do_ids from.
    pub channel_min: u64,
    pub channel_max: u64,
    /// Name given to the district this AI generates.
    pub district_name: String,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            md_addr: DEFAULT_MD_ADDR.into(),
            channel_min: 4_000_000,
            channel_max: 5_000_000,
            district_name: "Toon Valley".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UberdogConfig {
    pub md_addr: String,
}

impl Default for UberdogConfig {
    fn default() -> Self {
        Self {
            md_addr: DEFAULT_MD_ADDR.into(),
        }
    }
}

/// Configuration for the whole cluster.
#[derive(Debug, Clone, Default)]
pub struct ClusterConfig {
    pub message_director: MessageDirectorConfig,
    pub state_server: StateServerConfig,
    pub client_agent: ClientAgentConfig,
    pub db_server: DbServerConfig,
    pub ai: AiConfig,
    pub uberdog: UberdogConfig,
}

impl ClusterConfig {
    /// Points every service at the same message director.
    pub fn with_md_addr(mut self, addr: &str) -> Self {
        self.message_director.bind_addr = addr.to_string();
        self.state_server.md_addr = addr.to_string();
        self.client_agent.md_addr = addr.to_string();
        self.db_server.md_addr = addr.to_string();
        self.ai.md_addr = addr.to_string();
        self.uberdog.md_addr = addr.to_string();
        self
    }
}
