use clap::{Args, Parser, Subcommand};
use log::{error, info};
use server::ai::AiRepository;
use server::client_agent::ClientAgent;
use server::config::{ClusterConfig, DEFAULT_CA_ADDR, DEFAULT_MD_ADDR, DEFAULT_SERVER_VERSION};
use server::context::AppContext;
use server::db_server::DbServer;
use server::director::MessageDirector;
use server::state_server::StateServer;
use server::uberdog::{CentralLogger, Uberdog};
use shared::Schema;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Distributed object server cluster")]
struct Cli {
    /// Schema JSON replacing the built-in class definitions
    #[clap(long, global = true, env = "OTP_SCHEMA")]
    schema: Option<PathBuf>,

    /// Message director address services connect to (and `md` binds)
    #[clap(long, global = true, env = "OTP_MD_ADDR", default_value = DEFAULT_MD_ADDR)]
    md_addr: String,

    #[clap(subcommand)]
    service: Service,
}

#[derive(Subcommand, Debug)]
enum Service {
    /// Message director
    Md,
    /// State server
    StateServer,
    /// Client agent
    ClientAgent(AgentArgs),
    /// Database server
    Db(DbArgs),
    /// District AI
    Ai(AiArgs),
    /// Central logger uberdog
    Uberdog,
    /// Every service in one process
    All(AllArgs),
}

#[derive(Args, Debug)]
struct AgentArgs {
    /// Address game clients connect to
    #[clap(long, env = "OTP_CA_ADDR", default_value = DEFAULT_CA_ADDR)]
    bind: String,
    /// Version string clients must present
    #[clap(long, env = "OTP_SERVER_VERSION", default_value = DEFAULT_SERVER_VERSION)]
    server_version: String,
    /// Accept logins with an empty play token
    #[clap(long, env = "OTP_ALLOW_ANONYMOUS")]
    allow_anonymous: bool,
}

#[derive(Args, Debug)]
struct DbArgs {
    /// Snapshot file; rows stay in memory only when omitted
    #[clap(long, env = "OTP_DB_SNAPSHOT")]
    snapshot: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct AiArgs {
    /// Name of the district this AI creates
    #[clap(long, env = "OTP_DISTRICT_NAME", default_value = "Toon Valley")]
    district: String,
    /// First channel of this AI's range; every AI needs its own range
    #[clap(long, env = "OTP_AI_CHANNEL_MIN", default_value = "4000000")]
    channel_min: u64,
    #[clap(long, env = "OTP_AI_CHANNEL_MAX", default_value = "5000000")]
    channel_max: u64,
}

#[derive(Args, Debug)]
struct AllArgs {
    #[clap(flatten)]
    agent: AgentArgs,
    #[clap(flatten)]
    db: DbArgs,
    #[clap(flatten)]
    ai: AiArgs,
}

impl AgentArgs {
    fn apply(&self, config: &mut ClusterConfig) {
        config.client_agent.bind_addr = self.bind.clone();
        config.client_agent.server_version = self.server_version.clone();
        config.client_agent.allow_anonymous = self.allow_anonymous;
    }
}

impl DbArgs {
    fn apply(&self, config: &mut ClusterConfig) {
        config.db_server.snapshot_path = self.snapshot.clone();
    }
}

impl AiArgs {
    fn apply(&self, config: &mut ClusterConfig) {
        config.ai.district_name = self.district.clone();
        config.ai.channel_min = self.channel_min;
        config.ai.channel_max = self.channel_max;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let cli = Cli::parse();

    let schema = match &cli.schema {
        Some(path) => AppContext::load_schema(path)?,
        None => Schema::builtin()?,
    };
    let mut config = ClusterConfig::default().with_md_addr(&cli.md_addr);
    match &cli.service {
        Service::ClientAgent(args) => args.apply(&mut config),
        Service::Db(args) => args.apply(&mut config),
        Service::Ai(args) => args.apply(&mut config),
        Service::All(args) => {
            args.agent.apply(&mut config);
            args.db.apply(&mut config);
            args.ai.apply(&mut config);
        }
        Service::Md | Service::StateServer | Service::Uberdog => {}
    }
    let ctx = AppContext::new(schema, config);

    tokio::select! {
        result = run_service(cli.service, ctx) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            Ok(())
        }
    }
}

async fn run_service(service: Service, ctx: AppContext) -> Result<(), Box<dyn std::error::Error>> {
    match service {
        Service::Md => MessageDirector::new(ctx.config.message_director.clone()).run().await,
        Service::StateServer => StateServer::run(ctx).await,
        Service::ClientAgent(_) => ClientAgent::run(ctx).await,
        Service::Db(_) => DbServer::run(ctx).await,
        Service::Ai(_) => AiRepository::run(ctx).await,
        Service::Uberdog => Uberdog::run(ctx, Box::new(CentralLogger::new())).await,
        Service::All(_) => run_all(ctx).await,
    }
}

/// Starts the director first, then every service against it. Serves until
/// the client agent stops.
async fn run_all(ctx: AppContext) -> Result<(), Box<dyn std::error::Error>> {
    let md_addr = MessageDirector::new(ctx.config.message_director.clone())
        .spawn()
        .await?;
    info!("Cluster message director on {}", md_addr);

    StateServer::spawn(ctx.clone()).await?;
    DbServer::spawn(ctx.clone()).await?;

    let ai_ctx = ctx.clone();
    tokio::spawn(async move {
        if let Err(e) = AiRepository::run(ai_ctx).await {
            error!("AI stopped: {}", e);
        }
    });
    let uberdog_ctx = ctx.clone();
    tokio::spawn(async move {
        if let Err(e) = Uberdog::run(uberdog_ctx, Box::new(CentralLogger::new())).await {
            error!("Central logger stopped: {}", e);
        }
    });

    ClientAgent::run(ctx).await
}
