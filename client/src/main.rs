use clap::Parser;
use client::bot::{Bot, BotConfig};
use client::network::Connection;
use client::protocol::DEFAULT_SERVER_VERSION;
use log::{error, info};
use shared::Schema;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about = "Headless bot client", long_about = None)]
struct Args {
    /// Client agent address to connect to
    #[arg(short = 's', long, env = "OTP_CA_ADDR", default_value = "127.0.0.1:6667")]
    server: String,

    /// Play token; bots past the first get a numeric suffix
    #[arg(short = 't', long, env = "OTP_PLAY_TOKEN", default_value = "bot")]
    token: String,

    /// Version string presented at login
    #[arg(long, env = "OTP_SERVER_VERSION", default_value = DEFAULT_SERVER_VERSION)]
    server_version: String,

    /// Number of bots to run
    #[arg(short = 'n', long, default_value = "1")]
    bots: u32,

    /// Zone to walk around in
    #[arg(short = 'z', long, default_value = "2000")]
    zone: u32,

    /// Milliseconds between position updates
    #[arg(long, default_value = "250")]
    step_ms: u64,

    /// Steps before leaving, 0 to walk forever
    #[arg(long, default_value = "0")]
    steps: u32,

    /// Simulate network latency in milliseconds
    #[arg(short = 'l', long, default_value = "0")]
    fake_ping: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    info!("Starting {} bot(s) against {}", args.bots, args.server);
    if args.fake_ping > 0 {
        info!("Simulating {}ms latency", args.fake_ping);
    }

    let mut handles = Vec::new();
    for i in 0..args.bots {
        let token = if i == 0 {
            args.token.clone()
        } else {
            format!("{}{}", args.token, i)
        };
        let config = BotConfig {
            play_token: token.clone(),
            server_version: args.server_version.clone(),
            zone_id: args.zone,
            step_interval: Duration::from_millis(args.step_ms),
            steps: args.steps,
        };
        let conn = Connection::connect(&args.server).await?.with_fake_ping(args.fake_ping);
        let bot = Bot::new(conn, Schema::builtin()?, config);

        handles.push(tokio::spawn(async move {
            if let Err(e) = bot.run().await {
                error!("Bot {} stopped: {}", token, e);
            }
        }));
    }

    for handle in handles {
        if let Err(e) = handle.await {
            error!("Bot task panicked: {}", e);
        }
    }
    Ok(())
}
