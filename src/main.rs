use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use kgpd::configuration::Configuration;
use kgpd::server;

/// Kalah game server speaking the Kalah Game Protocol.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path of the SQLite database.
    #[arg(long, default_value = "kgpd.db")]
    database: PathBuf,

    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0:2671")]
    listen: String,

    /// Seconds of thinking time per move.
    #[arg(long, default_value_t = 5)]
    timeout: u64,

    /// Maximum number of concurrent games; 0 means unbounded.
    #[arg(long, default_value_t = 0)]
    slots: usize,

    /// Re-admit the survivor when its opponent dies.
    #[arg(long)]
    endless: bool,

    /// Pits per side.
    #[arg(long, default_value_t = 8)]
    size: usize,

    /// Initial stones per pit.
    #[arg(long, default_value_t = 8)]
    init: u32,

    /// Run a tournament instead of freeplay: "round-robin", "random" or
    /// "single-elimination".
    #[arg(long)]
    tournament: Option<String>,

    /// Number of participants the tournament waits for.
    #[arg(long, default_value_t = 0)]
    participants: usize,

    /// Round-robin only: how many agents pass on; 0 keeps everyone.
    #[arg(long, default_value_t = 0)]
    pick: usize,

    /// Command to run as a local subprocess agent; may be repeated.
    #[arg(long = "agent")]
    agents: Vec<String>,

    /// Log debug output.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default = if args.debug { "kgpd=debug" } else { "kgpd=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .init();

    let mut conf = Configuration::new()
        .with_database(args.database)
        .with_listen(args.listen)
        .with_timeout(Duration::from_secs(args.timeout))
        .with_slots(args.slots)
        .with_endless(args.endless)
        .with_board(args.size, args.init);
    if let Some(system) = args.tournament {
        conf = conf.with_tournament(system, args.participants);
    }
    conf.pick = args.pick;
    conf.agents = args.agents;
    conf.debug = args.debug;

    server::run(conf).await
}
