use std::{path::PathBuf, process, time::Duration};

use clap::Parser;
use tracing_subscriber::EnvFilter;

use santino::{config::Config, torrent::Torrent, utils::to_human_readable};

#[derive(Parser, Debug)]
#[command(version, about = "A command-line BitTorrent client")]
struct Args {
    /// Path to the .torrent file
    torrent: PathBuf,

    /// Directory to download into
    #[arg(short = 'd', long, default_value = ".")]
    download_dir: PathBuf,

    /// Port reported to the tracker
    #[arg(long, default_value_t = 6881)]
    port: u16,

    /// Cap on concurrent peer connections
    #[arg(long, default_value_t = 50)]
    max_peers: usize,

    /// Outstanding block requests per peer
    #[arg(long, default_value_t = 5)]
    pipeline_depth: usize,

    /// Seconds of silence before a peer is dropped
    #[arg(long, default_value_t = 120)]
    idle_timeout: u64,

    /// Seconds before an unanswered block request is retried elsewhere
    #[arg(long, default_value_t = 60)]
    block_timeout: u64,
}

impl Args {
    fn config(&self) -> Config {
        Config {
            port: self.port,
            max_peers: self.max_peers,
            pipeline_depth: self.pipeline_depth,
            idle_timeout: Duration::from_secs(self.idle_timeout),
            block_timeout: Duration::from_secs(self.block_timeout),
            ..Config::default()
        }
    }
}

async fn run(args: Args) -> i32 {
    let bytes = match tokio::fs::read(&args.torrent).await {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("could not read {}: {e}", args.torrent.display());
            return 4;
        }
    };

    let mut torrent =
        match Torrent::open(&bytes, &args.download_dir, args.config()) {
            Ok(torrent) => torrent,
            Err(e) => {
                eprintln!("Error: {e}");
                return e.exit_code();
            }
        };

    match torrent.run().await {
        Ok(()) => {
            let (pieces, _, bytes) = torrent.progress();
            println!(
                "Done: {pieces} piece(s), {}, saved in \"{}\".",
                to_human_readable(bytes as f64),
                args.download_dir.display(),
            );
            0
        }
        Err(e) => {
            eprintln!("Error: {e}");
            e.exit_code()
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();

    // everything cooperates on one executor thread, a task per peer
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("could not start the runtime: {e}");
            process::exit(4);
        }
    };

    process::exit(runtime.block_on(run(args)));
}
