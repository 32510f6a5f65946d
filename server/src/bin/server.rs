//! warden game server binary.

use clap::Parser;
use server::config::{Config, default_toml};
use server::{Server, logging, signal};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "warden-server")]
#[command(about = "Per-core io_uring game server")]
struct Args {
    /// Path to configuration file (defaults apply when omitted)
    config: Option<PathBuf>,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,
}

fn main() {
    let args = Args::parse();

    if args.print_config {
        print!("{}", default_toml());
        return;
    }

    let config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("failed to load config: {e}");
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    logging::init(&config.logging);

    if !strandio::is_supported() {
        tracing::error!("this kernel lacks the required io_uring features (6.0+ needed)");
        std::process::exit(1);
    }

    if let Err(e) = run(config) {
        tracing::error!("server error: {e}");
        std::process::exit(1);
    }
}

fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let shutdown = signal::install_signal_handler();

    let server = Server::launch(&config)?;
    tracing::info!(
        host = %config.listener.host,
        port = config.listener.port,
        workers = config.threads(),
        "serving"
    );

    while !shutdown.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
    }

    server.shutdown();
    server.join()?;

    tracing::info!("clean shutdown");
    Ok(())
}
