use std::path::PathBuf;

use clap::Parser;
use client::network::{Client, ClientSettings};
use log::{error, info};
use shared::{Config, LineSink};
use tokio::io::BufReader;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Name shown in the console prompt
    #[arg(default_value = "client")]
    name: String,

    /// Client configuration (`chatserver.host`, `chatserver.tcp.port`, ...)
    #[arg(short = 'c', long, default_value = "config/client.properties")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let console = LineSink::stdout();

    let loaded = Config::load(&args.config).and_then(|config| ClientSettings::from_config(&config));
    let settings = match loaded {
        Ok(settings) => Some(settings),
        Err(e) => {
            error!("Failed to load {}: {}", args.config.display(), e);
            console
                .write_line(&format!("Could not load configuration: {e}"))
                .await?;
            None
        }
    };

    let client = Client::new(
        &args.name,
        settings.clone().unwrap_or_default(),
        console.clone(),
    );
    if settings.is_some() {
        match client.connect().await {
            Ok(addr) => info!("Connected to chat server at {}", addr),
            Err(e) => {
                error!("Could not connect to chat server: {}", e);
                console
                    .write_line(&format!("Could not connect to chat server: {e}"))
                    .await?;
            }
        }
    }

    // The console stays usable without a server connection so the user can exit
    client.run(BufReader::new(tokio::io::stdin())).await?;

    // The blocking stdin reader would otherwise keep the runtime alive
    std::process::exit(0);
}
