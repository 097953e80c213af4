use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::{error, info};
use server::network::{Server, ServerSettings};
use shared::{Config, LineSink, ServeExit};
use tokio::io::BufReader;

/// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Name shown in the console prompt
    #[clap(default_value = "chatserver")]
    name: String,
    /// Server configuration (`tcp.port`, `udp.port`, optional `host`)
    #[clap(short, long, default_value = "config/chatserver.properties")]
    config: PathBuf,
    /// Credential store with one `<username>.password` entry per account
    #[clap(short, long, default_value = "config/user.properties")]
    users: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let users = Config::load(&args.users).unwrap_or_else(|e| {
        error!("Failed to load user store {}: {}", args.users.display(), e);
        Config::new()
    });
    let settings =
        Config::load(&args.config).and_then(|config| ServerSettings::from_config(&config));

    let console = LineSink::stdout();
    let server = Arc::new(Server::new(
        settings.as_ref().cloned().unwrap_or_default(),
        users,
    ));

    // Networking failures are reported but leave the console usable
    let started = match settings {
        Ok(_) => server.start().await.map(|_| ()).map_err(|e| e.to_string()),
        Err(e) => Err(e.to_string()),
    };
    if let Err(reason) = started {
        error!("Chat server could not start networking: {}", reason);
        console
            .write_line(&format!("Networking disabled: {reason}"))
            .await?;
    }

    let engine = server.console(&args.name, console)?;
    match engine.serve(BufReader::new(tokio::io::stdin())).await {
        Ok(ServeExit::EndOfStream) => info!("Console input closed"),
        Ok(ServeExit::Closed) => {}
        Err(e) => error!("Console failed: {}", e),
    }
    server.shutdown().await;

    // The blocking stdin reader would otherwise keep the runtime alive
    std::process::exit(0);
}
