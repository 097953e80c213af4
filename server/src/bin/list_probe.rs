//! Sends one `!list` discovery datagram and prints the reply.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use shared::protocol::{LIST_QUERY, UDP_BUFFER_SIZE};
use tokio::net::UdpSocket;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Discovery address of the chat server
    #[clap(default_value = "127.0.0.1:13461")]
    server: SocketAddr,
    /// Seconds to wait for the reply
    #[clap(short, long, default_value = "2")]
    timeout: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    println!("Probe socket bound to {}", socket.local_addr()?);

    println!("Sending {} to {}", LIST_QUERY, args.server);
    socket.send_to(LIST_QUERY.as_bytes(), args.server).await?;

    let mut buf = [0u8; UDP_BUFFER_SIZE];
    match tokio::time::timeout(Duration::from_secs(args.timeout), socket.recv_from(&mut buf)).await
    {
        Ok(Ok((len, addr))) => {
            let listing = String::from_utf8_lossy(&buf[..len]);
            println!("Received {} bytes from {}", len, addr);
            if listing.is_empty() {
                println!("No users online");
            }
            for username in listing.lines() {
                println!("  {}", username);
            }
        }
        Ok(Err(e)) => println!("Receive failed: {}", e),
        Err(_) => println!("No reply within {}s", args.timeout),
    }

    Ok(())
}
