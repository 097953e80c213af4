//! # Chat Client Library
//!
//! Client side of the chat system. A client keeps one TCP connection to the
//! chat server for authentication, public messages and address lookups, and
//! exchanges private messages with other clients over direct, one-shot TCP
//! connections.
//!
//! ## Module Organization
//!
//! ### Input Module (`input`)
//! The user command surface: forwarding server commands, binding the private
//! message listener on `register`, discovery queries and `msg`.
//!
//! ### Relay Module (`relay`)
//! Reads the server socket and turns its notifications into console output,
//! the last received message and address resolutions.
//!
//! ### Messenger Module (`messenger`)
//! Address book and per-user pending queues. Messages to users whose address
//! is unknown wait until the server resolves it, then go out in order. The
//! courier runs these deliveries on pooled tasks, one queue per user, so
//! neither the console nor the relay ever waits on a peer.
//!
//! ### Peer Module (`peer`)
//! The direct transport: the listener answering inbound messages with `!ack`
//! and the sender side of the exchange.
//!
//! ### Network Module (`network`)
//! Configuration, the connection to the chat server and the console shell.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::network::{Client, ClientSettings};
//! use shared::{Config, LineSink};
//! use tokio::io::BufReader;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = ClientSettings::from_config(&Config::load("config/client.properties")?)?;
//!     let client = Client::new("alice", settings, LineSink::stdout());
//!     client.connect().await?;
//!
//!     // login, register, msg, list, lastMsg, exit, ...
//!     client.run(BufReader::new(tokio::io::stdin())).await?;
//!     Ok(())
//! }
//! ```

pub mod input;
pub mod messenger;
pub mod network;
pub mod peer;
pub mod relay;
