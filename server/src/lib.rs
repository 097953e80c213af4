//! # Chat Server Library
//!
//! The central server of the chat system. It authenticates users against a
//! credential store, relays broadcast messages between logged-in sessions and
//! tells peers where to reach each other directly.
//!
//! ## Core Responsibilities
//!
//! ### Session Handling
//! Every TCP connection gets its own line command engine bound to a
//! [`session::Connection`]. The connection moves between anonymous and
//! authenticated states in response to `!login` and `!logout`, and remembers
//! the private address a user registered for direct peer messaging.
//!
//! ### Broadcast and Lookup
//! `!send` reaches every other authenticated session. `!lookup` resolves a
//! username to the private address its session registered, or explains why
//! it cannot.
//!
//! ### Discovery
//! A UDP responder answers `!list` datagrams with the names of the users
//! currently online.
//!
//! ## Module Organization
//!
//! ### Client Manager Module (`client_manager`)
//! The credential store plus the ordered registry of accepted connections.
//!
//! ### Session Module (`session`)
//! The per-connection authentication state machine and its commands.
//!
//! ### Discovery Module (`discovery`)
//! The UDP `!list` responder.
//!
//! ### Network Module (`network`)
//! Socket setup, the accept loop, shutdown and the operator console.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::network::{Server, ServerSettings};
//! use shared::{Config, LineSink};
//! use std::sync::Arc;
//! use tokio::io::BufReader;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = ServerSettings::from_config(&Config::load("config/chatserver.properties")?)?;
//!     let server = Arc::new(Server::new(settings, Config::load("config/user.properties")?));
//!     server.start().await?;
//!
//!     // `users` and `exit` on stdin
//!     let console = server.console("chatserver", LineSink::stdout())?;
//!     console.serve(BufReader::new(tokio::io::stdin())).await?;
//!     server.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod client_manager;
pub mod discovery;
pub mod network;
pub mod session;
