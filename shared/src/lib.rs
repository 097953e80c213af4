//! # Shared Chat Protocol Library
//!
//! Building blocks used by both the chat server and its clients.
//!
//! ## Module Organization
//!
//! ### Engine Module (`engine`)
//! The line command protocol engine: tokenizing `[!]name args...` lines,
//! the command table handlers register into, and the serve loop that pairs
//! one input stream with one output sink.
//!
//! ### Sink Module (`sink`)
//! Line-buffered, shareable output targets (sockets, stdout, in-memory
//! transcripts).
//!
//! ### Protocol Module (`protocol`)
//! Wire constants, fixed reply texts and line formatters.
//!
//! ### Config Module (`config`)
//! The dotted-key configuration and credential store.
//!
//! ### Pool Module (`pool`)
//! Unbounded task pool whose in-flight work can be cancelled at shutdown.

pub mod config;
pub mod engine;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod sink;

pub use config::Config;
pub use engine::{
    no_reply, reply, Args, CloseHandle, CommandHandler, CommandResult, CommandTable, Engine,
    ServeExit,
};
pub use error::{CommandError, ConfigError};
pub use pool::WorkerPool;
pub use sink::{LineSink, Transcript};
