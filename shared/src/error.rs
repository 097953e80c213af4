//! Error types shared by both roles.
//!
//! `CommandError` doubles as the diagnostic text the engine writes back when a
//! line cannot be dispatched, so its `Display` output is user-facing.

use thiserror::Error;

/// Failure to parse, coerce or execute a single command line.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Wrong number of arguments for {command}: expected {expected}, got {got}")]
    WrongArity {
        command: String,
        expected: usize,
        got: usize,
    },

    #[error("Invalid argument {index} for {command} ({value:?}): {reason}")]
    InvalidArgument {
        command: String,
        index: usize,
        value: String,
        reason: String,
    },

    #[error("Command {0} is already registered")]
    DuplicateCommand(String),

    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failure to load or query the key-value configuration store.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed configuration line {line}: {content:?}")]
    Malformed { line: usize, content: String },

    #[error("missing configuration key {0}")]
    MissingKey(String),

    #[error("configuration key {key} is not an integer: {value:?}")]
    NotAnInteger { key: String, value: String },
}
