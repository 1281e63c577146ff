//! Error type shared by every public operation.

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PalError {
    /// A required argument was empty, zero or out of range. Nothing was changed.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The object is not in a state that allows the operation.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// The socket is not open (never opened, or raced with a close).
    #[error("socket is not open")]
    NotOpen,

    /// The peer reset or aborted the connection.
    #[error("connection abandoned by peer")]
    Abandoned,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to spawn thread {name}: {source}")]
    ThreadSpawn {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("metrics exporter: {0}")]
    Metrics(String),
}

pub type Result<T> = std::result::Result<T, PalError>;
