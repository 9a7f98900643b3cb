//! Development-time file serving: a target device reads data from the host
//! file system as if it were a local mount

mod cli;
mod client;
mod datadir;
pub mod protocol;
mod server;

pub use cli::FileserveCliArgs;
pub use client::{ClientConfig, ClientStats, FileCacheStatus, FileserveClient};
pub use datadir::FileserveDataDir;
pub use protocol::{FileState, CHUNK_SIZE};
pub use server::{Fileserver, FileserverEvent};

use common::*;

#[derive(Debug, Error)]
pub enum FileserveError {
    #[error("Not connected to a file server")]
    NotConnected,

    #[error("File not found on any mount: {0}")]
    NotFound(String),

    #[error("Malformed protocol frame: {0}")]
    Protocol(&'static str),

    #[error("Timed out waiting for the server")]
    Timeout,

    #[error("Invalid mount id {0}")]
    InvalidMount(u16),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type FileserveResult<T> = Result<T, FileserveError>;
