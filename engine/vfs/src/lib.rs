//! Mountable virtual file system: named data directories, special directory
//! resolution and archive-backed read-only mounts

pub mod archive;
mod datadir;
mod filesystem;
mod folder;
mod path;

pub use archive::{ArchiveDataDir, ArchiveWriter, CompressionMode};
pub use datadir::{DataDirReader, DataDirUsage, DataDirectory, FileStats};
pub use filesystem::{DataDirId, FileSystem};
pub use folder::FolderDataDir;
pub use path::{
    is_asset_guid, make_clean_path, register_special_directory, register_special_dirs_from_args,
    resolve_special_directory, VirtualPath,
};

use common::*;

#[derive(Debug, Error)]
pub enum VfsError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("No data directory with root name {0:?}")]
    UnknownRoot(String),

    #[error("Unknown special directory {0:?}")]
    UnknownSpecialDirectory(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Data directory is read-only")]
    ReadOnly,

    #[error("Path escapes the data directory root: {0}")]
    EscapesRoot(String),

    #[error("Archives only support shared reads")]
    ExclusiveAccessUnsupported,

    #[error("Malformed archive: {0}")]
    MalformedArchive(&'static str),

    #[error("Unsupported compression mode {0}")]
    UnsupportedCompression(u8),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type VfsResult<T> = Result<T, VfsError>;
