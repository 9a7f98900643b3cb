//! Presents a remote server mount through the regular data-dir interface

use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::sync::Arc;

use parking_lot::Mutex;
use vfs::{DataDirReader, DataDirectory, FileStats, VfsError, VfsResult};

use crate::client::FileserveClient;
use crate::FileserveError;

/// A mount whose files live on the development host. Each operation turns
/// into a request/response pair with the local cache in between
pub struct FileserveDataDir {
    mount_path: String,
    client: Arc<Mutex<FileserveClient>>,
    dd_id: u16,
}

impl FileserveDataDir {
    /// Registers `data_dir` with the server through `client` and wraps the
    /// resulting mount
    pub fn mount(
        client: Arc<Mutex<FileserveClient>>,
        data_dir: &str,
        root_name: &str,
    ) -> VfsResult<Self> {
        let dd_id = client
            .lock()
            .mount_data_directory(data_dir, root_name)
            .map_err(to_vfs_error)?;

        Ok(Self {
            mount_path: data_dir.to_owned(),
            client,
            dd_id,
        })
    }

    pub fn mount_id(&self) -> u16 {
        self.dd_id
    }
}

fn to_vfs_error(e: FileserveError) -> VfsError {
    match e {
        FileserveError::NotFound(path) => VfsError::NotFound(path),
        FileserveError::Io(io) => VfsError::Io(io),
        other => VfsError::Io(std::io::Error::new(std::io::ErrorKind::Other, other.to_string())),
    }
}

struct CachedFileReader {
    file: BufReader<File>,
    size: u64,
}

impl Read for CachedFileReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read(buf)
    }
}

impl DataDirReader for CachedFileReader {
    fn file_size(&self) -> u64 {
        self.size
    }
}

/// Writes buffer locally, then pushes the whole file on close
struct UploadWriter {
    client: Arc<Mutex<FileserveClient>>,
    dd_id: u16,
    path: String,
    buffer: Vec<u8>,
    uploaded: bool,
}

impl Write for UploadWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if !self.uploaded {
            self.uploaded = true;
            self.client
                .lock()
                .upload_file(self.dd_id, &self.path, &self.buffer)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        }
        Ok(())
    }
}

impl Drop for UploadWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

impl DataDirectory for FileserveDataDir {
    fn mount_path(&self) -> &str {
        &self.mount_path
    }

    fn open_read(&self, path: &str, _exclusive: bool) -> VfsResult<Box<dyn DataDirReader>> {
        let cached = self
            .client
            .lock()
            .download_file(self.dd_id, path, false)
            .map_err(to_vfs_error)?;

        let file = File::open(&cached).map_err(|_| VfsError::NotFound(path.to_owned()))?;
        let size = file.metadata()?.len();
        Ok(Box::new(CachedFileReader {
            file: BufReader::new(file),
            size,
        }))
    }

    fn open_write(&self, path: &str) -> VfsResult<Box<dyn Write + Send>> {
        Ok(Box::new(UploadWriter {
            client: Arc::clone(&self.client),
            dd_id: self.dd_id,
            path: path.to_owned(),
            buffer: Vec::new(),
            uploaded: false,
        }))
    }

    fn exists_file(&self, path: &str) -> bool {
        self.client
            .lock()
            .download_file(self.dd_id, path, false)
            .is_ok()
    }

    fn file_stats(&self, path: &str) -> VfsResult<FileStats> {
        let cached = self
            .client
            .lock()
            .download_file(self.dd_id, path, false)
            .map_err(to_vfs_error)?;

        let meta = std::fs::metadata(&cached).map_err(|_| VfsError::NotFound(path.to_owned()))?;
        let clean = vfs::make_clean_path(path);
        let (parent, name) = clean.rsplit_once('/').unwrap_or(("", clean.as_str()));

        Ok(FileStats {
            is_directory: meta.is_dir(),
            size: meta.len(),
            modified: meta.modified()?,
            name: name.to_owned(),
            parent_path: parent.to_owned(),
        })
    }

    fn delete_file(&self, path: &str) -> VfsResult<()> {
        self.client
            .lock()
            .delete_file(self.dd_id, path)
            .map_err(to_vfs_error)
    }

    fn iterate(&self, _visitor: &mut dyn FnMut(&str) -> bool) {
        // the protocol has no directory listing; remote mounts are probed by
        // path only
    }
}
