use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use common::*;

use crate::archive::{ArchiveDataDir, ARCHIVE_EXTENSION};
use crate::datadir::{DataDirReader, DataDirUsage, DataDirectory, FileStats};
use crate::folder::FolderDataDir;
use crate::path::{is_asset_guid, make_clean_path, resolve_special_directory, VirtualPath};
use crate::{VfsError, VfsResult};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct DataDirId(u32);

struct Mount {
    id: DataDirId,
    group: String,
    root_name: String,
    dir: Arc<dyn DataDirectory>,
}

/// Registry of mounted data directories. Reads probe mounts in reverse
/// registration order, so the most recently added mount shadows older ones
#[derive(Default)]
pub struct FileSystem {
    mounts: Vec<Mount>,
    next_id: u32,
}

impl FileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mounts `path`, picking the archive backend when the path points at (or
    /// into) an archive file
    pub fn add_data_directory(
        &mut self,
        path: &str,
        group: &str,
        root_name: &str,
        usage: DataDirUsage,
    ) -> VfsResult<DataDirId> {
        let dir: Arc<dyn DataDirectory> = if path.contains(ARCHIVE_EXTENSION) {
            Arc::new(ArchiveDataDir::new(path)?)
        } else {
            Arc::new(FolderDataDir::new(path, usage)?)
        };

        Ok(self.add_data_directory_mount(dir, group, root_name))
    }

    /// Mounts a custom data directory implementation (network mounts etc)
    pub fn add_data_directory_mount(
        &mut self,
        dir: Arc<dyn DataDirectory>,
        group: &str,
        root_name: &str,
    ) -> DataDirId {
        self.next_id += 1;
        let id = DataDirId(self.next_id);

        info!(
            "mounted data directory";
            "path" => dir.mount_path(),
            "root" => root_name,
            "group" => group
        );

        self.mounts.push(Mount {
            id,
            group: group.to_owned(),
            root_name: root_name.trim_matches(|c| c == ':' || c == '/').to_owned(),
            dir,
        });
        id
    }

    pub fn remove_data_directory_group(&mut self, group: &str) {
        let before = self.mounts.len();
        self.mounts.retain(|m| m.group != group);
        let removed = before - self.mounts.len();
        if removed > 0 {
            info!("unmounted data directory group"; "group" => group, "count" => removed);
        }
    }

    pub fn mount(&self, id: DataDirId) -> Option<&Arc<dyn DataDirectory>> {
        self.mounts.iter().find(|m| m.id == id).map(|m| &m.dir)
    }

    fn rooted_mount(&self, root: &str) -> VfsResult<&Mount> {
        self.mounts
            .iter()
            .rev()
            .find(|m| m.root_name == root)
            .ok_or_else(|| VfsError::UnknownRoot(root.to_owned()))
    }

    /// Mounts in probe order (most recently registered first)
    fn probe_order(&self) -> impl Iterator<Item = &Mount> {
        self.mounts.iter().rev()
    }

    pub fn open_read(&self, path: &str) -> VfsResult<Box<dyn DataDirReader>> {
        match VirtualPath::parse(path) {
            VirtualPath::Rooted { root, rest } => {
                self.rooted_mount(root)?.dir.open_read(rest, false)
            }
            VirtualPath::Special { .. } => open_absolute_read(&resolve_special_directory(path)?),
            VirtualPath::Absolute(abs) => open_absolute_read(&PathBuf::from(abs)),
            VirtualPath::Relative(rel) => {
                if is_asset_guid(rel) {
                    return self.open_redirected(rel);
                }

                for mount in self.probe_order() {
                    match mount.dir.open_read(rel, false) {
                        Ok(reader) => return Ok(reader),
                        Err(VfsError::NotFound(_)) => continue,
                        Err(other) => return Err(other),
                    }
                }
                Err(VfsError::NotFound(rel.to_owned()))
            }
        }
    }

    fn open_redirected(&self, guid: &str) -> VfsResult<Box<dyn DataDirReader>> {
        for mount in self.probe_order() {
            if let Some(redirected) = mount.dir.resolve_redirection(guid) {
                return mount.dir.open_read(&redirected, false);
            }
        }
        Err(VfsError::NotFound(guid.to_owned()))
    }

    pub fn open_write(&self, path: &str) -> VfsResult<Box<dyn Write + Send>> {
        match VirtualPath::parse(path) {
            VirtualPath::Rooted { root, rest } => self.rooted_mount(root)?.dir.open_write(rest),
            VirtualPath::Special { .. } => open_absolute_write(&resolve_special_directory(path)?),
            VirtualPath::Absolute(abs) => open_absolute_write(&PathBuf::from(abs)),
            VirtualPath::Relative(rel) => {
                for mount in self.probe_order() {
                    match mount.dir.open_write(rel) {
                        Ok(writer) => return Ok(writer),
                        Err(VfsError::ReadOnly) => continue,
                        Err(other) => return Err(other),
                    }
                }
                Err(VfsError::ReadOnly)
            }
        }
    }

    pub fn exists_file(&self, path: &str) -> bool {
        match VirtualPath::parse(path) {
            VirtualPath::Rooted { root, rest } => self
                .rooted_mount(root)
                .map(|m| m.dir.exists_file(rest))
                .unwrap_or(false),
            VirtualPath::Special { .. } => resolve_special_directory(path)
                .map(|p| p.is_file())
                .unwrap_or(false),
            VirtualPath::Absolute(abs) => PathBuf::from(abs).is_file(),
            VirtualPath::Relative(rel) => self.probe_order().any(|m| m.dir.exists_file(rel)),
        }
    }

    pub fn file_stats(&self, path: &str) -> VfsResult<FileStats> {
        match VirtualPath::parse(path) {
            VirtualPath::Rooted { root, rest } => self.rooted_mount(root)?.dir.file_stats(rest),
            VirtualPath::Special { .. } => absolute_stats(&resolve_special_directory(path)?),
            VirtualPath::Absolute(abs) => absolute_stats(&PathBuf::from(abs)),
            VirtualPath::Relative(rel) => {
                for mount in self.probe_order() {
                    match mount.dir.file_stats(rel) {
                        Ok(stats) => return Ok(stats),
                        Err(VfsError::NotFound(_)) => continue,
                        Err(other) => return Err(other),
                    }
                }
                Err(VfsError::NotFound(rel.to_owned()))
            }
        }
    }

    pub fn delete_file(&self, path: &str) -> VfsResult<()> {
        match VirtualPath::parse(path) {
            VirtualPath::Rooted { root, rest } => self.rooted_mount(root)?.dir.delete_file(rest),
            VirtualPath::Special { .. } => {
                std::fs::remove_file(resolve_special_directory(path)?).map_err(VfsError::Io)
            }
            VirtualPath::Absolute(abs) => std::fs::remove_file(abs).map_err(VfsError::Io),
            VirtualPath::Relative(rel) => {
                for mount in self.probe_order() {
                    if mount.dir.exists_file(rel) {
                        return mount.dir.delete_file(rel);
                    }
                }
                Err(VfsError::NotFound(rel.to_owned()))
            }
        }
    }
}

struct AbsoluteReader {
    file: BufReader<File>,
    size: u64,
}

impl Read for AbsoluteReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read(buf)
    }
}

impl DataDirReader for AbsoluteReader {
    fn file_size(&self) -> u64 {
        self.size
    }
}

fn open_absolute_read(path: &PathBuf) -> VfsResult<Box<dyn DataDirReader>> {
    let file = File::open(path).map_err(|_| VfsError::NotFound(path.display().to_string()))?;
    let size = file.metadata()?.len();
    Ok(Box::new(AbsoluteReader {
        file: BufReader::new(file),
        size,
    }))
}

fn open_absolute_write(path: &PathBuf) -> VfsResult<Box<dyn Write + Send>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(Box::new(BufWriter::new(File::create(path)?)))
}

fn absolute_stats(path: &PathBuf) -> VfsResult<FileStats> {
    let meta =
        std::fs::metadata(path).map_err(|_| VfsError::NotFound(path.display().to_string()))?;
    let clean = make_clean_path(&path.to_string_lossy());
    let (parent, name) = clean.rsplit_once('/').unwrap_or(("", clean.as_str()));

    Ok(FileStats {
        is_directory: meta.is_dir(),
        size: meta.len(),
        modified: meta.modified()?,
        name: name.to_owned(),
        parent_path: parent.to_owned(),
    })
}
