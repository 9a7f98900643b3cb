use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use common::*;
use walkdir::WalkDir;

use crate::datadir::{DataDirReader, DataDirUsage, DataDirectory, FileStats};
use crate::path::make_clean_path;
use crate::{VfsError, VfsResult};

/// Plain directory mount backed by the OS file system
pub struct FolderDataDir {
    mount_path: String,
    root: PathBuf,
    usage: DataDirUsage,
    redirections: parking_lot::RwLock<HashMap<String, String>>,
}

struct FolderReader {
    file: BufReader<File>,
    size: u64,
}

impl Read for FolderReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read(buf)
    }
}

impl DataDirReader for FolderReader {
    fn file_size(&self) -> u64 {
        self.size
    }
}

impl FolderDataDir {
    pub fn new(mount_path: &str, usage: DataDirUsage) -> VfsResult<Self> {
        let resolved = if mount_path.starts_with('>') {
            crate::path::resolve_special_directory(mount_path)?
        } else {
            PathBuf::from(mount_path)
        };

        if !resolved.is_dir() {
            return Err(VfsError::NotFound(mount_path.to_owned()));
        }

        Ok(Self {
            mount_path: mount_path.to_owned(),
            root: resolved,
            usage,
            redirections: Default::default(),
        })
    }

    /// Maps `guid` to a mount-relative path for asset addressing
    pub fn add_redirection(&self, guid: &str, path: &str) {
        self.redirections
            .write()
            .insert(guid.to_owned(), make_clean_path(path));
    }

    fn resolve(&self, path: &str) -> VfsResult<PathBuf> {
        let clean = make_clean_path(path);
        if clean.starts_with("..") || Path::new(&clean).is_absolute() {
            return Err(VfsError::EscapesRoot(path.to_owned()));
        }
        Ok(self.root.join(clean))
    }
}

impl DataDirectory for FolderDataDir {
    fn mount_path(&self) -> &str {
        &self.mount_path
    }

    fn open_read(&self, path: &str, _exclusive: bool) -> VfsResult<Box<dyn DataDirReader>> {
        let full = self.resolve(path)?;
        let file = File::open(&full).map_err(|_| VfsError::NotFound(path.to_owned()))?;
        let size = file.metadata()?.len();
        Ok(Box::new(FolderReader {
            file: BufReader::new(file),
            size,
        }))
    }

    fn open_write(&self, path: &str) -> VfsResult<Box<dyn Write + Send>> {
        if self.usage != DataDirUsage::AllowWrites {
            return Err(VfsError::ReadOnly);
        }

        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = File::create(&full)?;
        Ok(Box::new(BufWriter::new(file)))
    }

    fn exists_file(&self, path: &str) -> bool {
        self.resolve(path).map(|p| p.is_file()).unwrap_or(false)
    }

    fn file_stats(&self, path: &str) -> VfsResult<FileStats> {
        let full = self.resolve(path)?;
        let meta = std::fs::metadata(&full).map_err(|_| VfsError::NotFound(path.to_owned()))?;

        let clean = make_clean_path(path);
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
        if self.usage != DataDirUsage::AllowWrites {
            return Err(VfsError::ReadOnly);
        }
        let full = self.resolve(path)?;
        std::fs::remove_file(full).map_err(VfsError::Io)
    }

    fn iterate(&self, visitor: &mut dyn FnMut(&str) -> bool) {
        for entry in WalkDir::new(&self.root).into_iter() {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("failed to iterate data directory"; "error" => %e);
                    continue;
                }
            };

            if !entry.path().is_file() {
                continue;
            }

            let relative = entry
                .path()
                .strip_prefix(&self.root)
                .expect("walked file is under the root");
            let relative = make_clean_path(&relative.to_string_lossy());
            if !visitor(&relative) {
                return;
            }
        }
    }

    fn resolve_redirection(&self, guid: &str) -> Option<String> {
        self.redirections.read().get(guid).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (tempfile::TempDir, FolderDataDir) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("top.txt"), b"top").unwrap();
        std::fs::write(dir.path().join("sub/nested.txt"), b"nested!").unwrap();

        let mount = FolderDataDir::new(
            dir.path().to_str().unwrap(),
            DataDirUsage::AllowWrites,
        )
        .unwrap();
        (dir, mount)
    }

    #[test]
    fn reads_and_stats() {
        let (_dir, mount) = fixture();

        let mut reader = mount.open_read("sub/nested.txt", false).unwrap();
        assert_eq!(reader.file_size(), 7);
        let mut content = String::new();
        reader.read_to_string(&mut content).unwrap();
        assert_eq!(content, "nested!");

        let stats = mount.file_stats("sub/nested.txt").unwrap();
        assert!(!stats.is_directory);
        assert_eq!(stats.size, 7);
        assert_eq!(stats.name, "nested.txt");
        assert_eq!(stats.parent_path, "sub");

        assert!(mount.exists_file("top.txt"));
        assert!(!mount.exists_file("missing.txt"));
    }

    #[test]
    fn writes_create_directories() {
        let (dir, mount) = fixture();

        {
            let mut writer = mount.open_write("new/deep/file.bin").unwrap();
            writer.write_all(b"payload").unwrap();
        }

        assert_eq!(
            std::fs::read(dir.path().join("new/deep/file.bin")).unwrap(),
            b"payload"
        );
    }

    #[test]
    fn escaping_paths_are_rejected() {
        let (_dir, mount) = fixture();

        assert!(matches!(
            mount.open_write("../outside.txt"),
            Err(VfsError::EscapesRoot(_))
        ));
        assert!(matches!(
            mount.open_write("a/../../outside.txt"),
            Err(VfsError::EscapesRoot(_))
        ));
    }

    #[test]
    fn read_only_mounts_reject_writes() {
        let dir = tempfile::tempdir().unwrap();
        let mount =
            FolderDataDir::new(dir.path().to_str().unwrap(), DataDirUsage::ReadOnly).unwrap();
        assert!(matches!(mount.open_write("x.txt"), Err(VfsError::ReadOnly)));
    }

    #[test]
    fn iteration_visits_every_file_once() {
        let (_dir, mount) = fixture();

        let mut seen = Vec::new();
        mount.iterate(&mut |path| {
            seen.push(path.to_owned());
            true
        });

        seen.sort();
        assert_eq!(seen, ["sub/nested.txt", "top.txt"]);
    }
}
