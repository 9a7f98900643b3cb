//! Indexed archive files backing read-only mounts. Layout is
//! `[magic][blob][toc][footer]`, entries optionally zstd-compressed. Open
//! files borrow a pooled reader so hot paths do not allocate per open

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use common::*;
use memmap::Mmap;

use crate::datadir::{DataDirReader, DataDirectory, FileStats};
use crate::path::make_clean_path;
use crate::{VfsError, VfsResult};

const HEAD_MAGIC: &[u8; 8] = b"ENGARCH1";
const TAIL_MAGIC: &[u8; 8] = b"ENGARCHT";

/// File extension an archive mount looks for inside its path
pub const ARCHIVE_EXTENSION: &str = ".arc";

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum CompressionMode {
    Uncompressed = 0,
    Zstd = 1,
}

impl CompressionMode {
    fn from_u8(v: u8) -> VfsResult<Self> {
        match v {
            0 => Ok(CompressionMode::Uncompressed),
            1 => Ok(CompressionMode::Zstd),
            other => Err(VfsError::UnsupportedCompression(other)),
        }
    }
}

#[derive(Clone, Debug)]
struct TocEntry {
    offset: u64,
    stored_size: u64,
    uncompressed_size: u64,
    compression: CompressionMode,
}

struct ArchiveShared {
    mmap: Mmap,
    toc: HashMap<String, TocEntry>,
    modified: SystemTime,
}

/// Token cycled through the per-mode free pools; carries scratch capacity so
/// reuse skips the allocation
struct ReaderCore {
    _scratch: Vec<u8>,
}

#[derive(Default)]
struct ReaderPool {
    free: parking_lot::Mutex<Vec<ReaderCore>>,
    created: std::sync::atomic::AtomicUsize,
}

impl ReaderPool {
    fn take(&self) -> ReaderCore {
        if let Some(core) = self.free.lock().pop() {
            return core;
        }
        self.created
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        ReaderCore {
            _scratch: Vec::new(),
        }
    }

    fn put_back(&self, core: ReaderCore) {
        self.free.lock().push(core);
    }
}

/// Read-only mount backed by a single archive file, optionally rooted at a
/// sub-folder inside it
pub struct ArchiveDataDir {
    mount_path: String,
    shared: Arc<ArchiveShared>,
    sub_folder: String,
    pool_uncompressed: Arc<ReaderPool>,
    pool_zstd: Arc<ReaderPool>,
}

impl ArchiveDataDir {
    pub fn new(mount_path: &str) -> VfsResult<Self> {
        let resolved = if mount_path.starts_with('>') {
            crate::path::resolve_special_directory(mount_path)?
        } else {
            PathBuf::from(mount_path)
        };
        let resolved = make_clean_path(&resolved.to_string_lossy());

        let (archive_path, sub_folder) = split_archive_path(&resolved)
            .ok_or_else(|| VfsError::InvalidPath(mount_path.to_owned()))?;

        let file = File::open(&archive_path)
            .map_err(|_| VfsError::NotFound(archive_path.display().to_string()))?;
        let modified = file.metadata()?.modified()?;
        // safety: archives are written once and treated as immutable afterwards
        let mmap = unsafe { Mmap::map(&file)? };

        let toc = parse_toc(&mmap)?;
        debug!(
            "opened archive mount";
            "archive" => %archive_path.display(),
            "entries" => toc.len(),
            "sub_folder" => &sub_folder
        );

        Ok(Self {
            mount_path: mount_path.to_owned(),
            shared: Arc::new(ArchiveShared {
                mmap,
                toc,
                modified,
            }),
            sub_folder,
            pool_uncompressed: Default::default(),
            pool_zstd: Default::default(),
        })
    }

    fn entry_key(&self, path: &str) -> String {
        let clean = make_clean_path(path);
        if self.sub_folder.is_empty() {
            clean
        } else {
            format!("{}/{}", self.sub_folder, clean)
        }
    }

    fn find_entry(&self, path: &str) -> Option<&TocEntry> {
        self.shared.toc.get(&self.entry_key(path))
    }

    /// (total readers created, currently pooled) per compression mode, for
    /// diagnostics
    pub fn reader_pool_stats(&self) -> [(usize, usize); 2] {
        let count = |pool: &ReaderPool| {
            (
                pool.created.load(std::sync::atomic::Ordering::Relaxed),
                pool.free.lock().len(),
            )
        };
        [count(&self.pool_uncompressed), count(&self.pool_zstd)]
    }
}

fn split_archive_path(path: &str) -> Option<(PathBuf, String)> {
    if path.ends_with(ARCHIVE_EXTENSION) {
        return Some((PathBuf::from(path), String::new()));
    }

    let marker = format!("{}/", ARCHIVE_EXTENSION);
    path.rfind(&marker).map(|idx| {
        let split = idx + ARCHIVE_EXTENSION.len();
        (
            PathBuf::from(&path[..split]),
            path[split + 1..].to_owned(),
        )
    })
}

fn parse_toc(mmap: &Mmap) -> VfsResult<HashMap<String, TocEntry>> {
    let bytes: &[u8] = mmap;
    if bytes.len() < HEAD_MAGIC.len() + 16 || &bytes[..8] != HEAD_MAGIC {
        return Err(VfsError::MalformedArchive("bad header"));
    }

    let tail = &bytes[bytes.len() - 16..];
    if &tail[8..] != TAIL_MAGIC {
        return Err(VfsError::MalformedArchive("bad footer"));
    }

    let toc_offset = (&tail[..8]).read_u64::<LittleEndian>()? as usize;
    if toc_offset >= bytes.len() - 16 {
        return Err(VfsError::MalformedArchive("toc offset out of range"));
    }

    let mut toc_bytes = &bytes[toc_offset..bytes.len() - 16];
    let count = toc_bytes.read_u32::<LittleEndian>()?;

    let mut toc = HashMap::with_capacity(count as usize);
    for _ in 0..count {
        let path_len = toc_bytes.read_u32::<LittleEndian>()? as usize;
        if toc_bytes.len() < path_len {
            return Err(VfsError::MalformedArchive("truncated toc entry"));
        }
        let (path, rest) = toc_bytes.split_at(path_len);
        toc_bytes = rest;
        let path = std::str::from_utf8(path)
            .map_err(|_| VfsError::MalformedArchive("entry path utf8"))?
            .to_owned();

        let offset = toc_bytes.read_u64::<LittleEndian>()?;
        let stored_size = toc_bytes.read_u64::<LittleEndian>()?;
        let uncompressed_size = toc_bytes.read_u64::<LittleEndian>()?;
        let compression = CompressionMode::from_u8(toc_bytes.read_u8()?)?;

        toc.insert(
            path,
            TocEntry {
                offset,
                stored_size,
                uncompressed_size,
                compression,
            },
        );
    }

    Ok(toc)
}

/// Bounded view into the archive blob
struct BlobSlice {
    shared: Arc<ArchiveShared>,
    start: usize,
    len: usize,
    pos: usize,
}

impl Read for BlobSlice {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let remaining = self.len - self.pos;
        let n = remaining.min(buf.len());
        let from = self.start + self.pos;
        buf[..n].copy_from_slice(&self.shared.mmap[from..from + n]);
        self.pos += n;
        Ok(n)
    }
}

struct UncompressedReader {
    slice: BlobSlice,
    size: u64,
    pool: Arc<ReaderPool>,
    core: Option<ReaderCore>,
}

impl Read for UncompressedReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.slice.read(buf)
    }
}

impl DataDirReader for UncompressedReader {
    fn file_size(&self) -> u64 {
        self.size
    }
}

impl Drop for UncompressedReader {
    fn drop(&mut self) {
        if let Some(core) = self.core.take() {
            self.pool.put_back(core);
        }
    }
}

struct ZstdReader {
    decoder: zstd::stream::read::Decoder<'static, BufReader<BlobSlice>>,
    size: u64,
    pool: Arc<ReaderPool>,
    core: Option<ReaderCore>,
}

impl Read for ZstdReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.decoder.read(buf)
    }
}

impl DataDirReader for ZstdReader {
    fn file_size(&self) -> u64 {
        self.size
    }
}

impl Drop for ZstdReader {
    fn drop(&mut self) {
        if let Some(core) = self.core.take() {
            self.pool.put_back(core);
        }
    }
}

impl DataDirectory for ArchiveDataDir {
    fn mount_path(&self) -> &str {
        &self.mount_path
    }

    fn open_read(&self, path: &str, exclusive: bool) -> VfsResult<Box<dyn DataDirReader>> {
        if exclusive {
            return Err(VfsError::ExclusiveAccessUnsupported);
        }

        let entry = self
            .find_entry(path)
            .ok_or_else(|| VfsError::NotFound(path.to_owned()))?
            .clone();

        let blob_start = HEAD_MAGIC.len() + entry.offset as usize;
        let slice = BlobSlice {
            shared: Arc::clone(&self.shared),
            start: blob_start,
            len: entry.stored_size as usize,
            pos: 0,
        };

        match entry.compression {
            CompressionMode::Uncompressed => {
                let core = self.pool_uncompressed.take();
                Ok(Box::new(UncompressedReader {
                    slice,
                    size: entry.uncompressed_size,
                    pool: Arc::clone(&self.pool_uncompressed),
                    core: Some(core),
                }))
            }
            CompressionMode::Zstd => {
                let core = self.pool_zstd.take();
                let decoder = zstd::stream::read::Decoder::new(slice)?;
                Ok(Box::new(ZstdReader {
                    decoder,
                    size: entry.uncompressed_size,
                    pool: Arc::clone(&self.pool_zstd),
                    core: Some(core),
                }))
            }
        }
    }

    fn open_write(&self, _path: &str) -> VfsResult<Box<dyn Write + Send>> {
        Err(VfsError::ReadOnly)
    }

    fn exists_file(&self, path: &str) -> bool {
        self.find_entry(path).is_some()
    }

    fn file_stats(&self, path: &str) -> VfsResult<FileStats> {
        let entry = self
            .find_entry(path)
            .ok_or_else(|| VfsError::NotFound(path.to_owned()))?;

        let clean = make_clean_path(path);
        let (parent, name) = clean.rsplit_once('/').unwrap_or(("", clean.as_str()));

        Ok(FileStats {
            is_directory: false,
            size: entry.uncompressed_size,
            modified: self.shared.modified,
            name: name.to_owned(),
            parent_path: parent.to_owned(),
        })
    }

    fn delete_file(&self, _path: &str) -> VfsResult<()> {
        Err(VfsError::ReadOnly)
    }

    fn iterate(&self, visitor: &mut dyn FnMut(&str) -> bool) {
        let prefix = if self.sub_folder.is_empty() {
            String::new()
        } else {
            format!("{}/", self.sub_folder)
        };

        for path in self.shared.toc.keys() {
            if let Some(relative) = path.strip_prefix(&prefix) {
                if !visitor(relative) {
                    return;
                }
            }
        }
    }
}

/// Builds an archive file entry by entry
pub struct ArchiveWriter {
    out: File,
    blob_written: u64,
    entries: Vec<(String, TocEntry)>,
}

impl ArchiveWriter {
    pub fn create(path: impl AsRef<Path>) -> VfsResult<Self> {
        let mut out = File::create(path)?;
        out.write_all(HEAD_MAGIC)?;
        Ok(Self {
            out,
            blob_written: 0,
            entries: Vec::new(),
        })
    }

    pub fn add_file(
        &mut self,
        path: &str,
        content: &[u8],
        compression: CompressionMode,
    ) -> VfsResult<()> {
        let stored = match compression {
            CompressionMode::Uncompressed => content.to_vec(),
            CompressionMode::Zstd => zstd::encode_all(content, 0)?,
        };

        self.out.write_all(&stored)?;
        self.entries.push((
            make_clean_path(path),
            TocEntry {
                offset: self.blob_written,
                stored_size: stored.len() as u64,
                uncompressed_size: content.len() as u64,
                compression,
            },
        ));
        self.blob_written += stored.len() as u64;
        Ok(())
    }

    pub fn finish(mut self) -> VfsResult<()> {
        let toc_offset = HEAD_MAGIC.len() as u64 + self.blob_written;

        self.out.write_u32::<LittleEndian>(self.entries.len() as u32)?;
        for (path, entry) in &self.entries {
            self.out.write_u32::<LittleEndian>(path.len() as u32)?;
            self.out.write_all(path.as_bytes())?;
            self.out.write_u64::<LittleEndian>(entry.offset)?;
            self.out.write_u64::<LittleEndian>(entry.stored_size)?;
            self.out.write_u64::<LittleEndian>(entry.uncompressed_size)?;
            self.out.write_u8(entry.compression as u8)?;
        }

        self.out.write_u64::<LittleEndian>(toc_offset)?;
        self.out.write_all(TAIL_MAGIC)?;
        self.out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_archive(dir: &Path) -> PathBuf {
        common::logging::for_tests();
        let archive_path = dir.join("pack.arc");
        let mut writer = ArchiveWriter::create(&archive_path).unwrap();
        writer
            .add_file("plain.txt", b"plain content", CompressionMode::Uncompressed)
            .unwrap();
        let big = vec![42u8; 64 * 1024];
        writer
            .add_file("nested/big.bin", &big, CompressionMode::Zstd)
            .unwrap();
        writer.finish().unwrap();
        archive_path
    }

    #[test]
    fn round_trips_both_compression_modes() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = build_archive(dir.path());

        let mount = ArchiveDataDir::new(archive_path.to_str().unwrap()).unwrap();

        let mut plain = String::new();
        mount
            .open_read("plain.txt", false)
            .unwrap()
            .read_to_string(&mut plain)
            .unwrap();
        assert_eq!(plain, "plain content");

        let mut big = Vec::new();
        let mut reader = mount.open_read("nested/big.bin", false).unwrap();
        assert_eq!(reader.file_size(), 64 * 1024);
        reader.read_to_end(&mut big).unwrap();
        assert_eq!(big, vec![42u8; 64 * 1024]);
    }

    #[test]
    fn lookups_and_stats_come_from_the_toc() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = build_archive(dir.path());
        let mount = ArchiveDataDir::new(archive_path.to_str().unwrap()).unwrap();

        assert!(mount.exists_file("plain.txt"));
        assert!(mount.exists_file("nested/big.bin"));
        assert!(!mount.exists_file("missing.txt"));

        let stats = mount.file_stats("nested/big.bin").unwrap();
        assert_eq!(stats.size, 64 * 1024);
        assert_eq!(stats.name, "big.bin");
        assert_eq!(stats.parent_path, "nested");
    }

    #[test]
    fn exclusive_opens_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = build_archive(dir.path());
        let mount = ArchiveDataDir::new(archive_path.to_str().unwrap()).unwrap();

        assert!(matches!(
            mount.open_read("plain.txt", true),
            Err(VfsError::ExclusiveAccessUnsupported)
        ));
    }

    #[test]
    fn readers_return_to_the_pool() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = build_archive(dir.path());
        let mount = ArchiveDataDir::new(archive_path.to_str().unwrap()).unwrap();

        for _ in 0..4 {
            let mut reader = mount.open_read("plain.txt", false).unwrap();
            let mut sink = String::new();
            reader.read_to_string(&mut sink).unwrap();
        }

        let [(created, free), _] = mount.reader_pool_stats();
        assert_eq!(created, 1, "sequential opens must reuse the pooled reader");
        assert_eq!(free, 1);

        // two concurrent opens need a second reader
        let a = mount.open_read("plain.txt", false).unwrap();
        let b = mount.open_read("plain.txt", false).unwrap();
        drop((a, b));

        let [(created, free), _] = mount.reader_pool_stats();
        assert_eq!(created, 2);
        assert_eq!(free, 2);
    }

    #[test]
    fn sub_folder_mounts_scope_the_toc() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = build_archive(dir.path());

        let sub_path = format!("{}/nested", archive_path.display());
        let mount = ArchiveDataDir::new(&sub_path).unwrap();

        assert!(mount.exists_file("big.bin"));
        assert!(!mount.exists_file("plain.txt"));

        let mut seen = Vec::new();
        mount.iterate(&mut |p| {
            seen.push(p.to_owned());
            true
        });
        assert_eq!(seen, ["big.bin"]);
    }
}
