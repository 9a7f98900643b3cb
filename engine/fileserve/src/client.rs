//! The consuming side: mirrors the server's data dirs through an on-disk
//! cache keyed by (timestamp, content hash)

use std::collections::HashMap;
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use common::*;
use uuid::Uuid;

use crate::protocol::*;
use crate::{FileserveError, FileserveResult};

#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// "host:port" tried before the saved/discovered addresses
    pub server: Option<String>,
    /// Root under which the content cache and meta sidecars live
    pub cache_root: PathBuf,
    pub timeout: Duration,
    /// How long a cached file-status answer suppresses server round-trips
    pub cache_status_ttl: Duration,
}

impl ClientConfig {
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        let engine = config::get_or_defaults();
        Self {
            server: engine.fileserve.server.clone(),
            cache_root: cache_root.into(),
            timeout: Duration::from_secs_f32(engine.fileserve.timeout_secs),
            cache_status_ttl: Duration::from_secs_f32(engine.fileserve.cache_status_ttl_secs),
        }
    }

    pub fn server(mut self, address: impl Into<String>) -> Self {
        self.server = Some(address.into());
        self
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct FileCacheStatus {
    pub timestamp: i64,
    pub hash: u64,
    last_check: Option<Instant>,
}

struct MountedDataDir {
    mount_point: String,
    mounted: bool,
    cache_status: HashMap<String, FileCacheStatus>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ClientStats {
    /// READ requests that actually hit the network
    pub read_requests_sent: usize,
    pub bytes_downloaded: u64,
    pub bytes_uploaded: u64,
}

/// Connected fileserve client. All calls are synchronous request/response
/// pairs over one connection
pub struct FileserveClient {
    stream: TcpStream,
    server_address: String,
    cache_dir: PathBuf,
    meta_dir: PathBuf,
    mounts: Vec<MountedDataDir>,
    /// Which mount last answered for a path
    file_datadir: HashMap<String, u16>,
    ttl: Duration,
    timeout: Duration,
    stats: ClientStats,
    reload_requested: bool,
}

impl FileserveClient {
    /// Tries, in order of preference: the configured server, the config file
    /// next to the binary, the address saved from the last successful
    /// session
    pub fn connect(config: &ClientConfig) -> FileserveResult<Self> {
        let mut candidates: Vec<String> = Vec::new();

        // lowest priority first; most recently pushed wins
        candidates.push("localhost:1042".to_owned());
        if let Some(saved) = read_address_file(&config.cache_root.join("fileserve.txt")) {
            candidates.push(saved);
        }
        if let Some(beside_binary) = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join("fileserve.txt")))
            .and_then(|path| read_address_file(&path))
        {
            candidates.push(beside_binary);
        }
        if let Some(server) = &config.server {
            candidates.push(server.clone());
        }

        let mut last_error = FileserveError::NotConnected;
        for address in candidates.iter().rev() {
            match Self::connect_to(address, config) {
                Ok(client) => {
                    // remember the address that worked
                    let _ = std::fs::create_dir_all(&config.cache_root);
                    let _ = std::fs::write(config.cache_root.join("fileserve.txt"), address);
                    return Ok(client);
                }
                Err(e) => {
                    debug!("fileserve candidate failed"; "address" => address.as_str(), "error" => %e);
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    fn connect_to(address: &str, config: &ClientConfig) -> FileserveResult<Self> {
        let mut addrs = std::net::ToSocketAddrs::to_socket_addrs(address)
            .map_err(|_| FileserveError::NotConnected)?;
        let addr = addrs.next().ok_or(FileserveError::NotConnected)?;

        let stream = TcpStream::connect_timeout(&addr, config.timeout)?;
        stream.set_read_timeout(Some(config.timeout))?;
        stream.set_nodelay(true).ok();

        let cache_dir = config.cache_root.join("Cache");
        let meta_dir = config.cache_root.join("Meta");
        std::fs::create_dir_all(&cache_dir)?;
        std::fs::create_dir_all(&meta_dir)?;

        let mut client = Self {
            stream,
            server_address: address.to_owned(),
            cache_dir,
            meta_dir,
            mounts: Vec::new(),
            file_datadir: HashMap::new(),
            ttl: config.cache_status_ttl,
            timeout: config.timeout,
            stats: ClientStats::default(),
            reload_requested: false,
        };

        client.send(&Frame::new(GROUP_FSRV, MSG_HELO))?;
        info!("connected to file server"; "address" => address);
        Ok(client)
    }

    /// Listens on the discovery endpoint for a server announcing itself and
    /// returns its "ip:port"
    pub fn wait_for_server_info(discovery_port: u16, timeout: Duration) -> FileserveResult<String> {
        let socket = std::net::UdpSocket::bind(("0.0.0.0", discovery_port))?;
        socket.set_read_timeout(Some(timeout))?;

        let mut buf = [0u8; 2048];
        let (len, _from) = socket.recv_from(&mut buf).map_err(|_| FileserveError::Timeout)?;

        let frame = Frame::read_from(&mut &buf[..len])?;
        if frame.group != GROUP_NSIP || frame.id != MSG_MY_IP {
            return Err(FileserveError::Protocol("unexpected discovery message"));
        }

        let mut reader = frame.reader();
        let port = reader.u16()?;
        let count = reader.u8()?;
        let mut ips = Vec::with_capacity(count as usize);
        for _ in 0..count {
            ips.push(reader.str()?);
        }

        ips.into_iter()
            .next()
            .map(|ip| format!("{}:{}", ip, port))
            .ok_or(FileserveError::Protocol("beacon carried no addresses"))
    }

    pub fn server_address(&self) -> &str {
        &self.server_address
    }

    pub fn stats(&self) -> ClientStats {
        self.stats
    }

    /// True once after the server broadcast a reload request
    pub fn take_reload_requested(&mut self) -> bool {
        std::mem::take(&mut self.reload_requested)
    }

    fn send(&mut self, frame: &Frame) -> FileserveResult<()> {
        let mut writer = &self.stream;
        frame.write_to(&mut writer)
    }

    /// Mirrors a local data-dir registration on the server. Returns the
    /// mount id used in subsequent requests
    pub fn mount_data_directory(&mut self, data_dir: &str, root_name: &str) -> FileserveResult<u16> {
        let root = root_name.trim_matches(|c| c == ':' || c == '/');
        let mount_point = mount_point_hash(data_dir);
        let dd_id = self.mounts.len() as u16;

        let mut frame = Frame::new(GROUP_FSRV, MSG_MOUNT);
        frame
            .push_str(data_dir)
            .push_str(root)
            .push_str(&mount_point)
            .push_u16(dd_id);
        self.send(&frame)?;

        std::fs::create_dir_all(self.cache_dir.join(&mount_point))?;
        std::fs::create_dir_all(self.meta_dir.join(&mount_point))?;

        self.mounts.push(MountedDataDir {
            mount_point,
            mounted: true,
            cache_status: HashMap::new(),
        });
        Ok(dd_id)
    }

    pub fn unmount_data_directory(&mut self, dd_id: u16) -> FileserveResult<()> {
        let mount = self
            .mounts
            .get_mut(dd_id as usize)
            .ok_or(FileserveError::InvalidMount(dd_id))?;
        mount.mounted = false;

        let mut frame = Frame::new(GROUP_FSRV, MSG_UNMOUNT);
        frame.push_u16(dd_id);
        self.send(&frame)
    }

    fn cached_paths(&self, mount_point: &str, file: &str) -> (PathBuf, PathBuf) {
        let clean = vfs::make_clean_path(file);
        (
            self.cache_dir.join(mount_point).join(&clean),
            self.meta_dir.join(mount_point).join(&clean),
        )
    }

    fn write_meta_file(path: &Path, timestamp: i64, hash: u64) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let mut bytes = Vec::with_capacity(16);
        bytes.extend_from_slice(&timestamp.to_le_bytes());
        bytes.extend_from_slice(&hash.to_le_bytes());
        if let Err(e) = std::fs::write(path, bytes) {
            error!("failed to write cache meta file"; "path" => %path.display(), "error" => %e);
        }
    }

    fn read_meta_file(path: &Path) -> Option<(i64, u64)> {
        let bytes = std::fs::read(path).ok()?;
        if bytes.len() != 16 {
            return None;
        }
        let timestamp = i64::from_le_bytes(bytes[..8].try_into().unwrap());
        let hash = u64::from_le_bytes(bytes[8..].try_into().unwrap());
        Some((timestamp, hash))
    }

    /// Seeds the per-mount status of `file` from what is on disk
    fn fill_file_status_cache(&mut self, file: &str) {
        let mut best = 0xffffu16;

        for dd in (0..self.mounts.len()).rev() {
            if !self.mounts[dd].mounted {
                continue;
            }

            let (cached, meta) = self.cached_paths(&self.mounts[dd].mount_point, file);
            let mut status = FileCacheStatus::default();

            if cached.is_file() {
                match Self::read_meta_file(&meta) {
                    Some((timestamp, hash)) => {
                        status.timestamp = timestamp;
                        status.hash = hash;
                    }
                    None => {
                        // data without its sidecar is useless
                        std::fs::remove_file(&cached).ok();
                    }
                }
            }

            if best == 0xffff && status.timestamp != 0 && status.hash != 0 {
                best = dd as u16;
            }
            self.mounts[dd]
                .cache_status
                .insert(file.to_owned(), status);
        }

        if best == 0xffff {
            best = 0;
        }
        self.file_datadir.insert(file.to_owned(), best);
    }

    /// Resets what the client believes about a path, forcing the next access
    /// to ask the server
    fn invalidate_file_cache(&mut self, dd_id: u16, file: &str, hash: u64) {
        if let Some(mount) = self.mounts.get_mut(dd_id as usize) {
            mount.cache_status.insert(
                file.to_owned(),
                FileCacheStatus {
                    timestamp: 0,
                    hash,
                    last_check: None,
                },
            );
        }
        self.file_datadir.insert(file.to_owned(), dd_id);
    }

    /// Invalidates every cached status, e.g. after a reload broadcast
    pub fn invalidate_all_cache_status(&mut self) {
        for mount in &mut self.mounts {
            for status in mount.cache_status.values_mut() {
                status.last_check = None;
            }
        }
    }

    /// Fetches (or revalidates) `file` and returns the path of the cached
    /// copy. Within the status TTL no network traffic happens at all
    pub fn download_file(
        &mut self,
        dd_id: u16,
        file: &str,
        force_this_dir: bool,
    ) -> FileserveResult<PathBuf> {
        if self.mounts.get(dd_id as usize).map(|m| m.mounted) != Some(true) {
            return Err(FileserveError::InvalidMount(dd_id));
        }

        if !self.file_datadir.contains_key(file) {
            self.fill_file_status_cache(file);
        }

        let use_dd = if force_this_dir {
            dd_id
        } else {
            *self.file_datadir.get(file).expect("filled above")
        };

        let status = self.mounts[use_dd as usize]
            .cache_status
            .entry(file.to_owned())
            .or_default();

        if let Some(checked) = status.last_check {
            if checked.elapsed() < self.ttl {
                // answer from cache without a round-trip
                if status.hash == 0 {
                    return Err(FileserveError::NotFound(file.to_owned()));
                }
                let (cached, _) = self.cached_paths(&self.mounts[use_dd as usize].mount_point, file);
                return Ok(cached);
            }
        }

        let request_uuid = Uuid::new_v4();
        let (known_ts, known_hash) = (status.timestamp, status.hash);

        let mut request = Frame::new(GROUP_FSRV, MSG_READ);
        request
            .push_u16(use_dd)
            .push_u8(force_this_dir as u8)
            .push_str(file)
            .push_uuid(&request_uuid)
            .push_i64(known_ts)
            .push_u64(known_hash);
        self.send(&request)?;
        self.stats.read_requests_sent += 1;

        let mut download: Vec<u8> = Vec::new();
        loop {
            let frame = Frame::read_from(&mut self.stream)?;
            match frame.id {
                MSG_DOWNLOAD => {
                    let mut reader = frame.reader();
                    if reader.uuid()? != request_uuid {
                        continue; // answer for someone else
                    }
                    let chunk = reader.u16()? as usize;
                    let total = reader.u32()? as usize;
                    download.reserve(total);
                    download.extend_from_slice(reader.bytes(chunk)?);
                    self.stats.bytes_downloaded += chunk as u64;
                }
                MSG_DOWNLOAD_FINISHED => {
                    let mut reader = frame.reader();
                    if reader.uuid()? != request_uuid {
                        continue;
                    }
                    let state = FileState::from_i8(reader.i8()?)?;
                    let server_ts = reader.i64()?;
                    let server_hash = reader.u64()?;
                    let resolved_dd = reader.u16()?;

                    return self.finish_download(
                        file,
                        state,
                        server_ts,
                        server_hash,
                        resolved_dd,
                        download,
                    );
                }
                MSG_RELOAD_RESOURCES => {
                    self.reload_requested = true;
                    self.invalidate_all_cache_status();
                }
                _ => {}
            }
        }
    }

    fn finish_download(
        &mut self,
        file: &str,
        state: FileState,
        server_ts: i64,
        server_hash: u64,
        resolved_dd: u16,
        download: Vec<u8>,
    ) -> FileserveResult<PathBuf> {
        let now = Instant::now();

        if resolved_dd == 0xffff {
            // no mount on the server has it
            self.file_datadir.insert(file.to_owned(), 0);
            for mount in &mut self.mounts {
                mount.cache_status.insert(
                    file.to_owned(),
                    FileCacheStatus {
                        timestamp: 0,
                        hash: 0,
                        last_check: Some(now),
                    },
                );
            }

            if state == FileState::NonExistant {
                // stale cached copies are dropped everywhere
                for dd in 0..self.mounts.len() {
                    let (cached, meta) = self.cached_paths(&self.mounts[dd].mount_point, file);
                    std::fs::remove_file(cached).ok();
                    std::fs::remove_file(meta).ok();
                }
            }

            return Err(FileserveError::NotFound(file.to_owned()));
        }

        let resolved = resolved_dd as usize;
        if resolved >= self.mounts.len() {
            return Err(FileserveError::Protocol("resolved mount out of range"));
        }

        self.file_datadir.insert(file.to_owned(), resolved_dd);
        self.mounts[resolved].cache_status.insert(
            file.to_owned(),
            FileCacheStatus {
                timestamp: server_ts,
                hash: server_hash,
                last_check: Some(now),
            },
        );

        let (cached, meta) = self.cached_paths(&self.mounts[resolved].mount_point, file);
        match state {
            // nothing changed, the cached copy is authoritative
            FileState::SameTimestamp | FileState::NonExistantEither => {}
            // content identical, only the sidecar's timestamp moves
            FileState::SameHash => {
                Self::write_meta_file(&meta, server_ts, server_hash);
            }
            FileState::Different => {
                if let Some(parent) = cached.parent() {
                    std::fs::create_dir_all(parent).ok();
                }
                std::fs::write(&cached, &download)?;
                Self::write_meta_file(&meta, server_ts, server_hash);
            }
            FileState::NonExistant => {
                std::fs::remove_file(&cached).ok();
                std::fs::remove_file(&meta).ok();
                return Err(FileserveError::NotFound(file.to_owned()));
            }
        }

        Ok(cached)
    }

    /// Pushes a file to the server's data dir and blocks until it confirms
    /// the write
    pub fn upload_file(&mut self, dd_id: u16, file: &str, content: &[u8]) -> FileserveResult<()> {
        if self.mounts.get(dd_id as usize).map(|m| m.mounted) != Some(true) {
            return Err(FileserveError::InvalidMount(dd_id));
        }

        // pre-populate the local cache so an immediate re-read hits it
        let hash = content_hash(content);
        {
            let (cached, meta) = self.cached_paths(&self.mounts[dd_id as usize].mount_point, file);
            if let Some(parent) = cached.parent() {
                std::fs::create_dir_all(parent).ok();
            }
            std::fs::write(&cached, content)?;
            Self::write_meta_file(&meta, 0, hash);
        }
        self.invalidate_file_cache(dd_id, file, hash);

        let upload_uuid = Uuid::new_v4();

        let mut header = Frame::new(GROUP_FSRV, MSG_UPLOAD_HEADER);
        header
            .push_uuid(&upload_uuid)
            .push_u32(content.len() as u32)
            .push_u16(dd_id)
            .push_str(file);
        self.send(&header)?;

        let mut next = 0;
        while next < content.len() {
            let chunk = CHUNK_SIZE.min(content.len() - next);
            let mut data = Frame::new(GROUP_FSRV, MSG_UPLOAD_DATA);
            data.push_uuid(&upload_uuid)
                .push_u16(chunk as u16)
                .push_bytes(&content[next..next + chunk]);
            self.send(&data)?;
            next += chunk;
            self.stats.bytes_uploaded += chunk as u64;
        }

        let mut finished = Frame::new(GROUP_FSRV, MSG_UPLOAD_FINISHED);
        finished
            .push_uuid(&upload_uuid)
            .push_u16(dd_id)
            .push_str(file);
        self.send(&finished)?;

        // pump until the ack arrives
        loop {
            let frame = Frame::read_from(&mut self.stream)?;
            match frame.id {
                MSG_UPLOAD_ACK => return Ok(()),
                MSG_RELOAD_RESOURCES => {
                    self.reload_requested = true;
                    self.invalidate_all_cache_status();
                }
                _ => {}
            }
        }
    }

    pub fn delete_file(&mut self, dd_id: u16, file: &str) -> FileserveResult<()> {
        if self.mounts.get(dd_id as usize).map(|m| m.mounted) != Some(true) {
            return Err(FileserveError::InvalidMount(dd_id));
        }

        self.invalidate_file_cache(dd_id, file, 0);

        let mut frame = Frame::new(GROUP_FSRV, MSG_DELETE_FILE);
        frame.push_u16(dd_id).push_str(file);
        self.send(&frame)
    }

    /// Checks for messages the server pushed between operations (reload
    /// broadcasts). Never blocks longer than `wait`
    pub fn pump(&mut self, wait: Duration) {
        self.stream.set_read_timeout(Some(wait)).ok();
        if let Ok(frame) = Frame::read_from(&mut self.stream) {
            if frame.id == MSG_RELOAD_RESOURCES {
                self.reload_requested = true;
                self.invalidate_all_cache_status();
            }
        }
        self.stream.set_read_timeout(Some(self.timeout)).ok();
    }
}

fn read_address_file(path: &Path) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    let trimmed = content.trim();
    // must look like host:port
    if trimmed.is_empty() || !trimmed.contains(':') {
        return None;
    }
    Some(trimmed.to_owned())
}
