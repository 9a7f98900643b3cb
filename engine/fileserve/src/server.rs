//! The serving side: answers READ/upload/delete/mount requests from
//! connected clients and publishes activity events for UI layers

use std::collections::HashMap;
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::*;
use uuid::Uuid;

use crate::protocol::*;
use crate::{FileserveError, FileserveResult};

#[derive(Clone, Debug)]
pub enum FileserverEvent {
    ServerStarted { port: u16 },
    ServerStopped,
    ClientConnected { client: u32 },
    ClientDisconnected { client: u32 },
    AreYouThereRequest,
    MountDataDir { client: u32, root: String, path: String, redirected: String },
    MountDataDirFailed { client: u32, root: String, path: String },
    UnmountDataDir { client: u32, root: String, path: String },
    FileDownloadRequest { client: u32, path: String, state: FileState, size: u64 },
    FileDownloading { client: u32, path: String, sent: u64, total: u64 },
    FileDownloadFinished { client: u32, path: String },
    FileUploadRequest { client: u32, path: String, total: u64 },
    FileUploading { client: u32, path: String, sent: u64, total: u64 },
    FileUploadFinished { client: u32, path: String },
    FileDeleteRequest { client: u32, path: String },
}

struct Shared {
    event_sinks: parking_lot::Mutex<Vec<crossbeam_channel::Sender<FileserverEvent>>>,
    /// Write halves for broadcasts, keyed by client id
    writers: parking_lot::Mutex<HashMap<u32, TcpStream>>,
    shutdown: AtomicBool,
    next_client_id: AtomicU32,
}

impl Shared {
    fn publish(&self, event: FileserverEvent) {
        self.event_sinks
            .lock()
            .retain(|sink| sink.send(event.clone()).is_ok());
    }
}

/// Serves files to connected fileserve clients
pub struct Fileserver {
    shared: Arc<Shared>,
    port: u16,
    accept_thread: Option<std::thread::JoinHandle<()>>,
}

impl Fileserver {
    /// Binds and starts accepting. Port 0 picks a free one
    pub fn start(port: u16) -> FileserveResult<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        let port = listener.local_addr()?.port();
        listener.set_nonblocking(true)?;

        let shared = Arc::new(Shared {
            event_sinks: parking_lot::Mutex::new(Vec::new()),
            writers: parking_lot::Mutex::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
            next_client_id: AtomicU32::new(0),
        });

        let accept_shared = Arc::clone(&shared);
        let accept_thread = std::thread::Builder::new()
            .name("fileserve-accept".to_owned())
            .spawn(move || accept_loop(listener, accept_shared))
            .map_err(FileserveError::Io)?;

        info!("file server started"; "port" => port);
        shared.publish(FileserverEvent::ServerStarted { port });

        Ok(Self {
            shared,
            port,
            accept_thread: Some(accept_thread),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Activity events, for a UI or logging layer
    pub fn subscribe(&self) -> crossbeam_channel::Receiver<FileserverEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.shared.event_sinks.lock().push(tx);
        rx
    }

    /// Tells every connected client to reload its resources
    pub fn broadcast_reload_resources(&self) {
        let frame = Frame::new(GROUP_FSRV, MSG_RELOAD_RESOURCES);

        let mut writers = self.shared.writers.lock();
        writers.retain(|client, stream| {
            let mut writer = stream;
            match frame.write_to(&mut writer) {
                Ok(()) => true,
                Err(e) => {
                    debug!("dropping client on failed broadcast"; "client" => *client, "error" => %e);
                    false
                }
            }
        });
    }

    /// Announces this server on a client's discovery endpoint
    pub fn send_connection_info(
        &self,
        client_addr: &str,
        discovery_port: u16,
        ips: &[String],
    ) -> FileserveResult<()> {
        let socket = std::net::UdpSocket::bind(("0.0.0.0", 0))?;

        let mut frame = Frame::new(GROUP_NSIP, MSG_MY_IP);
        frame.push_u16(self.port);
        frame.push_u8(ips.len() as u8);
        for ip in ips {
            frame.push_str(ip);
        }

        let mut wire = Vec::new();
        frame.write_to(&mut wire)?;
        socket.send_to(&wire, (client_addr, discovery_port))?;
        Ok(())
    }
}

impl Drop for Fileserver {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        if let Some(thread) = self.accept_thread.take() {
            let _ = thread.join();
        }
        self.shared.publish(FileserverEvent::ServerStopped);
    }
}

fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    loop {
        if shared.shutdown.load(Ordering::SeqCst) {
            return;
        }

        match listener.accept() {
            Ok((stream, addr)) => {
                let client = shared.next_client_id.fetch_add(1, Ordering::SeqCst) + 1;
                debug!("fileserve client connected"; "client" => client, "addr" => %addr);

                if let Ok(writer) = stream.try_clone() {
                    shared.writers.lock().insert(client, writer);
                }
                shared.publish(FileserverEvent::ClientConnected { client });

                let client_shared = Arc::clone(&shared);
                let _ = std::thread::Builder::new()
                    .name(format!("fileserve-client-{}", client))
                    .spawn(move || {
                        if let Err(e) = handle_client(stream, client, &client_shared) {
                            debug!("fileserve client closed"; "client" => client, "error" => %e);
                        }
                        client_shared.writers.lock().remove(&client);
                        client_shared.publish(FileserverEvent::ClientDisconnected { client });
                    });
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(25));
            }
            Err(e) => {
                warn!("fileserve accept failed"; "error" => %e);
                std::thread::sleep(Duration::from_millis(250));
            }
        }
    }
}

struct MountEntry {
    client_path: String,
    root_name: String,
    server_path: Option<PathBuf>,
    mounted: bool,
}

struct UploadState {
    uuid: Uuid,
    total: u64,
    path: String,
    data: Vec<u8>,
}

#[derive(Default)]
struct ClientContext {
    mounts: Vec<MountEntry>,
    upload: Option<UploadState>,
}

fn handle_client(mut stream: TcpStream, client: u32, shared: &Shared) -> FileserveResult<()> {
    stream.set_nodelay(true).ok();
    let mut ctx = ClientContext::default();

    loop {
        if shared.shutdown.load(Ordering::SeqCst) {
            return Ok(());
        }

        let frame = Frame::read_from(&mut stream)?;
        if frame.group != GROUP_FSRV {
            warn!("frame outside the FSRV namespace"; "client" => client);
            continue;
        }

        match frame.id {
            MSG_HELO => {}
            MSG_ARE_YOU_THERE => {
                shared.publish(FileserverEvent::AreYouThereRequest);
                let reply = Frame::new(GROUP_FSRV, MSG_YES);
                write_frame(&stream, &reply)?;
            }
            MSG_MOUNT => handle_mount(&frame, client, &mut ctx, shared)?,
            MSG_UNMOUNT => handle_unmount(&frame, client, &mut ctx, shared)?,
            MSG_READ => handle_read(&frame, &stream, client, &ctx, shared)?,
            MSG_UPLOAD_HEADER => handle_upload_header(&frame, client, &mut ctx, shared)?,
            MSG_UPLOAD_DATA => handle_upload_data(&frame, client, &mut ctx, shared)?,
            MSG_UPLOAD_FINISHED => handle_upload_finished(&frame, &stream, client, &mut ctx, shared)?,
            MSG_DELETE_FILE => handle_delete(&frame, client, &ctx, shared)?,
            MSG_RELOAD_RESOURCES => {
                // a client asked everyone to reload
                let broadcast = Frame::new(GROUP_FSRV, MSG_RELOAD_RESOURCES);
                let mut writers = shared.writers.lock();
                writers.retain(|_, writer| {
                    let mut writer = writer;
                    broadcast.write_to(&mut writer).is_ok()
                });
            }
            other => {
                warn!(
                    "unknown FSRV message";
                    "id" => %String::from_utf8_lossy(&other),
                    "bytes" => frame.payload.len()
                );
            }
        }
    }
}

fn write_frame(stream: &TcpStream, frame: &Frame) -> FileserveResult<()> {
    let mut writer = stream;
    frame.write_to(&mut writer)
}

fn handle_mount(
    frame: &Frame,
    client: u32,
    ctx: &mut ClientContext,
    shared: &Shared,
) -> FileserveResult<()> {
    let mut reader = frame.reader();
    let client_path = reader.str()?;
    let root_name = reader.str()?;
    let _mount_point = reader.str()?;
    let dd_id = reader.u16()? as usize;

    if ctx.mounts.len() <= dd_id {
        ctx.mounts.resize_with(dd_id + 1, || MountEntry {
            client_path: String::new(),
            root_name: String::new(),
            server_path: None,
            mounted: false,
        });
    }

    let resolved = if client_path.starts_with('>') {
        vfs::resolve_special_directory(&client_path).ok()
    } else {
        Some(PathBuf::from(&client_path))
    };
    let resolved = resolved.filter(|p| p.is_dir());

    let entry = &mut ctx.mounts[dd_id];
    entry.client_path = client_path.clone();
    entry.root_name = root_name.clone();

    match resolved {
        Some(path) => {
            entry.server_path = Some(path.clone());
            entry.mounted = true;
            shared.publish(FileserverEvent::MountDataDir {
                client,
                root: root_name,
                path: client_path,
                redirected: path.display().to_string(),
            });
        }
        None => {
            entry.server_path = None;
            entry.mounted = false;
            shared.publish(FileserverEvent::MountDataDirFailed {
                client,
                root: root_name,
                path: client_path,
            });
        }
    }

    Ok(())
}

fn handle_unmount(
    frame: &Frame,
    client: u32,
    ctx: &mut ClientContext,
    shared: &Shared,
) -> FileserveResult<()> {
    let dd_id = frame.reader().u16()? as usize;
    let entry = ctx
        .mounts
        .get_mut(dd_id)
        .ok_or(FileserveError::InvalidMount(dd_id as u16))?;

    entry.mounted = false;
    shared.publish(FileserverEvent::UnmountDataDir {
        client,
        root: entry.root_name.clone(),
        path: entry.client_path.clone(),
    });
    Ok(())
}

fn handle_read(
    frame: &Frame,
    stream: &TcpStream,
    client: u32,
    ctx: &ClientContext,
    shared: &Shared,
) -> FileserveResult<()> {
    let mut reader = frame.reader();
    let requested_dd = reader.u16()?;
    let force_this_dir = reader.u8()? != 0;
    let path = reader.str()?;
    let uuid = reader.uuid()?;
    let client_ts = reader.i64()?;
    let client_hash = reader.u64()?;

    // probe mounts newest first, unless pinned to one
    let candidates: Vec<usize> = if force_this_dir {
        vec![requested_dd as usize]
    } else {
        (0..ctx.mounts.len()).rev().collect()
    };

    let mut found: Option<(usize, Vec<u8>, i64)> = None;
    for dd in candidates {
        let entry = match ctx.mounts.get(dd) {
            Some(e) if e.mounted => e,
            _ => continue,
        };
        let server_path = match &entry.server_path {
            Some(p) => p.join(&path),
            None => continue,
        };

        if let Ok(content) = std::fs::read(&server_path) {
            let ts = server_path
                .metadata()
                .and_then(|m| m.modified())
                .map(unix_timestamp)
                .unwrap_or(0);
            found = Some((dd, content, ts));
            break;
        }
    }

    let (state, resolved_dd, ts, hash, content) = match found {
        Some((dd, content, ts)) => {
            let hash = content_hash(&content);
            let state = if ts == client_ts && client_ts != 0 {
                FileState::SameTimestamp
            } else if hash == client_hash {
                FileState::SameHash
            } else {
                FileState::Different
            };
            (state, dd as u16, ts, hash, content)
        }
        None => {
            let state = if client_ts == 0 && client_hash == 0 {
                FileState::NonExistantEither
            } else {
                FileState::NonExistant
            };
            (state, 0xffff, 0, 0, Vec::new())
        }
    };

    shared.publish(FileserverEvent::FileDownloadRequest {
        client,
        path: path.clone(),
        state,
        size: content.len() as u64,
    });

    if state == FileState::Different {
        // at least one chunk, even for empty files
        let total = content.len();
        let mut next = 0;
        loop {
            let chunk = CHUNK_SIZE.min(total - next);
            let mut data = Frame::new(GROUP_FSRV, MSG_DOWNLOAD);
            data.push_uuid(&uuid)
                .push_u16(chunk as u16)
                .push_u32(total as u32)
                .push_bytes(&content[next..next + chunk]);
            write_frame(stream, &data)?;

            next += chunk;
            shared.publish(FileserverEvent::FileDownloading {
                client,
                path: path.clone(),
                sent: next as u64,
                total: total as u64,
            });

            if next >= total {
                break;
            }
        }
    }

    let mut finished = Frame::new(GROUP_FSRV, MSG_DOWNLOAD_FINISHED);
    finished
        .push_uuid(&uuid)
        .push_i8(state as i8)
        .push_i64(ts)
        .push_u64(hash)
        .push_u16(resolved_dd);
    write_frame(stream, &finished)?;

    shared.publish(FileserverEvent::FileDownloadFinished { client, path });
    Ok(())
}

fn handle_upload_header(
    frame: &Frame,
    client: u32,
    ctx: &mut ClientContext,
    shared: &Shared,
) -> FileserveResult<()> {
    let mut reader = frame.reader();
    let uuid = reader.uuid()?;
    let total = reader.u32()? as u64;
    let _dd_id = reader.u16()?;
    let path = reader.str()?;

    shared.publish(FileserverEvent::FileUploadRequest {
        client,
        path: path.clone(),
        total,
    });

    ctx.upload = Some(UploadState {
        uuid,
        total,
        path,
        data: Vec::with_capacity(total as usize),
    });
    Ok(())
}

fn handle_upload_data(
    frame: &Frame,
    client: u32,
    ctx: &mut ClientContext,
    shared: &Shared,
) -> FileserveResult<()> {
    let mut reader = frame.reader();
    let uuid = reader.uuid()?;
    let chunk = reader.u16()? as usize;

    let upload = match &mut ctx.upload {
        Some(u) if u.uuid == uuid => u,
        _ => return Ok(()), // stray chunk of an abandoned transfer
    };

    upload.data.extend_from_slice(reader.bytes(chunk)?);
    shared.publish(FileserverEvent::FileUploading {
        client,
        path: upload.path.clone(),
        sent: upload.data.len() as u64,
        total: upload.total,
    });
    Ok(())
}

fn handle_upload_finished(
    frame: &Frame,
    stream: &TcpStream,
    client: u32,
    ctx: &mut ClientContext,
    shared: &Shared,
) -> FileserveResult<()> {
    let mut reader = frame.reader();
    let uuid = reader.uuid()?;
    let dd_id = reader.u16()? as usize;
    let path = reader.str()?;

    let upload = match ctx.upload.take() {
        Some(u) if u.uuid == uuid => u,
        _ => return Ok(()),
    };

    let target = ctx
        .mounts
        .get(dd_id)
        .filter(|e| e.mounted)
        .and_then(|e| e.server_path.as_ref())
        .map(|p| p.join(&path));

    match target {
        Some(target) => {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).ok();
            }

            // written to the side and moved in, so readers never see a
            // half-written file
            let temp = target.with_extension("fileserve-upload");
            let write_result = std::fs::write(&temp, &upload.data)
                .and_then(|_| std::fs::rename(&temp, &target));

            if let Err(e) = write_result {
                error!("could not write uploaded file"; "path" => %target.display(), "error" => %e);
            }
        }
        None => {
            error!("upload to unmounted data dir"; "dd" => dd_id, "path" => &path);
        }
    }

    shared.publish(FileserverEvent::FileUploadFinished {
        client,
        path,
    });

    // the ack lets the client stop pumping the connection
    let mut ack = Frame::new(GROUP_FSRV, MSG_UPLOAD_ACK);
    ack.push_uuid(&uuid);
    write_frame(stream, &ack)?;
    Ok(())
}

fn handle_delete(
    frame: &Frame,
    client: u32,
    ctx: &ClientContext,
    shared: &Shared,
) -> FileserveResult<()> {
    let mut reader = frame.reader();
    let dd_id = reader.u16()? as usize;
    let path = reader.str()?;

    shared.publish(FileserverEvent::FileDeleteRequest {
        client,
        path: path.clone(),
    });

    if let Some(target) = ctx
        .mounts
        .get(dd_id)
        .filter(|e| e.mounted)
        .and_then(|e| e.server_path.as_ref())
        .map(|p| p.join(&path))
    {
        if let Err(e) = std::fs::remove_file(&target) {
            debug!("delete request for missing file"; "path" => %target.display(), "error" => %e);
        }
    }

    Ok(())
}
