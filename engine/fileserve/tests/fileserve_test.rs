//! End-to-end client/server exchanges over a loopback connection

use std::sync::Arc;
use std::time::Duration;

use fileserve::{
    ClientConfig, FileserveClient, FileserveDataDir, FileserveError, Fileserver, FileserverEvent,
};
use parking_lot::Mutex;
use vfs::DataDirectory;

struct Fixture {
    server: Fileserver,
    server_dir: tempfile::TempDir,
    cache_dir: tempfile::TempDir,
}

impl Fixture {
    fn new() -> Self {
        common::logging::for_tests();
        let server = Fileserver::start(0).unwrap();
        Self {
            server,
            server_dir: tempfile::tempdir().unwrap(),
            cache_dir: tempfile::tempdir().unwrap(),
        }
    }

    fn client(&self, ttl: Duration) -> FileserveClient {
        let config = ClientConfig {
            server: Some(format!("127.0.0.1:{}", self.server.port())),
            cache_root: self.cache_dir.path().to_owned(),
            timeout: Duration::from_secs(5),
            cache_status_ttl: ttl,
        };
        FileserveClient::connect(&config).unwrap()
    }

    fn mounted_client(&self, ttl: Duration) -> (FileserveClient, u16) {
        let mut client = self.client(ttl);
        let dd = client
            .mount_data_directory(self.server_dir.path().to_str().unwrap(), ":data")
            .unwrap();
        // give the server a beat to process the mount
        std::thread::sleep(Duration::from_millis(100));
        (client, dd)
    }

    fn server_file(&self, name: &str, content: &[u8]) {
        std::fs::write(self.server_dir.path().join(name), content).unwrap();
    }
}

#[test]
fn downloads_cache_and_skip_network_within_ttl() {
    let fixture = Fixture::new();
    fixture.server_file("cfg.json", b"{\"v\": 13:}");

    let (mut client, dd) = fixture.mounted_client(Duration::from_secs(5));

    let cached = client.download_file(dd, "cfg.json", false).unwrap();
    assert_eq!(std::fs::read(&cached).unwrap(), b"{\"v\": 13:}");
    assert_eq!(client.stats().read_requests_sent, 1);

    // within the ttl the cached answer is served without traffic
    let again = client.download_file(dd, "cfg.json", false).unwrap();
    assert_eq!(again, cached);
    assert_eq!(client.stats().read_requests_sent, 1);
}

#[test]
fn revalidation_ladder_matches_the_protocol() {
    let fixture = Fixture::new();
    fixture.server_file("cfg.json", b"13 bytes long");

    // zero ttl: every access asks the server
    let (mut client, dd) = fixture.mounted_client(Duration::ZERO);

    // empty cache: full download
    let cached = client.download_file(dd, "cfg.json", false).unwrap();
    assert_eq!(std::fs::read(&cached).unwrap(), b"13 bytes long");
    assert_eq!(client.stats().bytes_downloaded, 13);

    // unchanged: same timestamp answer, no rewrite
    let before = std::fs::metadata(&cached).unwrap().modified().unwrap();
    client.download_file(dd, "cfg.json", false).unwrap();
    assert_eq!(client.stats().bytes_downloaded, 13, "no second download");
    assert_eq!(
        std::fs::metadata(&cached).unwrap().modified().unwrap(),
        before
    );

    // touch with identical content: timestamps differ, hash matches
    std::thread::sleep(Duration::from_millis(1100));
    fixture.server_file("cfg.json", b"13 bytes long");
    client.download_file(dd, "cfg.json", false).unwrap();
    assert_eq!(
        client.stats().bytes_downloaded,
        13,
        "same-hash must not re-download content"
    );
    assert_eq!(std::fs::read(&cached).unwrap(), b"13 bytes long");

    // truncate to zero bytes: different, zero-length download overwrites
    std::thread::sleep(Duration::from_millis(1100));
    fixture.server_file("cfg.json", b"");
    client.download_file(dd, "cfg.json", false).unwrap();
    assert_eq!(std::fs::read(&cached).unwrap(), b"");
}

#[test]
fn missing_files_and_server_side_deletes() {
    let fixture = Fixture::new();
    let (mut client, dd) = fixture.mounted_client(Duration::ZERO);

    // neither side has it
    assert!(matches!(
        client.download_file(dd, "ghost.txt", false),
        Err(FileserveError::NotFound(_))
    ));

    // appears on the server
    fixture.server_file("ghost.txt", b"now you see me");
    let cached = client.download_file(dd, "ghost.txt", false).unwrap();
    assert_eq!(std::fs::read(&cached).unwrap(), b"now you see me");

    // disappears again: cached copy and sidecar are dropped
    std::fs::remove_file(fixture.server_dir.path().join("ghost.txt")).unwrap();
    assert!(matches!(
        client.download_file(dd, "ghost.txt", false),
        Err(FileserveError::NotFound(_))
    ));
    assert!(!cached.exists());
}

#[test]
fn uploads_write_through_and_acknowledge() {
    let fixture = Fixture::new();
    let (mut client, dd) = fixture.mounted_client(Duration::ZERO);

    let content: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();
    client.upload_file(dd, "out/generated.bin", &content).unwrap();

    // the ack means the server committed the file
    let uploaded = std::fs::read(fixture.server_dir.path().join("out/generated.bin")).unwrap();
    assert_eq!(uploaded, content);

    // an immediate re-read is served from the pre-populated cache
    let cached = client.download_file(dd, "out/generated.bin", false).unwrap();
    assert_eq!(std::fs::read(cached).unwrap(), content);
}

#[test]
fn deletes_reach_the_server() {
    let fixture = Fixture::new();
    fixture.server_file("doomed.txt", b"x");
    let (mut client, dd) = fixture.mounted_client(Duration::ZERO);

    client.delete_file(dd, "doomed.txt").unwrap();

    let path = fixture.server_dir.path().join("doomed.txt");
    let gone = (0..50).any(|_| {
        std::thread::sleep(Duration::from_millis(50));
        !path.exists()
    });
    assert!(gone, "server never deleted the file");
}

#[test]
fn reload_broadcast_reaches_clients() {
    let fixture = Fixture::new();
    let (mut client, _dd) = fixture.mounted_client(Duration::from_secs(5));

    fixture.server.broadcast_reload_resources();

    let requested = (0..50).any(|_| {
        client.pump(Duration::from_millis(50));
        client.take_reload_requested()
    });
    assert!(requested, "reload broadcast never arrived");
}

#[test]
fn server_publishes_activity_events() {
    let fixture = Fixture::new();
    let events = fixture.server.subscribe();
    fixture.server_file("seen.txt", b"event me");

    let (mut client, dd) = fixture.mounted_client(Duration::ZERO);
    client.download_file(dd, "seen.txt", false).unwrap();

    let mut saw_mount = false;
    let mut saw_download = false;
    while let Ok(event) = events.recv_timeout(Duration::from_millis(500)) {
        match event {
            FileserverEvent::MountDataDir { .. } => saw_mount = true,
            FileserverEvent::FileDownloadFinished { ref path, .. } if path == "seen.txt" => {
                saw_download = true;
                break;
            }
            _ => {}
        }
    }
    assert!(saw_mount);
    assert!(saw_download);
}

#[test]
fn fileserve_mounts_speak_the_datadir_interface() {
    let fixture = Fixture::new();
    fixture.server_file("remote.txt", b"remote content");

    let client = fixture.client(Duration::ZERO);
    let client = Arc::new(Mutex::new(client));

    let mount = FileserveDataDir::mount(
        Arc::clone(&client),
        fixture.server_dir.path().to_str().unwrap(),
        ":remote",
    )
    .unwrap();
    std::thread::sleep(Duration::from_millis(100));

    assert!(mount.exists_file("remote.txt"));
    assert!(!mount.exists_file("missing.txt"));

    let mut reader = mount.open_read("remote.txt", false).unwrap();
    let mut content = String::new();
    std::io::Read::read_to_string(&mut reader, &mut content).unwrap();
    assert_eq!(content, "remote content");

    {
        let mut writer = mount.open_write("pushed.txt").unwrap();
        std::io::Write::write_all(&mut writer, b"pushed up").unwrap();
        std::io::Write::flush(&mut writer).unwrap();
    }
    assert_eq!(
        std::fs::read(fixture.server_dir.path().join("pushed.txt")).unwrap(),
        b"pushed up"
    );
}
