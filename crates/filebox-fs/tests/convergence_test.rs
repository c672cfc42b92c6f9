use filebox_fs::{errno, ClientAdapter, ClientConfig, FileSystemDriver};
use filebox_proto::{AccessMode, FsError, OpenFlags};
use filebox_server::{serve_background, FileboxServer, ReconcilerConfig, ServerConfig};
use std::net::SocketAddr;
use std::path::Path;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::runtime::Runtime;

const WAIT: Duration = Duration::from_secs(10);

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

fn start_server(runtime: &Runtime, root: &Path, listen: SocketAddr) -> FileboxServer {
    let config = ServerConfig {
        listen,
        root: root.to_path_buf(),
        reconciler: ReconcilerConfig {
            enabled: false,
            ..Default::default()
        },
        ..Default::default()
    };
    runtime.block_on(serve_background(config)).unwrap()
}

fn connect(runtime: &Runtime, server: &FileboxServer) -> ClientAdapter {
    let config = ClientConfig {
        server: server.addr().to_string(),
        // Only invalidation may make changes visible.
        attr_ttl_ms: 60_000,
        ..Default::default()
    };
    ClientAdapter::connect(config, runtime.handle().clone()).unwrap()
}

fn write_file(adapter: &ClientAdapter, path: &str, data: &[u8]) {
    let file = adapter
        .open(
            path,
            AccessMode::Write,
            OpenFlags {
                create: true,
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(adapter.write(file.handle, 0, data).unwrap(), data.len() as u32);
    adapter.close(file.handle).unwrap();
}

fn read_file(adapter: &ClientAdapter, path: &str) -> Vec<u8> {
    let file = adapter
        .open(path, AccessMode::Read, OpenFlags::default())
        .unwrap();
    let data = adapter.read(file.handle, 0, 4096).unwrap();
    adapter.close(file.handle).unwrap();
    data
}

fn names(adapter: &ClientAdapter, path: &str) -> Vec<String> {
    adapter
        .read_directory(path)
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect()
}

#[test]
fn five_mounts_converge_on_every_change() {
    let runtime = runtime();
    let temp = TempDir::new().unwrap();
    let server = start_server(&runtime, temp.path(), "127.0.0.1:0".parse().unwrap());

    let mounts: Vec<ClientAdapter> = (0..5).map(|_| connect(&runtime, &server)).collect();
    let (writer, observers) = mounts.split_first().unwrap();

    // Cache the absence first so the change has to evict it.
    for mount in observers {
        assert!(matches!(
            mount.get_attributes("/mydir0"),
            Err(FsError::NotFound(_))
        ));
        assert!(names(mount, "/").is_empty());
    }

    writer.create_directory("/mydir0").unwrap();
    write_file(writer, "/mydir0/myfile0.txt", b"Hello 0");
    let version = server.version();
    assert_eq!(version, 3);

    for mount in &mounts {
        assert!(mount.wait_for_version(version, WAIT));
        assert!(mount.get_attributes("/mydir0").unwrap().is_dir());
        assert_eq!(names(mount, "/mydir0"), vec!["myfile0.txt"]);
        assert_eq!(mount.get_attributes("/mydir0/myfile0.txt").unwrap().size, 7);
        assert_eq!(read_file(mount, "/mydir0/myfile0.txt"), b"Hello 0");
    }

    writer
        .rename("/mydir0/myfile0.txt", "/mydir0/myfile0.txt.new")
        .unwrap();
    let version = server.version();
    for mount in &mounts {
        assert!(mount.wait_for_version(version, WAIT));
        assert!(matches!(
            mount.get_attributes("/mydir0/myfile0.txt"),
            Err(FsError::NotFound(_))
        ));
        assert_eq!(names(mount, "/mydir0"), vec!["myfile0.txt.new"]);
        assert_eq!(read_file(mount, "/mydir0/myfile0.txt.new"), b"Hello 0");
    }

    writer.delete("/mydir0/myfile0.txt.new").unwrap();
    writer.delete_directory("/mydir0").unwrap();
    let version = server.version();
    for mount in &mounts {
        assert!(mount.wait_for_version(version, WAIT));
        assert!(matches!(
            mount.get_attributes("/mydir0"),
            Err(FsError::NotFound(_))
        ));
        assert!(names(mount, "/").is_empty());
    }
    assert!(!temp.path().join("mydir0").exists());

    drop(mounts);
    runtime.block_on(server.shutdown_and_wait());
}

#[test]
fn truncate_and_overwrite_are_seen_by_readers() {
    let runtime = runtime();
    let temp = TempDir::new().unwrap();
    let server = start_server(&runtime, temp.path(), "127.0.0.1:0".parse().unwrap());
    let a = connect(&runtime, &server);
    let b = connect(&runtime, &server);

    write_file(&a, "/notes.txt", b"first draft");
    assert!(b.wait_for_version(server.version(), WAIT));
    assert_eq!(b.get_attributes("/notes.txt").unwrap().size, 11);

    a.truncate("/notes.txt", 5).unwrap();
    assert!(b.wait_for_version(server.version(), WAIT));
    assert_eq!(b.get_attributes("/notes.txt").unwrap().size, 5);
    assert_eq!(read_file(&b, "/notes.txt"), b"first");

    // Structural errors come back unchanged.
    assert!(matches!(
        a.delete_directory("/notes.txt"),
        Err(FsError::NotADirectory(_))
    ));
    let err = a.create_directory("/notes.txt").unwrap_err();
    assert_eq!(errno(&err), libc::EEXIST);

    drop((a, b));
    runtime.block_on(server.shutdown_and_wait());
}

#[test]
fn reconnect_discards_cache_and_old_handles() {
    let runtime = runtime();
    let temp = TempDir::new().unwrap();
    let server = start_server(&runtime, temp.path(), "127.0.0.1:0".parse().unwrap());
    let addr = server.addr();
    let adapter = connect(&runtime, &server);

    write_file(&adapter, "/kept.txt", b"kept");
    let stale = adapter
        .open("/kept.txt", AccessMode::Read, OpenFlags::default())
        .unwrap();
    assert!(matches!(
        adapter.get_attributes("/restarted.txt"),
        Err(FsError::NotFound(_))
    ));

    runtime.block_on(server.shutdown_and_wait());
    let deadline = Instant::now() + WAIT;
    while adapter.session_id().is_some() {
        assert!(Instant::now() < deadline, "session never noticed the shutdown");
        std::thread::sleep(Duration::from_millis(20));
    }
    std::fs::write(temp.path().join("restarted.txt"), b"new").unwrap();
    let server = start_server(&runtime, temp.path(), addr);

    // The next call reconnects and starts from an empty cache.
    let deadline = Instant::now() + WAIT;
    let attr = loop {
        match adapter.read_directory("/") {
            Ok(entries) if entries.iter().any(|e| e.name == "restarted.txt") => {
                break adapter.get_attributes("/restarted.txt").unwrap();
            }
            Ok(_) | Err(FsError::Disconnected) | Err(FsError::IoFailure(_))
                if Instant::now() < deadline =>
            {
                std::thread::sleep(Duration::from_millis(50));
            }
            other => panic!("mount never caught up with the restart: {:?}", other),
        }
    };
    assert_eq!(attr.size, 3);
    assert!(matches!(
        adapter.read(stale.handle, 0, 16),
        Err(FsError::InvalidHandle(_))
    ));
    assert_eq!(read_file(&adapter, "/kept.txt"), b"kept");

    drop(adapter);
    runtime.block_on(server.shutdown_and_wait());
}
