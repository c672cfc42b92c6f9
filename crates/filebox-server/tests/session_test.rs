use filebox_proto::{
    codec, AccessMode, ChangeEvent, ChangeKind, ClientFrame, FsError, OpenFlags, Request, Response,
    Resync, ServerFrame, Version, PROTOCOL_VERSION,
};
use filebox_server::{serve_background, FileboxServer, ReconcilerConfig, ServerConfig};
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

async fn start_server(root: &Path) -> FileboxServer {
    let config = ServerConfig {
        listen: "127.0.0.1:0".parse().unwrap(),
        root: root.to_path_buf(),
        reconciler: ReconcilerConfig {
            enabled: false,
            ..Default::default()
        },
        ..Default::default()
    };
    serve_background(config).await.unwrap()
}

/// Minimal protocol client that keeps push frames aside.
struct RawClient {
    reader: BufReader<ReadHalf<TcpStream>>,
    writer: WriteHalf<TcpStream>,
    next_id: u64,
    pushed: Vec<ServerFrame>,
}

impl RawClient {
    async fn connect(server: &FileboxServer) -> Self {
        let stream = TcpStream::connect(server.addr()).await.unwrap();
        let (read_half, writer) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read_half),
            writer,
            next_id: 1,
            pushed: Vec::new(),
        }
    }

    async fn join(server: &FileboxServer, last_version: Option<Version>) -> (Self, Response) {
        let mut client = Self::connect(server).await;
        let welcome = client
            .call(Request::Hello {
                protocol: PROTOCOL_VERSION.to_string(),
                last_version,
            })
            .await
            .unwrap();
        (client, welcome)
    }

    async fn send(&mut self, request: Request) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        codec::write_frame(&mut self.writer, &ClientFrame { id, request })
            .await
            .unwrap();
        id
    }

    async fn next_frame(&mut self) -> Option<ServerFrame> {
        timeout(WAIT, codec::read_frame(&mut self.reader))
            .await
            .expect("timed out waiting for a frame")
            .unwrap()
    }

    async fn call(&mut self, request: Request) -> Result<Response, FsError> {
        let id = self.send(request).await;
        loop {
            match self.next_frame().await.expect("connection closed") {
                ServerFrame::Response { id: got, result } if got == id => return result,
                other => self.pushed.push(other),
            }
        }
    }

    /// Wait until an event with `version` has been pushed.
    async fn wait_event(&mut self, version: Version) -> Vec<ChangeEvent> {
        loop {
            let events: Vec<ChangeEvent> = self
                .pushed
                .iter()
                .filter_map(|frame| match frame {
                    ServerFrame::Event { event } => Some(event.clone()),
                    _ => None,
                })
                .collect();
            if events.iter().any(|e| e.version >= version) {
                return events;
            }
            let frame = self.next_frame().await.expect("connection closed");
            self.pushed.push(frame);
        }
    }
}

fn done_version(response: Response) -> Version {
    match response {
        Response::Done { version } => version,
        other => panic!("expected done, got {:?}", other),
    }
}

#[tokio::test]
async fn mutations_are_pushed_to_every_session_in_order() {
    let temp = TempDir::new().unwrap();
    let server = start_server(temp.path()).await;

    let (mut a, welcome) = RawClient::join(&server, None).await;
    match welcome {
        Response::Welcome {
            version, resync, ..
        } => {
            assert_eq!(version, 0);
            assert_eq!(resync, Resync::Current);
        }
        other => panic!("expected welcome, got {:?}", other),
    }
    let (mut b, _) = RawClient::join(&server, None).await;

    let v1 = done_version(
        a.call(Request::CreateDirectory {
            path: "/mydir0".into(),
            mode: None,
        })
        .await
        .unwrap(),
    );
    let opened = a
        .call(Request::Open {
            path: "/mydir0/myfile0.txt".into(),
            mode: AccessMode::Write,
            flags: OpenFlags {
                create: true,
                ..Default::default()
            },
        })
        .await
        .unwrap();
    let handle = match opened {
        Response::Opened {
            handle, committed, ..
        } => {
            assert_eq!(committed, Some(v1 + 1));
            handle
        }
        other => panic!("expected opened, got {:?}", other),
    };
    let written = a
        .call(Request::Write {
            handle,
            offset: None,
            data: b"Hello 0".to_vec(),
        })
        .await
        .unwrap();
    assert!(matches!(written, Response::Written { written: 7, size: 7, .. }));
    let closed = done_version(a.call(Request::Close { handle }).await.unwrap());
    assert_eq!(closed, 3);

    let events = b.wait_event(3).await;
    let kinds: Vec<_> = events.iter().map(|e| (e.version, e.kind)).collect();
    assert_eq!(
        kinds,
        vec![
            (1, ChangeKind::Mkdir),
            (2, ChangeKind::Create),
            (3, ChangeKind::Write)
        ]
    );

    // Read-after-close from the other session.
    let handle = match b
        .call(Request::Open {
            path: "/mydir0/myfile0.txt".into(),
            mode: AccessMode::Read,
            flags: OpenFlags::default(),
        })
        .await
        .unwrap()
    {
        Response::Opened { handle, .. } => handle,
        other => panic!("expected opened, got {:?}", other),
    };
    let data = b
        .call(Request::Read {
            handle,
            offset: Some(0),
            length: 1024,
        })
        .await
        .unwrap();
    assert_eq!(
        data,
        Response::Data {
            data: b"Hello 0".to_vec()
        }
    );

    server.shutdown();
}

#[tokio::test]
async fn structural_errors_are_reported_without_events() {
    let temp = TempDir::new().unwrap();
    let server = start_server(temp.path()).await;
    let (mut a, _) = RawClient::join(&server, None).await;

    a.call(Request::CreateDirectory {
        path: "/d".into(),
        mode: None,
    })
    .await
    .unwrap();
    a.call(Request::CreateDirectory {
        path: "/d/inner".into(),
        mode: None,
    })
    .await
    .unwrap();

    assert_eq!(
        a.call(Request::DeleteDirectory { path: "/d".into() }).await,
        Err(FsError::NotEmpty("/d".into()))
    );
    assert_eq!(
        a.call(Request::GetAttributes {
            path: "/missing".into()
        })
        .await,
        Err(FsError::NotFound("/missing".into()))
    );
    assert_eq!(
        a.call(Request::Read {
            handle: 42,
            offset: None,
            length: 1
        })
        .await,
        Err(FsError::InvalidHandle(42))
    );
    assert!(matches!(
        a.call(Request::GetAttributes {
            path: "/../etc".into()
        })
        .await,
        Err(FsError::InvalidPath(_))
    ));
    assert_eq!(server.version(), 2);

    server.shutdown();
}

#[tokio::test]
async fn rename_is_one_event_and_listing_reflects_it() {
    let temp = TempDir::new().unwrap();
    let server = start_server(temp.path()).await;
    let (mut a, _) = RawClient::join(&server, None).await;
    let (mut b, _) = RawClient::join(&server, None).await;

    a.call(Request::Open {
        path: "/f.txt".into(),
        mode: AccessMode::Write,
        flags: OpenFlags {
            create: true,
            ..Default::default()
        },
    })
    .await
    .unwrap();
    let version = done_version(
        a.call(Request::Rename {
            from: "/f.txt".into(),
            to: "/f.txt.new".into(),
        })
        .await
        .unwrap(),
    );

    let events = b.wait_event(version).await;
    let rename = events.last().unwrap();
    assert_eq!(rename.kind, ChangeKind::Rename);
    assert_eq!(rename.old_path.as_deref(), Some("/f.txt"));
    assert_eq!(rename.path, "/f.txt.new");

    match b.call(Request::ReadDirectory { path: "/".into() }).await.unwrap() {
        Response::Entries { entries, as_of } => {
            assert_eq!(as_of, version);
            let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
            assert_eq!(names, vec!["f.txt.new"]);
        }
        other => panic!("expected entries, got {:?}", other),
    }
    assert!(temp.path().join("f.txt.new").exists());

    server.shutdown();
}

#[tokio::test]
async fn reconnect_replays_missed_events() {
    let temp = TempDir::new().unwrap();
    let server = start_server(temp.path()).await;
    let (mut a, _) = RawClient::join(&server, None).await;

    for name in ["/one", "/two", "/three"] {
        a.call(Request::CreateDirectory {
            path: name.into(),
            mode: None,
        })
        .await
        .unwrap();
    }

    let (_b, welcome) = RawClient::join(&server, Some(1)).await;
    match welcome {
        Response::Welcome {
            version,
            resync: Resync::Replay(events),
            ..
        } => {
            assert_eq!(version, 3);
            let paths: Vec<_> = events.iter().map(|e| e.path.as_str()).collect();
            assert_eq!(paths, vec!["/two", "/three"]);
        }
        other => panic!("expected replay, got {:?}", other),
    }

    server.shutdown();
}

#[tokio::test]
async fn request_before_hello_is_rejected() {
    let temp = TempDir::new().unwrap();
    let server = start_server(temp.path()).await;
    let mut client = RawClient::connect(&server).await;

    let result = client
        .call(Request::GetAttributes { path: "/".into() })
        .await;
    assert!(matches!(result, Err(FsError::Protocol(_))));
    // The server hangs up afterwards.
    assert!(client.next_frame().await.is_none());

    server.shutdown();
}
