//! Wire messages exchanged between a mount and the server.
//!
//! The client sends [`ClientFrame`]s, each carrying a request id and a
//! [`Request`]. The server answers with [`ServerFrame::Response`] frames
//! echoing the id, and independently pushes [`ServerFrame::Event`],
//! [`ServerFrame::Ping`] and [`ServerFrame::Reset`] frames. Push frames are
//! never correlated with a request.

use crate::error::FsError;
use crate::event::ChangeEvent;
use crate::types::{AccessMode, DirEntry, HandleId, NodeAttr, OpenFlags, SessionId, Version};
use serde::{Deserialize, Serialize};

/// Protocol version announced in `Hello`.
pub const PROTOCOL_VERSION: &str = "filebox.v1";

/// Request id reserved for frames that expect no response.
pub const UNCORRELATED_ID: u64 = 0;

/// Upper bound on a single `Read`.
pub const MAX_READ_LENGTH: u32 = 1024 * 1024;

/// A request from a mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// First frame of every connection.
    Hello {
        protocol: String,
        /// Highest version the client processed in a previous session.
        #[serde(default)]
        last_version: Option<Version>,
    },
    GetAttributes {
        path: String,
    },
    Open {
        path: String,
        mode: AccessMode,
        #[serde(default)]
        flags: OpenFlags,
    },
    Read {
        handle: HandleId,
        /// Explicit position; the handle cursor when absent.
        #[serde(default)]
        offset: Option<u64>,
        length: u32,
    },
    Write {
        handle: HandleId,
        #[serde(default)]
        offset: Option<u64>,
        #[serde(with = "crate::codec::base64_bytes")]
        data: Vec<u8>,
    },
    /// Commit barrier: returns once every earlier write through the handle
    /// has been published.
    Flush {
        handle: HandleId,
    },
    Close {
        handle: HandleId,
    },
    Truncate {
        path: String,
        size: u64,
    },
    Delete {
        path: String,
    },
    CreateDirectory {
        path: String,
        #[serde(default)]
        mode: Option<u32>,
    },
    ReadDirectory {
        path: String,
    },
    DeleteDirectory {
        path: String,
    },
    Rename {
        from: String,
        to: String,
    },
    /// Acknowledges every event up to `version`. Sent uncorrelated.
    Ack {
        version: Version,
    },
}

impl Request {
    /// Whether the request is routed through the mutation sequencer.
    pub fn is_mutating(&self) -> bool {
        match self {
            Request::Open { flags, .. } => flags.may_mutate(),
            Request::Write { .. }
            | Request::Flush { .. }
            | Request::Close { .. }
            | Request::Truncate { .. }
            | Request::Delete { .. }
            | Request::CreateDirectory { .. }
            | Request::DeleteDirectory { .. }
            | Request::Rename { .. } => true,
            Request::Hello { .. }
            | Request::GetAttributes { .. }
            | Request::Read { .. }
            | Request::ReadDirectory { .. }
            | Request::Ack { .. } => false,
        }
    }

    /// Short operation name for logging.
    pub fn op_name(&self) -> &'static str {
        match self {
            Request::Hello { .. } => "hello",
            Request::GetAttributes { .. } => "get_attributes",
            Request::Open { .. } => "open",
            Request::Read { .. } => "read",
            Request::Write { .. } => "write",
            Request::Flush { .. } => "flush",
            Request::Close { .. } => "close",
            Request::Truncate { .. } => "truncate",
            Request::Delete { .. } => "delete",
            Request::CreateDirectory { .. } => "create_directory",
            Request::ReadDirectory { .. } => "read_directory",
            Request::DeleteDirectory { .. } => "delete_directory",
            Request::Rename { .. } => "rename",
            Request::Ack { .. } => "ack",
        }
    }
}

/// How a joining session rebuilds its view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "items", rename_all = "snake_case")]
pub enum Resync {
    /// Nothing to catch up on (first connect or already current).
    Current,
    /// Every event after the client's last version, in order.
    Replay(Vec<ChangeEvent>),
    /// The history no longer covers the gap: every node, pre-order.
    Snapshot(Vec<NodeAttr>),
}

/// A successful response payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Response {
    Welcome {
        session_id: SessionId,
        /// Tree version at the moment the session joined.
        version: Version,
        resync: Resync,
    },
    Attributes {
        attr: NodeAttr,
        /// Tree version the answer was read at.
        as_of: Version,
    },
    Opened {
        handle: HandleId,
        attr: NodeAttr,
        /// Version of the create/truncate this open committed, if any.
        #[serde(default)]
        committed: Option<Version>,
    },
    Data {
        #[serde(with = "crate::codec::base64_bytes")]
        data: Vec<u8>,
    },
    Written {
        written: u32,
        size: u64,
        version: Version,
    },
    Entries {
        entries: Vec<DirEntry>,
        as_of: Version,
    },
    /// A mutation (or barrier) committed at `version`.
    Done {
        version: Version,
    },
}

/// Frame sent by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientFrame {
    pub id: u64,
    pub request: Request,
}

/// Frame sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Answer to the client frame with the same id.
    Response {
        id: u64,
        result: Result<Response, FsError>,
    },
    /// A committed change, pushed in version order.
    Event { event: ChangeEvent },
    /// Liveness probe carrying the current tree version.
    Ping { version: Version },
    /// The session fell behind; the client must discard its cache.
    Reset { version: Version },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NodeKind, OpenFlags};
    use chrono::Utc;

    #[test]
    fn open_is_mutating_only_with_create_or_truncate() {
        let plain = Request::Open {
            path: "/a".into(),
            mode: AccessMode::Read,
            flags: OpenFlags::default(),
        };
        assert!(!plain.is_mutating());

        let create = Request::Open {
            path: "/a".into(),
            mode: AccessMode::Write,
            flags: OpenFlags {
                create: true,
                ..Default::default()
            },
        };
        assert!(create.is_mutating());
        assert!(Request::Close { handle: 1 }.is_mutating());
        assert!(!Request::ReadDirectory { path: "/".into() }.is_mutating());
    }

    #[test]
    fn write_payload_is_base64() {
        let frame = ClientFrame {
            id: 7,
            request: Request::Write {
                handle: 1,
                offset: Some(0),
                data: b"Hello 0".to_vec(),
            },
        };
        let text = serde_json::to_string(&frame).unwrap();
        assert!(text.contains(r#""data":"SGVsbG8gMA==""#));
        let back: ClientFrame = serde_json::from_str(&text).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn response_carries_result_or_error() {
        let ok = ServerFrame::Response {
            id: 3,
            result: Ok(Response::Attributes {
                attr: NodeAttr {
                    path: "/mydir0".into(),
                    kind: NodeKind::Directory,
                    size: 0,
                    modified_at: Utc::now(),
                    mode: 0o755,
                    version: 1,
                },
                as_of: 5,
            }),
        };
        let text = serde_json::to_string(&ok).unwrap();
        assert_eq!(serde_json::from_str::<ServerFrame>(&text).unwrap(), ok);

        let err = ServerFrame::Response {
            id: 4,
            result: Err(FsError::NotFound("/nope".into())),
        };
        let text = serde_json::to_string(&err).unwrap();
        assert!(text.contains(r#""Err""#));
        assert_eq!(serde_json::from_str::<ServerFrame>(&text).unwrap(), err);
    }
}
