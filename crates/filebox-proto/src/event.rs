use crate::path;
use crate::types::{NodeAttr, Version};
use serde::{Deserialize, Serialize};

/// Kind of a committed namespace mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Create,
    Write,
    Delete,
    Mkdir,
    Rmdir,
    Rename,
}

/// Immutable record of one applied mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Version assigned by the sequencer.
    pub version: Version,
    /// What happened.
    pub kind: ChangeKind,
    /// Affected path (the destination for a rename).
    pub path: String,
    /// Source path of a rename.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_path: Option<String>,
    /// Resulting attributes; absent for delete and rmdir.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attr: Option<NodeAttr>,
}

impl ChangeEvent {
    /// Every path whose cached state this event makes stale.
    ///
    /// Includes the parents of the affected paths, since their listings
    /// changed too.
    pub fn stale_paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = Vec::with_capacity(4);
        for affected in self.affected_paths() {
            // A write changes the size shown in the parent's listing too.
            let parent = path::parent(affected);
            for p in std::iter::once(affected).chain(parent) {
                if !paths.contains(&p) {
                    paths.push(p);
                }
            }
        }
        paths
    }

    /// Paths named by the event itself (old and new for a rename).
    pub fn affected_paths(&self) -> Vec<&str> {
        match &self.old_path {
            Some(old) => vec![old.as_str(), self.path.as_str()],
            None => vec![self.path.as_str()],
        }
    }

    /// Whether the event can invalidate descendants of its paths.
    ///
    /// True for directory removal and for renames, which move whole
    /// subtrees.
    pub fn affects_subtree(&self) -> bool {
        match self.kind {
            ChangeKind::Rmdir | ChangeKind::Rename => true,
            ChangeKind::Delete => self.attr.as_ref().map_or(true, |a| a.is_dir()),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeKind;
    use chrono::Utc;

    fn attr(path: &str, kind: NodeKind) -> NodeAttr {
        NodeAttr {
            path: path.to_string(),
            kind,
            size: 7,
            modified_at: Utc::now(),
            mode: 0o644,
            version: 4,
        }
    }

    #[test]
    fn rename_invalidates_both_sides_and_parents() {
        let event = ChangeEvent {
            version: 4,
            kind: ChangeKind::Rename,
            path: "/b/new.txt".to_string(),
            old_path: Some("/a/old.txt".to_string()),
            attr: Some(attr("/b/new.txt", NodeKind::File)),
        };

        let stale = event.stale_paths();
        assert_eq!(stale, vec!["/a/old.txt", "/a", "/b/new.txt", "/b"]);
        assert!(event.affects_subtree());
    }

    #[test]
    fn write_invalidates_path_and_parent_only() {
        let event = ChangeEvent {
            version: 9,
            kind: ChangeKind::Write,
            path: "/f.txt".to_string(),
            old_path: None,
            attr: Some(attr("/f.txt", NodeKind::File)),
        };
        assert_eq!(event.stale_paths(), vec!["/f.txt", "/"]);
        assert!(!event.affects_subtree());
    }

    #[test]
    fn optional_fields_are_omitted_on_the_wire() {
        let event = ChangeEvent {
            version: 2,
            kind: ChangeKind::Delete,
            path: "/gone".to_string(),
            old_path: None,
            attr: None,
        };
        let text = serde_json::to_string(&event).unwrap();
        assert_eq!(text, r#"{"version":2,"kind":"delete","path":"/gone"}"#);
    }
}
