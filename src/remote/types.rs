use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::time::Instant;

/// Kind of a remote filesystem object. Mutually exclusive by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

impl EntryKind {
    /// Derive the kind from the first character of an `ls -l` permissions field.
    pub fn from_permissions(perms: &str) -> Self {
        match perms.chars().next() {
            Some('d') => EntryKind::Directory,
            Some('l') => EntryKind::Symlink,
            _ => EntryKind::File,
        }
    }

    /// Directories and symlinks can be expanded in the tree.
    pub fn is_folder_like(&self) -> bool {
        matches!(self, EntryKind::Directory | EntryKind::Symlink)
    }
}

/// One object reported by a remote directory listing.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectoryEntry {
    /// Base name, never `.` or `..`
    pub name: String,
    pub kind: EntryKind,
    /// Present only for symlinks
    pub link_target: Option<String>,
    pub permissions: String,
    pub size_bytes: u64,
    pub modified_at: Option<DateTime<Utc>>,
}

impl DirectoryEntry {
    /// `name`, or `name -> target` for symlinks.
    pub fn display_name(&self) -> String {
        match &self.link_target {
            Some(target) => format!("{} -> {}", self.name, target),
            None => self.name.clone(),
        }
    }

    /// Stand-in for a name claimed earlier in the same upload batch.
    pub fn placeholder(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: EntryKind::File,
            link_target: None,
            permissions: String::new(),
            size_bytes: 0,
            modified_at: None,
        }
    }
}

/// A cached listing for one remote path.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub path: String,
    pub entries: Vec<DirectoryEntry>,
    pub fetched_at: Instant,
}

/// One local item and the remote path it will be placed at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTransfer {
    pub local_path: PathBuf,
    pub remote_path: String,
}

/// Progress and completion reports emitted by transfers.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Progress { item: String, text: String },
    Complete { item: String },
    Failed { item: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_permissions() {
        assert_eq!(EntryKind::from_permissions("drwxr-xr-x"), EntryKind::Directory);
        assert_eq!(EntryKind::from_permissions("lrwxrwxrwx"), EntryKind::Symlink);
        assert_eq!(EntryKind::from_permissions("-rw-r--r--"), EntryKind::File);
        assert_eq!(EntryKind::from_permissions("crw-rw----"), EntryKind::File);
        assert_eq!(EntryKind::from_permissions(""), EntryKind::File);
    }

    #[test]
    fn test_display_name() {
        let mut entry = DirectoryEntry::placeholder("a");
        assert_eq!(entry.display_name(), "a");
        entry.kind = EntryKind::Symlink;
        entry.link_target = Some("b".to_string());
        assert_eq!(entry.display_name(), "a -> b");
    }
}
