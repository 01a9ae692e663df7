//! Virtual filesystem, spec §4.6. Unix-style octal permission bits, quota
//! accounting across the whole tree, and a watch mechanism that notifies
//! subscribers synchronously before the mutating call returns (spec §5).

mod node;
mod path;

pub use node::{Quota, VfsMetadata, VfsNode, DEFAULT_DIR_PERMISSIONS, DEFAULT_FILE_PERMISSIONS};

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::error::ErrorKind;

#[derive(Debug, Clone, thiserror::Error)]
pub enum VfsError {
    #[error("quota exceeded: {requested} bytes requested, {remaining} remaining")]
    Quota { requested: u64, remaining: u64 },
    #[error("no such file or directory: {0}")]
    NotFound(String),
    #[error("{0} is a directory")]
    IsDirectory(String),
    #[error("{0} is not a directory")]
    NotADirectory(String),
    #[error("permission denied: {0}")]
    Permission(String),
    #[error("parent directory does not exist: {0}")]
    ParentNotFound(String),
    #[error("cannot delete the root directory")]
    CannotDeleteRoot,
    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),
    #[error("invalid path: {0}")]
    InvalidPath(String),
}

impl VfsError {
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            VfsError::Quota { .. } => ErrorKind::Quota,
            VfsError::NotFound(_) | VfsError::ParentNotFound(_) | VfsError::InvalidPath(_) => {
                ErrorKind::NotFound
            }
            VfsError::IsDirectory(_) | VfsError::NotADirectory(_) => ErrorKind::Type,
            VfsError::Permission(_) | VfsError::CannotDeleteRoot => ErrorKind::Permission,
            VfsError::DirectoryNotEmpty(_) => ErrorKind::DirectoryNotEmpty,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Stat {
    pub path: String,
    pub is_directory: bool,
    pub size_bytes: u64,
    pub permissions: u16,
    pub created_at: std::time::SystemTime,
    pub modified_at: std::time::SystemTime,
    pub accessed_at: std::time::SystemTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VfsEventKind {
    Write,
    Delete,
    Mkdir,
    Chmod,
}

#[derive(Debug, Clone)]
pub struct VfsEvent {
    pub path: String,
    pub kind: VfsEventKind,
}

struct Inner {
    root: VfsNode,
    quota: Quota,
    watchers: HashMap<String, tokio::sync::broadcast::Sender<VfsEvent>>,
}

/// Default mounts spec §4.6 assumes exist at sandbox construction time.
pub const DEFAULT_MOUNTS: &[&str] = &["/sandbox", "/tmp", "/cache"];

pub struct VirtualFilesystem {
    inner: Mutex<Inner>,
}

impl VirtualFilesystem {
    pub fn new(max_bytes: u64) -> Self {
        let mut root = VfsNode::new_dir();
        for mount in DEFAULT_MOUNTS {
            let components = path::normalize(mount).expect("default mounts are valid paths");
            insert_dir(&mut root, &components).expect("default mounts don't collide");
        }
        Self {
            inner: Mutex::new(Inner {
                root,
                quota: Quota::new(max_bytes),
                watchers: HashMap::new(),
            }),
        }
    }

    pub fn write(&self, path_str: &str, bytes: Vec<u8>) -> Result<(), VfsError> {
        let components = path::normalize(path_str)?;
        let mut inner = self.inner.lock();

        let previous_size = lookup(&inner.root, &components)
            .map(VfsNode::size_bytes)
            .unwrap_or(0);
        let new_size = bytes.len() as u64;
        let delta = new_size.saturating_sub(previous_size);
        if delta > inner.quota.remaining() {
            return Err(VfsError::Quota {
                requested: delta,
                remaining: inner.quota.remaining(),
            });
        }

        let (parent_components, name) = split_parent(&components, path_str)?;
        let parent = lookup_mut(&mut inner.root, &parent_components)
            .ok_or_else(|| VfsError::ParentNotFound(path_str.to_string()))?;
        let VfsNode::Directory { children, .. } = parent else {
            return Err(VfsError::NotADirectory(path_str.to_string()));
        };
        match children.get_mut(&name) {
            Some(VfsNode::Directory { .. }) => return Err(VfsError::IsDirectory(path_str.to_string())),
            Some(VfsNode::File { bytes: existing_bytes, permissions, metadata }) => {
                if *permissions & 0o200 == 0 {
                    return Err(VfsError::Permission(path_str.to_string()));
                }
                *existing_bytes = bytes;
                metadata.touch();
            }
            None => {
                children.insert(name, VfsNode::new_file(bytes));
            }
        }
        inner.quota.current_bytes = inner.quota.current_bytes.saturating_sub(previous_size) + new_size;
        crate::metrics::VFS_QUOTA_BYTES_USED.set(inner.quota.current_bytes as i64);
        notify(&inner.watchers, path_str, VfsEventKind::Write);
        Ok(())
    }

    pub fn read(&self, path_str: &str) -> Result<Vec<u8>, VfsError> {
        let components = path::normalize(path_str)?;
        let mut inner = self.inner.lock();
        match lookup_mut(&mut inner.root, &components) {
            Some(VfsNode::File { bytes, permissions, metadata }) => {
                if *permissions & 0o400 == 0 {
                    return Err(VfsError::Permission(path_str.to_string()));
                }
                metadata.touch_accessed();
                Ok(bytes.clone())
            }
            Some(VfsNode::Directory { .. }) => Err(VfsError::IsDirectory(path_str.to_string())),
            None => Err(VfsError::NotFound(path_str.to_string())),
        }
    }

    pub fn readdir(&self, path_str: &str) -> Result<Vec<String>, VfsError> {
        let components = path::normalize(path_str)?;
        let inner = self.inner.lock();
        match lookup(&inner.root, &components) {
            Some(VfsNode::Directory { children, .. }) => Ok(children.keys().cloned().collect()),
            Some(VfsNode::File { .. }) => Err(VfsError::NotADirectory(path_str.to_string())),
            None => Err(VfsError::NotFound(path_str.to_string())),
        }
    }

    /// spec §4.6 `mkdir(path, recursive)`: idempotent on an existing
    /// directory either way; non-recursive fails `ParentNotFound` if any
    /// intermediate component is missing instead of creating it.
    pub fn mkdir(&self, path_str: &str, recursive: bool) -> Result<(), VfsError> {
        let components = path::normalize(path_str)?;
        let mut inner = self.inner.lock();
        if recursive {
            insert_dir(&mut inner.root, &components)?;
        } else {
            let (parent_components, name) = split_parent(&components, path_str)?;
            let parent = lookup_mut(&mut inner.root, &parent_components)
                .ok_or_else(|| VfsError::ParentNotFound(path_str.to_string()))?;
            let VfsNode::Directory { children, .. } = parent else {
                return Err(VfsError::NotADirectory(path_str.to_string()));
            };
            match children.get(&name) {
                Some(VfsNode::Directory { .. }) => {}
                Some(VfsNode::File { .. }) => return Err(VfsError::NotADirectory(path_str.to_string())),
                None => {
                    children.insert(name, VfsNode::new_dir());
                }
            }
        }
        notify(&inner.watchers, path_str, VfsEventKind::Mkdir);
        Ok(())
    }

    /// spec §4.6 `delete(path, recursive)`: a non-empty directory is only
    /// removed when `recursive` is set, in which case the whole subtree is
    /// dropped and `currentBytes` decremented by its full size.
    pub fn delete(&self, path_str: &str, recursive: bool) -> Result<(), VfsError> {
        let components = path::normalize(path_str)?;
        if components.is_empty() {
            return Err(VfsError::CannotDeleteRoot);
        }
        let mut inner = self.inner.lock();
        let (parent_components, name) = split_parent(&components, path_str)?;
        let parent = lookup_mut(&mut inner.root, &parent_components)
            .ok_or_else(|| VfsError::ParentNotFound(path_str.to_string()))?;
        let VfsNode::Directory { children, .. } = parent else {
            return Err(VfsError::NotADirectory(path_str.to_string()));
        };
        match children.get(&name) {
            None => return Err(VfsError::NotFound(path_str.to_string())),
            Some(node) if !node.is_writable() => {
                return Err(VfsError::Permission(path_str.to_string()))
            }
            Some(VfsNode::Directory { children: grandchildren, .. })
                if !grandchildren.is_empty() && !recursive =>
            {
                return Err(VfsError::DirectoryNotEmpty(path_str.to_string()))
            }
            _ => {}
        }
        let removed = children
            .remove(&name)
            .expect("presence checked above");
        let freed = removed.size_bytes();
        inner.quota.current_bytes = inner
            .quota
            .current_bytes
            .checked_sub(freed)
            .ok_or_else(|| VfsError::InvalidPath(format!("quota underflow deleting {path_str}")))?;
        crate::metrics::VFS_QUOTA_BYTES_USED.set(inner.quota.current_bytes as i64);
        notify(&inner.watchers, path_str, VfsEventKind::Delete);
        Ok(())
    }

    pub fn stat(&self, path_str: &str) -> Result<Stat, VfsError> {
        let components = path::normalize(path_str)?;
        let inner = self.inner.lock();
        let node = lookup(&inner.root, &components).ok_or_else(|| VfsError::NotFound(path_str.to_string()))?;
        let metadata = node.metadata();
        Ok(Stat {
            path: path::render(&components),
            is_directory: node.is_dir(),
            size_bytes: node.size_bytes(),
            permissions: node.permissions(),
            created_at: metadata.created_at,
            modified_at: metadata.modified_at,
            accessed_at: metadata.accessed_at,
        })
    }

    pub fn chmod(&self, path_str: &str, permissions: u16) -> Result<(), VfsError> {
        let components = path::normalize(path_str)?;
        let mut inner = self.inner.lock();
        let node =
            lookup_mut(&mut inner.root, &components).ok_or_else(|| VfsError::NotFound(path_str.to_string()))?;
        node.set_permissions(permissions & 0o777);
        node.metadata_mut().touch();
        notify(&inner.watchers, path_str, VfsEventKind::Chmod);
        Ok(())
    }

    pub fn watch(&self, path_str: &str) -> tokio::sync::broadcast::Receiver<VfsEvent> {
        let mut inner = self.inner.lock();
        inner
            .watchers
            .entry(path_str.to_string())
            .or_insert_with(|| tokio::sync::broadcast::channel(32).0)
            .subscribe()
    }

    pub fn quota(&self) -> Quota {
        self.inner.lock().quota
    }
}

/// spec §4.6: watchers on the exact mutated path *and* watchers on its
/// parent directory both receive the event (the latter is how a directory
/// watcher learns about its immediate children).
fn notify(watchers: &HashMap<String, tokio::sync::broadcast::Sender<VfsEvent>>, path: &str, kind: VfsEventKind) {
    if let Some(tx) = watchers.get(path) {
        let _ = tx.send(VfsEvent {
            path: path.to_string(),
            kind,
        });
    }
    if let Some(parent) = parent_path(path) {
        if let Some(tx) = watchers.get(&parent) {
            let _ = tx.send(VfsEvent {
                path: path.to_string(),
                kind,
            });
        }
    }
}

fn parent_path(path: &str) -> Option<String> {
    let trimmed = path.trim_end_matches('/');
    let idx = trimmed.rfind('/')?;
    Some(if idx == 0 {
        "/".to_string()
    } else {
        trimmed[..idx].to_string()
    })
}

fn split_parent(components: &[String], original: &str) -> Result<(Vec<String>, String), VfsError> {
    match components.split_last() {
        Some((name, parent)) => Ok((parent.to_vec(), name.clone())),
        None => Err(VfsError::InvalidPath(original.to_string())),
    }
}

fn lookup<'a>(root: &'a VfsNode, components: &[String]) -> Option<&'a VfsNode> {
    let mut current = root;
    for component in components {
        match current {
            VfsNode::Directory { children, .. } => current = children.get(component)?,
            VfsNode::File { .. } => return None,
        }
    }
    Some(current)
}

fn lookup_mut<'a>(root: &'a mut VfsNode, components: &[String]) -> Option<&'a mut VfsNode> {
    let mut current = root;
    for component in components {
        match current {
            VfsNode::Directory { children, .. } => current = children.get_mut(component)?,
            VfsNode::File { .. } => return None,
        }
    }
    Some(current)
}

fn insert_dir(root: &mut VfsNode, components: &[String]) -> Result<(), VfsError> {
    let mut current = root;
    for component in components {
        let VfsNode::Directory { children, .. } = current else {
            return Err(VfsError::NotADirectory(component.clone()));
        };
        current = children
            .entry(component.clone())
            .or_insert_with(VfsNode::new_dir);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_roundtrip_and_quota_tracking() {
        let vfs = VirtualFilesystem::new(1024);
        vfs.write("/sandbox/a.txt", b"hello".to_vec()).unwrap();
        assert_eq!(vfs.read("/sandbox/a.txt").unwrap(), b"hello");
        assert_eq!(vfs.quota().current_bytes, 5);
    }

    #[test]
    fn delete_decrements_quota() {
        let vfs = VirtualFilesystem::new(1024);
        vfs.write("/sandbox/a.txt", b"hello".to_vec()).unwrap();
        vfs.delete("/sandbox/a.txt", false).unwrap();
        assert_eq!(vfs.quota().current_bytes, 0);
        assert!(matches!(vfs.read("/sandbox/a.txt"), Err(VfsError::NotFound(_))));
    }

    #[test]
    fn quota_exceeded_rejects_write() {
        let vfs = VirtualFilesystem::new(4);
        let result = vfs.write("/sandbox/big.txt", b"hello".to_vec());
        assert!(matches!(result, Err(VfsError::Quota { .. })));
    }

    #[test]
    fn cannot_delete_root() {
        let vfs = VirtualFilesystem::new(1024);
        assert!(matches!(vfs.delete("/", true), Err(VfsError::CannotDeleteRoot)));
    }

    #[test]
    fn directory_must_be_empty_to_delete_non_recursively() {
        let vfs = VirtualFilesystem::new(1024);
        vfs.mkdir("/sandbox/dir", true).unwrap();
        vfs.write("/sandbox/dir/f.txt", b"x".to_vec()).unwrap();
        assert!(matches!(
            vfs.delete("/sandbox/dir", false),
            Err(VfsError::DirectoryNotEmpty(_))
        ));
        vfs.delete("/sandbox/dir/f.txt", false).unwrap();
        vfs.delete("/sandbox/dir", false).unwrap();
    }

    #[test]
    fn recursive_delete_removes_subtree_and_frees_quota() {
        let vfs = VirtualFilesystem::new(1024);
        vfs.mkdir("/sandbox/dir/nested", true).unwrap();
        vfs.write("/sandbox/dir/f.txt", b"hello".to_vec()).unwrap();
        vfs.write("/sandbox/dir/nested/g.txt", b"world!".to_vec()).unwrap();
        assert_eq!(vfs.quota().current_bytes, 11);

        vfs.delete("/sandbox/dir", true).unwrap();

        assert_eq!(vfs.quota().current_bytes, 0);
        assert!(matches!(vfs.read("/sandbox/dir/f.txt"), Err(VfsError::NotFound(_))));
        assert!(matches!(vfs.stat("/sandbox/dir"), Err(VfsError::NotFound(_))));
    }

    #[test]
    fn directory_watcher_sees_child_events() {
        let vfs = VirtualFilesystem::new(1024);
        let mut rx = vfs.watch("/sandbox");
        vfs.write("/sandbox/a.txt", b"hi".to_vec()).unwrap();
        let event = rx.try_recv().expect("directory watcher should see child write");
        assert_eq!(event.path, "/sandbox/a.txt");
        assert_eq!(event.kind, VfsEventKind::Write);
    }

    #[test]
    fn non_recursive_mkdir_fails_when_parent_is_missing() {
        let vfs = VirtualFilesystem::new(1024);
        assert!(matches!(
            vfs.mkdir("/sandbox/missing/child", false),
            Err(VfsError::ParentNotFound(_))
        ));
        vfs.mkdir("/sandbox/missing", false).unwrap();
        vfs.mkdir("/sandbox/missing", false).unwrap();
        vfs.mkdir("/sandbox/missing/child", false).unwrap();
    }

    #[test]
    fn default_mounts_exist() {
        let vfs = VirtualFilesystem::new(1024);
        for mount in DEFAULT_MOUNTS {
            let stat = vfs.stat(mount).unwrap();
            assert!(stat.is_directory);
        }
    }
}
