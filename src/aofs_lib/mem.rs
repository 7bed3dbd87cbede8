//! In-memory materialisation of the log: inodes, extents, xattrs, open-file
//! handles, and the namespace index. Entries are never physically removed
//! during a mount; deletion is a flag so later log records can still address
//! the inode by id.

use std::collections::HashMap;

use fuser::{FileAttr, FileType};
use log::debug;

use crate::aofs_lib::desc::{NodeRec, Record};
use crate::aofs_lib::utils::{canonical_path, child_name, now_secs, utc_time};

/// The root directory is synthetic: materialised at store construction and
/// never logged, so replay never references its id.
pub const ROOT_ID: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    /// Offset in the file where this extent begins.
    pub logical_offset: u64,
    pub length: u32,
    /// Absolute offset of the bytes in the data segment.
    pub data_offset: u64,
}

impl Extent {
    pub fn end(&self) -> u64 {
        self.logical_offset + self.length as u64
    }
}

#[derive(Debug, Clone)]
pub struct Inode {
    pub id: u64,
    pub path: String,
    pub mode: u32,
    pub size: i64,
    pub ctime: i64,
    pub mtime: i64,
    pub atime: i64,
    pub deleted: bool,
    pub symlink_target: Option<Vec<u8>>,
    /// Insertion order is override order: later extents win on overlap.
    pub extents: Vec<Extent>,
    /// Name/value pairs; insertion order is listing order.
    pub xattrs: Vec<(String, Vec<u8>)>,
}

impl Inode {
    pub fn new(id: u64, path: String, mode: u32, now: i64) -> Self {
        Self {
            id,
            path,
            mode,
            size: 0,
            ctime: now,
            mtime: now,
            atime: now,
            deleted: false,
            symlink_target: None,
            extents: Vec::new(),
            xattrs: Vec::new(),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFLNK
    }

    pub fn is_file(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFREG
    }

    pub fn info(&self) -> InodeInfo {
        InodeInfo {
            id: self.id,
            mode: self.mode,
            size: self.size,
            ctime: self.ctime,
            mtime: self.mtime,
            atime: self.atime,
        }
    }

    pub fn xattr(&self, name: &str) -> Option<&[u8]> {
        self.xattrs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_slice())
    }

    fn set_xattr(&mut self, name: &str, value: &[u8]) {
        match self.xattrs.iter_mut().find(|(n, _)| n == name) {
            Some((_, v)) => *v = value.to_vec(),
            None => self.xattrs.push((name.to_string(), value.to_vec())),
        }
    }

    fn remove_xattr(&mut self, name: &str) {
        self.xattrs.retain(|(n, _)| n != name);
    }

    /// Register a flushed extent and grow the size to cover it.
    pub fn push_extent(&mut self, extent: Extent, new_size: i64) {
        self.extents.push(extent);
        self.size = self.size.max(new_size);
    }

    /// Truncation walk: cut the extent list at `size`. The tail of the list
    /// is dropped from the first extent starting at or past the new size;
    /// a straddling last extent is shortened.
    pub fn apply_truncate(&mut self, size: i64) {
        let s = size.max(0) as u64;
        if let Some(i) = self.extents.iter().position(|e| e.logical_offset >= s) {
            self.extents.truncate(i);
        }
        if let Some(last) = self.extents.last_mut() {
            if last.end() > s {
                last.length = (s - last.logical_offset) as u32;
            }
        }
        self.size = size;
    }
}

/// Attribute summary handed to the adapter.
#[derive(Debug, Clone, Copy)]
pub struct InodeInfo {
    pub id: u64,
    pub mode: u32,
    pub size: i64,
    pub ctime: i64,
    pub mtime: i64,
    pub atime: i64,
}

impl InodeInfo {
    pub fn kind(&self) -> FileType {
        match self.mode & libc::S_IFMT {
            libc::S_IFDIR => FileType::Directory,
            libc::S_IFLNK => FileType::Symlink,
            libc::S_IFIFO => FileType::NamedPipe,
            libc::S_IFCHR => FileType::CharDevice,
            libc::S_IFBLK => FileType::BlockDevice,
            libc::S_IFSOCK => FileType::Socket,
            _ => FileType::RegularFile,
        }
    }

    /// FUSE attrs; uid/gid come from the calling context, never from us.
    pub fn to_attr(&self, uid: u32, gid: u32) -> FileAttr {
        FileAttr {
            ino: self.id,
            size: self.size.max(0) as u64,
            blocks: (self.size.max(0) as u64 + 511) / 512,
            atime: utc_time(self.atime),
            mtime: utc_time(self.mtime),
            ctime: utc_time(self.ctime),
            crtime: utc_time(self.ctime),
            kind: self.kind(),
            perm: (self.mode & 0o7777) as u16,
            // hard links are unsupported, every inode has exactly one name
            nlink: 1,
            uid,
            gid,
            rdev: 0,
            blksize: 4096,
            flags: 0,
        }
    }
}

/// Per-open-file staging state. The buffer coalesces contiguous writes until
/// a flush turns them into one data-segment append plus one extent record.
pub struct FileHandle {
    pub ino: u64,
    pub flags: i32,
    /// Position bookkeeping for O_APPEND opens.
    pub pos: i64,
    pub buf: Vec<u8>,
    /// Logical file offset of the first buffered byte.
    pub buf_offset: i64,
    pub capacity: usize,
}

impl FileHandle {
    pub fn new(ino: u64, flags: i32, capacity: usize) -> Self {
        Self {
            ino,
            flags,
            pos: 0,
            buf: Vec::with_capacity(capacity),
            buf_offset: 0,
            capacity,
        }
    }

    pub fn buffer_end(&self) -> i64 {
        self.buf_offset + self.buf.len() as i64
    }

    pub fn is_contiguous(&self, offset: i64) -> bool {
        self.buf.is_empty() || offset == self.buffer_end()
    }
}

/// Namespace & inode store: the in-memory image the log materialises,
/// indexed by id (deleted entries included) and by canonical path (deleted
/// entries excluded).
pub struct InodeStore {
    nodes: HashMap<u64, Inode>,
    by_path: HashMap<String, u64>,
    next_id: u64,
}

impl Default for InodeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeStore {
    pub fn new() -> Self {
        let mut store = Self {
            nodes: HashMap::new(),
            by_path: HashMap::new(),
            next_id: ROOT_ID + 1,
        };
        let root = Inode::new(ROOT_ID, "/".to_string(), libc::S_IFDIR | 0o755, now_secs());
        store.by_path.insert("/".to_string(), ROOT_ID);
        store.nodes.insert(ROOT_ID, root);
        store
    }

    /// Candidate id for the next create. Only folding the CREATE record in
    /// actually consumes it, so a failed log append spends nothing.
    pub fn peek_id(&self) -> u64 {
        self.next_id
    }

    pub fn bump_past(&mut self, id: u64) {
        self.next_id = self.next_id.max(id + 1);
    }

    /// Lookup by id, deleted entries included (replay needs them).
    pub fn get(&self, id: u64) -> Option<&Inode> {
        self.nodes.get(&id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut Inode> {
        self.nodes.get_mut(&id)
    }

    /// Lookup by canonical path, deleted entries excluded.
    pub fn lookup_path(&self, path: &str) -> Option<&Inode> {
        self.by_path.get(path).and_then(|id| self.nodes.get(id))
    }

    pub fn id_by_path(&self, path: &str) -> Option<u64> {
        self.by_path.get(path).copied()
    }

    /// Most recently created deleted inode at `path`, for revival.
    pub fn deleted_at(&self, path: &str) -> Option<u64> {
        self.nodes
            .values()
            .filter(|n| n.deleted && n.path == path)
            .map(|n| n.id)
            .max()
    }

    /// Immediate children of a directory, sorted by name so directory
    /// listings page stably.
    pub fn children(&self, dir: &str) -> Vec<(&str, &Inode)> {
        let mut out: Vec<(&str, &Inode)> = self
            .by_path
            .iter()
            .filter_map(|(p, id)| child_name(dir, p).map(|name| (name, &self.nodes[id])))
            .collect();
        out.sort_by_key(|(name, _)| *name);
        out
    }

    pub fn is_empty_dir(&self, dir: &str) -> bool {
        self.by_path.keys().all(|p| child_name(dir, p).is_none())
    }

    /// Live inodes whose path lies strictly under `path`, sorted by path.
    pub fn descendants_of(&self, path: &str) -> Vec<(u64, String)> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        let mut out: Vec<(u64, String)> = self
            .by_path
            .iter()
            .filter(|(p, _)| p.len() > prefix.len() && p.starts_with(&prefix))
            .map(|(p, id)| (*id, p.clone()))
            .collect();
        out.sort_by(|a, b| a.1.cmp(&b.1));
        out
    }

    /// Every non-deleted inode, for invariant checks and tests.
    pub fn live_nodes(&self) -> impl Iterator<Item = &Inode> {
        self.nodes.values().filter(|n| !n.deleted)
    }

    /// Fold one log record into the store. This is the single application
    /// path: replay feeds it every intact record, and live operations feed
    /// it the record they just appended, so a remount converges on the same
    /// image the mutation produced.
    pub fn apply(&mut self, record: &Record) {
        match record {
            Record::Create(n) | Record::Mkdir(n) => self.apply_node(n),
            Record::Extent {
                id,
                logical_offset,
                data_offset,
                length,
                new_size,
            } => {
                if let Some(node) = self.nodes.get_mut(id) {
                    node.push_extent(
                        Extent {
                            logical_offset: *logical_offset,
                            length: *length,
                            data_offset: *data_offset,
                        },
                        *new_size as i64,
                    );
                }
            }
            Record::Truncate { id, new_size } => {
                if let Some(node) = self.nodes.get_mut(id) {
                    node.apply_truncate(*new_size as i64);
                }
            }
            Record::Unlink { id } => self.mark_deleted(*id),
            Record::Rename { id, new_path } => self.set_path(*id, new_path),
            Record::SetXattr { id, name, value } => {
                if let Some(node) = self.nodes.get_mut(id) {
                    node.set_xattr(name, value);
                }
            }
            Record::RemoveXattr { id, name } => {
                if let Some(node) = self.nodes.get_mut(id) {
                    node.remove_xattr(name);
                }
            }
            Record::Times { id, atime, mtime } => {
                if let Some(node) = self.nodes.get_mut(id) {
                    node.atime = *atime;
                    node.mtime = *mtime;
                }
            }
        }
    }

    /// CREATE/MKDIR application: allocate the inode or revive the existing
    /// one under the recorded id, resetting everything the payload carries.
    fn apply_node(&mut self, rec: &NodeRec) {
        let path = canonical_path(&rec.path);
        let times = rec.timestamp as i64;
        let node = self
            .nodes
            .entry(rec.id)
            .or_insert_with(|| Inode::new(rec.id, path.clone(), rec.mode, times));
        node.extents.clear();
        node.xattrs.clear();
        node.path = path.clone();
        node.mode = rec.mode;
        node.size = rec.size as i64;
        node.ctime = times;
        node.mtime = times;
        node.atime = times;
        node.deleted = false;
        node.symlink_target = rec.symlink_target.clone();
        self.by_path.insert(path, rec.id);
        self.bump_past(rec.id);
        debug!("node {} at {:?} materialised", rec.id, rec.path);
    }

    fn set_path(&mut self, id: u64, new_path: &str) {
        if let Some(node) = self.nodes.get_mut(&id) {
            if self.by_path.get(&node.path) == Some(&id) {
                self.by_path.remove(&node.path);
            }
            node.path = new_path.to_string();
            node.deleted = false;
            self.by_path.insert(new_path.to_string(), id);
        }
    }

    fn mark_deleted(&mut self, id: u64) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.deleted = true;
            if self.by_path.get(&node.path) == Some(&id) {
                self.by_path.remove(&node.path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_node(store: &mut InodeStore, path: &str) -> u64 {
        let id = store.peek_id();
        store.apply(&Record::Create(NodeRec {
            id,
            mode: libc::S_IFREG | 0o644,
            size: 0,
            timestamp: 1,
            path: path.to_string(),
            symlink_target: None,
        }));
        id
    }

    #[test]
    fn root_exists_from_the_start() {
        let store = InodeStore::new();
        let root = store.lookup_path("/").unwrap();
        assert_eq!(root.id, ROOT_ID);
        assert!(root.is_dir());
        assert_eq!(store.peek_id(), ROOT_ID + 1);
    }

    #[test]
    fn unlink_hides_but_keeps_entry() {
        let mut store = InodeStore::new();
        let id = file_node(&mut store, "/f");
        store.apply(&Record::Unlink { id });
        assert!(store.lookup_path("/f").is_none());
        assert!(store.get(id).unwrap().deleted);
    }

    #[test]
    fn create_revives_deleted_id() {
        let mut store = InodeStore::new();
        let id = file_node(&mut store, "/f");
        store.apply(&Record::SetXattr {
            id,
            name: "user.a".to_string(),
            value: b"1".to_vec(),
        });
        store.apply(&Record::Unlink { id });
        store.apply(&Record::Create(NodeRec {
            id,
            mode: libc::S_IFREG | 0o600,
            size: 0,
            timestamp: 9,
            path: "/f".to_string(),
            symlink_target: None,
        }));
        let node = store.lookup_path("/f").unwrap();
        assert_eq!(node.id, id);
        assert!(node.xattrs.is_empty());
        assert_eq!(node.mode, libc::S_IFREG | 0o600);
        assert_eq!(node.ctime, 9);
    }

    #[test]
    fn ids_never_go_backwards() {
        let mut store = InodeStore::new();
        store.apply(&Record::Create(NodeRec {
            id: 40,
            mode: libc::S_IFREG | 0o644,
            size: 0,
            timestamp: 1,
            path: "/f".to_string(),
            symlink_target: None,
        }));
        assert_eq!(store.peek_id(), 41);
        file_node(&mut store, "/g");
        assert_eq!(store.peek_id(), 42);
    }

    #[test]
    fn truncation_walk() {
        let mut node = Inode::new(5, "/f".to_string(), libc::S_IFREG | 0o644, 0);
        node.push_extent(
            Extent {
                logical_offset: 0,
                length: 100,
                data_offset: 0,
            },
            100,
        );
        node.push_extent(
            Extent {
                logical_offset: 100,
                length: 50,
                data_offset: 100,
            },
            150,
        );
        node.push_extent(
            Extent {
                logical_offset: 80,
                length: 10,
                data_offset: 150,
            },
            150,
        );

        // drops the tail from the first extent at or past the new size,
        // then shortens the straddler
        node.apply_truncate(90);
        assert_eq!(node.extents.len(), 1);
        assert_eq!(node.extents[0].length, 90);
        assert_eq!(node.size, 90);

        node.apply_truncate(0);
        assert!(node.extents.is_empty());
        assert_eq!(node.size, 0);
    }

    #[test]
    fn extent_grows_size_monotonically() {
        let mut store = InodeStore::new();
        let id = file_node(&mut store, "/f");
        store.apply(&Record::Extent {
            id,
            logical_offset: 0,
            data_offset: 0,
            length: 64,
            new_size: 64,
        });
        store.apply(&Record::Extent {
            id,
            logical_offset: 0,
            data_offset: 64,
            length: 16,
            new_size: 16,
        });
        assert_eq!(store.get(id).unwrap().size, 64);
    }

    #[test]
    fn children_are_sorted_and_rootable() {
        let mut store = InodeStore::new();
        file_node(&mut store, "/b");
        file_node(&mut store, "/a");
        file_node(&mut store, "/a2/nested"); // not an immediate child
        let names: Vec<&str> = store.children("/").iter().map(|(n, _)| *n).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(!store.is_empty_dir("/"));
        assert!(store.is_empty_dir("/a"));
    }

    #[test]
    fn descendants_sorted_by_path() {
        let mut store = InodeStore::new();
        file_node(&mut store, "/x/y/f");
        file_node(&mut store, "/x/a");
        file_node(&mut store, "/xylophone");
        let d = store.descendants_of("/x");
        let paths: Vec<&str> = d.iter().map(|(_, p)| p.as_str()).collect();
        assert_eq!(paths, vec!["/x/a", "/x/y/f"]);
    }

    #[test]
    fn rename_clears_deleted_flag() {
        let mut store = InodeStore::new();
        let id = file_node(&mut store, "/old");
        store.apply(&Record::Unlink { id });
        store.apply(&Record::Rename {
            id,
            new_path: "/new".to_string(),
        });
        assert!(store.lookup_path("/old").is_none());
        assert_eq!(store.lookup_path("/new").unwrap().id, id);
    }
}
