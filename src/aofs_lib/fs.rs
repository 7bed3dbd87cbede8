//! Namespace and file operations: the surface the adapter drives.
//!
//! Every mutating operation validates first, appends its record to the log,
//! and only then touches the in-memory image, so a failed append leaves the
//! engine exactly where it was. The one sanctioned exception is the
//! multi-record rename of a directory subtree, whose partial completion the
//! log carries faithfully.

use std::cmp::{max, min};

use append_store::AppendStore;
use log::{debug, warn};

use crate::aofs_lib::desc::{self, NodeRec, Record};
use crate::aofs_lib::mem::{Extent, FileHandle, InodeInfo};
use crate::aofs_lib::types::{FsError, FsResult, SetTime, MIN_WRITE_BUFFER};
use crate::aofs_lib::utils::{canonical_path, join_path, now_secs, parent_path};
use crate::aofs_lib::AOFS;
use crate::prv;

impl<T: AppendStore> AOFS<T> {
    // ---- resolution ------------------------------------------------------

    pub(crate) fn resolve(&self, path: &str) -> FsResult<u64> {
        self.store.id_by_path(path).ok_or(FsError::NotFound)
    }

    /// Canonical path of a live inode, for the id-addressed adapter.
    pub fn path_of(&self, id: u64) -> FsResult<String> {
        let node = self.store.get(id).ok_or(FsError::NotFound)?;
        if node.deleted {
            return Err(FsError::NotFound);
        }
        Ok(node.path.clone())
    }

    fn require_parent_dir(&self, path: &str) -> FsResult<()> {
        let parent = parent_path(path).ok_or(FsError::Exists)?;
        let node = self.store.lookup_path(parent).ok_or(FsError::NotFound)?;
        if !node.is_dir() {
            return Err(FsError::NotDir);
        }
        Ok(())
    }

    // ---- create family ---------------------------------------------------

    fn make_node(&mut self, path: &str, mode: u32, target: Option<&[u8]>) -> FsResult<InodeInfo> {
        let path = canonical_path(path);
        if path == "/" {
            return Err(FsError::Exists);
        }
        if self.store.lookup_path(&path).is_some() {
            return Err(FsError::Exists);
        }
        self.require_parent_dir(&path)?;
        // a deleted entry at this path is revived under its old id
        let id = self
            .store
            .deleted_at(&path)
            .unwrap_or_else(|| self.store.peek_id());
        let node = NodeRec {
            id,
            mode,
            size: target.map(|t| t.len() as u64).unwrap_or(0),
            timestamp: now_secs() as u64,
            path: path.clone(),
            symlink_target: target.map(|t| t.to_vec()),
        };
        let record = if desc::is_dir(mode) {
            Record::Mkdir(node)
        } else {
            Record::Create(node)
        };
        self.commit(&record)?;
        self.aofs_stat(&path)
    }

    pub fn aofs_create(&mut self, path: &str, mode: u32) -> FsResult<InodeInfo> {
        prv!("create", path, mode);
        let mode = if mode & libc::S_IFMT == 0 {
            mode | libc::S_IFREG
        } else {
            mode
        };
        self.make_node(path, mode, None)
    }

    pub fn aofs_mkdir(&mut self, path: &str, mode: u32) -> FsResult<InodeInfo> {
        prv!("mkdir", path, mode);
        self.make_node(path, (mode & !libc::S_IFMT) | libc::S_IFDIR, None)
    }

    pub fn aofs_symlink(&mut self, target: &str, linkpath: &str) -> FsResult<InodeInfo> {
        prv!("symlink", target, linkpath);
        self.make_node(linkpath, libc::S_IFLNK | 0o777, Some(target.as_bytes()))
    }

    pub fn aofs_readlink(&self, path: &str) -> FsResult<Vec<u8>> {
        let node = self
            .store
            .lookup_path(&canonical_path(path))
            .ok_or(FsError::NotFound)?;
        if !node.is_symlink() {
            return Err(FsError::Invalid("readlink on a non-symlink"));
        }
        node.symlink_target
            .clone()
            .ok_or(FsError::Invalid("symlink without a target"))
    }

    /// Hard links are unsupported; every inode has link count 1.
    pub fn aofs_link(&self) -> FsResult<()> {
        Err(FsError::Unsupported)
    }

    // ---- open / handles --------------------------------------------------

    pub fn aofs_open(&mut self, path: &str, flags: i32, mode: u32) -> FsResult<u64> {
        let path = canonical_path(path);
        prv!("open", path, flags);
        let (exists, is_dir) = match self.store.lookup_path(&path) {
            Some(node) => (true, node.is_dir()),
            None => (false, false),
        };
        if is_dir {
            return Err(FsError::IsDir);
        }
        if exists && flags & libc::O_CREAT != 0 && flags & libc::O_EXCL != 0 {
            return Err(FsError::Exists);
        }
        if !exists {
            if flags & libc::O_CREAT == 0 {
                return Err(FsError::NotFound);
            }
            self.aofs_create(&path, mode)?;
        }
        if flags & libc::O_TRUNC != 0 {
            self.aofs_truncate(&path, 0)?;
        }
        let id = self.resolve(&path)?;
        let size = self.store.get(id).map(|n| n.size).unwrap_or(0);
        let fh = self.alloc_fh();
        let mut handle = FileHandle::new(id, flags, self.options().write_buffer_size);
        if flags & libc::O_APPEND != 0 {
            handle.pos = size;
        }
        self.handles.insert(fh, handle);
        Ok(fh)
    }

    /// Close implies flush; the handle is gone afterwards either way.
    pub fn aofs_release(&mut self, fh: u64) -> FsResult<()> {
        prv!("release", fh);
        let res = self.flush_handle(fh);
        self.handles.remove(&fh);
        res
    }

    pub fn aofs_flush(&mut self, fh: u64) -> FsResult<()> {
        self.flush_handle(fh)
    }

    /// Flush the handle and push the data segment down; a full (non-data)
    /// fsync also pushes the log.
    pub fn aofs_fsync(&mut self, fh: u64, datasync: bool) -> FsResult<()> {
        prv!("fsync", fh, datasync);
        self.flush_handle(fh)?;
        self.data.sync()?;
        if !datasync {
            self.meta.sync()?;
        }
        Ok(())
    }

    /// Directory mutations are log records, so fsyncdir is a log sync.
    pub fn aofs_fsyncdir(&mut self) -> FsResult<()> {
        self.meta.sync()?;
        Ok(())
    }

    // ---- write pipeline --------------------------------------------------

    pub fn aofs_write(&mut self, fh: u64, data: &[u8], offset: i64) -> FsResult<u32> {
        prv!("write", fh, offset, data.len());
        if offset < 0 {
            return Err(FsError::Invalid("negative write offset"));
        }
        let contiguous = self
            .handles
            .get(&fh)
            .ok_or(FsError::Invalid("unknown file handle"))?
            .is_contiguous(offset);
        if !contiguous {
            self.flush_handle(fh)?;
        }
        let mut copied = 0usize;
        loop {
            let need_flush;
            {
                let h = self
                    .handles
                    .get_mut(&fh)
                    .ok_or(FsError::Invalid("unknown file handle"))?;
                if h.buf.is_empty() {
                    h.buf_offset = offset + copied as i64;
                }
                let room = h.capacity - h.buf.len();
                let n = min(room, data.len() - copied);
                h.buf.extend_from_slice(&data[copied..copied + n]);
                copied += n;
                need_flush = h.buf.len() >= h.capacity && h.buf.len() >= MIN_WRITE_BUFFER;
            }
            if need_flush {
                self.flush_handle(fh)?;
            }
            if copied >= data.len() {
                break;
            }
        }
        if let Some(h) = self.handles.get_mut(&fh) {
            h.pos = offset + copied as i64;
        }
        Ok(copied as u32)
    }

    /// Turn one handle's staging buffer into a data-segment append plus an
    /// extent record, then fold the extent into memory. The unit is atomic:
    /// if the record append fails after the data append succeeded, the data
    /// segment is cut back to its prior length and nothing else changes.
    pub(crate) fn flush_handle(&mut self, fh: u64) -> FsResult<()> {
        let h = self
            .handles
            .get(&fh)
            .ok_or(FsError::Invalid("unknown file handle"))?;
        if h.buf.is_empty() {
            return Ok(());
        }
        let ino = h.ino;
        let buf_offset = h.buf_offset;
        let len = h.buf.len();
        let prior_size = self.store.get(ino).ok_or(FsError::NotFound)?.size;
        let new_size = max(prior_size, buf_offset + len as i64);

        let d = self.data.len();
        self.data.append(&h.buf)?;
        let record = Record::Extent {
            id: ino,
            logical_offset: buf_offset as u64,
            data_offset: d,
            length: len as u32,
            new_size: new_size as u64,
        };
        if let Err(e) = self.meta.append(&record.encode()) {
            warn!("extent record append failed ({}), rolling data segment back", e);
            self.data.truncate(d)?;
            return Err(e.into());
        }

        let node = self.store.get_mut(ino).ok_or(FsError::NotFound)?;
        node.push_extent(
            Extent {
                logical_offset: buf_offset as u64,
                length: len as u32,
                data_offset: d,
            },
            new_size,
        );
        node.mtime = now_secs();
        if let Some(h) = self.handles.get_mut(&fh) {
            h.buf.clear();
        }
        debug!(
            "flush fh {}: {} bytes, logical {} -> data {}",
            fh, len, buf_offset, d
        );
        Ok(())
    }

    /// Flush every handle staging data for this inode, so extent records
    /// serialise against truncate and reads observe buffered writes.
    fn flush_inode_handles(&mut self, id: u64) -> FsResult<()> {
        let fhs: Vec<u64> = self
            .handles
            .iter()
            .filter(|(_, h)| h.ino == id && !h.buf.is_empty())
            .map(|(fh, _)| *fh)
            .collect();
        for fh in fhs {
            self.flush_handle(fh)?;
        }
        Ok(())
    }

    // ---- read path -------------------------------------------------------

    /// Resolve `[offset, offset + size)` against the extent history. Later
    /// extents overwrite earlier contributions in the output buffer, which
    /// is what gives overlapping writes their latest-wins meaning; gaps no
    /// extent covers stay zero.
    pub fn aofs_read(&mut self, path: &str, offset: i64, size: u32) -> FsResult<Vec<u8>> {
        let path = canonical_path(path);
        prv!("read", path, offset, size);
        let id = self.resolve(&path)?;
        if self.store.get(id).ok_or(FsError::NotFound)?.is_dir() {
            return Err(FsError::IsDir);
        }
        self.flush_inode_handles(id)?;

        let node = self.store.get(id).ok_or(FsError::NotFound)?;
        let offset = offset.max(0);
        let stop = min(offset.saturating_add(size as i64), node.size);
        if stop <= offset {
            return Ok(Vec::new());
        }
        let mut out = vec![0u8; (stop - offset) as usize];
        for e in &node.extents {
            let l = e.logical_offset as i64;
            let end = l + e.length as i64;
            let start = max(offset, l);
            let cut = min(stop, end);
            if start < cut {
                let src = e.data_offset + (start - l) as u64;
                let dst = (start - offset) as usize;
                let n = (cut - start) as usize;
                self.data.read_at(src, &mut out[dst..dst + n])?;
            }
        }
        if let Some(node) = self.store.get_mut(id) {
            node.atime = now_secs();
        }
        Ok(out)
    }

    // ---- truncate --------------------------------------------------------

    pub fn aofs_truncate(&mut self, path: &str, size: i64) -> FsResult<()> {
        let path = canonical_path(path);
        prv!("truncate", path, size);
        if size < 0 {
            return Err(FsError::Invalid("negative size"));
        }
        let id = self.resolve(&path)?;
        let node = self.store.get(id).ok_or(FsError::NotFound)?;
        if !node.is_file() && !node.is_symlink() {
            return Err(FsError::Invalid("truncate on a non-regular file"));
        }
        self.flush_inode_handles(id)?;
        self.commit(&Record::Truncate {
            id,
            new_size: size as u64,
        })
    }

    // ---- unlink family ---------------------------------------------------

    pub fn aofs_unlink(&mut self, path: &str) -> FsResult<()> {
        let path = canonical_path(path);
        prv!("unlink", path);
        let id = self.resolve(&path)?;
        if self.store.get(id).ok_or(FsError::NotFound)?.is_dir() {
            return Err(FsError::IsDir);
        }
        self.commit(&Record::Unlink { id })
    }

    pub fn aofs_rmdir(&mut self, path: &str) -> FsResult<()> {
        let path = canonical_path(path);
        prv!("rmdir", path);
        if path == "/" {
            return Err(FsError::Invalid("rmdir of the root"));
        }
        let id = self.resolve(&path)?;
        if !self.store.get(id).ok_or(FsError::NotFound)?.is_dir() {
            return Err(FsError::NotDir);
        }
        if !self.store.is_empty_dir(&path) {
            return Err(FsError::NotEmpty);
        }
        self.commit(&Record::Unlink { id })
    }

    // ---- rename ----------------------------------------------------------

    pub fn aofs_rename(&mut self, from: &str, to: &str) -> FsResult<()> {
        let from = canonical_path(from);
        let to = canonical_path(to);
        prv!("rename", from, to);
        if from == to {
            return Ok(());
        }
        if from == "/" || to == "/" {
            return Err(FsError::Invalid("rename involving the root"));
        }
        let src_id = self.resolve(&from)?;
        let src_is_dir = self
            .store
            .get(src_id)
            .map(|n| n.is_dir())
            .unwrap_or(false);
        if src_is_dir && to.starts_with(&format!("{}/", from)) {
            return Err(FsError::Invalid("rename of a directory into itself"));
        }
        self.require_parent_dir(&to)?;

        if let Some(dst) = self.store.lookup_path(&to) {
            let (dst_id, dst_is_dir) = (dst.id, dst.is_dir());
            if dst_is_dir && !src_is_dir {
                return Err(FsError::IsDir);
            }
            if !dst_is_dir && src_is_dir {
                return Err(FsError::NotDir);
            }
            if dst_is_dir && !self.store.is_empty_dir(&to) {
                return Err(FsError::NotEmpty);
            }
            self.commit(&Record::Unlink { id: dst_id })?;
        }

        let descendants = if src_is_dir {
            self.store.descendants_of(&from)
        } else {
            Vec::new()
        };
        self.commit(&Record::Rename {
            id: src_id,
            new_path: to.clone(),
        })?;
        // per-descendant records follow; a failure leaves the earlier ones
        // renamed and the log carries that partial result faithfully
        for (id, old_path) in descendants {
            let new_path = format!("{}{}", to, &old_path[from.len()..]);
            self.commit(&Record::Rename { id, new_path })?;
        }
        Ok(())
    }

    // ---- times / stat ----------------------------------------------------

    pub fn aofs_set_times(&mut self, path: &str, atime: SetTime, mtime: SetTime) -> FsResult<()> {
        let path = canonical_path(path);
        prv!("set_times", path);
        let id = self.resolve(&path)?;
        let node = self.store.get(id).ok_or(FsError::NotFound)?;
        let now = now_secs();
        let record = Record::Times {
            id,
            atime: atime.resolve(now, node.atime),
            mtime: mtime.resolve(now, node.mtime),
        };
        self.commit(&record)?;
        // ctime moves with the change itself and is not carried by the record
        if let Some(node) = self.store.get_mut(id) {
            node.ctime = now;
        }
        Ok(())
    }

    pub fn aofs_stat(&self, path: &str) -> FsResult<InodeInfo> {
        self.store
            .lookup_path(&canonical_path(path))
            .map(|n| n.info())
            .ok_or(FsError::NotFound)
    }

    /// Id-addressed stat for the adapter; serves deleted-but-open inodes too.
    pub fn stat_id(&self, id: u64) -> FsResult<InodeInfo> {
        self.store.get(id).map(|n| n.info()).ok_or(FsError::NotFound)
    }

    pub fn lookup_child(&self, parent: u64, name: &str) -> FsResult<InodeInfo> {
        let dir = self.path_of(parent)?;
        self.aofs_stat(&join_path(&dir, name))
    }

    // ---- directories -----------------------------------------------------

    /// Iterate the immediate children of a directory. The callback returns
    /// 0 to continue, non-zero to stop.
    pub fn for_each_child<F>(&self, dir: &str, mut f: F) -> FsResult<()>
    where
        F: FnMut(&str, &InodeInfo) -> i32,
    {
        let dir = canonical_path(dir);
        let node = self.store.lookup_path(&dir).ok_or(FsError::NotFound)?;
        if !node.is_dir() {
            return Err(FsError::NotDir);
        }
        for (name, child) in self.store.children(&dir) {
            if f(name, &child.info()) != 0 {
                break;
            }
        }
        Ok(())
    }

    // ---- statfs ----------------------------------------------------------

    /// Host filesystem stats of the backing directory.
    pub fn aofs_statfs(&self) -> FsResult<nix::sys::statvfs::Statvfs> {
        nix::sys::statvfs::statvfs(self.root())
            .map_err(|e| FsError::Io(std::io::Error::from_raw_os_error(e as i32)))
    }
}
