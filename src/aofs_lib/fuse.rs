/// FUSE operations: thin translation from the kernel's ino/fh addressing
/// onto the engine surface. All real work happens in `fs.rs`/`xattr.rs`;
/// this layer resolves paths, converts times, and maps errors to errno.
use std::ffi::OsStr;
use std::path::Path;
use std::time::SystemTime;

use append_store::AppendStore;
use fuser::{
    FileAttr, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use libc::c_int;
use log::*;

use crate::aofs_lib::types::{FsResult, SetTime};
use crate::aofs_lib::utils::{invalid_name, join_path, ret, system_time_secs};
use crate::aofs_lib::xattr::XattrReply;
use crate::aofs_lib::{AOFS, TTL};
use crate::{prv, rep};

fn set_time_of(t: Option<TimeOrNow>) -> SetTime {
    match t {
        None => SetTime::Omit,
        Some(TimeOrNow::Now) => SetTime::Now,
        // nanoseconds are truncated to seconds
        Some(TimeOrNow::SpecificTime(t)) => SetTime::At(system_time_secs(t)),
    }
}

impl<T: AppendStore> AOFS<T> {
    fn child_path(&self, parent: u64, name: &OsStr) -> FsResult<String> {
        let name = name.to_str().ok_or_else(|| invalid_name(name))?;
        Ok(join_path(&self.path_of(parent)?, name))
    }

    fn attr_of(&self, id: u64, req: &Request<'_>) -> FsResult<FileAttr> {
        Ok(self.stat_id(id)?.to_attr(req.uid(), req.gid()))
    }
}

impl<T: AppendStore> Filesystem for AOFS<T> {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        ret(self.aofs_init())
    }

    fn destroy(&mut self) {
        if let Err(e) = self.aofs_destroy() {
            error!("unmount: {}", e);
        }
    }

    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        prv!("lookup", parent, name);
        let name = match name.to_str() {
            Some(n) => n,
            None => {
                reply.error(libc::EINVAL);
                return;
            }
        };
        rep!(reply, info, self.lookup_child(parent, name));
        reply.entry(&TTL, &info.to_attr(req.uid(), req.gid()), 0);
    }

    fn getattr(&mut self, req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        prv!("getattr", ino);
        rep!(reply, attr, self.attr_of(ino, req));
        reply.attr(&TTL, &attr);
    }

    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        prv!("setattr", ino, size, atime, mtime);
        // mode/uid/gid are not persisted; ownership comes from each request
        if let Some(size) = size {
            rep!(reply, path, self.path_of(ino));
            rep!(reply, self.aofs_truncate(&path, size as i64));
        }
        if atime.is_some() || mtime.is_some() {
            rep!(reply, path, self.path_of(ino));
            rep!(
                reply,
                self.aofs_set_times(&path, set_time_of(atime), set_time_of(mtime))
            );
        }
        rep!(reply, attr, self.attr_of(ino, req));
        reply.attr(&TTL, &attr);
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        prv!("readlink", ino);
        rep!(reply, path, self.path_of(ino));
        rep!(reply, target, self.aofs_readlink(&path));
        reply.data(&target);
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        prv!("mknod", parent, name, mode);
        rep!(reply, path, self.child_path(parent, name));
        rep!(reply, info, self.aofs_create(&path, mode));
        reply.entry(&TTL, &info.to_attr(req.uid(), req.gid()), 0);
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        prv!("mkdir", parent, name, mode);
        rep!(reply, path, self.child_path(parent, name));
        rep!(reply, info, self.aofs_mkdir(&path, mode));
        reply.entry(&TTL, &info.to_attr(req.uid(), req.gid()), 0);
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        rep!(reply, path, self.child_path(parent, name));
        rep!(reply, self.aofs_unlink(&path));
        reply.ok();
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        rep!(reply, path, self.child_path(parent, name));
        rep!(reply, self.aofs_rmdir(&path));
        reply.ok();
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        link: &Path,
        reply: ReplyEntry,
    ) {
        prv!("symlink", parent, name, link);
        rep!(reply, path, self.child_path(parent, name));
        let target = match link.to_str() {
            Some(t) => t,
            None => {
                reply.error(libc::EINVAL);
                return;
            }
        };
        rep!(reply, info, self.aofs_symlink(target, &path));
        reply.entry(&TTL, &info.to_attr(req.uid(), req.gid()), 0);
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        prv!("rename", parent, name, newparent, newname, flags);
        if flags != 0 {
            reply.error(libc::EOPNOTSUPP);
            return;
        }
        rep!(reply, from, self.child_path(parent, name));
        rep!(reply, to, self.child_path(newparent, newname));
        rep!(reply, self.aofs_rename(&from, &to));
        reply.ok();
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        prv!("open", ino, flags);
        rep!(reply, path, self.path_of(ino));
        rep!(reply, fh, self.aofs_open(&path, flags, 0));
        reply.opened(fh, 0);
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        prv!("read", ino, offset, size);
        rep!(reply, path, self.path_of(ino));
        rep!(reply, data, self.aofs_read(&path, offset, size));
        reply.data(&data);
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        prv!("write", ino, fh, offset, data.len());
        rep!(reply, written, self.aofs_write(fh, data, offset));
        reply.written(written);
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        rep!(reply, self.aofs_flush(fh));
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        rep!(reply, self.aofs_release(fh));
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        rep!(reply, self.aofs_fsync(fh, datasync));
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        prv!("opendir", ino);
        rep!(reply, info, self.stat_id(ino));
        if info.mode & libc::S_IFMT != libc::S_IFDIR {
            reply.error(libc::ENOTDIR);
            return;
        }
        reply.opened(0, 0);
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        prv!("readdir", ino, offset);
        rep!(reply, dir, self.path_of(ino));
        let mut entries = Vec::new();
        rep!(
            reply,
            self.for_each_child(&dir, |name, info| {
                entries.push((name.to_string(), *info));
                0
            })
        );
        for (i, (name, info)) in entries.iter().enumerate().skip(offset as usize) {
            if reply.add(info.id, (i + 1) as i64, info.kind(), name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        // directory mutations are already log records; push them down on close
        rep!(reply, self.aofs_fsyncdir());
        reply.ok();
    }

    fn fsyncdir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _datasync: bool,
        reply: ReplyEmpty,
    ) {
        rep!(reply, self.aofs_fsyncdir());
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        rep!(reply, s, self.aofs_statfs());
        reply.statfs(
            s.blocks() as u64,
            s.blocks_free() as u64,
            s.blocks_available() as u64,
            s.files() as u64,
            s.files_free() as u64,
            s.block_size() as u32,
            s.name_max() as u32,
            s.fragment_size() as u32,
        );
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        rep!(reply, path, self.path_of(ino));
        let name = match name.to_str() {
            Some(n) => n,
            None => {
                reply.error(libc::EINVAL);
                return;
            }
        };
        rep!(reply, self.aofs_setxattr(&path, name, value, flags));
        reply.ok();
    }

    fn getxattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        rep!(reply, path, self.path_of(ino));
        let name = match name.to_str() {
            Some(n) => n,
            None => {
                reply.error(libc::EINVAL);
                return;
            }
        };
        match self.aofs_getxattr(&path, name, size) {
            Ok(XattrReply::Size(n)) => reply.size(n),
            Ok(XattrReply::Data(d)) => reply.data(&d),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        rep!(reply, path, self.path_of(ino));
        match self.aofs_listxattr(&path, size) {
            Ok(XattrReply::Size(n)) => reply.size(n),
            Ok(XattrReply::Data(d)) => reply.data(&d),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        rep!(reply, path, self.path_of(ino));
        let name = match name.to_str() {
            Some(n) => n,
            None => {
                reply.error(libc::EINVAL);
                return;
            }
        };
        rep!(reply, self.aofs_removexattr(&path, name));
        reply.ok();
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, _mask: i32, reply: ReplyEmpty) {
        rep!(reply, self.stat_id(ino));
        reply.ok();
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        prv!("create", parent, name, mode, flags);
        rep!(reply, path, self.child_path(parent, name));
        rep!(reply, fh, self.aofs_open(&path, flags | libc::O_CREAT, mode));
        rep!(reply, info, self.aofs_stat(&path));
        reply.created(&TTL, &info.to_attr(req.uid(), req.gid()), 0, fh, 0);
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _newparent: u64,
        _newname: &OsStr,
        reply: ReplyEntry,
    ) {
        // link count is always 1
        match self.aofs_link() {
            Err(e) => reply.error(e.errno()),
            Ok(()) => reply.error(libc::EOPNOTSUPP),
        }
    }
}
