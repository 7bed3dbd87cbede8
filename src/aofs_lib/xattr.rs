//! Extended attribute operations.
//!
//! Attributes live on the inode as name/value pairs in insertion order;
//! every mutation is a log record, so the image after a remount matches.

use append_store::AppendStore;

use crate::aofs_lib::desc::Record;
use crate::aofs_lib::types::{FsError, FsResult};
use crate::aofs_lib::utils::canonical_path;
use crate::aofs_lib::AOFS;
use crate::prv;

/// Reply to a get/list request, sized by the caller's buffer: a zero-sized
/// probe gets the byte count, anything else gets the bytes or ERANGE.
pub enum XattrReply {
    Size(u32),
    Data(Vec<u8>),
}

impl<T: AppendStore> AOFS<T> {
    pub fn aofs_setxattr(&mut self, path: &str, name: &str, value: &[u8], flags: i32) -> FsResult<()> {
        let path = canonical_path(path);
        prv!("setxattr", path, name, flags);
        let id = self.resolve(&path)?;
        let present = self
            .store
            .get(id)
            .ok_or(FsError::NotFound)?
            .xattr(name)
            .is_some();
        if flags & libc::XATTR_CREATE != 0 && present {
            return Err(FsError::Exists);
        }
        if flags & libc::XATTR_REPLACE != 0 && !present {
            return Err(FsError::NoData);
        }
        self.commit(&Record::SetXattr {
            id,
            name: name.to_string(),
            value: value.to_vec(),
        })
    }

    pub fn aofs_getxattr(&self, path: &str, name: &str, size: u32) -> FsResult<XattrReply> {
        let node = self
            .store
            .lookup_path(&canonical_path(path))
            .ok_or(FsError::NotFound)?;
        let value = node.xattr(name).ok_or(FsError::NoData)?;
        if size == 0 {
            return Ok(XattrReply::Size(value.len() as u32));
        }
        if (size as usize) < value.len() {
            return Err(FsError::Range);
        }
        Ok(XattrReply::Data(value.to_vec()))
    }

    /// Names joined with NUL terminators, or the total byte count.
    pub fn aofs_listxattr(&self, path: &str, size: u32) -> FsResult<XattrReply> {
        let node = self
            .store
            .lookup_path(&canonical_path(path))
            .ok_or(FsError::NotFound)?;
        let mut names = Vec::new();
        for (name, _) in &node.xattrs {
            names.extend_from_slice(name.as_bytes());
            names.push(0);
        }
        if size == 0 {
            return Ok(XattrReply::Size(names.len() as u32));
        }
        if (size as usize) < names.len() {
            return Err(FsError::Range);
        }
        Ok(XattrReply::Data(names))
    }

    pub fn aofs_removexattr(&mut self, path: &str, name: &str) -> FsResult<()> {
        let path = canonical_path(path);
        prv!("removexattr", path, name);
        let id = self.resolve(&path)?;
        if self
            .store
            .get(id)
            .ok_or(FsError::NotFound)?
            .xattr(name)
            .is_none()
        {
            return Err(FsError::NoData);
        }
        self.commit(&Record::RemoveXattr {
            id,
            name: name.to_string(),
        })
    }
}
