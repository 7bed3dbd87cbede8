/// Engine core: ties the two backing stores to the in-memory namespace.
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

pub use append_store;
use append_store::AppendStore;
use log::*;

pub mod desc;
pub mod fs;
pub mod fuse;
pub mod mem;
pub mod replay;
pub mod types;
pub mod utils;
pub mod xattr;

use desc::Record;
use mem::{FileHandle, InodeStore};
use types::{FsError, FsOptions, FsResult, MIN_WRITE_BUFFER};

/// Attr TTL handed to the kernel, 1 second default
pub(crate) const TTL: Duration = Duration::from_secs(1);

/// One mounted engine instance. Everything it owns lives for the mount:
/// the two append-only stores, the inode image, and the open handles.
pub struct AOFS<T: AppendStore> {
    pub data: T,
    pub meta: T,
    pub store: InodeStore,
    pub handles: HashMap<u64, FileHandle>,
    next_fh: u64,
    options: FsOptions,
    root: PathBuf,
}

impl<T: AppendStore> AOFS<T> {
    pub fn new(root: impl Into<PathBuf>, data: T, meta: T) -> Self {
        Self {
            data,
            meta,
            store: InodeStore::new(),
            handles: HashMap::new(),
            next_fh: 1,
            options: FsOptions::default(),
            root: root.into(),
        }
    }

    pub fn options(&self) -> &FsOptions {
        &self.options
    }

    /// Capacity for subsequently opened handles; existing handles keep
    /// their buffer.
    pub fn set_write_buffer_size(&mut self, size: usize) -> FsResult<()> {
        if size < MIN_WRITE_BUFFER {
            return Err(FsError::Invalid("write buffer below the 4 KiB floor"));
        }
        self.options.write_buffer_size = size;
        Ok(())
    }

    pub fn set_strict_replay(&mut self, strict: bool) {
        self.options.strict_replay = strict;
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    /// Mount: open both stores under the root (creating the backing
    /// directory if missing) and replay the log into memory. Append cursors
    /// end up at the stores' lengths.
    pub fn aofs_init(&mut self) -> FsResult<()> {
        info!("mounting aofs root {}", self.root.display());
        self.data.open(&self.root.join("data"))?;
        self.meta.open(&self.root.join("meta"))?;
        let stats = replay::replay(&self.meta, &mut self.store, self.options.strict_replay)?;
        info!(
            "replayed {} records ({} skipped), next inode id {}, data segment {} bytes",
            stats.applied,
            stats.skipped,
            self.store.peek_id(),
            self.data.len()
        );
        Ok(())
    }

    /// Unmount: flush every open handle, push both stores to stable
    /// storage, close them.
    pub fn aofs_destroy(&mut self) -> FsResult<()> {
        let fhs: Vec<u64> = self.handles.keys().copied().collect();
        for fh in fhs {
            self.flush_handle(fh)?;
        }
        self.handles.clear();
        self.data.sync()?;
        self.meta.sync()?;
        self.data.close()?;
        self.meta.close()?;
        info!("unmounted aofs root {}", self.root.display());
        Ok(())
    }

    /// Append a namespace record to the log and, only on success, fold it
    /// into memory. A failed append therefore leaves the image untouched.
    pub(crate) fn commit(&mut self, record: &Record) -> FsResult<()> {
        self.meta.append(&record.encode())?;
        self.store.apply(record);
        Ok(())
    }

    pub(crate) fn alloc_fh(&mut self) -> u64 {
        let fh = self.next_fh;
        self.next_fh += 1;
        fh
    }
}
