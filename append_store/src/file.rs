use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;

use log::debug;

use crate::AppendStore;

/// File-backed store. Writes go through `pwrite` at the tracked length, so
/// the kernel file offset is never used and the cursor cannot drift.
pub struct FileStore {
    file: Option<File>,
    len: u64,
}

impl FileStore {
    pub fn new() -> Self {
        Self { file: None, len: 0 }
    }

    fn file(&self) -> io::Result<&File> {
        self.file
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "store not open"))
    }
}

impl Default for FileStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AppendStore for FileStore {
    fn open(&mut self, path: &Path) -> io::Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        self.len = file.metadata()?.len();
        debug!("store open {} ({} bytes)", path.display(), self.len);
        self.file = Some(file);
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        Ok(())
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn append(&mut self, buf: &[u8]) -> io::Result<u64> {
        let offset = self.len;
        self.file()?.write_all_at(buf, offset)?;
        self.len += buf.len() as u64;
        Ok(offset)
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let file = self.file()?;
        let mut done = 0;
        while done < buf.len() {
            match file.read_at(&mut buf[done..], offset + done as u64) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(done)
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.file()?.set_len(len)?;
        self.len = len;
        Ok(())
    }

    fn sync(&mut self) -> io::Result<()> {
        self.file()?.sync_data()
    }
}
