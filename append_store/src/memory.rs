use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::AppendStore;

/// In-memory store over a shared buffer. Two stores cloned from the same
/// `MemStore` see the same bytes, so a test can drop an engine and mount a
/// fresh one over the surviving "disk" without touching the host filesystem.
#[derive(Clone, Default)]
pub struct MemStore {
    mem: Arc<Mutex<Vec<u8>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw backing bytes, for corruption tests.
    pub fn buffer(&self) -> Arc<Mutex<Vec<u8>>> {
        self.mem.clone()
    }
}

impl AppendStore for MemStore {
    fn open(&mut self, _path: &Path) -> io::Result<()> {
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn len(&self) -> u64 {
        self.mem.lock().unwrap().len() as u64
    }

    fn append(&mut self, buf: &[u8]) -> io::Result<u64> {
        let mut mem = self.mem.lock().unwrap();
        let offset = mem.len() as u64;
        mem.extend_from_slice(buf);
        Ok(offset)
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let mem = self.mem.lock().unwrap();
        let offset = offset.min(mem.len() as u64) as usize;
        let n = buf.len().min(mem.len() - offset);
        buf[..n].copy_from_slice(&mem[offset..offset + n]);
        Ok(n)
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.mem.lock().unwrap().truncate(len as usize);
        Ok(())
    }

    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_tester;

    #[test]
    fn simple_test() -> io::Result<()> {
        let mut store = MemStore::new();
        store.open(Path::new("unused"))?;
        store_tester(&mut store)
    }

    #[test]
    fn clones_share_bytes() -> io::Result<()> {
        let mut a = MemStore::new();
        let b = a.clone();
        a.append(b"shared")?;
        let mut buf = [0u8; 6];
        b.read_at(0, &mut buf)?;
        assert_eq!(&buf, b"shared");
        Ok(())
    }
}
