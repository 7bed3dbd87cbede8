//! On-disk record formats for the metadata log.
//!
//! Every record is a 9-byte header followed by a payload: byte 0 is the type
//! tag, bytes 1..5 the payload length (LE u32), bytes 5..9 a CRC-32 of the
//! payload alone (LE u32, reflected polynomial 0xEDB88320, init and final
//! xor 0xFFFFFFFF). The header is not covered by the checksum. All integers
//! are little-endian. CREATE/MKDIR carry an unsigned timestamp; TIMES carries
//! signed seconds. Sizes travel as u64 but must fit i64 on decode.

use num_enum::TryFromPrimitive;

use crate::aofs_lib::types::{FsError, FsResult};

pub const RECORD_HEADER_SIZE: usize = 9;

/// Record type tags. Values are on-disk format, do not renumber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum RecordType {
    Create = 1,
    Extent = 2,
    Truncate = 3,
    Unlink = 4,
    Rename = 5,
    Mkdir = 6,
    SetXattr = 7,
    RemoveXattr = 8,
    Times = 9,
}

pub fn is_dir(mode: u32) -> bool {
    mode & libc::S_IFMT == libc::S_IFDIR
}

pub fn is_symlink(mode: u32) -> bool {
    mode & libc::S_IFMT == libc::S_IFLNK
}

pub fn is_file(mode: u32) -> bool {
    mode & libc::S_IFMT == libc::S_IFREG
}

/// Payload shared by CREATE and MKDIR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRec {
    pub id: u64,
    pub mode: u32,
    pub size: u64,
    pub timestamp: u64,
    pub path: String,
    /// Present iff `mode` carries the symlink file type.
    pub symlink_target: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Create(NodeRec),
    Mkdir(NodeRec),
    Extent {
        id: u64,
        logical_offset: u64,
        data_offset: u64,
        length: u32,
        new_size: u64,
    },
    Truncate {
        id: u64,
        new_size: u64,
    },
    Unlink {
        id: u64,
    },
    Rename {
        id: u64,
        new_path: String,
    },
    SetXattr {
        id: u64,
        name: String,
        value: Vec<u8>,
    },
    RemoveXattr {
        id: u64,
        name: String,
    },
    Times {
        id: u64,
        atime: i64,
        mtime: i64,
    },
}

impl Record {
    pub fn record_type(&self) -> RecordType {
        match self {
            Record::Create(_) => RecordType::Create,
            Record::Mkdir(_) => RecordType::Mkdir,
            Record::Extent { .. } => RecordType::Extent,
            Record::Truncate { .. } => RecordType::Truncate,
            Record::Unlink { .. } => RecordType::Unlink,
            Record::Rename { .. } => RecordType::Rename,
            Record::SetXattr { .. } => RecordType::SetXattr,
            Record::RemoveXattr { .. } => RecordType::RemoveXattr,
            Record::Times { .. } => RecordType::Times,
        }
    }

    /// Serialise into header plus payload with the checksum filled in.
    pub fn encode(&self) -> Vec<u8> {
        let payload = self.encode_payload();
        let mut out = Vec::with_capacity(RECORD_HEADER_SIZE + payload.len());
        out.push(self.record_type() as u8);
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        out.extend_from_slice(&payload);
        out
    }

    fn encode_payload(&self) -> Vec<u8> {
        let mut p = Vec::with_capacity(64);
        match self {
            Record::Create(n) | Record::Mkdir(n) => {
                put_u64(&mut p, n.id);
                put_u32(&mut p, n.mode);
                put_u64(&mut p, n.size);
                put_u64(&mut p, n.timestamp);
                put_bytes(&mut p, n.path.as_bytes());
                if let Some(target) = &n.symlink_target {
                    put_bytes(&mut p, target);
                }
            }
            Record::Extent {
                id,
                logical_offset,
                data_offset,
                length,
                new_size,
            } => {
                put_u64(&mut p, *id);
                put_u64(&mut p, *logical_offset);
                put_u64(&mut p, *data_offset);
                put_u32(&mut p, *length);
                put_u64(&mut p, *new_size);
            }
            Record::Truncate { id, new_size } => {
                put_u64(&mut p, *id);
                put_u64(&mut p, *new_size);
            }
            Record::Unlink { id } => {
                put_u64(&mut p, *id);
            }
            Record::Rename { id, new_path } => {
                put_u64(&mut p, *id);
                put_bytes(&mut p, new_path.as_bytes());
            }
            Record::SetXattr { id, name, value } => {
                // both lengths precede both byte strings
                put_u64(&mut p, *id);
                put_u32(&mut p, name.len() as u32);
                put_u32(&mut p, value.len() as u32);
                p.extend_from_slice(name.as_bytes());
                p.extend_from_slice(value);
            }
            Record::RemoveXattr { id, name } => {
                put_u64(&mut p, *id);
                put_bytes(&mut p, name.as_bytes());
            }
            Record::Times { id, atime, mtime } => {
                put_u64(&mut p, *id);
                put_u64(&mut p, *atime as u64);
                put_u64(&mut p, *mtime as u64);
            }
        }
        p
    }
}

/// Header of the record at the replay cursor.
#[derive(Debug, Clone, Copy)]
pub struct RecordHeader {
    pub kind: u8,
    pub length: u32,
    pub crc: u32,
}

pub fn parse_header(buf: &[u8; RECORD_HEADER_SIZE]) -> RecordHeader {
    RecordHeader {
        kind: buf[0],
        length: le_u32(&buf[1..5]),
        crc: le_u32(&buf[5..9]),
    }
}

pub fn checksum_ok(header: &RecordHeader, payload: &[u8]) -> bool {
    crc32fast::hash(payload) == header.crc
}

/// Decode one checksum-verified payload. `Ok(None)` is an unknown type tag,
/// skipped for forward compatibility; `Err` is a malformed payload.
pub fn decode(kind: u8, payload: &[u8]) -> FsResult<Option<Record>> {
    let kind = match RecordType::try_from(kind) {
        Ok(kind) => kind,
        Err(_) => return Ok(None),
    };
    let mut s = Scan::new(payload);
    let record = match kind {
        RecordType::Create => Record::Create(scan_node(&mut s)?),
        RecordType::Mkdir => Record::Mkdir(scan_node(&mut s)?),
        RecordType::Extent => Record::Extent {
            id: s.u64()?,
            logical_offset: s.u64()?,
            data_offset: s.u64()?,
            length: s.u32()?,
            new_size: s.size()?,
        },
        RecordType::Truncate => Record::Truncate {
            id: s.u64()?,
            new_size: s.size()?,
        },
        RecordType::Unlink => Record::Unlink { id: s.u64()? },
        RecordType::Rename => Record::Rename {
            id: s.u64()?,
            new_path: s.string()?,
        },
        RecordType::SetXattr => {
            let id = s.u64()?;
            let name_len = s.u32()? as usize;
            let value_len = s.u32()? as usize;
            let name = utf8(s.take(name_len)?)?;
            let value = s.take(value_len)?.to_vec();
            Record::SetXattr { id, name, value }
        }
        RecordType::RemoveXattr => {
            let id = s.u64()?;
            let name = s.string()?;
            Record::RemoveXattr { id, name }
        }
        RecordType::Times => Record::Times {
            id: s.u64()?,
            atime: s.i64()?,
            mtime: s.i64()?,
        },
    };
    s.finish()?;
    Ok(Some(record))
}

fn scan_node(s: &mut Scan<'_>) -> FsResult<NodeRec> {
    let id = s.u64()?;
    let mode = s.u32()?;
    let size = s.size()?;
    let timestamp = s.u64()?;
    let path = s.string()?;
    let symlink_target = if is_symlink(mode) {
        Some(s.bytes()?.to_vec())
    } else {
        None
    };
    Ok(NodeRec {
        id,
        mode,
        size,
        timestamp,
        path,
        symlink_target,
    })
}

struct Scan<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Scan<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> FsResult<&'a [u8]> {
        if self.buf.len() - self.pos < n {
            return Err(FsError::Invalid("record payload too short"));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u32(&mut self) -> FsResult<u32> {
        Ok(le_u32(self.take(4)?))
    }

    fn u64(&mut self) -> FsResult<u64> {
        Ok(le_u64(self.take(8)?))
    }

    fn i64(&mut self) -> FsResult<i64> {
        Ok(le_u64(self.take(8)?) as i64)
    }

    /// A u64 that must fit the signed size representation.
    fn size(&mut self) -> FsResult<u64> {
        let v = self.u64()?;
        if v > i64::MAX as u64 {
            return Err(FsError::Invalid("negative size in record"));
        }
        Ok(v)
    }

    fn bytes(&mut self) -> FsResult<&'a [u8]> {
        let n = self.u32()? as usize;
        self.take(n)
    }

    fn string(&mut self) -> FsResult<String> {
        utf8(self.bytes()?)
    }

    fn finish(&self) -> FsResult<()> {
        if self.pos == self.buf.len() {
            Ok(())
        } else {
            Err(FsError::Invalid("trailing bytes in record"))
        }
    }
}

fn utf8(b: &[u8]) -> FsResult<String> {
    String::from_utf8(b.to_vec()).map_err(|_| FsError::Invalid("non-utf8 string in record"))
}

fn le_u32(b: &[u8]) -> u32 {
    let mut w = [0u8; 4];
    w.copy_from_slice(&b[..4]);
    u32::from_le_bytes(w)
}

fn le_u64(b: &[u8]) -> u64 {
    let mut w = [0u8; 8];
    w.copy_from_slice(&b[..8]);
    u64::from_le_bytes(w)
}

fn put_u32(p: &mut Vec<u8>, v: u32) {
    p.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(p: &mut Vec<u8>, v: u64) {
    p.extend_from_slice(&v.to_le_bytes());
}

fn put_bytes(p: &mut Vec<u8>, b: &[u8]) {
    put_u32(p, b.len() as u32);
    p.extend_from_slice(b);
}
