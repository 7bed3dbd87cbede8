//! Rebuild the in-memory namespace by scanning the metadata log.

use append_store::AppendStore;
use log::{debug, warn};

use crate::aofs_lib::desc::{self, RECORD_HEADER_SIZE};
use crate::aofs_lib::mem::InodeStore;
use crate::aofs_lib::types::FsResult;

/// Counters reported after a replay pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReplayStats {
    pub applied: u64,
    pub skipped: u64,
}

/// Scan the log from offset 0 and apply every intact record.
///
/// A short header or a record whose declared payload runs past the end of
/// the log is a torn tail: the scan stops there and later appends continue
/// past it. A record whose checksum fails, or whose payload is malformed,
/// is skipped and the scan continues, unless `strict` stops the scan at
/// the first such record. Unknown type tags are ignored.
pub fn replay<T: AppendStore>(meta: &T, store: &mut InodeStore, strict: bool) -> FsResult<ReplayStats> {
    let mut stats = ReplayStats::default();
    let end = meta.len();
    let mut cursor = 0u64;
    let mut header_buf = [0u8; RECORD_HEADER_SIZE];

    while cursor + (RECORD_HEADER_SIZE as u64) <= end {
        let n = meta.read_at(cursor, &mut header_buf)?;
        if n < RECORD_HEADER_SIZE {
            break;
        }
        let header = desc::parse_header(&header_buf);
        let payload_at = cursor + RECORD_HEADER_SIZE as u64;
        if payload_at + header.length as u64 > end {
            warn!(
                "log ends mid-record at offset {} (want {} payload bytes); stopping replay",
                cursor, header.length
            );
            break;
        }
        let mut payload = vec![0u8; header.length as usize];
        let n = meta.read_at(payload_at, &mut payload)?;
        if n < payload.len() {
            warn!("short payload read at offset {}; stopping replay", payload_at);
            break;
        }
        let record_at = cursor;
        cursor = payload_at + header.length as u64;

        if !desc::checksum_ok(&header, &payload) {
            warn!("checksum mismatch in record at offset {}; skipping", record_at);
            stats.skipped += 1;
            if strict {
                break;
            }
            continue;
        }
        match desc::decode(header.kind, &payload) {
            Ok(Some(record)) => {
                store.apply(&record);
                stats.applied += 1;
            }
            Ok(None) => {
                debug!(
                    "unknown record type {} at offset {}; ignoring",
                    header.kind, record_at
                );
                stats.skipped += 1;
            }
            Err(e) => {
                warn!("malformed record at offset {}: {}; skipping", record_at, e);
                stats.skipped += 1;
                if strict {
                    break;
                }
            }
        }
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use append_store::{AppendStore, MemStore};

    use super::*;
    use crate::aofs_lib::desc::{NodeRec, Record};

    fn meta_with(records: &[Record]) -> MemStore {
        let mut meta = MemStore::new();
        meta.open(Path::new("unused")).unwrap();
        for r in records {
            meta.append(&r.encode()).unwrap();
        }
        meta
    }

    fn create_rec(id: u64, path: &str) -> Record {
        Record::Create(NodeRec {
            id,
            mode: libc::S_IFREG | 0o644,
            size: 0,
            timestamp: 10,
            path: path.to_string(),
            symlink_target: None,
        })
    }

    #[test]
    fn applies_records_in_order() {
        let meta = meta_with(&[
            create_rec(2, "/f"),
            Record::Extent {
                id: 2,
                logical_offset: 0,
                data_offset: 0,
                length: 4,
                new_size: 4,
            },
            Record::Unlink { id: 2 },
        ]);
        let mut store = InodeStore::new();
        let stats = replay(&meta, &mut store, false).unwrap();
        assert_eq!(stats.applied, 3);
        assert_eq!(stats.skipped, 0);
        assert!(store.lookup_path("/f").is_none());
        assert!(store.get(2).unwrap().deleted);
        assert_eq!(store.peek_id(), 3);
    }

    #[test]
    fn flipped_byte_skips_only_that_record() {
        let meta = meta_with(&[create_rec(2, "/a"), create_rec(3, "/b"), create_rec(4, "/c")]);
        // corrupt a byte inside the second record's payload
        let second_at = create_rec(2, "/a").encode().len();
        {
            let buf = meta.buffer();
            let mut bytes = buf.lock().unwrap();
            bytes[second_at + RECORD_HEADER_SIZE + 10] ^= 0x01;
        }
        let mut store = InodeStore::new();
        let stats = replay(&meta, &mut store, false).unwrap();
        assert_eq!(stats.applied, 2);
        assert_eq!(stats.skipped, 1);
        assert!(store.lookup_path("/a").is_some());
        assert!(store.lookup_path("/b").is_none());
        assert!(store.lookup_path("/c").is_some());
    }

    #[test]
    fn strict_mode_stops_at_first_bad_record() {
        let meta = meta_with(&[create_rec(2, "/a"), create_rec(3, "/b"), create_rec(4, "/c")]);
        let second_at = create_rec(2, "/a").encode().len();
        {
            let buf = meta.buffer();
            let mut bytes = buf.lock().unwrap();
            bytes[second_at + RECORD_HEADER_SIZE + 10] ^= 0x01;
        }
        let mut store = InodeStore::new();
        let stats = replay(&meta, &mut store, true).unwrap();
        assert_eq!(stats.applied, 1);
        assert!(store.lookup_path("/a").is_some());
        assert!(store.lookup_path("/c").is_none());
    }

    #[test]
    fn torn_tail_stops_the_scan() {
        let meta = meta_with(&[create_rec(2, "/a")]);
        {
            let buf = meta.buffer();
            let mut bytes = buf.lock().unwrap();
            let mut torn = create_rec(3, "/half").encode();
            torn.truncate(torn.len() - 5);
            bytes.extend_from_slice(&torn);
        }
        let mut store = InodeStore::new();
        let stats = replay(&meta, &mut store, false).unwrap();
        assert_eq!(stats.applied, 1);
        assert!(store.lookup_path("/a").is_some());
        assert!(store.lookup_path("/half").is_none());
    }

    #[test]
    fn unknown_record_type_is_ignored() {
        let meta = meta_with(&[create_rec(2, "/a")]);
        {
            let buf = meta.buffer();
            let mut bytes = buf.lock().unwrap();
            let payload = b"future format";
            bytes.push(42);
            bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            bytes.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
            bytes.extend_from_slice(payload);
        }
        let mut store = InodeStore::new();
        let stats = replay(&meta, &mut store, false).unwrap();
        assert_eq!(stats.applied, 1);
        assert_eq!(stats.skipped, 1);
        assert!(store.lookup_path("/a").is_some());
    }
}

#[cfg(test)]
mod engine_tests {
    use append_store::{FileStore, MemStore};

    use crate::aofs_lib::desc::{Record, RecordType, RECORD_HEADER_SIZE};
    use crate::aofs_lib::AOFS;

    fn mem_mount(data: &MemStore, meta: &MemStore) -> AOFS<MemStore> {
        let mut fsys = AOFS::new("/tmp", data.clone(), meta.clone());
        fsys.aofs_init().unwrap();
        fsys
    }

    #[test]
    fn large_write_survives_remount_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let len = 4 * 1024 * 1024 + 8192;
        let pattern: Vec<u8> = (0..len).map(|i| i as u8).collect();

        let mut fsys = AOFS::new(dir.path(), FileStore::new(), FileStore::new());
        fsys.aofs_init().unwrap();
        fsys.aofs_mkdir("/demo", 0o755).unwrap();
        fsys.aofs_create("/demo/f", 0o644).unwrap();
        let fh = fsys.aofs_open("/demo/f", libc::O_RDWR, 0).unwrap();
        assert_eq!(fsys.aofs_write(fh, &pattern, 0).unwrap() as usize, len);
        fsys.aofs_release(fh).unwrap();
        fsys.aofs_destroy().unwrap();
        drop(fsys);

        let mut fsys = AOFS::new(dir.path(), FileStore::new(), FileStore::new());
        fsys.aofs_init().unwrap();
        assert_eq!(fsys.aofs_stat("/demo/f").unwrap().size as usize, len);
        let tail = fsys.aofs_read("/demo/f", len as i64 - 64, 64).unwrap();
        assert_eq!(&tail[..], &pattern[len - 64..]);
    }

    #[test]
    fn buffered_writes_are_lost_on_crash() {
        let (data, meta) = (MemStore::new(), MemStore::new());
        let mut fsys = mem_mount(&data, &meta);
        fsys.aofs_mkdir("/demo", 0o755).unwrap();
        fsys.aofs_create("/demo/f", 0o644).unwrap();
        let fh = fsys.aofs_open("/demo/f", libc::O_RDWR, 0).unwrap();
        fsys.aofs_write(fh, b"never flushed", 0).unwrap();
        // crash: the engine is dropped with the handle still staged
        drop(fsys);

        let mut fsys = mem_mount(&data, &meta);
        assert_eq!(fsys.aofs_stat("/demo/f").unwrap().size, 0);
        assert!(fsys.aofs_read("/demo/f", 0, 16).unwrap().is_empty());
    }

    #[test]
    fn corrupt_extent_record_reverts_to_prior_state() {
        let (data, meta) = (MemStore::new(), MemStore::new());
        let mut fsys = mem_mount(&data, &meta);
        fsys.aofs_create("/a", 0o644).unwrap();
        let fh = fsys.aofs_open("/a", libc::O_RDWR, 0).unwrap();
        fsys.aofs_write(fh, b"AAAA", 0).unwrap();
        fsys.aofs_flush(fh).unwrap();
        fsys.aofs_write(fh, b"BB", 1).unwrap();
        fsys.aofs_release(fh).unwrap();
        assert_eq!(&fsys.aofs_read("/a", 0, 4).unwrap(), b"ABBA");
        drop(fsys);

        // flip one byte inside the second extent record's payload
        {
            let buf = meta.buffer();
            let mut bytes = buf.lock().unwrap();
            let mut cursor = 0usize;
            let mut extent_seen = 0;
            let mut target = None;
            while cursor + RECORD_HEADER_SIZE <= bytes.len() {
                let kind = bytes[cursor];
                let mut w = [0u8; 4];
                w.copy_from_slice(&bytes[cursor + 1..cursor + 5]);
                let length = u32::from_le_bytes(w) as usize;
                if kind == RecordType::Extent as u8 {
                    extent_seen += 1;
                    if extent_seen == 2 {
                        target = Some(cursor + RECORD_HEADER_SIZE + length / 2);
                        break;
                    }
                }
                cursor += RECORD_HEADER_SIZE + length;
            }
            let target = target.expect("second extent record present");
            bytes[target] ^= 0x10;
        }

        let mut fsys = mem_mount(&data, &meta);
        assert_eq!(&fsys.aofs_read("/a", 0, 4).unwrap(), b"AAAA");
    }

    #[test]
    fn remount_reproduces_the_image() {
        let (data, meta) = (MemStore::new(), MemStore::new());
        let mut fsys = mem_mount(&data, &meta);
        fsys.aofs_mkdir("/d", 0o755).unwrap();
        fsys.aofs_create("/d/f", 0o640).unwrap();
        fsys.aofs_symlink("/d/f", "/l").unwrap();
        fsys.aofs_setxattr("/d/f", "user.b", b"2", 0).unwrap();
        fsys.aofs_setxattr("/d/f", "user.a", b"1", 0).unwrap();
        let fh = fsys.aofs_open("/d/f", libc::O_RDWR, 0).unwrap();
        fsys.aofs_write(fh, b"0123456789", 0).unwrap();
        fsys.aofs_release(fh).unwrap();
        fsys.aofs_truncate("/d/f", 7).unwrap();
        fsys.aofs_create("/gone", 0o644).unwrap();
        fsys.aofs_unlink("/gone").unwrap();
        fsys.aofs_rename("/d", "/e").unwrap();

        let mut before: Vec<_> = fsys
            .store
            .live_nodes()
            .map(|n| {
                (
                    n.id,
                    n.path.clone(),
                    n.mode,
                    n.size,
                    n.extents.clone(),
                    n.xattrs.clone(),
                    n.symlink_target.clone(),
                )
            })
            .collect();
        before.sort_by_key(|n| n.0);
        let next_id = fsys.store.peek_id();
        drop(fsys);

        let fsys = mem_mount(&data, &meta);
        let mut after: Vec<_> = fsys
            .store
            .live_nodes()
            .map(|n| {
                (
                    n.id,
                    n.path.clone(),
                    n.mode,
                    n.size,
                    n.extents.clone(),
                    n.xattrs.clone(),
                    n.symlink_target.clone(),
                )
            })
            .collect();
        after.sort_by_key(|n| n.0);
        assert_eq!(before, after);
        assert_eq!(fsys.store.peek_id(), next_id);
    }

    #[test]
    fn revival_survives_remount() {
        let (data, meta) = (MemStore::new(), MemStore::new());
        let mut fsys = mem_mount(&data, &meta);
        let first = fsys.aofs_create("/f", 0o644).unwrap();
        fsys.aofs_unlink("/f").unwrap();
        let revived = fsys.aofs_create("/f", 0o600).unwrap();
        assert_eq!(first.id, revived.id);
        drop(fsys);

        let fsys = mem_mount(&data, &meta);
        let info = fsys.aofs_stat("/f").unwrap();
        assert_eq!(info.id, first.id);
        assert_eq!(info.mode & 0o777, 0o600);
        assert_eq!(fsys.store.peek_id(), first.id + 1);
    }

    #[test]
    fn appends_continue_past_a_torn_tail() {
        let (data, meta) = (MemStore::new(), MemStore::new());
        let mut fsys = mem_mount(&data, &meta);
        fsys.aofs_create("/before", 0o644).unwrap();
        drop(fsys);

        // simulate a crash mid-append of some record
        {
            let buf = meta.buffer();
            let mut bytes = buf.lock().unwrap();
            let mut torn = Record::Unlink { id: 99 }.encode();
            torn.truncate(torn.len() - 3);
            bytes.extend_from_slice(&torn);
        }

        let mut fsys = mem_mount(&data, &meta);
        fsys.aofs_stat("/before").unwrap();
        // new appends land after the torn bytes and the mount still works
        fsys.aofs_create("/after", 0o644).unwrap();
        fsys.aofs_stat("/after").unwrap();
    }
}
