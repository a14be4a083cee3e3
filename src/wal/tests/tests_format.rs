#[cfg(test)]
mod tests {
    use crate::kv::{KeyRef, Record, decode_wire};
    use crate::wal::{PGSZ, WAL_HEADER_SIZE, Wal};
    use tempfile::TempDir;
    use tracing::Level;
    use tracing_subscriber::fmt::Subscriber;

    fn init_tracing() {
        let _ = Subscriber::builder()
            .with_max_level(Level::TRACE)
            .try_init();
    }

    /// Decodes every record in a WAL file the way recovery does.
    fn scan(bytes: &[u8]) -> Vec<(Vec<u8>, Vec<u8>, bool)> {
        let mut records = Vec::new();
        let mut off = WAL_HEADER_SIZE;
        while off < bytes.len() {
            match decode_wire(&bytes[off..]) {
                Ok(Some((wire, consumed))) => {
                    records.push((wire.key.to_vec(), wire.value.to_vec(), wire.is_tombstone()));
                    off += consumed;
                }
                _ if bytes[off] == 0 => off += 1,
                _ => break,
            }
        }
        records
    }

    #[test]
    fn test_file_scans_back_to_records() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let mut wal = Wal::open(tmp.path(), 1 << 20).unwrap();
        wal.begin(9);

        for i in 0..50u32 {
            let rec = Record::new(
                format!("key{i:03}").as_bytes(),
                format!("value{i}").as_bytes(),
            )
            .unwrap();
            wal.append(&rec);
        }
        wal.flush_sync_wait().unwrap();

        let bytes = std::fs::read(tmp.path().join("wal1")).unwrap();
        let records = scan(&bytes);
        assert_eq!(records.len(), 50);
        assert_eq!(records[0].0, b"key000");
        assert_eq!(records[49].1, b"value49");
    }

    #[test]
    fn test_records_span_multiple_flushes() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let mut wal = Wal::open(tmp.path(), 1 << 24).unwrap();
        wal.begin(1);

        // Large values force several staging-buffer flushes; the scan
        // must skip the inter-page padding transparently.
        let value = vec![0x42u8; 60 * 1024];
        for i in 0..20u32 {
            let rec = Record::new(format!("big{i:02}").as_bytes(), &value).unwrap();
            wal.append(&rec);
        }
        wal.flush_sync_wait().unwrap();

        let bytes = std::fs::read(tmp.path().join("wal1")).unwrap();
        let records = scan(&bytes);
        assert_eq!(records.len(), 20);
        for (i, (key, value_out, ts)) in records.iter().enumerate() {
            assert_eq!(key, format!("big{i:02}").as_bytes());
            assert_eq!(value_out.len(), value.len());
            assert!(!ts);
        }
    }

    #[test]
    fn test_tombstones_round_trip_through_log() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let mut wal = Wal::open(tmp.path(), 1 << 20).unwrap();
        wal.begin(1);

        wal.append(&Record::new(b"live", b"value").unwrap());
        wal.append(&Record::tombstone(&KeyRef::new(b"dead")).unwrap());
        wal.flush_sync_wait().unwrap();

        let bytes = std::fs::read(tmp.path().join("wal1")).unwrap();
        let records = scan(&bytes);
        assert_eq!(records.len(), 2);
        assert!(!records[0].2);
        assert!(records[1].2);
        assert_eq!(records[1].0, b"dead");
        assert!(records[1].1.is_empty());
    }

    #[test]
    fn test_corrupt_byte_stops_the_scan() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let mut wal = Wal::open(tmp.path(), 1 << 20).unwrap();
        wal.begin(1);

        for i in 0..10u32 {
            wal.append(&Record::new(format!("key{i}").as_bytes(), b"value").unwrap());
        }
        wal.flush_sync_wait().unwrap();

        let mut bytes = std::fs::read(tmp.path().join("wal1")).unwrap();
        // Flip a key byte of the sixth record; its checksum fails and
        // the scan must stop there, keeping the first five.
        let records = scan(&bytes);
        assert_eq!(records.len(), 10);
        let rec5_off = {
            let mut off = WAL_HEADER_SIZE;
            let mut seen = 0;
            loop {
                let (_, consumed) = decode_wire(&bytes[off..]).unwrap().unwrap();
                if seen == 5 {
                    break off;
                }
                seen += 1;
                off += consumed;
            }
        };
        bytes[rec5_off + 2] ^= 0xff;

        let records = scan(&bytes);
        assert_eq!(records.len(), 5);
    }

    #[test]
    fn test_trailing_page_padding_is_zero() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let mut wal = Wal::open(tmp.path(), 1 << 20).unwrap();
        wal.begin(1);

        let rec = Record::new(b"solo", b"record").unwrap();
        wal.append(&rec);
        wal.flush_sync_wait().unwrap();

        let bytes = std::fs::read(tmp.path().join("wal1")).unwrap();
        assert_eq!(bytes.len(), PGSZ);
        let used = WAL_HEADER_SIZE + rec.wire_len();
        assert!(bytes[used..].iter().all(|&b| b == 0));
    }
}
