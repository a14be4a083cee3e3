#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::kv::{KeyRef, Record};
    use crate::merge::OrderedIter;
    use crate::zone::run::{Run, RunIter, build_run};
    use tempfile::TempDir;
    use tracing::Level;
    use tracing_subscriber::fmt::Subscriber;

    fn init_tracing() {
        let _ = Subscriber::builder()
            .with_max_level(Level::DEBUG)
            .try_init();
    }

    fn records(n: u32) -> Vec<Box<Record>> {
        (0..n)
            .map(|i| {
                Record::new(
                    format!("key{i:05}").as_bytes(),
                    format!("value{i}").as_bytes(),
                )
                .unwrap()
            })
            .collect()
    }

    #[test]
    fn test_build_and_get() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("run-000001.run");
        build_run(&path, &records(100), true).unwrap();

        let run = Run::open(&path).unwrap();
        assert_eq!(run.props().record_count, 100);
        assert_eq!(run.props().min_key, b"key00000");
        assert_eq!(run.props().max_key, b"key00099");

        let hit = run.get(&KeyRef::new(b"key00042")).unwrap().unwrap();
        assert_eq!(hit.value(), b"value42");
        assert!(run.get(&KeyRef::new(b"key00142")).unwrap().is_none());
        assert!(run.get(&KeyRef::new(b"aaa")).unwrap().is_none());
    }

    #[test]
    fn test_empty_run_is_valid() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("run-000001.run");
        build_run(&path, &[], true).unwrap();

        let run = Run::open(&path).unwrap();
        assert_eq!(run.props().record_count, 0);
        assert!(run.get(&KeyRef::new(b"anything")).unwrap().is_none());

        let mut iter = RunIter::new(Arc::new(run));
        iter.seek(b"");
        assert!(!iter.valid());
    }

    #[test]
    fn test_get_without_bloom() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("run-000001.run");
        build_run(&path, &records(50), false).unwrap();

        let run = Run::open(&path).unwrap();
        assert!(run.get(&KeyRef::new(b"key00010")).unwrap().is_some());
        assert!(run.get(&KeyRef::new(b"key00050")).unwrap().is_none());
    }

    #[test]
    fn test_tombstones_survive_in_run() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("run-000001.run");
        let recs = vec![
            Record::new(b"alive", b"v").unwrap(),
            Record::tombstone(&KeyRef::new(b"dead")).unwrap(),
        ];
        build_run(&path, &recs, true).unwrap();

        let run = Run::open(&path).unwrap();
        assert_eq!(run.props().tombstone_count, 1);
        let rec = run.get(&KeyRef::new(b"dead")).unwrap().unwrap();
        assert!(rec.is_tombstone());
    }

    #[test]
    fn test_iter_spans_blocks() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("run-000001.run");
        // Enough data to fill multiple 4 KiB blocks.
        let recs: Vec<_> = (0..500u32)
            .map(|i| Record::new(format!("key{i:05}").as_bytes(), &[0x55u8; 100]).unwrap())
            .collect();
        build_run(&path, &recs, true).unwrap();

        let run = Arc::new(Run::open(&path).unwrap());
        let mut iter = RunIter::new(Arc::clone(&run));
        iter.seek(b"");
        let mut count = 0u32;
        while let Some(rec) = iter.peek() {
            assert_eq!(rec.key(), format!("key{count:05}").as_bytes());
            count += 1;
            iter.skip1();
        }
        assert_eq!(count, 500);

        iter.seek(b"key00250");
        assert_eq!(iter.peek().unwrap().key(), b"key00250");
        iter.seek(b"key00499\x00");
        assert!(!iter.valid());
    }

    #[test]
    fn test_corrupt_footer_rejected() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("run-000001.run");
        build_run(&path, &records(10), true).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        let len = bytes.len();
        bytes[len - 10] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        assert!(Run::open(&path).is_err());
    }

    #[test]
    fn test_corrupt_block_detected_on_read() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("run-000001.run");
        build_run(&path, &records(10), false).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        // First data block payload starts after the 4-byte magic and
        // 4-byte length prefix.
        bytes[10] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        let run = Run::open(&path).unwrap();
        assert!(run.get(&KeyRef::new(b"key00003")).is_err());
    }
}
