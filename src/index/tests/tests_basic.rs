#[cfg(test)]
mod tests {
    use crate::index::{MergeUpdate, TrieIndex};
    use crate::kv::{KeyRef, Record};
    use tracing::Level;
    use tracing_subscriber::fmt::Subscriber;

    fn init_tracing() {
        let _ = Subscriber::builder()
            .with_max_level(Level::DEBUG)
            .try_init();
    }

    #[test]
    fn test_put_and_get() {
        init_tracing();

        let index = TrieIndex::new();
        let idx_ref = index.make_ref().unwrap();

        idx_ref.put(Record::new(b"key1", b"value1").unwrap());
        let rec = idx_ref.get(&KeyRef::new(b"key1")).unwrap();

        assert_eq!(rec.key(), b"key1");
        assert_eq!(rec.value(), b"value1");
    }

    #[test]
    fn test_get_missing_key() {
        init_tracing();

        let index = TrieIndex::new();
        let idx_ref = index.make_ref().unwrap();

        idx_ref.put(Record::new(b"present", b"x").unwrap());
        assert!(idx_ref.get(&KeyRef::new(b"absent")).is_none());
        assert!(!idx_ref.probe(&KeyRef::new(b"absent")));
    }

    #[test]
    fn test_put_replaces_existing() {
        init_tracing();

        let index = TrieIndex::new();
        let idx_ref = index.make_ref().unwrap();

        let old = idx_ref.put(Record::new(b"key", b"first").unwrap());
        assert!(old.is_none());

        let old = idx_ref.put(Record::new(b"key", b"second").unwrap());
        assert_eq!(old.unwrap().value(), b"first");

        assert_eq!(idx_ref.get(&KeyRef::new(b"key")).unwrap().value(), b"second");
    }

    #[test]
    fn test_del() {
        init_tracing();

        let index = TrieIndex::new();
        let idx_ref = index.make_ref().unwrap();

        idx_ref.put(Record::new(b"key", b"value").unwrap());
        assert!(idx_ref.del(&KeyRef::new(b"key")));
        assert!(!idx_ref.probe(&KeyRef::new(b"key")));
        assert!(!idx_ref.del(&KeyRef::new(b"key")));
    }

    #[test]
    fn test_empty_key_lives_in_initial_leaf() {
        init_tracing();

        let index = TrieIndex::new();
        let idx_ref = index.make_ref().unwrap();

        idx_ref.put(Record::new(b"", b"empty-key-value").unwrap());
        idx_ref.put(Record::new(b"a", b"a-value").unwrap());

        assert_eq!(
            idx_ref.get(&KeyRef::new(b"")).unwrap().value(),
            b"empty-key-value"
        );
        assert_eq!(idx_ref.get(&KeyRef::new(b"a")).unwrap().value(), b"a-value");
    }

    #[test]
    fn test_tombstone_records_are_stored_verbatim() {
        init_tracing();

        let index = TrieIndex::new();
        let idx_ref = index.make_ref().unwrap();

        let kref = KeyRef::new(b"doomed");
        idx_ref.put(Record::tombstone(&kref).unwrap());

        // The index is value-agnostic: a tombstone is a record like any
        // other, and presence includes it.
        let rec = idx_ref.get(&kref).unwrap();
        assert!(rec.is_tombstone());
        assert!(idx_ref.probe(&kref));
    }

    #[test]
    fn test_merge_inserts_when_absent() {
        init_tracing();

        let index = TrieIndex::new();
        let idx_ref = index.make_ref().unwrap();

        let kref = KeyRef::new(b"counter");
        idx_ref.merge(&kref, |cur| {
            assert!(cur.is_none());
            MergeUpdate::Put(Record::new(b"counter", b"1").unwrap())
        });

        assert_eq!(idx_ref.get(&kref).unwrap().value(), b"1");
    }

    #[test]
    fn test_merge_keep_leaves_value() {
        init_tracing();

        let index = TrieIndex::new();
        let idx_ref = index.make_ref().unwrap();

        idx_ref.put(Record::new(b"key", b"untouched").unwrap());
        let kref = KeyRef::new(b"key");
        idx_ref.merge(&kref, |cur| {
            assert_eq!(cur.unwrap().value(), b"untouched");
            MergeUpdate::Keep
        });

        assert_eq!(idx_ref.get(&kref).unwrap().value(), b"untouched");
    }

    #[test]
    fn test_inpr_reports_presence() {
        init_tracing();

        let index = TrieIndex::new();
        let idx_ref = index.make_ref().unwrap();

        idx_ref.put(Record::new(b"key", b"value").unwrap());

        let (present, len) = idx_ref.inpr(&KeyRef::new(b"key"), |rec| {
            rec.map(|r| r.value().len()).unwrap_or(0)
        });
        assert!(present);
        assert_eq!(len, 5);

        let (present, _) = idx_ref.inpr(&KeyRef::new(b"nope"), |rec| {
            assert!(rec.is_none());
        });
        assert!(!present);
    }

    #[test]
    fn test_inpw_mutates_value_in_place() {
        init_tracing();

        let index = TrieIndex::new();
        let idx_ref = index.make_ref().unwrap();

        idx_ref.put(Record::new(b"key", b"aaaa").unwrap());
        let (present, _) = idx_ref.inpw(&KeyRef::new(b"key"), |rec| {
            let rec = rec.unwrap();
            let len = rec.value().len();
            rec.value_mut()[..len].copy_from_slice(b"bbbb");
        });
        assert!(present);
        assert_eq!(idx_ref.get(&KeyRef::new(b"key")).unwrap().value(), b"bbbb");
    }

    #[test]
    fn test_clean_resets_to_empty() {
        init_tracing();

        let index = TrieIndex::new();
        let idx_ref = index.make_ref().unwrap();

        for i in 0..500u32 {
            let key = format!("key{i:05}");
            idx_ref.put(Record::new(key.as_bytes(), b"v").unwrap());
        }
        index.clean();

        assert!(idx_ref.get(&KeyRef::new(b"key00000")).is_none());
        idx_ref.put(Record::new(b"fresh", b"start").unwrap());
        assert_eq!(idx_ref.get(&KeyRef::new(b"fresh")).unwrap().value(), b"start");
    }
}
