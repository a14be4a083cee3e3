#[cfg(test)]
mod tests {
    use crate::index::TrieIndex;
    use crate::index::leaf::KPN;
    use crate::kv::{KeyRef, Record};
    use crate::merge::OrderedIter;
    use rand::prelude::*;
    use tracing::Level;
    use tracing_subscriber::fmt::Subscriber;

    fn init_tracing() {
        let _ = Subscriber::builder()
            .with_max_level(Level::DEBUG)
            .try_init();
    }

    fn key(i: u32) -> Vec<u8> {
        format!("key{i:06}").into_bytes()
    }

    #[test]
    fn test_leaf_capacity_boundary() {
        init_tracing();

        let index = TrieIndex::new();
        let idx_ref = index.make_ref().unwrap();

        // Exactly KPN records fit in the initial leaf; one more forces a
        // split, after which every record must still be reachable.
        for i in 0..=(KPN as u32) {
            let k = key(i);
            idx_ref.put(Record::new(&k, b"v").unwrap());
        }
        for i in 0..=(KPN as u32) {
            let k = key(i);
            assert!(
                idx_ref.probe(&KeyRef::new(&k)),
                "key {i} lost across the split"
            );
        }
    }

    #[test]
    fn test_many_splits_sequential_keys() {
        init_tracing();

        let index = TrieIndex::new();
        let idx_ref = index.make_ref().unwrap();

        let n = 4096u32;
        for i in 0..n {
            let k = key(i);
            idx_ref.put(Record::new(&k, format!("value{i}").as_bytes()).unwrap());
        }
        for i in 0..n {
            let k = key(i);
            let rec = idx_ref.get(&KeyRef::new(&k)).unwrap();
            assert_eq!(rec.value(), format!("value{i}").as_bytes());
        }
    }

    #[test]
    fn test_many_splits_random_order() {
        init_tracing();

        let index = TrieIndex::new();
        let idx_ref = index.make_ref().unwrap();

        let mut order: Vec<u32> = (0..4096).collect();
        order.shuffle(&mut rand::rng());

        for &i in &order {
            let k = key(i);
            idx_ref.put(Record::new(&k, &i.to_le_bytes()).unwrap());
        }
        for i in 0..4096u32 {
            let k = key(i);
            let rec = idx_ref.get(&KeyRef::new(&k)).unwrap();
            assert_eq!(rec.value(), i.to_le_bytes());
        }
    }

    #[test]
    fn test_iteration_order_after_splits() {
        init_tracing();

        let index = TrieIndex::new();
        let idx_ref = index.make_ref().unwrap();

        let mut order: Vec<u32> = (0..2000).collect();
        order.shuffle(&mut rand::rng());
        for &i in &order {
            let k = key(i);
            idx_ref.put(Record::new(&k, b"v").unwrap());
        }

        let mut iter = index.iter().unwrap();
        iter.seek(b"");
        let mut seen = 0u32;
        while let Some(rec) = iter.peek() {
            assert_eq!(rec.key(), key(seen).as_slice(), "order broken at {seen}");
            seen += 1;
            iter.skip1();
        }
        assert_eq!(seen, 2000);
    }

    #[test]
    fn test_shared_prefix_keys_split_cleanly() {
        init_tracing();

        let index = TrieIndex::new();
        let idx_ref = index.make_ref().unwrap();

        // Deep shared prefixes exercise anchor computation and the trie
        // descent through long prefix chains.
        for i in 0..1500u32 {
            let k = format!("shared/prefix/deeply/nested/{i:08}");
            idx_ref.put(Record::new(k.as_bytes(), b"v").unwrap());
        }
        for i in 0..1500u32 {
            let k = format!("shared/prefix/deeply/nested/{i:08}");
            assert!(idx_ref.probe(&KeyRef::new(k.as_bytes())), "missing {i}");
        }
    }

    #[test]
    fn test_delete_triggers_merge_and_keys_survive() {
        init_tracing();

        let index = TrieIndex::new();
        let idx_ref = index.make_ref().unwrap();

        let n = 2048u32;
        for i in 0..n {
            let k = key(i);
            idx_ref.put(Record::new(&k, b"v").unwrap());
        }
        // Delete all but every 16th key; the population collapses far
        // below the merge threshold, forcing leaf merges along the way.
        for i in 0..n {
            if i % 16 != 0 {
                let k = key(i);
                assert!(idx_ref.del(&KeyRef::new(&k)));
            }
        }
        for i in 0..n {
            let k = key(i);
            assert_eq!(idx_ref.probe(&KeyRef::new(&k)), i % 16 == 0, "key {i}");
        }

        // Survivors still iterate in order.
        let mut iter = index.iter().unwrap();
        iter.seek(b"");
        let mut expect = 0u32;
        while let Some(rec) = iter.peek() {
            assert_eq!(rec.key(), key(expect).as_slice());
            expect += 16;
            iter.skip1();
        }
        assert_eq!(expect, n);
    }

    #[test]
    fn test_drain_refill_cycles() {
        init_tracing();

        let index = TrieIndex::new();
        let idx_ref = index.make_ref().unwrap();

        for round in 0..4u32 {
            for i in 0..1024u32 {
                let k = key(i);
                idx_ref.put(Record::new(&k, &round.to_le_bytes()).unwrap());
            }
            for i in 0..1024u32 {
                if i % 2 == 0 {
                    let k = key(i);
                    idx_ref.del(&KeyRef::new(&k));
                }
            }
            for i in (1..1024u32).step_by(2) {
                let k = key(i);
                let rec = idx_ref.get(&KeyRef::new(&k)).unwrap();
                assert_eq!(rec.value(), round.to_le_bytes(), "round {round} key {i}");
            }
            for i in (0..1024u32).step_by(2) {
                let k = key(i);
                idx_ref.put(Record::new(&k, &round.to_le_bytes()).unwrap());
            }
        }
    }
}
