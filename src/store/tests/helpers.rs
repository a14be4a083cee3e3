use std::path::Path;

use crate::store::{Store, StoreConfig};
use tracing::Level;
use tracing_subscriber::fmt::Subscriber;

pub(super) fn init_tracing() {
    let _ = Subscriber::builder()
        .with_max_level(Level::DEBUG)
        .try_init();
}

/// Default-sized store for functional tests.
pub(super) fn open_store(dir: &Path) -> Store {
    Store::open(dir, test_config()).unwrap()
}

/// A configuration small enough that tests can push the store through
/// rotations quickly.
pub(super) fn test_config() -> StoreConfig {
    StoreConfig {
        cache_mb: 16,
        memtable_mb: 1,
        wal_mb: 2,
        run_target_bytes: 16 * 1024,
        ..StoreConfig::default()
    }
}

pub(super) fn key(i: u32) -> Vec<u8> {
    format!("key{i:06}").into_bytes()
}

pub(super) fn value(i: u32) -> Vec<u8> {
    format!("value{i:06}").into_bytes()
}
