use condcache::{CacheConfig, ConditionsCache, ValidityInterval};

pub use condcache_test::{CallCounter, Gate, setup};

/// The cache used throughout these tests: string keys, plain integer time points.
pub type Cache = ConditionsCache<String, u64, i32, String>;

pub fn cache() -> Cache {
    ConditionsCache::new(CacheConfig::named("integration"))
}

pub fn iv(start: u64, end: u64) -> ValidityInterval<u64> {
    ValidityInterval::new(start, end).unwrap()
}

pub fn key(name: &str) -> String {
    name.to_owned()
}
