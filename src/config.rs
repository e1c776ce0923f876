/// Configuration for the lock table.
#[derive(Debug, Clone)]
pub struct LockTableConfig {
    /// Number of shards the resource map is split over. Rounded up to a
    /// power of two. More shards reduce contention on the map itself;
    /// per-resource contention is unaffected.
    pub shard_count: usize,
}

impl Default for LockTableConfig {
    fn default() -> Self {
        Self { shard_count: 32 }
    }
}

impl LockTableConfig {
    /// A config tuned for fast testing.
    ///
    /// - **shard_count:** Tiny, so shard-collision paths actually run.
    #[cfg(test)]
    pub fn for_testing() -> Self {
        Self { shard_count: 2 }
    }
}
