use std::{collections::HashMap, fmt, sync::OnceLock};

use num_enum::{IntoPrimitive, TryFromPrimitive};
use parking_lot::Mutex;
use xxhash_rust::xxh3::xxh3_64;

// These values are part of the id packing and shall never be changed.
// They start at 1 so that no valid resource id is ever the all-zero word,
// which the waiting probe uses as its "not waiting" sentinel.
#[repr(u8)]
#[derive(
    Debug, Display, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive,
)]
pub enum ResourceType {
    /// The whole server; parent of everything.
    Global = 1,
    /// The journal flush lock of the legacy engine, pinned to the locker.
    Flush = 2,
    Database = 3,
    Collection = 4,
    /// A named cooperative mutex.
    Mutex = 5,
}

/// Compact resource identifier. Packs the 56-bit key in the upper bytes
/// with the [`ResourceType`] in the lowest byte, so a single `u64`
/// identifies any resource and fits in an atomic for the waiting probe.
///
/// `Global` and `Flush` are singletons; databases, collections and
/// mutexes derive their key by hashing the name.
#[derive(Clone, Copy, ::core::cmp::PartialEq, ::core::cmp::Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(u64);

/// Keys may only use 56 bits; the lowest byte holds the resource type.
const KEY_MASK: u64 = (1 << 56) - 1;
const SINGLETON_KEY: u64 = 1;

impl ResourceId {
    pub const GLOBAL: Self = Self::singleton(ResourceType::Global);
    pub const FLUSH: Self = Self::singleton(ResourceType::Flush);

    const fn singleton(kind: ResourceType) -> Self {
        Self((SINGLETON_KEY << 8) | kind as u64)
    }

    /// Builds the id of a named resource by hashing `name`.
    pub fn new(kind: ResourceType, name: &str) -> Self {
        debug_assert!(
            matches!(
                kind,
                ResourceType::Database | ResourceType::Collection | ResourceType::Mutex
            ),
            "singleton resources do not carry a name"
        );
        Self(((xxh3_64(name.as_bytes()) & KEY_MASK) << 8) | kind as u64)
    }

    pub fn for_database(name: &str) -> Self {
        Self::new(ResourceType::Database, name)
    }

    /// `ns` is the full `db.collection` namespace.
    pub fn for_collection(ns: &str) -> Self {
        Self::new(ResourceType::Collection, ns)
    }

    pub fn kind(&self) -> ResourceType {
        ResourceType::try_from((self.0 & 0xFF) as u8)
            .expect("resource id was constructed with a known type byte")
    }

    #[inline]
    pub(crate) const fn raw(&self) -> u64 {
        self.0
    }

    #[inline]
    pub(crate) const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Debug for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = self.kind();
        match kind {
            ResourceType::Global | ResourceType::Flush => write!(f, "{kind}"),
            ResourceType::Mutex => match mutex_label(*self) {
                Some(label) => write!(f, "Mutex({label})"),
                None => write!(f, "Mutex({:#x})", self.0 >> 8),
            },
            _ => write!(f, "{kind}({:#x})", self.0 >> 8),
        }
    }
}

/// Returns the database component of a full `db.collection` namespace.
pub fn namespace_db(ns: &str) -> &str {
    ns.split_once('.').map_or(ns, |(db, _)| db)
}

fn labels() -> &'static Mutex<HashMap<u64, String>> {
    static LABELS: OnceLock<Mutex<HashMap<u64, String>>> = OnceLock::new();
    LABELS.get_or_init(Default::default)
}

/// Remembers the human-readable label of a mutex resource for debug
/// output. Hash collisions keep the first registered label.
pub(crate) fn register_mutex_label(id: ResourceId, name: &str) {
    labels()
        .lock()
        .entry(id.raw())
        .or_insert_with(|| name.to_owned());
}

pub(crate) fn mutex_label(id: ResourceId) -> Option<String> {
    labels().lock().get(&id.raw()).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_singletons_are_distinct_and_valid() {
        assert_ne!(ResourceId::GLOBAL, ResourceId::FLUSH);
        assert_ne!(ResourceId::GLOBAL.raw(), 0);
        assert_eq!(ResourceId::GLOBAL.kind(), ResourceType::Global);
        assert_eq!(ResourceId::FLUSH.kind(), ResourceType::Flush);
    }

    #[test]
    fn test_named_resources_hash_by_name_and_kind() {
        let db1 = ResourceId::for_database("accounts");
        let db2 = ResourceId::for_database("accounts");
        let other = ResourceId::for_database("inventory");
        assert_eq!(db1, db2);
        assert_ne!(db1, other);

        // Same name under a different kind is a different resource.
        let coll = ResourceId::new(ResourceType::Collection, "accounts");
        assert_ne!(db1, coll);
        assert_eq!(coll.kind(), ResourceType::Collection);
    }

    #[test]
    fn test_namespace_db_splits_on_first_dot() {
        assert_eq!(namespace_db("db1.coll"), "db1");
        assert_eq!(namespace_db("db1.system.views"), "db1");
        assert_eq!(namespace_db("nodot"), "nodot");
    }

    #[test]
    fn test_mutex_labels_survive_in_debug_output() {
        let id = ResourceId::new(ResourceType::Mutex, "catalog lock");
        register_mutex_label(id, "catalog lock");
        assert_eq!(format!("{id:?}"), "Mutex(catalog lock)");
    }
}
