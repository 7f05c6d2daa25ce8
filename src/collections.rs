//! Map and set types keyed by small ids and short strings, where FNV beats SipHash.

use fnv::FnvBuildHasher;

pub type FnvHashMap<K, V> = hashbrown::HashMap<K, V, FnvBuildHasher>;

pub type FnvHashSet<T> = hashbrown::HashSet<T, FnvBuildHasher>;
