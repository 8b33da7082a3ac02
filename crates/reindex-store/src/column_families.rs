//! Column family layout for the durable store.
//!
//! - keys: key -> kind tag (`string`, `list`, `set`, `hash`)
//! - strings: key -> value
//! - lists: key -> JSON array, head first
//! - sets: `key\0member` -> empty
//! - hashes: `key\0field` -> value

use rocksdb::{ColumnFamilyDescriptor, Options};

/// Column family name for the key kind registry
pub const CF_KEYS: &str = "keys";

/// Column family name for string values
pub const CF_STRINGS: &str = "strings";

/// Column family name for list values
pub const CF_LISTS: &str = "lists";

/// Column family name for set members
pub const CF_SETS: &str = "sets";

/// Column family name for hash fields
pub const CF_HASHES: &str = "hashes";

/// All column family names
pub const ALL_CF_NAMES: &[&str] = &[CF_KEYS, CF_STRINGS, CF_LISTS, CF_SETS, CF_HASHES];

/// Build all column family descriptors
pub fn build_cf_descriptors() -> Vec<ColumnFamilyDescriptor> {
    ALL_CF_NAMES
        .iter()
        .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
        .collect()
}
