//! Deterministic storage paths and coordination keys derived from a content hash.

use chrono::{DateTime, Utc};

use crate::hash::ContentHash;

/// Root of the analysis cache in the object store.
pub const METADATA_ROOT: &str = "vision/metadata";

/// Root of archived source snapshots in the object store.
pub const SOURCE_ROOT: &str = "vision/source";

/// Namespace of coordination lock keys.
pub const LOCK_PREFIX: &str = "vision:lock";

/// File name of the fast-path cache entry.
pub const LATEST_FILE: &str = "latest.json";

/// Prefix under which every analysis of `hash` lives, trailing slash included.
pub fn metadata_prefix(hash: &ContentHash) -> String {
    format!("{METADATA_ROOT}/{hash}/")
}

/// Well-known path probed before falling back to a listing.
pub fn latest_metadata_path(hash: &ContentHash) -> String {
    format!("{}{LATEST_FILE}", metadata_prefix(hash))
}

/// Timestamped history entry, sortable by name.
pub fn history_metadata_path(hash: &ContentHash, at: DateTime<Utc>) -> String {
    format!(
        "{}{}.json",
        metadata_prefix(hash),
        at.format("%Y%m%dT%H%M%S%.3fZ")
    )
}

/// Archive location of the original bytes.
pub fn source_snapshot_path(hash: &ContentHash) -> String {
    format!("{SOURCE_ROOT}/{hash}/source.bin")
}

/// Coordination key guarding generation for `hash`.
pub fn lock_key(hash: &ContentHash) -> String {
    format!("{LOCK_PREFIX}:{hash}")
}
