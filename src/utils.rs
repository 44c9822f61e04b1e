use ulid::Ulid;

/// Generates a new time-based, lexicographically sortable unique identifier (UID).
///
/// ULIDs carry a millisecond timestamp followed by randomness, so records keyed by
/// them iterate in creation order inside sled trees.
pub fn time_sortable_uid() -> String {
    Ulid::new().to_string()
}

/// Task and vehicle ids read like `TSK-01J...` in logs.
pub fn prefixed_uid(prefix: &str) -> String {
    format!("{}-{}", prefix, time_sortable_uid())
}
