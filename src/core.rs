//! Misc shared core pieces

/// Genericized threadpool
pub(crate) mod pool;

/// Turning deltas into staged files
pub(crate) mod delta;

/// The staging and rename engine
pub(crate) mod staging;

/// Path-based file classification
pub(crate) mod heuristics;

/// Post-update trigger handling
pub(crate) mod scripts;
