//! Dealing with the update servers themselves

/// The HTTP(ish) transport
pub(crate) mod http;

/// Detached signature checking
pub(crate) mod signature;

/// Version pointers, mirror policy, and the time gate
pub(crate) mod version;
