//! Result type alias for zfs-sync operations

use crate::Error;

/// Result type alias for zfs-sync operations
pub type Result<T> = std::result::Result<T, Error>;
