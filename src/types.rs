use crate::error::Error;

/// The crate-wide result alias. Every fallible operation returns this.
pub type Result<T, E = Error> = std::result::Result<T, E>;
