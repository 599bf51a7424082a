//! API-key pool for the Google backend.
//!
//! Keys are loaded once at startup from a text file, rotated round-robin,
//! timed out on quota exhaustion and removed permanently on auth failures.

pub mod error;
pub mod pool;

pub use error::KeyPoolError;
pub use pool::{KeyErrorKind, KeyEvent, KeyPool, KeyStatuses};
