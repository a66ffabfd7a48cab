//! # Ferry Platform
//!
//! Shared types for the Ferry SSH/SFTP stack.
//!
//! This crate provides the unified error type (`FerryError`, `FerryResult`)
//! used by every protocol layer, so that callers only ever see typed errors.
//!
//! # Examples
//!
//! ```
//! use ferry_platform::{FerryError, FerryResult};
//!
//! fn lookup(path: &str) -> FerryResult<u64> {
//!     Err(FerryError::NoSuchFile(path.to_string()))
//! }
//!
//! let err = lookup("/missing").unwrap_err();
//! assert!(!err.is_fatal());
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;

pub use error::{FerryError, FerryResult};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
