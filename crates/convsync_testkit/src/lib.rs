//! # convsync testkit
//!
//! Test utilities for convsync.
//!
//! This crate provides:
//! - store fixtures (in-memory and file-backed) that can be "restarted"
//! - property-based generators for entities and store operation sequences
//! - a fault-injecting backend for torn writes and failed rollbacks
//!
//! ## Usage
//!
//! ```rust
//! use convsync_testkit::prelude::*;
//!
//! let store = TestStore::memory();
//! seed_conversation(&store, "c1", 3);
//! assert_eq!(store.pending_counts().messages, 3);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod faults;
pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::faults::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use faults::*;
pub use fixtures::*;
pub use generators::*;
