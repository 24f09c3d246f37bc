//! # convsync storage
//!
//! Byte-level backends underneath the convsync local store.
//!
//! A backend is an **opaque, append-only byte log**. It knows nothing about
//! conversations, messages, write-ahead log framing or the sync ledger; the
//! `convsync_core` store owns every byte it writes here.
//!
//! ## Contract
//!
//! - `append` returns the offset the bytes landed at
//! - `flush`/`sync` make previously appended bytes survive process exit
//! - `truncate` rolls the log back to an earlier offset (used to discard a
//!   transaction whose write failed half way)
//! - backends are `Send + Sync` so the store can hand them across tasks
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - ephemeral stores and tests; clones share bytes so a
//!   test can "restart" a store on the same log
//! - [`FileBackend`] - the on-device log file
//!
//! ## Example
//!
//! ```rust
//! use convsync_storage::{InMemoryBackend, StorageBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"conversation bytes").unwrap();
//! assert_eq!(backend.read_at(offset, 12).unwrap(), b"conversation");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
