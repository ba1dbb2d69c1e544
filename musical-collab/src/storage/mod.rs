//! Persistent storage for a space: one append-only file per space.
//!
//! ```text
//! ┌────────────────────────────┬────────┬────────┬─────┐
//! │ MAGIC (48 bytes)           │ record │ record │ ... │
//! └────────────────────────────┴────────┴────────┴─────┘
//!        ▲                          ▲
//!        │ verified on open         │ appended by LogStore::write,
//!        │                          │ replayed by LogStore::open,
//!        │                          │ streamed by LogReader
//! ```
//!
//! Reference: Kleppmann, DDIA, Chapter 3 (append-only logs)

pub mod log;

pub use self::log::{AuthorLimits, LogReader, LogRecord, LogStore, Written, MAGIC};
