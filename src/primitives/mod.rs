//! Low-level primitives shared by the storage components.
//!
//! Includes checksummed byte channels, positioned and atomic file I/O, and
//! memory accounting.

/// Byte channels used by the log-command codec.
pub mod bytes;

/// I/O abstractions and utilities.
///
/// Positioned reads and writes plus the write-temp-then-rename helpers every
/// persisted file goes through.
pub mod io;

/// Memory accounting for bounded background work.
pub mod memory;
