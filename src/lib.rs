//! Record-storage layer of a graph database kernel.
//!
//! Covers offline store format migration (version checks, staging,
//! resumable promotion), the relationship-group degrees store and the
//! versioned transaction log with its command codecs.

#![warn(missing_docs)]

pub mod config;
pub mod dbms;
pub mod degrees;
pub mod format;
pub mod log;
pub mod logging;
pub mod migration;
pub mod primitives;
pub mod store;
pub mod types;

#[doc(hidden)]
pub mod testkit;

pub use config::{ConfigError, StoreConfig};
pub use format::StoreVersion;
pub use migration::{StoreMigrator, StoreUpgrader};
pub use types::{Result, StoreError, TxId};
