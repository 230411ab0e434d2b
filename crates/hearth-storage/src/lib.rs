//! Durable storage for the Hearth plugin runtime.
//!
//! [`PluginStore`] implements both of the core persistence traits on a single
//! redb database file, so registry records and plugin configuration survive
//! host restarts.

pub mod error;
pub mod plugins;

pub use error::{Error, Result};
pub use plugins::{PluginStore, StoreStats};
