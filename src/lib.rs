//! Runs pluggable data-processing units over sets of scientific data files.
//!
//! The [`pipeline`] module holds the orchestration core; [`units`] provides the
//! built-in filter and histogram units; [`store`] is the parameter lookup
//! service; [`settings`] and [`logging`] are the host-side setup.

pub mod logging;
pub mod pipeline;
pub mod settings;
pub mod store;
pub mod units;

pub use pipeline::{Controller, ProcessCatalog, ProgressEvent};
pub use settings::Settings;
pub use store::{ConfigStore, MemoryConfigStore, SqliteConfigStore};
