use std::path::PathBuf;

use thiserror::Error;

use crate::store::ConfigStoreError;

/// The catalog file could not be turned into a [`ProcessCatalog`](super::catalog::ProcessCatalog).
/// Always fatal at startup.
#[derive(Error, Debug)]
pub enum CatalogLoadError {
    #[error("cannot read catalog {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse catalog: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("catalog must be a mapping of entry id to process description")]
    NotAMapping,

    #[error("catalog key {0} is not a string or number")]
    BadKey(String),

    #[error("catalog entry '{entry}' is missing required field '{field}'")]
    MissingField { entry: String, field: &'static str },

    #[error("catalog entry id '{0}' appears more than once")]
    DuplicateId(String),
}

/// A required companion-file role matched nothing on disk.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FileResolutionError {
    #[error("no file found for required role '{role}'")]
    UnmatchedRole { role: String },
}

/// Anything that stops a run after the gate has been acquired.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Resolution(#[from] FileResolutionError),

    #[error("no unit registered for {module}.{class}")]
    UnknownBinding { module: String, class: String },

    #[error("cannot set up unit for {}: {source:#}", file.display())]
    Instantiation {
        file: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("unit failed on {}: {source:#}", file.display())]
    Execution {
        file: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("unit panicked on {}: {message}", file.display())]
    Panicked { file: PathBuf, message: String },

    #[error("cannot create output directory {}: {source}", path.display())]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration lookup failed: {0}")]
    Config(#[from] ConfigStoreError),
}

/// Errors surfaced synchronously by the [`Controller`](super::controller::Controller).
#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("unknown catalog entry '{0}'")]
    UnknownEntry(String),

    #[error("cannot spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}
