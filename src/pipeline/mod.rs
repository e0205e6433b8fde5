//! Job orchestration: catalog, file resolution, dispatch and progress.
//!
//! Architecture:
//! ```text
//!  catalog.yaml
//!        │
//!        ▼
//!   ┌──────────────┐
//!   │ ProcessCatalog│  id → caption, kind, binding, roles
//!   └──────────────┘
//!        │ run_job(entry, files)
//!        ▼
//!   ┌──────────┐   roles ─▶ ConfigStore ─▶ matcher ─▶ effective files
//!   │Controller│
//!   └──────────┘
//!        │ one worker thread per run
//!        ▼
//!   ┌───────────┐  ExecutionGate (one run at a time)
//!   │JobExecutor│──▶ PluginRegistry ─▶ ProcessUnit per file
//!   └───────────┘
//!        │
//!        ▼
//!    Observer ◀── ProgressEvent (step … 100 | -1)
//! ```

pub mod catalog;
pub mod controller;
pub mod error;
pub mod events;
pub mod executor;
pub mod gate;
pub mod matcher;
pub mod plugin;

pub use catalog::{CatalogEntry, PluginBinding, ProcessCatalog};
pub use controller::Controller;
pub use error::{CatalogLoadError, ControllerError, FileResolutionError, RunError};
pub use events::{ChannelObserver, LogObserver, Observer, ProgressEvent, Stage};
pub use executor::{
    CancellationToken, FailurePolicy, FileOutcome, JobExecutor, JobState, OutputTarget, RunReport,
    RunRequest,
};
pub use gate::{ExecutionGate, ExecutionGuard};
pub use plugin::{Configurables, PluginRegistry, ProcessUnit, UnitContext, UnitFactory, UnitOutput};
