//! Built-in processing units.
//!
//! All units are registered under the module name [`MODULE`]; a catalog entry
//! selects one with `modulename: rusty_analysis.units` and `classname:
//! AutoFilter`, `AutoHistogram` or `AutoBatch`.

pub mod batch;
pub mod filter;
pub mod histogram;
pub mod table;

use std::path::Path;

use anyhow::{Context, Result};

use crate::pipeline::{Configurables, PluginBinding, PluginRegistry};

pub use batch::AutoBatch;
pub use filter::AutoFilter;
pub use histogram::AutoHistogram;

/// Module name the built-in units are bound under.
pub const MODULE: &str = "rusty_analysis.units";

/// Register every built-in unit.
pub fn register_builtin(registry: &mut PluginRegistry) {
    registry.register(PluginBinding::new(MODULE, "AutoFilter"), AutoFilter::factory);
    registry.register(PluginBinding::new(MODULE, "AutoHistogram"), AutoHistogram::factory);
    registry.register(PluginBinding::new(MODULE, "AutoBatch"), AutoBatch::factory);
}

/// File name without its extension.
pub(crate) fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

pub(crate) fn required(values: &Configurables, key: &str) -> Result<String> {
    match values.get(key).and_then(|v| v.as_deref()).map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => anyhow::bail!("no value configured for {key}"),
    }
}

pub(crate) fn optional_f64(values: &Configurables, key: &str) -> Result<Option<f64>> {
    match values.get(key).and_then(|v| v.as_deref()).map(str::trim) {
        Some(v) if !v.is_empty() => v
            .parse::<f64>()
            .map(Some)
            .with_context(|| format!("{key} '{v}' is not a number")),
        _ => Ok(None),
    }
}

pub(crate) fn optional_bool(values: &Configurables, key: &str) -> Result<Option<bool>> {
    match values.get(key).and_then(|v| v.as_deref()).map(str::trim) {
        Some(v) if !v.is_empty() => match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => anyhow::bail!("{key} '{v}' is not a yes/no value"),
        },
        _ => Ok(None),
    }
}
