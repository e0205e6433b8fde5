use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use super::catalog::{PluginBinding, ProcessCatalog};

// ---------------------------------------------------------------------------
// Unit contract
// ---------------------------------------------------------------------------

/// Resolved parameter values handed to a unit. `None` means the configuration
/// store had no value for that key.
pub type Configurables = BTreeMap<String, Option<String>>;

/// Everything a factory receives to build a unit for one file.
#[derive(Debug, Clone)]
pub struct UnitContext {
    pub primary_file: PathBuf,
    pub output_dir: PathBuf,
    /// Base configuration for the run (sheet, header row and similar).
    pub runtime: BTreeMap<String, String>,
}

/// What a unit reports after a successful run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitOutput {
    /// Files written by the unit.
    pub artifacts: Vec<PathBuf>,
    pub summary: Option<String>,
}

/// One instantiated processing unit bound to a single primary file.
///
/// Call order: [`configurable_keys`](Self::configurable_keys),
/// [`set_configurables`](Self::set_configurables), then
/// [`run`](Self::run) only if [`has_data`](Self::has_data) is true.
pub trait ProcessUnit: Send {
    /// Parameter names this unit wants resolved before it runs.
    fn configurable_keys(&self) -> BTreeSet<String>;

    fn set_configurables(&mut self, values: Configurables) -> anyhow::Result<()>;

    /// False when the input held nothing to process.
    fn has_data(&self) -> bool;

    fn run(&mut self) -> anyhow::Result<UnitOutput>;
}

/// Builds a [`ProcessUnit`] for a file.
pub trait UnitFactory: Send + Sync {
    fn instantiate(&self, ctx: &UnitContext) -> anyhow::Result<Box<dyn ProcessUnit>>;
}

impl<F> UnitFactory for F
where
    F: Fn(&UnitContext) -> anyhow::Result<Box<dyn ProcessUnit>> + Send + Sync,
{
    fn instantiate(&self, ctx: &UnitContext) -> anyhow::Result<Box<dyn ProcessUnit>> {
        self(ctx)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Factories keyed by the module/class binding named in the catalog.
///
/// Populated once at startup; the catalog decides which binding a run uses,
/// the registry only knows how to build it.
#[derive(Default, Clone)]
pub struct PluginRegistry {
    factories: HashMap<PluginBinding, Arc<dyn UnitFactory>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` under `binding`, replacing any previous one.
    pub fn register(&mut self, binding: PluginBinding, factory: impl UnitFactory + 'static) {
        if self.factories.insert(binding.clone(), Arc::new(factory)).is_some() {
            log::warn!("Replaced unit factory for {binding}");
        }
    }

    pub fn get(&self, binding: &PluginBinding) -> Option<Arc<dyn UnitFactory>> {
        self.factories.get(binding).cloned()
    }

    pub fn contains(&self, binding: &PluginBinding) -> bool {
        self.factories.contains_key(binding)
    }

    /// Catalog bindings with no registered factory, in catalog order.
    pub fn missing(&self, catalog: &ProcessCatalog) -> Vec<PluginBinding> {
        catalog
            .entries()
            .iter()
            .map(|e| &e.binding)
            .filter(|b| !self.contains(b))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<_> = self.factories.keys().map(ToString::to_string).collect();
        keys.sort();
        f.debug_struct("PluginRegistry").field("bindings", &keys).finish()
    }
}
