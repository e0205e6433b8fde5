use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use serde_yaml::{Mapping, Value};

use super::error::CatalogLoadError;

// ---------------------------------------------------------------------------
// PluginBinding – how a catalog entry finds its unit
// ---------------------------------------------------------------------------

/// Module + class identifiers naming a registered unit factory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PluginBinding {
    pub module: String,
    pub class: String,
}

impl PluginBinding {
    pub fn new(module: impl Into<String>, class: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            class: class.into(),
        }
    }
}

impl fmt::Display for PluginBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.module, self.class)
    }
}

// ---------------------------------------------------------------------------
// CatalogEntry
// ---------------------------------------------------------------------------

/// One pluggable processing step as declared in the catalog file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub id: String,
    pub caption: String,
    /// Classification tag (`href` in the catalog file).
    pub kind: String,
    pub binding: PluginBinding,
    /// Companion-file roles, in declaration order.
    pub required_roles: Vec<String>,
}

// ---------------------------------------------------------------------------
// ProcessCatalog
// ---------------------------------------------------------------------------

/// Immutable set of catalog entries, kept in file order.
///
/// Expected YAML:
///
/// ```yaml
/// filter:
///   caption: Filter data
///   modulename: rusty_analysis.units
///   classname: AutoFilter
///   href: filter
///   files: DATAFILE, MSDFILE
/// ```
#[derive(Debug, Clone, Default)]
pub struct ProcessCatalog {
    entries: Vec<CatalogEntry>,
    index: HashMap<String, usize>,
}

impl ProcessCatalog {
    pub fn load(path: &Path) -> Result<Self, CatalogLoadError> {
        let text = std::fs::read_to_string(path).map_err(|source| CatalogLoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let catalog = Self::from_yaml_str(&text)?;
        log::info!("Loaded {} processes from {}", catalog.len(), path.display());
        Ok(catalog)
    }

    /// Parse a catalog. Any malformed entry fails the whole load.
    pub fn from_yaml_str(text: &str) -> Result<Self, CatalogLoadError> {
        let root: Value = serde_yaml::from_str(text)?;
        let mapping = match root {
            Value::Mapping(m) => m,
            Value::Null => Mapping::new(),
            _ => return Err(CatalogLoadError::NotAMapping),
        };

        let mut entries = Vec::with_capacity(mapping.len());
        let mut index = HashMap::with_capacity(mapping.len());

        for (key, body) in &mapping {
            let id = key_to_id(key)?;
            let entry = parse_entry(id, body)?;
            log::debug!("catalog: {}={}", entry.id, entry.caption);
            if index.insert(entry.id.clone(), entries.len()).is_some() {
                return Err(CatalogLoadError::DuplicateId(entry.id));
            }
            entries.push(entry);
        }

        Ok(Self { entries, index })
    }

    pub fn get(&self, id: &str) -> Option<&CatalogEntry> {
        self.index.get(id).map(|&i| &self.entries[i])
    }

    /// Entries in the order they appear in the catalog file.
    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn key_to_id(key: &Value) -> Result<String, CatalogLoadError> {
    match key {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(CatalogLoadError::BadKey(format!("{other:?}"))),
    }
}

fn parse_entry(id: String, body: &Value) -> Result<CatalogEntry, CatalogLoadError> {
    let fields = body.as_mapping();
    let required = |field: &'static str| -> Result<String, CatalogLoadError> {
        fields
            .and_then(|m| m.get(field))
            .and_then(scalar_to_string)
            .filter(|s| !s.trim().is_empty())
            .map(|s| s.trim().to_string())
            .ok_or_else(|| CatalogLoadError::MissingField {
                entry: id.clone(),
                field,
            })
    };

    let caption = required("caption")?;
    let module = required("modulename")?;
    let class = required("classname")?;
    let kind = required("href")?;

    let required_roles = fields
        .and_then(|m| m.get("files"))
        .and_then(scalar_to_string)
        .map(|s| split_roles(&s))
        .unwrap_or_default();

    Ok(CatalogEntry {
        id,
        caption,
        kind,
        binding: PluginBinding::new(module, class),
        required_roles,
    })
}

fn scalar_to_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// `"DATAFILE, MSDFILE"` → `["DATAFILE", "MSDFILE"]`.
fn split_roles(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(str::to_string)
        .collect()
}
