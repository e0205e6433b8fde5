//! Host settings file.
//!
//! ```yaml
//! catalog: catalog.yaml
//! config_db: config.db        # optional, SQLite parameter store
//! config_group: default
//! datafile_marker: _Image
//! failure_policy: abort_run   # or skip_file
//! log_dir: logs
//! runtime:
//!   SKIPROWS: 0
//! parameters:                 # used when config_db is absent
//!   default:
//!     COLUMN: Count
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};

use crate::pipeline::{FailurePolicy, ProcessCatalog};
use crate::store::{ConfigStore, MemoryConfigStore, ParameterGroups, SqliteConfigStore};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Process catalog YAML.
    pub catalog: PathBuf,

    /// SQLite parameter store. When unset, `parameters` is used instead.
    #[serde(default)]
    pub config_db: Option<PathBuf>,

    #[serde(default = "default_config_group")]
    pub config_group: String,

    /// Substring a path must contain to be processed. Empty keeps everything.
    #[serde(default)]
    pub datafile_marker: String,

    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Directory for `analysis.log`; stderr when unset.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Base configuration handed to every unit.
    #[serde(default, deserialize_with = "scalar_map")]
    pub runtime: BTreeMap<String, String>,

    #[serde(default, deserialize_with = "scalar_groups")]
    pub parameters: ParameterGroups,
}

fn default_config_group() -> String {
    "default".to_string()
}

impl Settings {
    /// Load settings from a YAML file. Relative paths inside it resolve
    /// against the file's directory.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading settings {}", path.display()))?;
        let mut settings = Self::from_yaml_str(&contents)
            .with_context(|| format!("parsing settings {}", path.display()))?;

        if let Some(base) = path.parent() {
            settings.resolve_paths(base);
        }
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    fn resolve_paths(&mut self, base: &Path) {
        let rebase = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        rebase(&mut self.catalog);
        if let Some(db) = self.config_db.as_mut() {
            rebase(db);
        }
        if let Some(dir) = self.log_dir.as_mut() {
            rebase(dir);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.catalog.as_os_str().is_empty() {
            bail!("catalog path must not be empty");
        }
        if self.config_group.trim().is_empty() {
            bail!("config_group must not be blank");
        }
        if self.config_db.is_some() && !self.parameters.is_empty() {
            log::warn!("config_db is set; inline parameters are ignored");
        }
        Ok(())
    }

    /// Ids of catalog entries whose role-resolved companions would reach the
    /// unit unfiltered, because no `datafile_marker` narrows them.
    pub fn unnarrowed_entries<'a>(&self, catalog: &'a ProcessCatalog) -> Vec<&'a str> {
        if !self.datafile_marker.is_empty() {
            return Vec::new();
        }
        catalog
            .entries()
            .iter()
            .filter(|e| !e.required_roles.is_empty())
            .map(|e| e.id.as_str())
            .collect()
    }

    /// Open the parameter store these settings describe.
    pub fn open_store(&self) -> Result<Arc<dyn ConfigStore>> {
        match &self.config_db {
            Some(db) => {
                let store = SqliteConfigStore::open(db)
                    .with_context(|| format!("opening config database {}", db.display()))?;
                log::info!("Using config database {}", db.display());
                Ok(Arc::new(store))
            }
            None => Ok(Arc::new(MemoryConfigStore::from_groups(self.parameters.clone()))),
        }
    }
}

// ---------------------------------------------------------------------------
// Scalar values as strings
// ---------------------------------------------------------------------------

fn scalar_to_string(value: serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn to_string_map<E: serde::de::Error>(
    raw: BTreeMap<String, serde_yaml::Value>,
) -> Result<BTreeMap<String, String>, E> {
    raw.into_iter()
        .map(|(k, v)| match scalar_to_string(v) {
            Some(s) => Ok((k, s)),
            None => Err(E::custom(format!("value for '{k}' must be a scalar"))),
        })
        .collect()
}

fn scalar_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = BTreeMap::<String, serde_yaml::Value>::deserialize(deserializer)?;
    to_string_map(raw)
}

fn scalar_groups<'de, D>(deserializer: D) -> Result<ParameterGroups, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = BTreeMap::<String, BTreeMap<String, serde_yaml::Value>>::deserialize(deserializer)?;
    raw.into_iter()
        .map(|(group, values)| to_string_map(values).map(|v| (group, v)))
        .collect::<Result<_, D::Error>>()
        .map_err(|e| D::Error::custom(format!("parameters: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply() {
        let s = Settings::from_yaml_str("catalog: catalog.yaml\n").unwrap();
        assert_eq!(s.config_group, "default");
        assert_eq!(s.datafile_marker, "");
        assert_eq!(s.failure_policy, FailurePolicy::AbortRun);
        assert!(s.config_db.is_none());
        assert!(s.runtime.is_empty());
        s.validate().unwrap();
    }

    #[test]
    fn scalars_become_strings() {
        let s = Settings::from_yaml_str(
            "catalog: c.yaml\n\
             failure_policy: skip_file\n\
             runtime:\n  SKIPROWS: 2\n  VERBOSE: true\n\
             parameters:\n  default:\n    MINRANGE: -5\n    COLUMN: Count\n",
        )
        .unwrap();
        assert_eq!(s.failure_policy, FailurePolicy::SkipFile);
        assert_eq!(s.runtime["SKIPROWS"], "2");
        assert_eq!(s.runtime["VERBOSE"], "true");
        assert_eq!(s.parameters["default"]["MINRANGE"], "-5");
        assert_eq!(s.parameters["default"]["COLUMN"], "Count");
    }

    #[test]
    fn nested_runtime_value_is_rejected() {
        let err = Settings::from_yaml_str("catalog: c.yaml\nruntime:\n  A: [1, 2]\n").unwrap_err();
        assert!(err.to_string().contains("scalar"));
    }

    #[test]
    fn unknown_field_is_rejected() {
        assert!(Settings::from_yaml_str("catalog: c.yaml\ncatalgo: x\n").is_err());
    }

    #[test]
    fn blank_group_fails_validation() {
        let s = Settings::from_yaml_str("catalog: c.yaml\nconfig_group: ' '\n").unwrap();
        assert!(s.validate().is_err());
    }

    #[test]
    fn relative_paths_follow_settings_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.yaml");
        std::fs::write(
            &path,
            "catalog: catalog.yaml\nconfig_db: db/config.db\nlog_dir: /var/log/analysis\n",
        )
        .unwrap();

        let s = Settings::from_file(&path).unwrap();
        assert_eq!(s.catalog, dir.path().join("catalog.yaml"));
        assert_eq!(s.config_db, Some(dir.path().join("db/config.db")));
        assert_eq!(s.log_dir, Some(PathBuf::from("/var/log/analysis")));
    }

    #[test]
    fn empty_marker_flags_entries_with_roles() {
        let catalog = ProcessCatalog::from_yaml_str(
            "msd:\n  caption: MSD\n  modulename: m\n  classname: C\n  href: h\n  files: MSD\n\
             plain:\n  caption: Plain\n  modulename: m\n  classname: C\n  href: h\n",
        )
        .unwrap();

        let bare = Settings::from_yaml_str("catalog: c.yaml\n").unwrap();
        assert_eq!(bare.unnarrowed_entries(&catalog), vec!["msd"]);

        let marked = Settings::from_yaml_str("catalog: c.yaml\ndatafile_marker: _Image\n").unwrap();
        assert!(marked.unnarrowed_entries(&catalog).is_empty());
    }

    #[test]
    fn inline_parameters_back_the_store() {
        let s = Settings::from_yaml_str(
            "catalog: c.yaml\nparameters:\n  default:\n    COLUMN: Count\n",
        )
        .unwrap();
        let store = s.open_store().unwrap();
        assert_eq!(store.lookup("default", "COLUMN").unwrap().as_deref(), Some("Count"));
        assert_eq!(store.lookup("default", "BINWIDTH").unwrap(), None);
    }

    #[test]
    fn sqlite_store_is_opened_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("config.db");
        SqliteConfigStore::open(&db)
            .unwrap()
            .replace_all(&[("default".into(), "COLUMN".into(), "Area".into())])
            .unwrap();

        let yaml = format!("catalog: c.yaml\nconfig_db: {}\n", db.display());
        let store = Settings::from_yaml_str(&yaml).unwrap().open_store().unwrap();
        assert_eq!(store.lookup("default", "COLUMN").unwrap().as_deref(), Some("Area"));
    }
}
