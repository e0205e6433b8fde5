use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use super::table::Table;
use super::{file_stem, required};
use crate::pipeline::{Configurables, ProcessUnit, UnitContext, UnitOutput};

pub const COLUMN: &str = "COLUMN";
pub const DATAFILE: &str = "DATAFILE";

/// Search text used when `DATAFILE` is not configured.
pub const DEFAULT_SEARCH: &str = "_Image.csv";

const PREFIX: &str = "BATCH_";

// ---------------------------------------------------------------------------
// File selection
// ---------------------------------------------------------------------------

/// Every file under `dir` whose name contains `search`, depth first in name
/// order. `skip` is never entered and earlier batch outputs are ignored.
pub fn select_files(dir: &Path, search: &str, skip: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    walk(dir, search, skip, &mut out);
    out
}

fn walk(dir: &Path, search: &str, skip: &Path, out: &mut Vec<PathBuf>) {
    if dir == skip {
        return;
    }
    let mut entries: Vec<PathBuf> = match std::fs::read_dir(dir) {
        Ok(rd) => rd.filter_map(|e| e.ok()).map(|e| e.path()).collect(),
        Err(e) => {
            log::debug!("Batch: cannot read {}: {e}", dir.display());
            return;
        }
    };
    entries.sort();
    for path in entries {
        if path.is_dir() {
            walk(&path, search, skip, out);
            continue;
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if name.contains(search) && !name.starts_with(PREFIX) {
            out.push(path);
        }
    }
}

/// One id per file: its stem when all stems differ, else `c001`, `c002`, …
pub fn file_ids(files: &[PathBuf]) -> Vec<String> {
    let stems: Vec<String> = files.iter().map(|f| file_stem(f)).collect();
    let unique: HashSet<&String> = stems.iter().collect();
    if unique.len() == stems.len() {
        stems
    } else {
        (1..=files.len()).map(|n| format!("c{n:03}")).collect()
    }
}

// ---------------------------------------------------------------------------
// AutoBatch unit
// ---------------------------------------------------------------------------

/// Gathers `COLUMN` (comma separated) from every data file under the input
/// directory into one `BATCH_<dir>_<search>.csv`, one output column per file
/// and requested column.
///
/// The input directory is the primary path itself when it is a directory,
/// otherwise the directory holding it.
pub struct AutoBatch {
    input_dir: PathBuf,
    output_dir: PathBuf,
    runtime: BTreeMap<String, String>,
    columns: Vec<String>,
    search: String,
    /// (file id, values per requested column)
    batch: Vec<(String, Vec<Vec<String>>)>,
}

impl AutoBatch {
    pub fn new(ctx: &UnitContext) -> Result<Self> {
        let input_dir = if ctx.primary_file.is_dir() {
            ctx.primary_file.clone()
        } else {
            ctx.primary_file
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."))
        };
        Ok(Self {
            input_dir,
            output_dir: ctx.output_dir.clone(),
            runtime: ctx.runtime.clone(),
            columns: Vec::new(),
            search: DEFAULT_SEARCH.to_string(),
            batch: Vec::new(),
        })
    }

    pub fn factory(ctx: &UnitContext) -> Result<Box<dyn ProcessUnit>> {
        Ok(Box::new(Self::new(ctx)?))
    }

    pub fn output_file(&self) -> PathBuf {
        let base = self
            .input_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let search = self.search.split('.').next().unwrap_or_default();
        self.output_dir.join(format!("{PREFIX}{base}_{search}.csv"))
    }

    fn collect(&mut self) {
        let files = select_files(&self.input_dir, &self.search, &self.output_dir);
        log::info!("Batch: {} files found in {}", files.len(), self.input_dir.display());
        let ids = file_ids(&files);

        self.batch.clear();
        for (id, file) in ids.into_iter().zip(&files) {
            let table = match Table::load(file, &self.runtime) {
                Ok(table) => table,
                Err(e) => {
                    log::warn!("Batch: skipping {}: {e:#}", file.display());
                    continue;
                }
            };
            let cols: Option<Vec<usize>> = self
                .columns
                .iter()
                .map(|c| table.headers.iter().position(|h| h == c))
                .collect();
            let Some(cols) = cols else {
                log::debug!("Batch: {} lacks the requested columns", file.display());
                continue;
            };
            let values: Vec<Vec<String>> = cols
                .iter()
                .map(|&c| {
                    table
                        .rows
                        .iter()
                        .map(|r| r.get(c).cloned().unwrap_or_default())
                        .collect()
                })
                .collect();
            self.batch.push((id, values));
        }
    }
}

impl ProcessUnit for AutoBatch {
    fn configurable_keys(&self) -> BTreeSet<String> {
        BTreeSet::from([COLUMN.to_string(), DATAFILE.to_string()])
    }

    fn set_configurables(&mut self, values: Configurables) -> Result<()> {
        self.columns = required(&values, COLUMN)?
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect();
        if self.columns.is_empty() {
            bail!("no columns listed in {COLUMN}");
        }
        if let Some(search) = values.get(DATAFILE).and_then(|v| v.as_deref()) {
            if !search.trim().is_empty() {
                self.search = search.trim().to_string();
            }
        }
        self.collect();
        Ok(())
    }

    fn has_data(&self) -> bool {
        !self.batch.is_empty()
    }

    fn run(&mut self) -> Result<UnitOutput> {
        let columns = &self.columns;
        let headers: Vec<String> = self
            .batch
            .iter()
            .flat_map(|(id, _)| {
                columns.iter().map(move |c| {
                    if columns.len() == 1 {
                        id.clone()
                    } else {
                        format!("{id}_{c}")
                    }
                })
            })
            .collect();
        let series: Vec<&Vec<String>> = self.batch.iter().flat_map(|(_, v)| v.iter()).collect();
        let height = series.iter().map(|s| s.len()).max().unwrap_or(0);
        let rows = (0..height).map(|i| {
            series
                .iter()
                .map(move |s| s.get(i).map_or("", String::as_str))
                .collect::<Vec<_>>()
        });

        let out = self.output_file();
        let header_refs: Vec<&str> = headers.iter().map(String::as_str).collect();
        Table::write_csv(&out, &header_refs, rows)
            .with_context(|| format!("saving batch for {}", self.input_dir.display()))?;

        log::info!("Batch: saved {} to {}", self.columns.join(","), out.display());
        Ok(UnitOutput {
            artifacts: vec![out],
            summary: Some(format!("{} files combined", self.batch.len())),
        })
    }
}
