use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::{Context, Result};

use super::table::Table;
use super::{file_stem, optional_bool, optional_f64, required};
use crate::pipeline::{Configurables, ProcessUnit, UnitContext, UnitOutput};

pub const COLUMN: &str = "COLUMN";
pub const MINRANGE: &str = "MINRANGE";
pub const MAXRANGE: &str = "MAXRANGE";
pub const OUTPUTALL: &str = "OUTPUTALL";

const DEFAULT_MIN: f64 = -5.0;
const DEFAULT_MAX: f64 = 1.0;

// ---------------------------------------------------------------------------
// Row predicate
// ---------------------------------------------------------------------------

/// Indices of rows whose value lies strictly between `min` and `max`.
/// Rows without a numeric value never pass.
pub fn filtered_indices(values: &[Option<f64>], min: f64, max: f64) -> Vec<usize> {
    values
        .iter()
        .enumerate()
        .filter(|(_, v)| matches!(v, Some(x) if *x > min && *x < max))
        .map(|(i, _)| i)
        .collect()
}

// ---------------------------------------------------------------------------
// AutoFilter unit
// ---------------------------------------------------------------------------

/// Keeps the rows of a data file whose `COLUMN` lies between `MINRANGE` and
/// `MAXRANGE`, writing them to `<stem>_FILTERED.csv`.
pub struct AutoFilter {
    source: PathBuf,
    output_dir: PathBuf,
    table: Table,
    column: String,
    min: f64,
    max: f64,
    output_all: bool,
}

impl AutoFilter {
    pub fn new(ctx: &UnitContext) -> Result<Self> {
        log::info!("Filter: loading data from {}", ctx.primary_file.display());
        let table = Table::load(&ctx.primary_file, &ctx.runtime)?;
        Ok(Self {
            source: ctx.primary_file.clone(),
            output_dir: ctx.output_dir.clone(),
            table,
            column: String::new(),
            min: DEFAULT_MIN,
            max: DEFAULT_MAX,
            output_all: true,
        })
    }

    pub fn factory(ctx: &UnitContext) -> Result<Box<dyn ProcessUnit>> {
        Ok(Box::new(Self::new(ctx)?))
    }
}

impl ProcessUnit for AutoFilter {
    fn configurable_keys(&self) -> BTreeSet<String> {
        [COLUMN, MINRANGE, MAXRANGE, OUTPUTALL]
            .into_iter()
            .map(String::from)
            .collect()
    }

    fn set_configurables(&mut self, values: Configurables) -> Result<()> {
        self.column = required(&values, COLUMN)?;
        self.min = optional_f64(&values, MINRANGE)?.unwrap_or(DEFAULT_MIN);
        self.max = optional_f64(&values, MAXRANGE)?.unwrap_or(DEFAULT_MAX);
        self.output_all = optional_bool(&values, OUTPUTALL)?.unwrap_or(true);
        Ok(())
    }

    fn has_data(&self) -> bool {
        !self.table.is_empty()
    }

    fn run(&mut self) -> Result<UnitOutput> {
        let col = self.table.column_index(&self.column)?;
        let keep = filtered_indices(&self.table.numeric_column(col), self.min, self.max);

        let summary = format!(
            "Rows after filtering {} values between {} and {}: {} of {}",
            self.column,
            self.min,
            self.max,
            keep.len(),
            self.table.len()
        );
        log::info!("{summary}");

        let out = self
            .output_dir
            .join(format!("{}_FILTERED.csv", file_stem(&self.source)));

        let written = if self.output_all {
            let headers: Vec<&str> = self.table.headers.iter().map(String::as_str).collect();
            let rows = keep.iter().map(|&i| self.table.rows[i].iter());
            Table::write_csv(&out, &headers, rows)
        } else {
            let rows = keep
                .iter()
                .map(|&i| std::iter::once(self.table.rows[i].get(col).map_or("", String::as_str)));
            Table::write_csv(&out, &[self.column.as_str()], rows)
        };
        written.with_context(|| format!("saving filtered data for {}", self.source.display()))?;

        log::info!("Filtered data saved: {}", out.display());
        Ok(UnitOutput {
            artifacts: vec![out],
            summary: Some(summary),
        })
    }
}
