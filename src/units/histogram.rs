use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};

use super::table::Table;
use super::{file_stem, optional_bool, optional_f64, required};
use crate::pipeline::{Configurables, ProcessUnit, UnitContext, UnitOutput};

pub const COLUMN: &str = "COLUMN";
pub const BINWIDTH: &str = "BINWIDTH";
pub const DENSITY: &str = "DENSITY";

/// Bin count used when no bin width is configured.
const DEFAULT_BINS: usize = 10;

/// Upper limit on the number of bins a width may produce.
pub const MAX_BINS: usize = 10_000;

// ---------------------------------------------------------------------------
// Binning
// ---------------------------------------------------------------------------

/// Left bin edges and counts.
#[derive(Debug, Clone, PartialEq)]
pub struct Histogram {
    pub edges: Vec<f64>,
    pub counts: Vec<usize>,
    pub width: f64,
}

impl Histogram {
    /// Counts scaled so the bars integrate to one.
    pub fn density(&self) -> Vec<f64> {
        let total: usize = self.counts.iter().sum();
        if total == 0 {
            return vec![0.0; self.counts.len()];
        }
        let norm = total as f64 * self.width;
        self.counts.iter().map(|&c| c as f64 / norm).collect()
    }
}

/// Bin `values` into fixed-width bins.
///
/// With a `width` the first edge is aligned down to a multiple of it; without
/// one the range is split into ten equal bins. The top edge is inclusive.
/// Fails on non-finite values and on widths that would need more than
/// [`MAX_BINS`] bins.
pub fn histogram(values: &[f64], width: Option<f64>) -> Result<Histogram> {
    if let Some(v) = values.iter().find(|v| !v.is_finite()) {
        bail!("cannot bin non-finite value {v}");
    }
    let (Some(lo), Some(hi)) = (
        values.iter().copied().reduce(f64::min),
        values.iter().copied().reduce(f64::max),
    ) else {
        return Ok(Histogram {
            edges: Vec::new(),
            counts: Vec::new(),
            width: width.unwrap_or(1.0),
        });
    };

    let (start, width, bins) = match width {
        Some(w) if w > 0.0 && w.is_finite() => {
            let start = (lo / w).floor() * w;
            let span = ((hi - start) / w).floor();
            if !span.is_finite() || span >= MAX_BINS as f64 {
                bail!("{BINWIDTH} {w} gives {span} bins over [{lo}, {hi}]; the limit is {MAX_BINS}");
            }
            (start, w, span as usize + 1)
        }
        Some(w) => bail!("{BINWIDTH} must be positive, got {w}"),
        None if hi > lo => {
            let w = (hi - lo) / DEFAULT_BINS as f64;
            if !w.is_finite() || w <= 0.0 {
                bail!("range [{lo}, {hi}] cannot be split into {DEFAULT_BINS} bins");
            }
            (lo, w, DEFAULT_BINS)
        }
        None => (lo, 1.0, 1),
    };

    let mut counts = vec![0usize; bins];
    for &v in values {
        let idx = (((v - start) / width).floor() as usize).min(bins - 1);
        counts[idx] += 1;
    }
    let edges = (0..bins).map(|i| start + i as f64 * width).collect();
    Ok(Histogram {
        edges,
        counts,
        width,
    })
}

// ---------------------------------------------------------------------------
// AutoHistogram unit
// ---------------------------------------------------------------------------

/// Frequency histogram of one column, saved as
/// `<stem>_<column>_HISTOGRAM.csv` with `bins,<column>` rows.
pub struct AutoHistogram {
    source: PathBuf,
    output_dir: PathBuf,
    table: Table,
    column: String,
    binwidth: Option<f64>,
    density: bool,
}

impl AutoHistogram {
    pub fn new(ctx: &UnitContext) -> Result<Self> {
        let table = Table::load(&ctx.primary_file, &ctx.runtime)?;
        Ok(Self {
            source: ctx.primary_file.clone(),
            output_dir: ctx.output_dir.clone(),
            table,
            column: String::new(),
            binwidth: None,
            density: false,
        })
    }

    pub fn factory(ctx: &UnitContext) -> Result<Box<dyn ProcessUnit>> {
        Ok(Box::new(Self::new(ctx)?))
    }
}

impl ProcessUnit for AutoHistogram {
    fn configurable_keys(&self) -> BTreeSet<String> {
        [COLUMN, BINWIDTH, DENSITY]
            .into_iter()
            .map(String::from)
            .collect()
    }

    fn set_configurables(&mut self, values: Configurables) -> Result<()> {
        self.column = required(&values, COLUMN)?;
        self.binwidth = optional_f64(&values, BINWIDTH)?;
        self.density = optional_bool(&values, DENSITY)?.unwrap_or(false);
        Ok(())
    }

    fn has_data(&self) -> bool {
        !self.table.is_empty()
    }

    fn run(&mut self) -> Result<UnitOutput> {
        let col = self.table.column_index(&self.column)?;
        let values: Vec<f64> = self.table.numeric_column(col).into_iter().flatten().collect();
        let histo = histogram(&values, self.binwidth)?;

        let stem = format!("{}_{}_HISTOGRAM", file_stem(&self.source), self.column);
        let out = self.output_dir.join(format!("{stem}.csv"));
        let rows = histo
            .edges
            .iter()
            .zip(&histo.counts)
            .map(|(edge, count)| [edge.to_string(), count.to_string()]);
        Table::write_csv(&out, &["bins", self.column.as_str()], rows)
            .with_context(|| format!("saving histogram for {}", self.source.display()))?;
        log::info!("Saved histogram data to {}", out.display());

        let mut artifacts = vec![out];
        if self.density {
            let out = self.output_dir.join(format!("{stem}_density.csv"));
            let rows = histo
                .edges
                .iter()
                .zip(histo.density())
                .map(|(edge, d)| [edge.to_string(), d.to_string()]);
            Table::write_csv(&out, &["bins", self.column.as_str()], rows)
                .with_context(|| format!("saving density for {}", self.source.display()))?;
            log::info!("Saved density data to {}", out.display());
            artifacts.push(out);
        }

        Ok(UnitOutput {
            artifacts,
            summary: Some(format!("{} values in {} bins", values.len(), histo.counts.len())),
        })
    }
}
