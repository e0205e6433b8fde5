use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result, bail};

// ---------------------------------------------------------------------------
// Table – a loaded data file
// ---------------------------------------------------------------------------

/// A delimited data file: one header row, then string cells.
#[derive(Debug, Clone, Default)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// Runtime key: number of lines to skip before the header row.
pub const SKIPROWS: &str = "SKIPROWS";

// ---------------------------------------------------------------------------
// Public entry-point
// ---------------------------------------------------------------------------

impl Table {
    /// Load a table from a file.  Dispatch by extension.
    ///
    /// Supported formats:
    /// * `.csv`          – comma separated
    /// * `.txt` / `.tsv` – tab separated (instrument exports)
    ///
    /// `runtime` may carry [`SKIPROWS`] for files with a preamble.
    pub fn load(path: &Path, runtime: &BTreeMap<String, String>) -> Result<Table> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();

        let delimiter = match ext.as_str() {
            "csv" => b',',
            "txt" | "tsv" => b'\t',
            other => bail!("Unsupported file extension: .{other}"),
        };

        let skip = match runtime.get(SKIPROWS) {
            Some(v) => v
                .trim()
                .parse::<usize>()
                .with_context(|| format!("{SKIPROWS} '{v}' is not a row count"))?,
            None => 0,
        };

        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let body: String = text
            .lines()
            .skip(skip)
            .map(|l| format!("{l}\n"))
            .collect();

        Self::parse(&body, delimiter).with_context(|| format!("parsing {}", path.display()))
    }

    fn parse(text: &str, delimiter: u8) -> Result<Table> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .flexible(true)
            .from_reader(text.as_bytes());

        let headers: Vec<String> = reader
            .headers()
            .context("reading headers")?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();

        let mut rows = Vec::new();
        for (row_no, result) in reader.records().enumerate() {
            let record = result.with_context(|| format!("row {row_no}"))?;
            rows.push(record.iter().map(str::to_string).collect());
        }

        Ok(Table { headers, rows })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Result<usize> {
        self.headers
            .iter()
            .position(|h| h == name)
            .with_context(|| format!("missing '{name}' column"))
    }

    /// Numeric value of `col` for every row; `None` where the cell is empty
    /// or not a number.
    pub fn numeric_column(&self, col: usize) -> Vec<Option<f64>> {
        self.rows
            .iter()
            .map(|r| r.get(col).and_then(|c| c.trim().parse::<f64>().ok()))
            .collect()
    }

    /// Write `headers` and `rows` as CSV.
    pub fn write_csv<R, C>(path: &Path, headers: &[&str], rows: R) -> Result<()>
    where
        R: IntoIterator<Item = C>,
        C: IntoIterator,
        C::Item: AsRef<[u8]>,
    {
        let mut writer =
            csv::Writer::from_path(path).with_context(|| format!("creating {}", path.display()))?;
        writer.write_record(headers).context("writing CSV header")?;
        for row in rows {
            writer.write_record(row).context("writing CSV row")?;
        }
        writer.flush().context("flushing CSV")?;
        Ok(())
    }
}
