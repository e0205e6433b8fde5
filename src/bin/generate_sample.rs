//! Writes a small demo tree: per-image object tables, a catalog and settings.
//!
//! ```text
//! cargo run --bin generate_sample -- demo
//! cargo run -- --settings demo/settings.yaml run filter demo/data/*.csv
//! cargo run -- --settings demo/settings.yaml run batch demo/data
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

const CATALOG: &str = "\
filter:
  caption: Filter objects
  modulename: rusty_analysis.units
  classname: AutoFilter
  href: filter
  files: DATAFILE
histogram:
  caption: Intensity histogram
  modulename: rusty_analysis.units
  classname: AutoHistogram
  href: analysis
batch:
  caption: Batch intensities
  modulename: rusty_analysis.units
  classname: AutoBatch
  href: batch
";

const SETTINGS: &str = "\
catalog: catalog.yaml
datafile_marker: _Image
failure_policy: skip_file
log_dir: logs
parameters:
  default:
    DATAFILE: _Image
    COLUMN: Intensity
    MINRANGE: -1.0
    MAXRANGE: 1.0
    OUTPUTALL: true
    BINWIDTH: 0.25
";

/// Minimal deterministic PRNG (xoshiro256**)
struct SimpleRng {
    state: [u64; 4],
}

impl SimpleRng {
    fn new(seed: u64) -> Self {
        let mut s = [0u64; 4];
        let mut x = seed;
        for slot in &mut s {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(1);
            *slot = x;
        }
        SimpleRng { state: s }
    }

    fn next_u64(&mut self) -> u64 {
        let result = (self.state[1].wrapping_mul(5)).rotate_left(7).wrapping_mul(9);
        let t = self.state[1] << 17;
        self.state[2] ^= self.state[0];
        self.state[3] ^= self.state[1];
        self.state[1] ^= self.state[2];
        self.state[0] ^= self.state[3];
        self.state[2] ^= t;
        self.state[3] = self.state[3].rotate_left(45);
        result
    }

    fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Box-Muller transform for normal distribution
    fn gauss(&mut self, mean: f64, std_dev: f64) -> f64 {
        let u1 = self.next_f64().max(1e-15);
        let u2 = self.next_f64();
        let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
        mean + std_dev * z
    }
}

fn write_image_table(path: &Path, objects: usize, spread: f64, rng: &mut SimpleRng) -> Result<()> {
    let mut writer =
        csv::Writer::from_path(path).with_context(|| format!("creating {}", path.display()))?;
    writer.write_record(["ImageNumber", "ObjectNumber", "Area", "Intensity"])?;
    for object in 1..=objects {
        let area = rng.gauss(120.0, 30.0).max(1.0).round();
        let intensity = rng.gauss(0.0, spread);
        writer.write_record([
            "1".to_string(),
            object.to_string(),
            area.to_string(),
            format!("{intensity:.4}"),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

fn main() -> Result<()> {
    let root = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("demo"));
    let data = root.join("data");
    std::fs::create_dir_all(&data).with_context(|| format!("creating {}", data.display()))?;

    let mut rng = SimpleRng::new(42);
    let samples = [("Brain01", 0.5), ("Brain02", 1.0), ("Brain03", 2.0)];
    for (name, spread) in samples {
        let path = data.join(format!("{name}_Image.csv"));
        write_image_table(&path, 200, spread, &mut rng)?;
        println!("Wrote {}", path.display());
    }

    // Not a data file; the filter entry's DATAFILE role and the marker drop it.
    std::fs::write(data.join("Experiment.csv"), "Key,Value\nOperator,Alice\n")?;

    std::fs::write(root.join("catalog.yaml"), CATALOG)?;
    std::fs::write(root.join("settings.yaml"), SETTINGS)?;
    println!("Wrote catalog and settings to {}", root.display());
    Ok(())
}
