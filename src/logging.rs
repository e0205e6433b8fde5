use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use env_logger::{Builder, Env, Target};

/// Log file name inside the configured log directory.
pub const LOG_FILE: &str = "analysis.log";

/// Size at which the log file is rolled over.
pub const MAX_BYTES: u64 = 10_000_000;

/// Number of rolled files kept (`analysis.log.1` … `analysis.log.10`).
pub const BACKUP_COUNT: usize = 10;

/// Install the global logger.
///
/// `RUST_LOG` overrides the default `info` level. Lines read
/// `[ 2024-05-01 10:00:00,123 INFO  ] (run-3) message`. With a `log_dir` the
/// output goes to a [`RollingFile`] at [`LOG_FILE`] there instead of stderr.
pub fn init(log_dir: Option<&Path>) -> Result<Option<PathBuf>> {
    let mut builder = Builder::from_env(Env::default().default_filter_or("info"));
    builder.format(|buf, record| {
        let thread = std::thread::current();
        writeln!(
            buf,
            "[ {} {:<5} ] ({:<9}) {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S,%3f"),
            record.level(),
            thread.name().unwrap_or("unnamed"),
            record.args()
        )
    });

    let path = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating log directory {}", dir.display()))?;
            let path = dir.join(LOG_FILE);
            let file = RollingFile::open(&path, MAX_BYTES, BACKUP_COUNT)
                .with_context(|| format!("opening log file {}", path.display()))?;
            builder.target(Target::Pipe(Box::new(file)));
            Some(path)
        }
        None => None,
    };

    builder.try_init().context("logger already initialised")?;
    Ok(path)
}

// ---------------------------------------------------------------------------
// RollingFile
// ---------------------------------------------------------------------------

/// Append-mode log file that shifts itself to `<path>.1`, `<path>.2`, …
/// once it would grow past `max_bytes`. The oldest backup beyond `backups`
/// is deleted.
#[derive(Debug)]
pub struct RollingFile {
    path: PathBuf,
    max_bytes: u64,
    backups: usize,
    file: File,
    written: u64,
}

impl RollingFile {
    /// Open `path` for appending, rolling it first if it is already full.
    pub fn open(path: &Path, max_bytes: u64, backups: usize) -> io::Result<Self> {
        let file = Self::append(path)?;
        let written = file.metadata()?.len();
        let mut rolling = Self {
            path: path.to_path_buf(),
            max_bytes,
            backups,
            file,
            written,
        };
        if rolling.written >= max_bytes {
            rolling.roll()?;
        }
        Ok(rolling)
    }

    fn append(path: &Path) -> io::Result<File> {
        OpenOptions::new().create(true).append(true).open(path)
    }

    fn backup(&self, n: usize) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(format!(".{n}"));
        PathBuf::from(name)
    }

    fn roll(&mut self) -> io::Result<()> {
        self.file.flush()?;
        if self.backups == 0 {
            self.file.set_len(0)?;
        } else {
            let oldest = self.backup(self.backups);
            if oldest.exists() {
                std::fs::remove_file(&oldest)?;
            }
            for n in (1..self.backups).rev() {
                let from = self.backup(n);
                if from.exists() {
                    std::fs::rename(&from, self.backup(n + 1))?;
                }
            }
            std::fs::rename(&self.path, self.backup(1))?;
            self.file = Self::append(&self.path)?;
        }
        self.written = 0;
        Ok(())
    }
}

impl Write for RollingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.max_bytes {
            self.roll()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}
