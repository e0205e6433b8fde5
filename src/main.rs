use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::mpsc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};

use rusty_analysis::pipeline::{
    ChannelObserver, FileOutcome, LogObserver, Observer, OutputTarget, PluginRegistry, Stage,
};
use rusty_analysis::{Controller, ProcessCatalog, ProgressEvent, Settings, SqliteConfigStore};
use rusty_analysis::{logging, units};

/// Run catalogued processing units over data files.
#[derive(Debug, Parser)]
#[command(name = "rusty-analysis", version, about, long_about = None)]
struct Cli {
    /// Settings file (YAML).
    #[arg(long, short, default_value = "settings.yaml")]
    settings: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List catalog entries.
    List,
    /// Run one catalog entry over a set of files.
    Run(RunArgs),
    /// Show or seed the parameters held in the config database.
    Params(ParamsArgs),
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Catalog entry id.
    entry: String,

    /// Data files to process.
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Write results here instead of a `processed/` folder beside each file.
    #[arg(long, short)]
    output: Option<PathBuf>,

    /// Row id echoed in every progress event.
    #[arg(long, default_value_t = 0)]
    row: u32,

    /// Configuration group to resolve parameters against.
    #[arg(long)]
    group: Option<String>,

    /// Print progress events as JSON lines.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct ParamsArgs {
    /// Group to list; defaults to the settings' group.
    #[arg(long)]
    group: Option<String>,

    /// List every (group, name) whose value equals this.
    #[arg(long, conflicts_with = "seed")]
    value: Option<String>,

    /// Replace the database contents with the inline `parameters`.
    #[arg(long)]
    seed: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            log::error!("{e:#}");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let settings = Settings::from_file(&cli.settings)?;
    if let Some(path) = logging::init(settings.log_dir.as_deref())? {
        eprintln!("Logging to {}", path.display());
    }

    match cli.command {
        Command::List => list(&settings),
        Command::Run(args) => run_entry(&settings, args),
        Command::Params(args) => params(&settings, args),
    }
}

fn load_catalog(settings: &Settings) -> Result<Arc<ProcessCatalog>> {
    let catalog = ProcessCatalog::load(&settings.catalog)
        .with_context(|| format!("loading catalog {}", settings.catalog.display()))?;
    log::info!("Loaded {} catalog entries", catalog.len());
    for id in settings.unnarrowed_entries(&catalog) {
        log::warn!("Entry '{id}' declares file roles but datafile_marker is empty; companion files will be processed as data files");
    }
    Ok(Arc::new(catalog))
}

fn list(settings: &Settings) -> Result<ExitCode> {
    let catalog = load_catalog(settings)?;
    for entry in catalog.entries() {
        println!(
            "{:<16} {:<28} {:<12} {}{}",
            entry.id,
            entry.caption,
            entry.kind,
            entry.binding,
            if entry.required_roles.is_empty() {
                String::new()
            } else {
                format!("  [{}]", entry.required_roles.join(", "))
            }
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn run_entry(settings: &Settings, args: RunArgs) -> Result<ExitCode> {
    let catalog = load_catalog(settings)?;
    let store = settings.open_store()?;

    let mut registry = PluginRegistry::new();
    units::register_builtin(&mut registry);

    let controller = Controller::new(catalog, Arc::new(registry), store)
        .with_config_group(args.group.unwrap_or_else(|| settings.config_group.clone()))
        .with_datafile_marker(settings.datafile_marker.clone())
        .with_failure_policy(settings.failure_policy)
        .with_runtime(settings.runtime.clone());

    let output = match args.output {
        Some(dir) => OutputTarget::Directory(dir),
        None => OutputTarget::Local,
    };

    let (tx, rx) = mpsc::channel();
    let channel = ChannelObserver::new(tx);
    let observer = move |event: &ProgressEvent| {
        LogObserver.notify(event);
        channel.notify(event);
    };
    controller.run_job(&args.entry, args.files, output, args.row, Arc::new(observer))?;

    let mut last = None;
    for event in rx {
        print_event(&event, args.json)?;
        if event.is_terminal() {
            last = Some(event.stage);
            break;
        }
    }

    for report in controller.wait() {
        if args.json {
            continue;
        }
        for (file, outcome) in &report.results {
            match outcome {
                FileOutcome::Completed(out) => {
                    for artifact in &out.artifacts {
                        println!("  {} -> {}", file.display(), artifact.display());
                    }
                }
                FileOutcome::NoData => println!("  {} (no data)", file.display()),
                FileOutcome::Failed(reason) => println!("  {} FAILED: {reason}", file.display()),
            }
        }
        if let Some(error) = &report.error {
            eprintln!("{}: {error}", report.job_name);
        }
    }

    match last {
        Some(Stage::Completed) => Ok(ExitCode::SUCCESS),
        Some(_) => Ok(ExitCode::FAILURE),
        None => bail!("run ended without a completion event"),
    }
}

fn print_event(event: &ProgressEvent, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
    } else {
        match event.stage {
            Stage::Failed => println!(
                "[row {}] {} failed after {} of {}",
                event.row_id, event.job_name, event.current, event.total
            ),
            _ => println!(
                "[row {}] {} {:>3}% ({}/{})",
                event.row_id, event.job_name, event.percent, event.current, event.total
            ),
        }
    }
    Ok(())
}

fn params(settings: &Settings, args: ParamsArgs) -> Result<ExitCode> {
    let Some(db) = &settings.config_db else {
        bail!("no config_db set in settings");
    };
    let store = SqliteConfigStore::open(db)
        .with_context(|| format!("opening config database {}", db.display()))?;

    if args.seed {
        let rows: Vec<(String, String, String)> = settings
            .parameters
            .iter()
            .flat_map(|(group, values)| {
                values
                    .iter()
                    .map(move |(name, value)| (group.clone(), name.clone(), value.clone()))
            })
            .collect();
        let count = store.replace_all(&rows)?;
        println!("Stored {count} parameters in {}", db.display());
        return Ok(ExitCode::SUCCESS);
    }

    if let Some(value) = &args.value {
        for (group, name) in store.names_for_value(value)? {
            println!("{group}\t{name}");
        }
        return Ok(ExitCode::SUCCESS);
    }

    let group = args.group.as_deref().unwrap_or(&settings.config_group);
    for (name, value) in store.entries(group)? {
        println!("{name} = {value}");
    }
    Ok(ExitCode::SUCCESS)
}
