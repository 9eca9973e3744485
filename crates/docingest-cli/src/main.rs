use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use docingest::config::schema::default_data_directory;
use docingest::{load_config, Config, Ingestor, Job, LogFormat};
use serde_json::json;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Ingest PDFs, images, Word and Excel files into a searchable store.
#[derive(Parser, Debug)]
#[command(name = "docingest", version, about)]
struct Cli {
    /// Config file (defaults to ~/.docingest/config.json when present).
    #[arg(long, global = true, env = "DOCINGEST_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, global = true, value_enum, default_value_t = LogFormatArg::Text)]
    log_format: LogFormatArg,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Scan a directory (the documents directory by default) and ingest
    /// every supported file, descending into subdirectories. Also resumes
    /// batches orphaned by a stopped process. Runs until the jobs finish.
    Ingest {
        root: Option<PathBuf>,
        /// Only scan the top level of the root.
        #[arg(long)]
        no_recursive: bool,
        /// Print a progress snapshot every 500 ms while the job runs.
        #[arg(long)]
        wait: bool,
    },
    /// Ingest files one at a time and print the stored documents.
    Upload {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Show a job. Jobs outlive the process only with `jobs.backend = "sqlite"`.
    Status { job_id: String },
    /// List known jobs, newest first.
    Jobs,
    /// Ranked search over indexed documents. An empty term lists the newest.
    Search {
        term: String,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Read or change persistent settings.
    Settings {
        #[command(subcommand)]
        command: SettingsCommand,
    },
}

#[derive(Subcommand, Debug)]
enum SettingsCommand {
    /// Print the current settings.
    Get,
    /// Validate and store a new documents directory.
    SetDocumentsDir { path: PathBuf },
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum LogFormatArg {
    Text,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Text => LogFormat::Text,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    docingest::logging::init(cli.log_format.into()).context("initializing logging")?;

    let config = resolve_config(cli.config.as_deref())?;
    let ingestor = Arc::new(Ingestor::open(config).context("opening the ingestion store")?);

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = Arc::clone(&interrupted);
        ctrlc::set_handler(move || {
            log::warn!("Interrupt received, finishing running tasks...");
            interrupted.store(true, Ordering::SeqCst);
        })
        .context("installing the Ctrl-C handler")?;
    }

    let outcome = run(&cli.command, &ingestor, &interrupted);
    ingestor.shutdown();
    outcome
}

fn run(command: &Commands, ingestor: &Ingestor, interrupted: &AtomicBool) -> Result<()> {
    match command {
        Commands::Ingest {
            root,
            no_recursive,
            wait,
        } => {
            let resumed = ingestor.recover_interrupted()?;
            match ingestor.reap_jobs() {
                Ok(0) => {}
                Ok(n) => log::info!("Reaped {} expired jobs", n),
                Err(e) => log::warn!("Could not reap expired jobs: {}", e),
            }

            let recursive = !no_recursive;
            let job_id = match root {
                Some(root) => ingestor.ingest_batch(root, recursive)?,
                None => ingestor.ingest_documents_dir(recursive)?,
            };
            eprintln!("Started job {}", job_id);
            for resumed_id in &resumed {
                eprintln!("Resumed an orphaned batch as job {}", resumed_id);
            }

            let job = wait_for_job(ingestor, &job_id, *wait, interrupted)?;
            // Workers live in this process; leaving now would discard the
            // resumed batches.
            for resumed_id in &resumed {
                wait_for_job(ingestor, resumed_id, false, interrupted)?;
            }
            print_json(&job)
        }
        Commands::Upload { files } => {
            let mut results = Vec::with_capacity(files.len());
            for path in files {
                results.push(upload_one(ingestor, path));
                if interrupted.load(Ordering::SeqCst) {
                    break;
                }
            }
            print_json(&results)
        }
        Commands::Status { job_id } => print_json(&ingestor.poll_status(job_id)?),
        Commands::Jobs => print_json(&ingestor.list_jobs()?),
        Commands::Search {
            term,
            limit,
            offset,
        } => print_json(&ingestor.search(term, *limit, *offset)?),
        Commands::Settings { command } => match command {
            SettingsCommand::Get => print_json(&json!({
                "documents_dir": ingestor.documents_dir()?,
                "data_directory": ingestor.config().data_directory(),
            })),
            SettingsCommand::SetDocumentsDir { path } => {
                let stored = ingestor.set_documents_dir(path)?;
                print_json(&json!({ "documents_dir": stored }))
            }
        },
    }
}

fn upload_one(ingestor: &Ingestor, path: &Path) -> serde_json::Value {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned());

    let outcome = std::fs::read(path)
        .with_context(|| format!("reading {}", path.display()))
        .and_then(|bytes| Ok(ingestor.ingest_one(&name, &bytes)?));

    match outcome {
        Ok(document) => json!({ "file": name, "document": document }),
        Err(e) => json!({ "file": name, "error": format!("{:#}", e) }),
    }
}

/// Polls until the job finishes or Ctrl-C arrives. Workers live in this
/// process, so returning earlier would abandon the job.
fn wait_for_job(
    ingestor: &Ingestor,
    job_id: &str,
    report_progress: bool,
    interrupted: &AtomicBool,
) -> Result<Job> {
    loop {
        let job = ingestor.poll_status(job_id)?;
        if job.is_finished() {
            return Ok(job);
        }
        if interrupted.load(Ordering::SeqCst) {
            ingestor.shutdown();
            return Ok(ingestor.poll_status(job_id)?);
        }
        if report_progress {
            eprintln!(
                "{} {:>3}% ({} of {}, {} failed)",
                job.state,
                job.progress_percent(),
                job.processed,
                job.total,
                job.failed
            );
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

fn resolve_config(explicit: Option<&Path>) -> Result<Config> {
    if let Some(path) = explicit {
        return load_config(path).with_context(|| format!("loading {}", path.display()));
    }
    let default_path = default_data_directory()
        .parent()
        .map(|dir| dir.join("config.json"))
        .filter(|p| p.exists());
    match default_path {
        Some(path) => load_config(&path).with_context(|| format!("loading {}", path.display())),
        None => Ok(Config::default()),
    }
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
