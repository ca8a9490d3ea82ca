use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use log::{error, info, warn};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use scanbind::config::{self, Config};
use scanbind::{
    CredentialScanner, Database, EventBus, JobOrchestrator, KeySelectionStrategy, OutputDirs,
    PageDispatcher, PdfWriter, PeriodClock, QuotaAllocator, ScanbindError, VisionClient,
};

#[derive(Parser)]
#[command(name = "scanbind", version, about = "Batch OCR of scanned folders into searchable PDFs")]
struct Cli {
    /// Config file; defaults apply when it does not exist.
    #[arg(long, global = true, env = "SCANBIND_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a job over the given folders and run it to the end.
    Run {
        #[arg(long = "folder", required = true)]
        folders: Vec<PathBuf>,
        #[arg(long, default_value = "MAX_REMAINING")]
        strategy: KeySelectionStrategy,
        #[arg(long, default_value_t = 1)]
        parallelism: usize,
    },
    /// Restart a stopped or failed job, skipping finished folders.
    Resume { job_id: String },
    /// List all jobs, newest first.
    Jobs,
    /// Show one job with its folders.
    Job { job_id: String },
    /// Show credentials with their usage this period.
    Credentials,
    /// Manually set the used units of a credential for this period.
    AdjustUsage {
        credential_id: String,
        #[arg(long)]
        used: i64,
        #[arg(long)]
        reason: String,
    },
    /// Show the usage audit trail of a credential.
    Audit { credential_id: String },
}

struct App {
    allocator: Arc<QuotaAllocator>,
    orchestrator: JobOrchestrator,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(json: bool) {
    if let Err(e) = tracing_log::LogTracer::init() {
        eprintln!("Failed to bridge log records: {}", e);
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };
    if let Err(e) = result {
        eprintln!("Failed to install log subscriber: {}", e);
    }
}

fn run(cli: Cli) -> Result<(), ScanbindError> {
    let config_path = cli.config.unwrap_or_else(default_config_path);
    let config = config::load_config(&config_path)?;
    let app = bootstrap(&config)?;

    match cli.command {
        Command::Run {
            folders,
            strategy,
            parallelism,
        } => {
            let job_id = app.orchestrator.create(&folders, strategy, parallelism)?;
            run_to_end(&app.orchestrator, &job_id)
        }
        Command::Resume { job_id } => run_to_end(&app.orchestrator, &job_id),
        Command::Jobs => print_json(&app.orchestrator.list()?),
        Command::Job { job_id } => print_json(&app.orchestrator.get(&job_id)?),
        Command::Credentials => print_json(&app.allocator.list_summaries()?),
        Command::AdjustUsage {
            credential_id,
            used,
            reason,
        } => print_json(&app.allocator.adjust_usage(&credential_id, used, &reason)?),
        Command::Audit { credential_id } => print_json(&app.allocator.audit_log(&credential_id)?),
    }
}

fn default_config_path() -> PathBuf {
    config::expand_home(Path::new("~/.scanbind/scanbind.json"))
}

/// Creates directories, opens state, recovers from a crash, then rescans
/// the credential directories.
fn bootstrap(config: &Config) -> Result<App, ScanbindError> {
    let output = OutputDirs {
        pdf_directory: config.pdf_directory(),
        report_directory: config.report_directory(),
    };
    let database_path = config.database_path();
    let mut directories = vec![output.pdf_directory.clone(), output.report_directory.clone()];
    directories.extend(database_path.parent().map(Path::to_path_buf));
    for dir in &directories {
        std::fs::create_dir_all(dir).map_err(|e| ScanbindError::Io {
            path: dir.clone(),
            source: e,
        })?;
    }

    let db = Database::open(&database_path)?;

    let clock = PeriodClock::from_name(&config.credentials.timezone)?;
    let allocator = Arc::new(QuotaAllocator::new(
        db.clone(),
        clock,
        config.credentials.monthly_cap,
    ));
    let engine = VisionClient::new(
        config.ocr.endpoint.clone(),
        config.ocr.language_hints.clone(),
        Duration::from_secs(config.ocr.timeout_secs),
    )?;
    let events = EventBus::default();
    let dispatcher = PageDispatcher::new(
        db.clone(),
        Arc::clone(&allocator),
        Arc::new(engine),
        events.clone(),
    );
    let orchestrator = JobOrchestrator::new(
        db.clone(),
        dispatcher,
        PdfWriter::new(config.font_candidates()),
        events,
        output,
    );
    orchestrator.recover_after_restart()?;

    let scan = CredentialScanner::new(config.credential_directories()).scan_and_sync(&db)?;
    info!(
        "Credential scan: {} active, {} skipped",
        scan.active, scan.skipped
    );

    Ok(App {
        allocator,
        orchestrator,
    })
}

/// Starts `job_id`, relays its events to the log and blocks until it ends.
/// Ctrl-C requests a cooperative stop.
fn run_to_end(orchestrator: &JobOrchestrator, job_id: &str) -> Result<(), ScanbindError> {
    spawn_event_logger(orchestrator.events());

    let handler_orchestrator = orchestrator.clone();
    let handler_job = job_id.to_string();
    if let Err(e) = ctrlc::set_handler(move || {
        warn!("Interrupt received, stopping job {}", handler_job);
        if let Err(e) = handler_orchestrator.stop(&handler_job) {
            error!("Failed to stop job {}: {}", handler_job, e);
        }
    }) {
        warn!("Failed to install Ctrl-C handler: {}", e);
    }

    orchestrator.start(job_id)?;
    orchestrator.wait(job_id);
    print_json(&orchestrator.get(job_id)?)
}

fn spawn_event_logger(events: &EventBus) {
    let mut receiver = events.subscribe();
    let spawned = std::thread::Builder::new()
        .name("scanbind-events".to_string())
        .spawn(move || loop {
            match receiver.blocking_recv() {
                Ok(event) => info!("[{}] {} {}", event.event_type, event.job_id, event.message),
                Err(RecvError::Lagged(skipped)) => warn!("Event log skipped {} events", skipped),
                Err(RecvError::Closed) => break,
            }
        });
    if let Err(e) = spawned {
        warn!("Failed to start event logger: {}", e);
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), ScanbindError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
