//! ldbm-import - bulk import, reindex and DN upgrade for an LDAP storage backend

mod cli;
mod config;
mod entry;
mod error;
mod import;
mod logging;
mod memory;
mod schema;
mod store;
mod sysmem;

use std::io::IsTerminal;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr};
use tracing::debug;

use cli::{Cli, Commands};
use config::BackendConfig;
use import::wire::BulkImport;
use import::{ImportJob, JobOptions, Outcome};
use logging::LogConfig;

/// Parses the command line, runs the selected job and maps its outcome to an exit code.
///
/// Errors print a colored header followed by each cause in the chain and exit with 1.
/// A DN-upgrade dry run that finds work exits with 2, 3 or 4.
fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        owo_colors::set_override(false);
    }
    init_logging(&cli);

    let result = match &cli.command {
        Commands::Import(args) if args.online => {
            run_online(&cli, args.job_options(show_progress(&cli)))
        }
        Commands::Import(args) => run_job(&cli, args.job_options(show_progress(&cli))),
        Commands::Reindex(args) => run_job(&cli, args.job_options(show_progress(&cli))),
        Commands::UpgradeDn(args) => run_job(&cli, args.job_options(show_progress(&cli))),
        Commands::Completions(args) => {
            args.generate();
            Ok(0)
        }
    };

    match result {
        Ok(0) => {}
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!(
                "{}: {}",
                "error"
                    .if_supports_color(Stderr, |text| text.red())
                    .if_supports_color(Stderr, |text| text.bold()),
                e
            );
            for cause in e.chain().skip(1) {
                eprintln!(
                    "  {}: {}",
                    "caused by".if_supports_color(Stderr, |text| text.yellow()),
                    cause
                );
            }
            std::process::exit(1);
        }
    }
}

fn init_logging(cli: &Cli) {
    let mut config = LogConfig::for_cli(cli.verbose, cli.quiet).with_ansi(!cli.no_color);
    if let Some(format) = cli.log_format {
        config = config.with_format(format);
    }
    if let Some(path) = &cli.log_file {
        config = config.with_file(path.clone());
    }
    logging::init(config.with_env_overrides());
}

/// The spinner only makes sense on an interactive terminal.
fn show_progress(cli: &Cli) -> bool {
    !cli.quiet && !cli.no_progress && std::io::stderr().is_terminal()
}

fn load_config(cli: &Cli) -> Result<BackendConfig> {
    let config = BackendConfig::load(cli.config.as_deref()).with_context(|| match &cli.config {
        Some(path) => format!("failed to load configuration from {}", path.display()),
        None => "invalid default configuration".to_string(),
    })?;
    debug!(instance = %config.instance, db_dir = %cli.db_dir.display(), "configuration loaded");
    Ok(config)
}

fn abort_on_ctrlc(job: Arc<ImportJob>) -> Result<()> {
    ctrlc::set_handler(move || {
        eprintln!("\nReceived Ctrl+C, aborting...");
        job.abort();
    })
    .context("failed to install the Ctrl+C handler")
}

/// Run one job against the configured instance and report how it ended.
fn run_job(cli: &Cli, options: JobOptions) -> Result<i32> {
    let config = load_config(cli)?;
    let job = Arc::new(ImportJob::new(config, &cli.db_dir, options)?);
    let _lock = job
        .instance
        .lock()
        .with_context(|| format!("cannot claim instance '{}'", job.instance.name()))?;
    abort_on_ctrlc(Arc::clone(&job))?;

    let outcome = import::run(&job).with_context(|| format!("{} failed", job.opstr()))?;
    report(cli, outcome)
}

/// Import the LDIF inputs through an online bulk import, queueing one entry at a time.
fn run_online(cli: &Cli, options: JobOptions) -> Result<i32> {
    let config = load_config(cli)?;
    let instance = config.instance.clone();
    let inputs = options.input_files.clone();
    let bulk = BulkImport::start(config, &cli.db_dir, options)
        .with_context(|| format!("cannot start a bulk import into instance '{}'", instance))?;
    abort_on_ctrlc(bulk.shared_job())?;

    let fed = inputs.iter().try_for_each(|path| bulk.feed_ldif(path).map(|_| ()));
    let outcome = match fed {
        Ok(()) => bulk.done(),
        Err(e) => Err(bulk.abort_with(e)),
    }
    .context("Import failed")?;
    report(cli, outcome)
}

fn report(cli: &Cli, outcome: Outcome) -> Result<i32> {
    match outcome {
        Outcome::Complete(summary) => {
            if !cli.quiet {
                eprintln!(
                    "{}",
                    summary
                        .message()
                        .if_supports_color(Stderr, |text| text.green())
                );
            }
            Ok(0)
        }
        Outcome::NeedsDnUpgrade(need) => {
            eprintln!(
                "{}",
                need.describe()
                    .if_supports_color(Stderr, |text| text.yellow())
            );
            Ok(need.exit_code())
        }
    }
}
