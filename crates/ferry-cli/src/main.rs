mod selfupdate;
mod signal;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use ferry_core::config::{self, ConfigDocument};
use ferry_core::exec::CancelToken;
use ferry_core::metrics::Metrics;
use ferry_core::notify::{JobReport, LogNotifier, Notifier, WebhookNotifier};
use ferry_core::runner::Runner;

const EXIT_OK: i32 = 0;
const EXIT_FATAL: i32 = 1;
const EXIT_JOB_ERRORS: i32 = 2;

#[derive(Parser)]
#[command(
    name = "ferry",
    version,
    about = "Scheduled backup creation, rotation and multi-storage delivery",
    after_help = "\
Configuration file lookup order:
  1. --config <path>          (explicit flag)
  2. $FERRY_CONFIG            (environment variable)
  3. ./ferry.yaml             (project)
  4. /etc/ferry/ferry.yaml    (system)

Values in the config may reference the environment as ${VAR} or
${VAR:-default}."
)]
struct Cli {
    /// Path to configuration file (overrides FERRY_CONFIG and the default
    /// search)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbosity level (-v, -vv); overrides the config loglevel
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run all enabled jobs once, or a single job by name
    Start { job: Option<String> },

    /// Print a starter configuration to stdout
    Generate,

    /// Validate the configuration and report per job
    #[command(name = "test-cfg", alias = "testCfg")]
    TestCfg,

    /// Replace this binary with the latest release asset
    SelfUpdate,
}

fn main() {
    std::process::exit(real_main());
}

fn real_main() -> i32 {
    let cli = Cli::parse();

    // `generate` needs no config at all.
    if let Commands::Generate = cli.command {
        print!("{}", config::config_template());
        return EXIT_OK;
    }

    let Some(config_path) = config::resolve_config_path(cli.config.as_deref()) else {
        eprintln!("Error: no configuration file found.");
        eprintln!("Searched:");
        for path in config::DEFAULT_CONFIG_PATHS {
            eprintln!("  {path}");
        }
        eprintln!();
        eprintln!("Run `ferry generate > ferry.yaml` to create one.");
        return EXIT_FATAL;
    };

    let doc = match config::load(&config_path) {
        Ok(doc) => doc,
        Err(e) => {
            eprintln!("Error: {e}");
            return EXIT_FATAL;
        }
    };

    let _log_guard = init_logging(&doc, cli.verbose);
    tracing::info!(config = %config_path.display(), "configuration loaded");

    match cli.command {
        Commands::Start { job } => run_start(&doc, job.as_deref()),
        Commands::TestCfg => run_test_cfg(&doc),
        Commands::SelfUpdate => match selfupdate::run() {
            Ok(()) => EXIT_OK,
            Err(e) => {
                eprintln!("Error: self-update failed: {e}");
                EXIT_FATAL
            }
        },
        Commands::Generate => unreachable!(),
    }
}

fn init_logging(doc: &ConfigDocument, verbose: u8) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let level = match verbose {
        0 => doc.loglevel.as_str(),
        1 => "debug",
        _ => "trace",
    };
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    };

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(filter());

    // The file sink is bounded and lossy: a blocked writer drops lines
    // rather than stalling producers; dropped lines are counted by the
    // worker guard.
    let (file_layer, guard) = match &doc.logfile {
        Some(path) => {
            let appender = tracing_appender::rolling::never(
                path.parent().unwrap_or_else(|| std::path::Path::new(".")),
                path.file_name().unwrap_or_else(|| std::ffi::OsStr::new("ferry.log")),
            );
            let (writer, guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
                .lossy(true)
                .finish(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(filter());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .init();
    guard
}

fn run_test_cfg(doc: &ConfigDocument) -> i32 {
    match config::build_jobs(doc) {
        Ok(jobs) => {
            println!("configuration OK: {} job(s)", jobs.len());
            for job in &jobs {
                println!(
                    "  {} ({}, {} target(s), {} storage(s))",
                    job.name,
                    job.kind,
                    job.targets.len(),
                    job.storages.len()
                );
            }
            EXIT_OK
        }
        Err(e) => {
            eprintln!("configuration INVALID: {e}");
            EXIT_FATAL
        }
    }
}

fn build_notifiers(doc: &ConfigDocument) -> Vec<Box<dyn Notifier>> {
    let mut notifiers: Vec<Box<dyn Notifier>> = vec![Box::new(LogNotifier)];
    if !doc.notifications.webhooks.is_empty() {
        notifiers.push(Box::new(WebhookNotifier::new(
            doc.notifications.webhooks.clone(),
        )));
    }
    notifiers
}

fn run_start(doc: &ConfigDocument, only_job: Option<&str>) -> i32 {
    let mut jobs = match config::build_jobs(doc) {
        Ok(jobs) => jobs,
        Err(e) => {
            eprintln!("Error: {e}");
            return EXIT_FATAL;
        }
    };

    if let Some(name) = only_job {
        jobs.retain(|j| j.name == name);
        if jobs.is_empty() {
            eprintln!("Error: no job named '{name}'");
            return EXIT_FATAL;
        }
    }

    signal::listen_for_shutdown();
    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        std::thread::spawn(move || loop {
            if signal::shutdown_requested() {
                tracing::warn!("shutdown requested, cancelling in-flight work");
                cancel.cancel();
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(200));
        });
    }

    let metrics = Metrics::new();
    let notifiers = build_notifiers(doc);
    let mut runner = Runner::new(&metrics, &cancel);
    let mut had_errors = false;

    for job in &mut jobs {
        let name = job.name.clone();
        match runner.run_job(job) {
            Ok(None) => {
                let report = JobReport::success(&doc.server_name, &doc.project_name, &name);
                for n in &notifiers {
                    n.notify(&report);
                }
            }
            Ok(Some(errs)) => {
                had_errors = true;
                let details = errs.errors().iter().map(|e| e.to_string()).collect();
                let report =
                    JobReport::failure(&doc.server_name, &doc.project_name, &name, details);
                for n in &notifiers {
                    n.notify(&report);
                }
            }
            Err(fatal) => {
                eprintln!("Error: job '{name}': {fatal}");
                metrics.run_finished(false, chrono_now());
                write_metrics(doc, &metrics);
                return EXIT_FATAL;
            }
        }
    }

    metrics.run_finished(!had_errors, chrono_now());
    write_metrics(doc, &metrics);

    if had_errors {
        EXIT_JOB_ERRORS
    } else {
        EXIT_OK
    }
}

fn chrono_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn write_metrics(doc: &ConfigDocument, metrics: &Metrics) {
    if !doc.metrics.enabled {
        return;
    }
    if let Some(path) = &doc.metrics.textfile_path {
        metrics.write_textfile(path);
    }
}
