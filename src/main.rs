use anyhow::Result;
use clap::Parser;
use indicatif::MultiProgress;
use std::io::Write;
use std::process;
use std::sync::Arc;
use tenant_migrator::cli::{self, Cli, Commands, ProgressReporter, Services};
use tenant_migrator::config::Config;
use tenant_migrator::error::MigrationError;
use tenant_migrator::job::JobOutcome;
use tenant_migrator::store::{JobRecord, JobStore};
use tenant_migrator::worker::WorkerPool;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// A writer that prints through MultiProgress to avoid progress bar conflicts
#[derive(Clone)]
struct MultiProgressWriter {
    multi: Arc<MultiProgress>,
    buffer: Arc<std::sync::Mutex<Vec<u8>>>,
}

impl MultiProgressWriter {
    fn new(multi: Arc<MultiProgress>) -> Self {
        Self {
            multi,
            buffer: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }
}

impl Write for MultiProgressWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Ok(mut buffer) = self.buffer.lock() {
            buffer.extend_from_slice(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if let Ok(mut buffer) = self.buffer.lock() {
            if !buffer.is_empty() {
                let msg = String::from_utf8_lossy(&buffer);
                let msg = msg.trim_end_matches('\n');
                if !msg.is_empty() {
                    let _ = self.multi.println(msg);
                }
                buffer.clear();
            }
        }
        Ok(())
    }
}

impl Drop for MultiProgressWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// MakeWriter implementation for tracing
#[derive(Clone)]
struct MultiProgressMakeWriter {
    multi: Arc<MultiProgress>,
}

impl<'a> MakeWriter<'a> for MultiProgressMakeWriter {
    type Writer = MultiProgressWriter;

    fn make_writer(&'a self) -> Self::Writer {
        MultiProgressWriter::new(Arc::clone(&self.multi))
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        display_error(&e);
        process::exit(1);
    }
}

async fn run() -> Result<()> {
    // Install default crypto provider for rustls
    #[cfg(not(windows))]
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install default crypto provider"))?;

    #[cfg(windows)]
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install default crypto provider"))?;

    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tenant_migrator=debug,info"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tenant_migrator=info,warn"))
    };

    // Logs print above progress bars
    let multi_progress = Arc::new(MultiProgress::new());
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(MultiProgressMakeWriter {
                multi: Arc::clone(&multi_progress),
            })
            .with_target(false)
            .init();
    }

    match cli.command {
        Commands::InitConfig { output, force } => {
            if output.exists() && !force {
                return Err(MigrationError::ConfigError(format!(
                    "Configuration file already exists at {:?}. Use --force to overwrite.",
                    output
                ))
                .into());
            }

            Config::create_example(&output).await?;

            println!("Created example configuration file at: {:?}", output);
            println!("\nKey settings to review:");
            println!("  - [[tenants]]: app registration of every tenant jobs refer to");
            println!("  - concurrency: concurrent runs per workload and worker slots");
            println!("  - execution.failure_policy: 'report' or 'fail_job'");
            println!("  - state.directory: where jobs, checkpoints, queue and snapshots live");
            Ok(())
        }

        command => {
            let config = Config::load(&cli.config).await?;
            tokio::fs::create_dir_all(&config.state.directory).await?;
            let services = Services::new(config);
            execute(&services, command, multi_progress).await
        }
    }
}

async fn execute(services: &Services, command: Commands, multi_progress: Arc<MultiProgress>) -> Result<()> {
    match command {
        Commands::Run { job } => {
            let message = cli::load_message(&job).await?;
            tracing::info!(job = %message.job_id, "Running job in the foreground");

            let reporter = Arc::new(ProgressReporter::with_multi_progress((*multi_progress).clone()));
            let outcome = cli::run_job(services, message, reporter).await?;
            print_outcome(&outcome);
            Ok(())
        }

        Commands::Worker { slots } => {
            let slots = slots.unwrap_or(services.config.concurrency.worker_slots);
            let recovered = services.queue.recover().await?;
            if recovered > 0 {
                tracing::warn!("Returned {} unacknowledged deliveries to the queue", recovered);
            }

            let (runner, _) = services.runner()?;
            let runner = runner.with_queue(services.queue.clone());
            let pool = Arc::new(WorkerPool::new(
                services.queue.clone(),
                services.jobs.clone(),
                Arc::new(runner),
                slots,
            ));

            let shutdown = CancellationToken::new();
            let trigger = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Shutting down, running jobs pause at their next page boundary");
                    trigger.cancel();
                }
            });

            pool.run(shutdown).await?;
            Ok(())
        }

        Commands::Enqueue { job } => {
            let message = cli::load_message(&job).await?;
            let job_id = message.job_id.clone();
            cli::enqueue(services, message).await?;
            println!("Queued job {}", job_id);
            Ok(())
        }

        Commands::Pause { job_id } => {
            cli::pause(services, &job_id).await?;
            println!("Pause requested for job {}", job_id);
            Ok(())
        }

        Commands::Resume { job_id } => {
            cli::resume(services, &job_id).await?;
            println!("Queued job {} again", job_id);
            Ok(())
        }

        Commands::Cancel { job_id } => {
            let status = cli::cancel(services, &job_id).await?;
            if status == tenant_migrator::job::JobStatus::Running {
                println!("Cancel requested for running job {}", job_id);
            } else {
                println!("Job {} cancelled", job_id);
            }
            Ok(())
        }

        Commands::Status { job_id, detailed } => {
            let records = match job_id {
                Some(job_id) => vec![tenant_migrator::store::require(&*services.jobs, &job_id).await?],
                None => services.jobs.list().await?,
            };
            if records.is_empty() {
                println!("No jobs found in {:?}", services.config.state.jobs_dir());
            }
            for record in &records {
                print_record(record, detailed);
                if let Some(percent) = services.queue.progress(record.job_id()).await? {
                    println!("Reported progress: {}%", percent);
                }
            }
            Ok(())
        }

        Commands::Checkpoints { job_id, clear } => {
            let checkpoints = cli::checkpoints(services, &job_id, clear).await?;
            if checkpoints.is_empty() {
                println!("No checkpoints for job {}", job_id);
            }
            for checkpoint in &checkpoints {
                println!(
                    "{:<6} {:<60} {:>5} pages  {:?}  {}",
                    checkpoint.key.workload.as_str(),
                    checkpoint.key.subject_id,
                    checkpoint.pages_completed,
                    checkpoint.cursor,
                    checkpoint.updated_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
            if clear {
                println!("Cleared {} checkpoints", checkpoints.len());
            }
            Ok(())
        }

        Commands::InitConfig { .. } => Ok(()),
    }
}

fn print_outcome(outcome: &JobOutcome) {
    println!("\n========================================");
    println!("Job {}", outcome.job_id);
    println!("========================================");
    match (outcome.status, outcome.stopped) {
        (Some(status), _) => println!("Status: {}", status),
        (None, Some(reason)) => println!("Stopped: {:?}", reason),
        (None, None) => println!("Status: unknown"),
    }
    println!("Items processed: {}", outcome.processed_items);
    println!("Items failed: {}", outcome.failed_items);
    println!("Bytes transferred: {}", outcome.bytes_transferred);
    if let Some(error) = &outcome.error {
        println!("Error: {}", error);
    }
    for error in outcome.errors().take(20) {
        println!("  - [{:?}] {}: {}", error.level, error.item_id, error.message);
    }
    println!("========================================");
}

fn print_record(record: &JobRecord, detailed: bool) {
    println!("\n========================================");
    println!("Job {} ({})", record.job_id(), record.status);
    println!("========================================");
    println!("Kind: {:?}", record.message.kind);
    println!("Source tenant: {}", record.message.source_tenant);
    if let Some(destination) = &record.message.destination_tenant {
        println!("Destination tenant: {}", destination);
    }
    println!("Progress: {}%", record.progress_percent);
    println!("Items processed: {}", record.counters.processed_items);
    println!("Items failed: {}", record.counters.failed_items);
    println!("Bytes transferred: {}", record.counters.bytes_transferred);
    println!("Updated: {}", record.updated_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(reason) = record.stopped {
        println!("Last run stopped: {:?}", reason);
    }

    if detailed {
        println!("\n--- Workloads ---");
        for summary in &record.workloads {
            println!(
                "{}: {} processed, {} failed{}",
                summary.workload,
                summary.result.processed,
                summary.result.failed,
                if summary.setup_failed { " (setup failed)" } else { "" }
            );
            for error in &summary.result.errors {
                println!("  - [{:?}] {}: {}", error.level, error.item_id, error.message);
            }
            if summary.result.errors_dropped > 0 {
                println!("  ... and {} more", summary.result.errors_dropped);
            }
        }
    }
}

/// Display error with context
fn display_error(error: &anyhow::Error) {
    eprintln!("Error: {}", error);

    let mut cause = error.source();
    while let Some(e) = cause {
        eprintln!("  Caused by: {}", e);
        cause = e.source();
    }

    if let Some(err) = error.downcast_ref::<MigrationError>() {
        match err {
            MigrationError::CredentialError(_) | MigrationError::Unauthorized(_) => {
                eprintln!("\nHint: Check the [[tenants]] entries in your configuration.");
                eprintln!("      The app registration needs application permissions on both tenants.");
            }
            MigrationError::ConfigError(_) => {
                eprintln!("\nHint: Check your configuration file for errors.");
                eprintln!("      Run: tenant-migrator init-config --force");
            }
            MigrationError::StateError(_) => {
                eprintln!("\nHint: Run `tenant-migrator status` to see the job's current state.");
            }
            _ => {}
        }
    }
}
