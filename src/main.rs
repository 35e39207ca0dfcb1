//! Mediasweep - media library duplicate scanner
//!
//! Scans the configured libraries and writes a report. Nothing is deleted
//! or renamed from here; the only mutating command is `revert`, which
//! needs `--yes`.

mod cli;

use anyhow::{Context, bail};
use tokio_util::sync::CancellationToken;

use mediasweep::Config;
use mediasweep::services::{
    BackupManager, Operation, ProgressConfig, ProgressHub, ProgressReporter, ReportWriter,
    ScanCoordinator, ScanProgress, Severity, init_tracing,
};

use crate::cli::{CliOptions, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let options = CliOptions::from_args();
    let config = Config::from_env()?;

    init_tracing(config.log_level, !options.plain_logs)?;
    tracing::info!("Starting mediasweep");

    match options.command {
        Command::Scan => scan(config).await,
        Command::ListBackups => list_backups(&config),
        Command::VerifyBackup(id) => verify_backup(&config, &id),
        Command::RevertBackup(id) => {
            if !options.confirmed {
                bail!("revert changes files on disk; rerun with --yes to confirm");
            }
            revert_backup(&config, &id).await
        }
    }
}

async fn scan(mut config: Config) -> anyhow::Result<()> {
    config.validate()?;
    config.check_libraries(false)?;
    tracing::info!(
        movie_roots = config.movie_paths.len(),
        tv_roots = config.tv_paths.len(),
        dry_run = config.safety.dry_run,
        "Configuration loaded"
    );

    let token = CancellationToken::new();
    let ctrl_c_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, stopping after the current file");
            ctrl_c_token.cancel();
        }
    });

    let (hub, events) = ProgressHub::new(256);
    let drain = tokio::spawn(async move {
        while let Ok(event) = events.recv_async().await {
            log_progress(&event);
        }
    });

    let report_dir = config.report_dir.clone();
    let report = ScanCoordinator::new(config).run(token, hub).await;
    drain.await.context("Progress drain task failed")?;

    let report = report?;
    let written = ReportWriter::new(report_dir).write(&report)?;
    tracing::info!(
        report = %written.json.display(),
        summary = %written.text.display(),
        "Report saved"
    );
    Ok(())
}

fn log_progress(event: &ScanProgress) {
    match event.severity {
        Severity::Error | Severity::Critical => tracing::error!(
            operation = %event.operation,
            stage = ?event.stage,
            message = %event.message,
            "Progress"
        ),
        Severity::Warn => tracing::warn!(
            operation = %event.operation,
            message = %event.message,
            "Progress"
        ),
        _ => tracing::debug!(
            operation = %event.operation,
            stage = ?event.stage,
            current = event.current,
            total = event.total,
            percentage = event.percentage,
            files = event.stats.files_processed,
            message = %event.message,
            "Progress"
        ),
    }
}

fn list_backups(config: &Config) -> anyhow::Result<()> {
    let manager = BackupManager::new(&config.backup_dir);
    for snapshot in manager.list_backups()? {
        println!(
            "{}  {:?}  {} files  {} bytes",
            snapshot.backup_id,
            snapshot.status(),
            snapshot.total_files,
            snapshot.total_size
        );
    }
    Ok(())
}

fn verify_backup(config: &Config, id: &str) -> anyhow::Result<()> {
    let manager = BackupManager::new(&config.backup_dir);
    let snapshot = manager.load_backup(id)?;
    let reporter = ProgressReporter::detached(Operation::VerifyBackup);
    let report = manager.verify_integrity(&snapshot, &reporter);
    for problem in &report.problems {
        println!("{:?}", problem);
    }
    println!("intact: {} ({} entries checked)", report.intact, report.checked);
    Ok(())
}

async fn revert_backup(config: &Config, id: &str) -> anyhow::Result<()> {
    let manager = BackupManager::new(&config.backup_dir);
    let (hub, events) = ProgressHub::new(64);
    let reporter = hub.reporter(Operation::RevertBackup, ProgressConfig::for_backup(config.log_level));
    hub.close();

    let drain = tokio::spawn(async move {
        while let Ok(event) = events.recv_async().await {
            log_progress(&event);
        }
    });

    let id = id.to_string();
    let summary = tokio::task::spawn_blocking(move || manager.revert_backup(&id, &reporter))
        .await
        .context("Revert task failed")?;
    drain.await.context("Progress drain task failed")?;

    let summary = summary?;
    println!(
        "restored: {}, unrecoverable deletions: {}, errors: {}",
        summary.restored,
        summary.unrecoverable,
        summary.errors.len()
    );
    Ok(())
}
