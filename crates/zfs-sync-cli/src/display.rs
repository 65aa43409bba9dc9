//! Terminal output for the zfs-sync CLI

use std::time::Duration;

use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use zfs_sync_engine::{JobReport, RunSummary};
use zfs_sync_types::{Endpoint, ReplicationJob, SnapshotInfo};

/// Print the per-job results and totals of a run
pub fn print_run_summary(summary: &RunSummary) {
    println!();
    println!("{}", style("Replication Summary:").bold().underlined());
    for report in &summary.jobs {
        print_job_report(report);
    }

    println!();
    println!(
        "  Jobs: {} succeeded, {}",
        style(summary.succeeded()).green(),
        if summary.failed() > 0 {
            style(format!("{} failed", summary.failed())).red()
        } else {
            style(format!("{} failed", summary.failed())).green()
        }
    );
    if summary.dry_run {
        println!("  {}", style("Dry run: no changes were made").yellow());
    }
    println!("  Run id: {}", style(summary.run_id).dim());
}

fn print_job_report(report: &JobReport) {
    let duration = format_duration(Duration::from_millis(report.duration_ms));
    if report.success {
        println!(
            "  {} {} {} in {}",
            style("✓").green().bold(),
            style(&report.job).bold(),
            style(report.kind.as_deref().unwrap_or("-")).cyan(),
            style(duration).blue()
        );
        if let Some(bytes) = report.estimated_bytes {
            println!("      Estimated size: {}", style(format_bytes(bytes)).green());
        }
        if report.pruned.removed > 0 || report.pruned.failed > 0 {
            println!(
                "      Pruned: {} removed, {} failed",
                style(report.pruned.removed).green(),
                if report.pruned.failed > 0 {
                    style(report.pruned.failed).red()
                } else {
                    style(report.pruned.failed).green()
                }
            );
        }
    } else {
        println!(
            "  {} {} failed during {}",
            style("✗").red().bold(),
            style(&report.job).bold(),
            style(report.phase).yellow()
        );
        if let Some(error) = &report.error {
            println!("      {}", style(error).red());
        }
    }
}

/// One line per job with its endpoints and options
pub fn print_job(job: &ReplicationJob) {
    println!(
        "  {} {}",
        style("•").blue().bold(),
        style(&job.name).bold()
    );
    println!(
        "      {} {} {}",
        style(&job.source).cyan(),
        style("→").green(),
        style(&job.destination).cyan()
    );
    let options = &job.options;
    println!(
        "      prefix={} keep={} recursive={} compression={} resume={} direct={} buffer={}",
        job.prefix,
        options.keep.get(),
        options.recursive,
        options.compression,
        options.resume_support,
        options.direct_transfer,
        options.buffer_memory
    );
}

/// Snapshot listing, newest first
pub fn print_snapshots(endpoint: &Endpoint, snapshots: &[(String, SnapshotInfo)]) {
    println!(
        "{} {}",
        style("Snapshots of").bold(),
        style(endpoint).cyan()
    );
    if snapshots.is_empty() {
        println!("  {}", style("none").dim());
        return;
    }
    for (path, snapshot) in snapshots {
        let created = snapshot
            .created_at()
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {}  {}  {}",
            style(created).dim(),
            style(format!("{:>20}", snapshot.guid)).dim(),
            path
        );
    }
}

/// Format bytes in human-readable format
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    #[allow(clippy::cast_precision_loss)]
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format duration in human-readable format
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{:.2}s", duration.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

/// Display a warning message with proper formatting
pub fn display_warning(message: &str) {
    eprintln!("{} {}", style("⚠").yellow().bold(), style(message).yellow());
}

/// Display a success message with proper formatting
pub fn display_success(message: &str) {
    println!("{} {}", style("✓").green().bold(), style(message).green());
}

/// Display an info message with proper formatting
pub fn display_info(message: &str) {
    println!("{} {}", style("ℹ").blue().bold(), style(message).blue());
}

/// Spinner for waits outside the transfer itself
pub fn create_spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.blue} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, "0.00 B")]
    #[case(1536, "1.50 KB")]
    #[case(5 * 1024 * 1024 * 1024, "5.00 GB")]
    fn test_format_bytes(#[case] bytes: u64, #[case] expected: &str) {
        assert_eq!(format_bytes(bytes), expected);
    }

    #[rstest]
    #[case(Duration::from_millis(1500), "1.50s")]
    #[case(Duration::from_secs(125), "2m 5s")]
    #[case(Duration::from_secs(3 * 3600 + 61), "3h 1m 1s")]
    fn test_format_duration(#[case] duration: Duration, #[case] expected: &str) {
        assert_eq!(format_duration(duration), expected);
    }
}
