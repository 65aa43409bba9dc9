//! Per-job and per-run reports

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;
use zfs_sync_types::{ErrorKind, JobFailure, JobPhase, ReplicationJob, Topology};

use crate::prune::PruneStats;

/// What happened to one job
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    /// Job name
    pub job: String,
    /// Whether the job reached `Done`
    pub success: bool,
    /// Last phase worked on; `Done` on success
    pub phase: JobPhase,
    /// Transfer kind label, once decided
    pub kind: Option<String>,
    /// Topology of the job, once validated
    pub topology: Option<Topology>,
    /// Snapshot that was transferred
    pub transfer_snapshot: Option<String>,
    /// Estimated stream size
    pub estimated_bytes: Option<u64>,
    /// GUID of the renewed baseline
    pub baseline_guid: Option<u64>,
    /// Retention counters across both sides
    pub pruned: PruneStats,
    /// Wall-clock time for the job
    pub duration_ms: u64,
    /// Whether mutations were simulated
    pub dry_run: bool,
    /// Category of the fatal error
    pub error_kind: Option<ErrorKind>,
    /// Fatal error message
    pub error: Option<String>,
    /// Structured failure for callers
    #[serde(skip)]
    pub failure: Option<JobFailure>,
}

impl JobReport {
    /// Fresh report for a job about to start
    pub fn new<N: Into<String>>(job: N, dry_run: bool) -> Self {
        Self {
            job: job.into(),
            success: false,
            phase: JobPhase::Validating,
            kind: None,
            topology: None,
            transfer_snapshot: None,
            estimated_bytes: None,
            baseline_guid: None,
            pruned: PruneStats::default(),
            duration_ms: 0,
            dry_run,
            error_kind: None,
            error: None,
            failure: None,
        }
    }

    /// Report for a job whose definition could not be resolved
    pub fn rejected<N: Into<String>>(job: N, error: zfs_sync_types::Error, dry_run: bool) -> Self {
        let mut report = Self::new(job, dry_run);
        report.fail(error);
        report
    }

    pub(crate) fn start(&mut self, job: &ReplicationJob) {
        self.topology = Some(job.topology());
    }

    /// Record a fatal error at the current phase
    pub fn fail(&mut self, error: zfs_sync_types::Error) {
        self.success = false;
        self.error_kind = Some(error.kind());
        self.error = Some(error.to_string());
        self.failure = Some(JobFailure {
            job: self.job.clone(),
            phase: self.phase,
            error,
        });
    }
}

/// Outcome of a multi-job run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Identifier for correlating logs
    pub run_id: Uuid,
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// Whether mutations were simulated
    pub dry_run: bool,
    /// One report per attempted job, in order
    pub jobs: Vec<JobReport>,
}

impl RunSummary {
    /// Start an empty summary
    pub fn new(dry_run: bool) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            dry_run,
            jobs: Vec::new(),
        }
    }

    /// Jobs that finished
    pub fn succeeded(&self) -> usize {
        self.jobs.iter().filter(|j| j.success).count()
    }

    /// Jobs that failed
    pub fn failed(&self) -> usize {
        self.jobs.len() - self.succeeded()
    }

    /// Whether every job finished
    pub fn all_succeeded(&self) -> bool {
        self.jobs.iter().all(|j| j.success)
    }

    /// Process exit status for the run
    pub fn exit_code(&self) -> i32 {
        i32::from(!self.all_succeeded())
    }

    /// Failures with their job and phase
    pub fn failures(&self) -> impl Iterator<Item = &JobFailure> {
        self.jobs.iter().filter_map(|j| j.failure.as_ref())
    }
}
