//! Error types and handling for zfs-sync
//!
//! Errors are grouped by what they mean for the running job: connectivity,
//! capability, validation and pipeline failures abort the current job, while
//! prune failures are recovered locally and only counted.

/// Error severity level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ErrorSeverity {
    /// Low severity - logged and counted, the job continues
    Low,
    /// Medium severity - the job is aborted, sibling jobs continue
    Medium,
    /// High severity - the job is aborted and its configuration needs attention
    High,
    /// Critical severity - the whole run should stop
    Critical,
}

/// Main error type for zfs-sync operations
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {message}")]
    Io {
        /// Error message from the I/O operation
        message: String,
    },

    /// A host could not be reached
    #[error("Cannot reach host '{host}': {message}")]
    Connectivity {
        /// Host that could not be reached
        host: String,
        /// Transport error message
        message: String,
    },

    /// A required tool is missing on a host
    #[error("Required tool '{tool}' is not available on host '{host}'")]
    Capability {
        /// Host that is missing the tool
        host: String,
        /// Name of the missing tool
        tool: String,
    },

    /// Job definition or dataset state is not acceptable
    #[error("Validation failed: {message}")]
    Validation {
        /// Description of the validation failure
        message: String,
    },

    /// A command exited with a non-zero status
    #[error("Command '{command}' failed on '{host}' with exit code {exit_code}: {stderr}")]
    RemoteExecution {
        /// Host the command ran on
        host: String,
        /// Rendered command line
        command: String,
        /// Exit code reported by the command
        exit_code: i32,
        /// Captured standard error
        stderr: String,
    },

    /// A stage of the transfer pipeline failed
    #[error("Pipeline stage '{stage}' in leg {leg} failed with {}: {stderr_tail}", describe_exit(*exit_code))]
    PipelineStage {
        /// Index of the leg the stage belongs to
        leg: usize,
        /// Description of the failing stage
        stage: String,
        /// Exit code, or `None` when the process was killed by a signal
        exit_code: Option<i32>,
        /// Last bytes written to standard error by the stage
        stderr_tail: String,
    },

    /// A post-transfer check did not hold
    #[error("Postcondition failed: {message}")]
    Postcondition {
        /// Description of the violated postcondition
        message: String,
    },

    /// A snapshot could not be pruned
    #[error("Failed to prune '{snapshot}' on '{host}': {message}")]
    Prune {
        /// Host the snapshot lives on
        host: String,
        /// Full snapshot name
        snapshot: String,
        /// Failure message
        message: String,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config {
        /// Error message describing the configuration issue
        message: String,
    },

    /// Command output could not be parsed
    #[error("Failed to parse output: {message}")]
    Parse {
        /// Description of the parse failure
        message: String,
    },

    /// Operation cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// Operation timed out
    #[error("Operation timed out after {seconds} seconds")]
    Timeout {
        /// Number of seconds after which the operation timed out
        seconds: u64,
    },
}

fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "a signal".to_string(),
    }
}

/// Error kind for categorizing errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ErrorKind {
    /// I/O related errors
    Io,
    /// Host unreachable
    Connectivity,
    /// Missing tool
    Capability,
    /// Invalid job or dataset state
    Validation,
    /// Non-zero command exit
    RemoteExecution,
    /// Failed pipeline stage
    PipelineStage,
    /// Failed post-transfer verification
    Postcondition,
    /// Failed snapshot pruning
    Prune,
    /// Configuration errors
    Config,
    /// Output parsing errors
    Parse,
    /// Cancellation
    Cancelled,
    /// Timeout
    Timeout,
}

impl Error {
    /// Get the error kind
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io { .. } => ErrorKind::Io,
            Self::Connectivity { .. } => ErrorKind::Connectivity,
            Self::Capability { .. } => ErrorKind::Capability,
            Self::Validation { .. } => ErrorKind::Validation,
            Self::RemoteExecution { .. } => ErrorKind::RemoteExecution,
            Self::PipelineStage { .. } => ErrorKind::PipelineStage,
            Self::Postcondition { .. } => ErrorKind::Postcondition,
            Self::Prune { .. } => ErrorKind::Prune,
            Self::Config { .. } => ErrorKind::Config,
            Self::Parse { .. } => ErrorKind::Parse,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Timeout { .. } => ErrorKind::Timeout,
        }
    }

    /// Get the error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Prune { .. } | Self::Parse { .. } => ErrorSeverity::Low,
            Self::Io { .. }
            | Self::Connectivity { .. }
            | Self::RemoteExecution { .. }
            | Self::PipelineStage { .. }
            | Self::Timeout { .. } => ErrorSeverity::Medium,
            Self::Capability { .. }
            | Self::Validation { .. }
            | Self::Postcondition { .. }
            | Self::Config { .. } => ErrorSeverity::High,
            Self::Cancelled => ErrorSeverity::Critical,
        }
    }

    /// Whether this error aborts the job it occurred in
    pub fn is_job_fatal(&self) -> bool {
        self.severity() >= ErrorSeverity::Medium
    }

    /// Create a new connectivity error
    pub fn connectivity<H: Into<String>, S: Into<String>>(host: H, message: S) -> Self {
        Self::Connectivity {
            host: host.into(),
            message: message.into(),
        }
    }

    /// Create a new capability error
    pub fn capability<H: Into<String>, S: Into<String>>(host: H, tool: S) -> Self {
        Self::Capability {
            host: host.into(),
            tool: tool.into(),
        }
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a new postcondition error
    pub fn postcondition<S: Into<String>>(message: S) -> Self {
        Self::Postcondition {
            message: message.into(),
        }
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a new parse error
    pub fn parse<S: Into<String>>(message: S) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Self::Io {
            message: error.to_string(),
        }
    }
}
