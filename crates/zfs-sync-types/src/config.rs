//! Validated value types used by job options
//!
//! Each wrapper rejects values the external tools would refuse, so a job that
//! passes validation never produces a malformed command line.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Memory given to the network buffer stage, in MiB
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BufferMemory(u32);

impl BufferMemory {
    /// Minimum buffer memory (1 MiB)
    pub const MIN: u32 = 1;
    /// Maximum buffer memory (64 GiB)
    pub const MAX: u32 = 64 * 1024;
    /// Default buffer memory (1 GiB)
    pub const DEFAULT: u32 = 1024;

    /// Create a new buffer memory size with validation
    pub fn new(mib: u32) -> Result<Self, String> {
        if mib < Self::MIN {
            Err(format!("Buffer memory {}M is below minimum {}M", mib, Self::MIN))
        } else if mib > Self::MAX {
            Err(format!("Buffer memory {}M exceeds maximum {}M", mib, Self::MAX))
        } else {
            Ok(Self(mib))
        }
    }

    /// Get the size in MiB
    pub fn mib(self) -> u32 {
        self.0
    }

    /// Render the size the way `mbuffer -m` expects it
    pub fn as_arg(self) -> String {
        if self.0 % 1024 == 0 {
            format!("{}G", self.0 / 1024)
        } else {
            format!("{}M", self.0)
        }
    }
}

impl Default for BufferMemory {
    fn default() -> Self {
        Self(Self::DEFAULT)
    }
}

impl fmt::Display for BufferMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_arg())
    }
}

impl FromStr for BufferMemory {
    type Err = String;

    /// Parse `512M`, `2G` or a bare number of MiB
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (digits, factor) = match trimmed.chars().last() {
            Some('G' | 'g') => (&trimmed[..trimmed.len() - 1], 1024),
            Some('M' | 'm') => (&trimmed[..trimmed.len() - 1], 1),
            _ => (trimmed, 1),
        };
        let value: u32 = digits
            .parse()
            .map_err(|_| format!("Invalid buffer memory '{}'", s))?;
        let mib = value
            .checked_mul(factor)
            .ok_or_else(|| format!("Buffer memory '{}' is too large", s))?;
        Self::new(mib)
    }
}

/// Number of managed snapshots retained per side
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct KeepCount(u32);

impl KeepCount {
    /// Minimum retention; the snapshot just transferred must survive
    pub const MIN: u32 = 1;
    /// Default retention
    pub const DEFAULT: u32 = 5;

    /// Create a new keep count with validation
    pub fn new(count: u32) -> Result<Self, String> {
        if count < Self::MIN {
            Err(format!("Keep count {} is below minimum {}", count, Self::MIN))
        } else {
            Ok(Self(count))
        }
    }

    /// Get the keep count value
    pub fn get(self) -> u32 {
        self.0
    }
}

impl Default for KeepCount {
    fn default() -> Self {
        Self(Self::DEFAULT)
    }
}

/// SSH connect timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConnectTimeout(u64);

impl ConnectTimeout {
    /// Default connect timeout in seconds
    pub const DEFAULT_SECS: u64 = 10;
    /// Maximum connect timeout in seconds
    pub const MAX_SECS: u64 = 600;

    /// Create a new connect timeout with validation
    pub fn from_secs(secs: u64) -> Result<Self, String> {
        if secs == 0 {
            Err("Connect timeout must be at least one second".to_string())
        } else if secs > Self::MAX_SECS {
            Err(format!(
                "Connect timeout {}s exceeds maximum {}s",
                secs,
                Self::MAX_SECS
            ))
        } else {
            Ok(Self(secs))
        }
    }

    /// Timeout in whole seconds, as passed to `ssh -o ConnectTimeout`
    pub fn secs(self) -> u64 {
        self.0
    }

    /// Timeout as a duration
    pub fn as_duration(self) -> Duration {
        Duration::from_secs(self.0)
    }
}

impl Default for ConnectTimeout {
    fn default() -> Self {
        Self(Self::DEFAULT_SECS)
    }
}

/// External programs used to build transfer pipelines
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ToolSet {
    /// Compressor preferred when present on a host
    pub parallel_compressor: String,
    /// Compressor used when the parallel one is missing
    pub serial_compressor: String,
    /// Progress meter
    pub meter: String,
    /// Flow-control buffer
    pub buffer: String,
    /// Block size passed to the buffer tool
    pub buffer_block_size: String,
}

impl Default for ToolSet {
    fn default() -> Self {
        Self {
            parallel_compressor: "pigz".to_string(),
            serial_compressor: "gzip".to_string(),
            meter: "pv".to_string(),
            buffer: "mbuffer".to_string(),
            buffer_block_size: "128k".to_string(),
        }
    }
}
