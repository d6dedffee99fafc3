//! Worker count selection

use std::fmt;
use std::thread;

use serde::{Deserialize, Serialize};

/// Largest pool the auto-sizer or configuration may request
pub const MAX_WORKERS: usize = 4;

const GIB: u64 = 1024 * 1024 * 1024;

/// Requested worker count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "WorkerCountRepr", into = "WorkerCountRepr")]
pub enum WorkerCount {
    /// Size from host capabilities
    #[default]
    Auto,
    Fixed(usize),
}

impl WorkerCount {
    /// Resolves to a concrete count in `1..=MAX_WORKERS`.
    #[must_use]
    pub fn resolve(self, host: &HostCapabilities) -> usize {
        match self {
            WorkerCount::Auto => host.recommended_workers(),
            WorkerCount::Fixed(n) => n.clamp(1, MAX_WORKERS),
        }
    }
}

impl fmt::Display for WorkerCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerCount::Auto => f.write_str("auto"),
            WorkerCount::Fixed(n) => write!(f, "{n}"),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum WorkerCountRepr {
    Count(usize),
    Keyword(String),
}

impl TryFrom<WorkerCountRepr> for WorkerCount {
    type Error = String;

    fn try_from(repr: WorkerCountRepr) -> Result<Self, Self::Error> {
        match repr {
            WorkerCountRepr::Count(n) if (1..=MAX_WORKERS).contains(&n) => Ok(Self::Fixed(n)),
            WorkerCountRepr::Count(n) => Err(format!(
                "worker count {n} is outside 1..={MAX_WORKERS}"
            )),
            WorkerCountRepr::Keyword(word) if word.eq_ignore_ascii_case("auto") => Ok(Self::Auto),
            WorkerCountRepr::Keyword(word) => Err(format!(
                "worker count must be a number or \"auto\", got {word:?}"
            )),
        }
    }
}

impl From<WorkerCount> for WorkerCountRepr {
    fn from(count: WorkerCount) -> Self {
        match count {
            WorkerCount::Auto => WorkerCountRepr::Keyword("auto".to_string()),
            WorkerCount::Fixed(n) => WorkerCountRepr::Count(n),
        }
    }
}

/// Host resources used for auto-sizing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostCapabilities {
    pub cores: usize,
    /// Total physical memory, when the platform reports it
    pub memory_bytes: Option<u64>,
}

impl HostCapabilities {
    /// Probes the current host.
    #[must_use]
    pub fn detect() -> Self {
        Self {
            cores: thread::available_parallelism().map_or(1, |n| n.get()),
            memory_bytes: total_memory(),
        }
    }

    /// Maps cores and memory to a worker count.
    ///
    /// The weaker of the two resources decides; unknown memory is ignored.
    #[must_use]
    pub fn recommended_workers(&self) -> usize {
        let memory = self.memory_bytes.unwrap_or(u64::MAX);
        if self.cores <= 2 || memory < 4 * GIB {
            1
        } else if self.cores <= 4 || memory < 6 * GIB {
            2
        } else if self.cores <= 6 || memory < 8 * GIB {
            3
        } else {
            MAX_WORKERS
        }
    }
}

#[cfg(target_os = "linux")]
fn total_memory() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    meminfo
        .lines()
        .find_map(|line| line.strip_prefix("MemTotal:"))
        .and_then(|rest| rest.trim().trim_end_matches("kB").trim().parse::<u64>().ok())
        .map(|kib| kib * 1024)
}

#[cfg(not(target_os = "linux"))]
fn total_memory() -> Option<u64> {
    None
}
