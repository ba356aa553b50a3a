mod harness;
mod isolate_runner;
mod process_runner;
mod runner;

// Re-export the trait and runner implementations
pub use isolate_runner::IsolateRunner;
pub use process_runner::{Confinement, ProcessRunner};
pub use runner::SandboxRunner;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use serde_json::Value;

use crate::config::{SandboxBackend, SandboxConfig};

/// Limits applied to a single invocation of the candidate function
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub time_limit: Duration,
    pub memory_limit_kb: u64,
}

/// How a single invocation ended
#[derive(Debug, Clone, PartialEq)]
pub enum OutcomeKind {
    Success(Value),
    Fault(String),
    TimedOut,
    MemoryExceeded,
}

/// Result of running the candidate against one test case
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub kind: OutcomeKind,
    pub elapsed_ms: u64,
    /// Peak resident memory, when the backend can measure it
    pub memory_kb: Option<u64>,
}

/// Creates a sandbox runner based on configuration
///
/// With the `auto` backend, an IsolateRunner is used whenever the `isolate`
/// binary is available and a ProcessRunner otherwise. The ProcessRunner
/// itself refuses to start without full confinement unless
/// `require_confinement` is turned off.
pub fn create_sandbox_runner(id: u8, config: &SandboxConfig) -> Result<Arc<dyn SandboxRunner>> {
    let backend = match config.backend {
        SandboxBackend::Auto if isolate_available() => SandboxBackend::Isolate,
        SandboxBackend::Auto => {
            log::warn!("isolate not found, runner {id} falls back to the process backend");
            SandboxBackend::Process
        }
        other => other,
    };

    if backend == SandboxBackend::Isolate {
        log::info!("Creating IsolateRunner {id}");
        Ok(Arc::new(IsolateRunner::build(id, config)?))
    } else {
        log::info!("Creating ProcessRunner {id}");
        Ok(Arc::new(ProcessRunner::build(id, config)?))
    }
}

fn isolate_available() -> bool {
    std::process::Command::new("which")
        .arg("isolate")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

/// Finds `name` on PATH unless it already is a path
fn resolve_executable(name: &str) -> Result<PathBuf> {
    if name.contains('/') {
        return Ok(PathBuf::from(name));
    }
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths)
                .map(|dir| dir.join(name))
                .find(|candidate| candidate.is_file())
        })
        .ok_or_else(|| anyhow!("Unable to find {name} on PATH"))
}
