use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::config::SandboxConfig;

use super::{ExecutionOutcome, ResourceLimits};

/// Capability to run one candidate function in isolation
///
/// Implementations execute untrusted code outside the judge's own process and
/// enforce `limits` from the supervising side. Whatever the candidate does,
/// including throwing, hanging or exhausting memory, comes back as an
/// [`ExecutionOutcome`]. `Err` is reserved for failures of the sandbox
/// machinery itself, e.g. the runtime binary being missing.
#[async_trait]
pub trait SandboxRunner: Send + Sync {
    /// Creates a new sandbox runner instance owned by worker `id`
    fn build(id: u8, config: &SandboxConfig) -> Result<Self>
    where
        Self: Sized;

    /// Short backend name used in logs
    fn name(&self) -> &'static str;

    /// Calls `entry_point(...inputs)` from `source` once, in a fresh context
    async fn execute(
        &self,
        source: &str,
        entry_point: &str,
        inputs: &[Value],
        limits: &ResourceLimits,
    ) -> Result<ExecutionOutcome>;
}
