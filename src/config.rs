use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, bail};
use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::catalog::Problem;

#[derive(Parser)]
#[command(name = "judge", version = "1.0", about, long_about = None)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(long = "config", short = 'c')]
    pub config_path: String,

    /// Whether to flush the existing submission database
    #[arg(long = "flush-data", short = 'f', default_value_t = false)]
    pub flush_data: bool,

    /// Override the number of judging workers from the configuration file
    #[arg(long = "workers", short = 'w')]
    pub workers: Option<usize>,
}

impl CliArgs {
    /// Load the configuration from the specified file
    pub fn to_config(&self) -> Result<Config> {
        let file = std::fs::File::open(&self.config_path)?;
        let reader = std::io::BufReader::new(file);
        let mut config: Config = serde_json::from_reader(reader)?;
        if let Some(workers) = self.workers {
            config.judge.workers = workers;
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Deserialize, Debug)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub judge: JudgeConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub recorder: RecorderConfig,
    pub problems: Vec<Problem>,
}

impl Config {
    /// Rejects configurations the judge cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.judge.workers == 0 {
            bail!("The number of workers must not be 0");
        }
        if self.judge.workers > u8::MAX as usize {
            bail!("At most {} workers are supported", u8::MAX);
        }
        if self.judge.queue_depth == 0 {
            bail!("The queue depth must not be 0");
        }
        if self.recorder.max_attempts == 0 {
            bail!("The recorder needs at least one attempt");
        }
        let mut ids: Vec<&str> = self.problems.iter().map(|p| p.id.as_str()).collect();
        ids.sort_unstable();
        if let Some(pair) = ids.windows(2).find(|w| w[0] == w[1]) {
            bail!("Duplicate problem id {}", pair[0]);
        }
        if let Some(p) = self.problems.iter().find(|p| p.cases.is_empty()) {
            bail!("Problem {} has no test cases", p.id);
        }
        Ok(())
    }
}

#[derive(Deserialize, Debug)]
pub struct ServerConfig {
    pub bind_address: Option<String>,
    pub bind_port: Option<u16>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct JudgeConfig {
    pub workers: usize,
    /// Jobs allowed to wait for a worker before submissions are refused
    pub queue_depth: usize,
    pub time_limit_ms: MilliSecond,
    pub memory_limit_mb: MegaByte,
    pub max_source_bytes: usize,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get().min(u8::MAX as usize))
                .unwrap_or(1),
            queue_depth: 64,
            time_limit_ms: MilliSecond(2000),
            memory_limit_mb: MegaByte(256),
            max_source_bytes: 64 * 1024,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SandboxBackend {
    /// `isolate` when available, plain supervised processes otherwise
    Auto,
    Process,
    Isolate,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SandboxConfig {
    pub backend: SandboxBackend,
    /// JavaScript runtime used to execute candidate code
    pub node_path: String,
    pub node_args: Vec<String>,
    pub max_output_bytes: usize,
    pub memory_poll_ms: u64,
    /// Hard address-space cap applied with `setrlimit`, off by default since
    /// V8 reserves far more virtual memory than it touches
    pub address_space_limit_mb: Option<MegaByte>,
    pub work_dir: Option<PathBuf>,
    /// Refuse to start the process backend on hosts where it cannot place
    /// candidate code in fresh namespaces under the runtime's permission model
    pub require_confinement: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: SandboxBackend::Auto,
            node_path: "node".to_string(),
            node_args: vec![
                "--disallow-code-generation-from-strings".to_string(),
                "--no-addons".to_string(),
            ],
            max_output_bytes: 1024 * 1024,
            memory_poll_ms: 10,
            address_space_limit_mb: None,
            work_dir: None,
            require_confinement: true,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreConfig {
    /// SQLite file, defaulting to the user's local data directory
    Sqlite { path: Option<PathBuf> },
    #[default]
    Memory,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RecorderConfig {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff_ms: 10,
            max_backoff_ms: 200,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MilliSecond(pub u64);

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MegaByte(pub u64);

impl From<MilliSecond> for Duration {
    fn from(value: MilliSecond) -> Self {
        Duration::from_millis(value.0)
    }
}

impl MegaByte {
    pub fn as_kilobytes(self) -> u64 {
        self.0 * 1024
    }
}
