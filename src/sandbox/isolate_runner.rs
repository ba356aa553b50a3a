use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;

use crate::config::SandboxConfig;

use super::harness::{self, RawRun, SCRIPT_NAME, Termination};
use super::{ExecutionOutcome, ResourceLimits, SandboxRunner, resolve_executable};

// Sandbox configuration constants
const RUNTIME_PROCESSES: u32 = 32; // V8 worker threads count against this
const RUNTIME_OPEN_FILES: u32 = 64;
const RUNTIME_FILE_SIZE: u32 = 1024; // KB
const EXTRA_WALL_SECONDS: f64 = 0.5;
const SUPERVISOR_GRACE: Duration = Duration::from_secs(2);

const STDOUT_NAME: &str = "stdout.txt";
const STDERR_NAME: &str = "stderr.txt";

// Sandbox cache directory permissions
const CACHE_DIR_PERMISSIONS: u32 = 0o700;

/// A sandbox for executing candidate code using Linux isolate
///
/// Every invocation runs in a freshly reinitialized box with its own
/// namespaces, no network, and a cgroup memory limit. isolate enforces the
/// limits; the runner additionally bounds the whole isolate call.
pub struct IsolateRunner {
    /// Unique identifier for this sandbox instance, used as the isolate box id
    id: u8,
    /// Path to the sandbox's working directory (inside isolate)
    box_dir: PathBuf,
    /// Path to the cache directory for meta files
    cache_dir: PathBuf,
    /// Absolute path of the runtime, as seen from inside the box
    node_path: PathBuf,
    node_args: Vec<String>,
    max_output_bytes: usize,
    invocations: AtomicU64,
}

/// Fields of an isolate meta file the judge cares about
#[derive(Debug, Default, PartialEq)]
struct MetaSummary {
    status: Option<String>,
    oom_killed: bool,
    exit_code: Option<i32>,
    exit_signal: Option<i32>,
    time_wall: Option<f64>,
    cg_mem_kb: Option<u64>,
    message: Option<String>,
}

#[async_trait]
impl SandboxRunner for IsolateRunner {
    fn build(id: u8, config: &SandboxConfig) -> Result<Self> {
        let cache_dir = Self::setup_cache_directory(id, config.work_dir.as_deref())?;
        let node_path = resolve_executable(&config.node_path)?;
        let box_dir = Self::initialize_isolate_sandbox(id)?;

        log::info!("IsolateRunner {id} initialized successfully");
        Ok(Self {
            id,
            box_dir,
            cache_dir,
            node_path,
            node_args: config.node_args.clone(),
            max_output_bytes: config.max_output_bytes,
            invocations: AtomicU64::new(0),
        })
    }

    fn name(&self) -> &'static str {
        "isolate"
    }

    async fn execute(
        &self,
        source: &str,
        entry_point: &str,
        inputs: &[Value],
        limits: &ResourceLimits,
    ) -> Result<ExecutionOutcome> {
        let script = harness::render_script(source, entry_point, inputs)?;

        self.reinit().await?;
        fs::write(self.box_dir.join(SCRIPT_NAME), script)?;

        let n = self.invocations.fetch_add(1, Ordering::Relaxed);
        let meta_path = self.cache_dir.join(format!("{n}.meta"));
        self.run_in_box(limits, &meta_path).await?;

        let meta = fs::read_to_string(&meta_path)
            .map_err(|e| anyhow!("Failed to read meta file {}: {e}", meta_path.display()))?;
        let _ = fs::remove_file(&meta_path);
        let meta = parse_meta(&meta);

        let termination = if meta.oom_killed {
            Termination::MemoryExceeded
        } else {
            match meta.status.as_deref() {
                Some("TO") => Termination::TimedOut,
                Some("XX") => bail!(
                    "isolate internal error in box {}: {}",
                    self.id,
                    meta.message.unwrap_or_default()
                ),
                _ => Termination::Exited {
                    code: meta.exit_code,
                    signal: meta.exit_signal,
                },
            }
        };

        Ok(harness::interpret(RawRun {
            termination,
            stdout: self.read_box_file(STDOUT_NAME),
            stderr: self.read_box_file(STDERR_NAME),
            wall_time: Duration::from_secs_f64(meta.time_wall.unwrap_or(0.0).max(0.0)),
            memory_kb: meta.cg_mem_kb,
        }))
    }
}

impl IsolateRunner {
    /// Sets up the cache directory for the sandbox
    fn setup_cache_directory(id: u8, base: Option<&Path>) -> Result<PathBuf> {
        let cache_base_dir = match base {
            Some(base) => base.join("isolate"),
            None => {
                use directories::ProjectDirs;

                let proj_dirs = ProjectDirs::from("", "", "judge")
                    .ok_or_else(|| anyhow!("Unable to find user directory"))?;
                proj_dirs.cache_dir().join("isolate")
            }
        };
        fs::create_dir_all(&cache_base_dir)?;
        fs::set_permissions(
            &cache_base_dir,
            fs::Permissions::from_mode(CACHE_DIR_PERMISSIONS),
        )?;

        let cache_dir = cache_base_dir.join(id.to_string());
        fs::create_dir_all(&cache_dir)?;

        Ok(cache_dir)
    }

    /// Initializes the isolate sandbox and returns the box directory
    fn initialize_isolate_sandbox(id: u8) -> Result<PathBuf> {
        let output = std::process::Command::new("isolate")
            .arg("-b")
            .arg(id.to_string())
            .arg("--cg")
            .arg("--init")
            .output()
            .map_err(|e| anyhow!("Failed to spawn isolate --init: {}", e))?;

        if !output.status.success() {
            bail!(
                "isolate --init exited with non-zero status; stderr={}",
                String::from_utf8_lossy(&output.stderr)
            );
        }

        let root_dir_absolute = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if root_dir_absolute.is_empty() {
            bail!(
                "isolate --init produced empty stdout; stderr={}",
                String::from_utf8_lossy(&output.stderr)
            );
        }

        Ok(PathBuf::from(root_dir_absolute).join("box"))
    }

    /// Reinitializes the sandbox so no state survives between invocations
    async fn reinit(&self) -> Result<()> {
        let box_id = self.id.to_string();
        for action in ["--cleanup", "--init"] {
            let output = Command::new("isolate")
                .args(["-b", &box_id, "--cg", action])
                .output()
                .await
                .map_err(|e| anyhow!("Failed to spawn isolate {action}: {}", e))?;

            if !output.status.success() {
                bail!("isolate {action} exited with non-zero status");
            }
        }

        log::debug!("IsolateRunner {} reinitialized", self.id);
        Ok(())
    }

    /// Runs the harness script in the box, writing the meta file
    async fn run_in_box(&self, limits: &ResourceLimits, meta_path: &Path) -> Result<()> {
        let seconds = limits.time_limit.as_secs_f64();
        let box_id = self.id.to_string();
        let time_arg = format!("--time={seconds:.3}");
        let wall_time_arg = format!("--wall-time={:.3}", seconds + EXTRA_WALL_SECONDS);
        let memory_arg = format!("--cg-mem={}", limits.memory_limit_kb);
        let processes_arg = format!("--processes={RUNTIME_PROCESSES}");
        let open_files_arg = format!("--open-files={RUNTIME_OPEN_FILES}");
        let fsize_arg = format!("--fsize={RUNTIME_FILE_SIZE}");
        let heap_arg = format!("--max-old-space-size={}", (limits.memory_limit_kb / 1024).max(16));
        let meta_arg = meta_path.to_string_lossy();

        let run = Command::new("isolate")
            .args([
                "-b",
                &box_id,
                "--cg",
                "--run",
                &time_arg,
                &wall_time_arg,
                &memory_arg,
                &processes_arg,
                &open_files_arg,
                &fsize_arg,
                "-E",
                "PATH=/usr/local/bin:/usr/bin:/bin",
                "-M",
                &meta_arg,
                "-o",
                STDOUT_NAME,
                "-r",
                STDERR_NAME,
                "--silent",
                "--",
            ])
            .arg(&self.node_path)
            .arg(&heap_arg)
            .args(&self.node_args)
            .arg(SCRIPT_NAME)
            .kill_on_drop(true)
            .output();

        let backstop = limits.time_limit + SUPERVISOR_GRACE;
        match tokio::time::timeout(backstop, run).await {
            Ok(output) => {
                output.map_err(|e| anyhow!("Failed to spawn isolate --run: {e}"))?;
                Ok(())
            }
            Err(_) => bail!("isolate box {} did not finish within {backstop:?}", self.id),
        }
    }

    fn read_box_file(&self, name: &str) -> Vec<u8> {
        let mut content = fs::read(self.box_dir.join(name)).unwrap_or_default();
        content.truncate(self.max_output_bytes);
        content
    }
}

/// Processes the meta file content written by `isolate -M`
fn parse_meta(meta_content: &str) -> MetaSummary {
    let mut summary = MetaSummary::default();
    for line in meta_content.lines() {
        if let Some((key, value)) = line.split_once(':') {
            match key {
                "status" => summary.status = Some(value.to_string()),
                "cg-oom-killed" => summary.oom_killed = value == "1",
                "exitcode" => summary.exit_code = value.parse().ok(),
                "exitsig" => summary.exit_signal = value.parse().ok(),
                "time-wall" => summary.time_wall = value.parse().ok(),
                "cg-mem" => summary.cg_mem_kb = value.parse().ok(),
                "message" => summary.message = Some(value.to_string()),
                _ => {}
            }
        }
    }
    summary
}
