use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::time::MissedTickBehavior;

use crate::config::SandboxConfig;

use super::harness::{self, RawRun, SCRIPT_NAME, Termination};
use super::{ExecutionOutcome, ResourceLimits, SandboxRunner, resolve_executable};

// Per-process limits applied with setrlimit before exec
const OPEN_FILES: u64 = 64;
const CPU_GRACE_SECONDS: u64 = 1;

// Work directory permissions
const WORK_DIR_PERMISSIONS: u32 = 0o700;

// Stable spelling first, then the one older runtimes accept
const PERMISSION_FLAGS: [&str; 2] = ["--permission", "--experimental-permission"];
const NAMESPACE_FLAGS: libc::c_int = libc::CLONE_NEWUSER
    | libc::CLONE_NEWPID
    | libc::CLONE_NEWNET
    | libc::CLONE_NEWNS
    | libc::CLONE_NEWIPC;
const MAX_TRACKED_PROCESSES: usize = 64;

/// Isolation layers the host offers to a runtime process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Confinement {
    /// Fresh user, PID, network, mount and IPC namespaces per run
    pub namespaces: bool,
    /// Flag enabling the runtime's permission model, if it has one
    pub permission_flag: Option<&'static str>,
}

impl Confinement {
    /// Starts the runtime once per layer to see which ones it survives
    pub fn detect(node_path: &Path) -> Self {
        Self {
            namespaces: starts_cleanly(node_path, &[], true),
            permission_flag: PERMISSION_FLAGS
                .into_iter()
                .find(|flag| starts_cleanly(node_path, &[*flag], false)),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.namespaces && self.permission_flag.is_some()
    }
}

fn starts_cleanly(node_path: &Path, flags: &[&str], in_namespaces: bool) -> bool {
    let mut cmd = std::process::Command::new(node_path);
    cmd.args(flags)
        .args(["-e", "0"])
        .env_clear()
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    if in_namespaces {
        // SAFETY: the hook only makes async-signal-safe libc calls
        unsafe {
            cmd.pre_exec(enter_namespaces);
        }
    }
    cmd.status().is_ok_and(|status| status.success())
}

/// Refuses a partially confined runner unless the configuration allows it
fn ensure_confined(id: u8, confinement: Confinement, required: bool) -> Result<()> {
    if confinement.is_complete() {
        return Ok(());
    }
    if required {
        bail!(
            "ProcessRunner {id} cannot confine candidate code on this host ({confinement:?}); \
             install isolate or set sandbox.require_confinement to false"
        );
    }
    log::warn!("ProcessRunner {id} runs candidate code with partial confinement: {confinement:?}");
    Ok(())
}

/// Runs candidate code in a dedicated, supervised Node.js process
///
/// Each invocation gets a fresh empty working directory, an empty
/// environment, its own process group and rlimit caps. Where the host allows
/// it the runtime also starts in fresh namespaces, so it sees no other
/// process and no network, and under the runtime's permission model with
/// read access to its own script only. The supervisor kills the whole group
/// once the wall-clock limit passes or the sampled resident memory crosses
/// the ceiling.
pub struct ProcessRunner {
    /// Unique identifier for this instance
    id: u8,
    /// Parent of the per-invocation directories
    work_dir: PathBuf,
    /// Absolute, since the child runs with an empty environment
    node_path: PathBuf,
    node_args: Vec<String>,
    max_output_bytes: usize,
    memory_poll: Duration,
    address_space_limit: Option<u64>,
    confinement: Confinement,
    invocations: AtomicU64,
}

#[async_trait]
impl SandboxRunner for ProcessRunner {
    fn build(id: u8, config: &SandboxConfig) -> Result<Self> {
        let work_dir = Self::create_work_directory(id, config.work_dir.as_deref())?;
        let node_path = resolve_executable(&config.node_path)?;
        let confinement = Confinement::detect(&node_path);
        ensure_confined(id, confinement, config.require_confinement)?;

        log::info!(
            "ProcessRunner {id} initialized in {} with {confinement:?}",
            work_dir.display()
        );
        Ok(Self {
            id,
            work_dir,
            node_path,
            node_args: config.node_args.clone(),
            max_output_bytes: config.max_output_bytes,
            memory_poll: Duration::from_millis(config.memory_poll_ms.max(1)),
            address_space_limit: config
                .address_space_limit_mb
                .map(|mb| mb.as_kilobytes() * 1024),
            confinement,
            invocations: AtomicU64::new(0),
        })
    }

    fn name(&self) -> &'static str {
        "process"
    }

    async fn execute(
        &self,
        source: &str,
        entry_point: &str,
        inputs: &[Value],
        limits: &ResourceLimits,
    ) -> Result<ExecutionOutcome> {
        let script = harness::render_script(source, entry_point, inputs)?;

        let run_dir = self.create_run_directory()?;
        fs::write(run_dir.join(SCRIPT_NAME), script)?;

        let result = self.run_script(&run_dir, limits).await;

        if let Err(e) = fs::remove_dir_all(&run_dir) {
            log::warn!(
                "ProcessRunner {} failed to remove {}: {e}",
                self.id,
                run_dir.display()
            );
        }

        result.map(harness::interpret)
    }
}

impl ProcessRunner {
    pub fn confinement(&self) -> Confinement {
        self.confinement
    }

    /// Creates the working directory for this runner instance
    fn create_work_directory(id: u8, base: Option<&Path>) -> Result<PathBuf> {
        let base = match base {
            Some(base) => base.to_path_buf(),
            None => {
                use directories::ProjectDirs;

                let proj_dirs = ProjectDirs::from("", "", "judge")
                    .ok_or_else(|| anyhow!("Unable to find user directory"))?;
                proj_dirs.cache_dir().join("process")
            }
        };

        let work_dir = base.join(id.to_string());
        fs::create_dir_all(&work_dir)?;
        fs::set_permissions(&work_dir, fs::Permissions::from_mode(WORK_DIR_PERMISSIONS))?;
        // The permission model takes absolute paths
        Ok(fs::canonicalize(work_dir)?)
    }

    /// Creates an empty directory that only this invocation will see
    fn create_run_directory(&self) -> Result<PathBuf> {
        let n = self.invocations.fetch_add(1, Ordering::Relaxed);
        let run_dir = self.work_dir.join(format!("run-{n}"));
        if run_dir.exists() {
            fs::remove_dir_all(&run_dir)?;
        }
        fs::create_dir_all(&run_dir)?;
        Ok(run_dir)
    }

    async fn run_script(&self, run_dir: &Path, limits: &ResourceLimits) -> Result<RawRun> {
        let heap_mb = (limits.memory_limit_kb / 1024).max(16);
        let rlimits = RlimitPlan {
            cpu_seconds: limits.time_limit.as_secs() + CPU_GRACE_SECONDS,
            address_space: self.address_space_limit,
        };
        let namespaces = self.confinement.namespaces;

        let mut cmd = Command::new(&self.node_path);
        cmd.arg(format!("--max-old-space-size={heap_mb}"));
        if let Some(flag) = self.confinement.permission_flag {
            cmd.arg(flag).arg(format!(
                "--allow-fs-read={}",
                run_dir.join(SCRIPT_NAME).display()
            ));
        }
        cmd.args(&self.node_args)
            .arg(SCRIPT_NAME)
            .current_dir(run_dir)
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // SAFETY: the hook only makes async-signal-safe libc calls
        unsafe {
            cmd.pre_exec(move || {
                rlimits.apply()?;
                if namespaces {
                    enter_namespaces()?;
                }
                Ok(())
            });
        }

        let started = Instant::now();
        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.node_path.display()))?;
        let pid = child.id();

        let stdout = child.stdout.take().context("Child stdout not captured")?;
        let stderr = child.stderr.take().context("Child stderr not captured")?;

        let stdout_reader = tokio::spawn(read_bounded(stdout, self.max_output_bytes));
        let stderr_reader = tokio::spawn(read_bounded(stderr, self.max_output_bytes));

        let (termination, memory_kb) = self.supervise(&mut child, pid, limits).await?;
        let wall_time = started.elapsed();

        let stdout = stdout_reader.await??;
        let stderr = stderr_reader.await??;

        log::debug!(
            "ProcessRunner {} finished in {:?}: {termination:?}, peak {memory_kb:?} KB",
            self.id,
            wall_time
        );

        Ok(RawRun {
            termination,
            stdout,
            stderr,
            wall_time,
            memory_kb,
        })
    }

    /// Waits for the child while enforcing the wall-clock and memory limits
    async fn supervise(
        &self,
        child: &mut Child,
        pid: Option<u32>,
        limits: &ResourceLimits,
    ) -> Result<(Termination, Option<u64>)> {
        let deadline = tokio::time::sleep(limits.time_limit);
        tokio::pin!(deadline);
        let mut ticker = tokio::time::interval(self.memory_poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut peak_kb: Option<u64> = None;

        let termination = loop {
            tokio::select! {
                status = child.wait() => {
                    let status = status?;
                    break Termination::Exited {
                        code: status.code(),
                        signal: status.signal(),
                    };
                }
                _ = &mut deadline => {
                    kill_process_group(child, pid).await;
                    break Termination::TimedOut;
                }
                _ = ticker.tick() => {
                    let count_root = !self.confinement.namespaces;
                    let sample = pid.and_then(|pid| read_tree_rss_kb(pid, count_root));
                    let Some(rss_kb) = sample else {
                        continue;
                    };
                    peak_kb = Some(peak_kb.map_or(rss_kb, |peak| peak.max(rss_kb)));
                    if rss_kb > limits.memory_limit_kb {
                        kill_process_group(child, pid).await;
                        break Termination::MemoryExceeded;
                    }
                }
            }
        };

        Ok((termination, peak_kb))
    }
}

/// Limits installed in the child between fork and exec
#[derive(Debug, Clone, Copy)]
struct RlimitPlan {
    cpu_seconds: u64,
    address_space: Option<u64>,
}

impl RlimitPlan {
    fn apply(&self) -> std::io::Result<()> {
        let limit = |value: u64| libc::rlimit {
            rlim_cur: value as libc::rlim_t,
            rlim_max: value as libc::rlim_t,
        };

        unsafe {
            if libc::setpgid(0, 0) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::setrlimit(libc::RLIMIT_CPU, &limit(self.cpu_seconds)) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::setrlimit(libc::RLIMIT_FSIZE, &limit(0)) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::setrlimit(libc::RLIMIT_NOFILE, &limit(OPEN_FILES)) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::setrlimit(libc::RLIMIT_CORE, &limit(0)) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            if let Some(bytes) = self.address_space
                && libc::setrlimit(libc::RLIMIT_AS, &limit(bytes)) != 0
            {
                return Err(std::io::Error::last_os_error());
            }
        }
        Ok(())
    }
}

/// Moves the spawned child into fresh namespaces between fork and exec
///
/// A new PID namespace only takes effect for children, so this forks once
/// more. The new process returns and goes on to exec the runtime as PID 1
/// of the namespace; the original closes its descriptors, waits for it and
/// then ends the same way it did.
fn enter_namespaces() -> std::io::Result<()> {
    unsafe {
        if libc::unshare(NAMESPACE_FLAGS) != 0 {
            return Err(std::io::Error::last_os_error());
        }
        match libc::fork() {
            -1 => Err(std::io::Error::last_os_error()),
            0 => {
                libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL);
                Ok(())
            }
            runtime => mirror_exit(runtime),
        }
    }
}

/// Waits for `runtime` and ends the calling process with its status
unsafe fn mirror_exit(runtime: libc::pid_t) -> ! {
    unsafe {
        // Output pipes reach EOF only once the runtime itself lets go of them
        if libc::syscall(libc::SYS_close_range, 0u32, u32::MAX, 0u32) != 0 {
            for fd in 0..1024 {
                libc::close(fd);
            }
        }

        let mut status: libc::c_int = 0;
        loop {
            if libc::waitpid(runtime, &mut status, 0) == runtime {
                break;
            }
            if std::io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
                libc::_exit(127);
            }
        }

        if libc::WIFSIGNALED(status) {
            let signal = libc::WTERMSIG(status);
            libc::signal(signal, libc::SIG_DFL);
            libc::kill(libc::getpid(), signal);
            libc::_exit(128 + signal);
        }
        libc::_exit(libc::WEXITSTATUS(status))
    }
}

/// Kills every process in the child's group, then reaps the child
async fn kill_process_group(child: &mut Child, pid: Option<u32>) {
    if let Some(pid) = pid {
        unsafe {
            libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
        }
    }
    if let Err(e) = child.kill().await {
        log::debug!("Child already gone while killing: {e}");
    }
}

/// Reads up to `limit` bytes and discards the rest so the writer never blocks
async fn read_bounded<R>(reader: R, limit: usize) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut kept = Vec::new();
    let mut limited = reader.take(limit as u64);
    limited.read_to_end(&mut kept).await?;
    let mut rest = limited.into_inner();
    tokio::io::copy(&mut rest, &mut tokio::io::sink()).await?;
    Ok(kept)
}

/// Current resident set size of `pid` in KB, from procfs
fn read_rss_kb(pid: u32) -> Option<u64> {
    let status = fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    parse_rss_kb(&status)
}

/// Resident memory of all descendants of `pid`, plus `pid` itself when
/// `count_root` is set
///
/// The namespace launcher is a copy of the judge that never execs, so only
/// its descendants are charged to the candidate.
fn read_tree_rss_kb(pid: u32, count_root: bool) -> Option<u64> {
    let mut total = if count_root { read_rss_kb(pid)? } else { 0 };
    let mut pending = read_children(pid);
    if !count_root && pending.is_empty() {
        return None;
    }
    let mut seen = 1;
    while let Some(child) = pending.pop() {
        if seen == MAX_TRACKED_PROCESSES {
            break;
        }
        seen += 1;
        total += read_rss_kb(child).unwrap_or(0);
        pending.extend(read_children(child));
    }
    Some(total)
}

/// Children forked by any thread of `pid`
fn read_children(pid: u32) -> Vec<u32> {
    let Ok(tasks) = fs::read_dir(format!("/proc/{pid}/task")) else {
        return Vec::new();
    };
    tasks
        .flatten()
        .filter_map(|task| fs::read_to_string(task.path().join("children")).ok())
        .flat_map(|list| parse_pids(&list))
        .collect()
}

fn parse_pids(list: &str) -> Vec<u32> {
    list.split_whitespace().filter_map(|pid| pid.parse().ok()).collect()
}

fn parse_rss_kb(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_resident_set_from_proc_status() {
        let status = "Name:\tnode\nVmPeak:\t 1200000 kB\nVmRSS:\t   45012 kB\nThreads:\t7\n";
        assert_eq!(parse_rss_kb(status), Some(45012));
        assert_eq!(parse_rss_kb("Name:\tzombie\n"), None);
    }

    #[test]
    fn own_process_memory_is_readable() {
        if cfg!(target_os = "linux") {
            assert!(read_rss_kb(std::process::id()).is_some_and(|kb| kb > 0));
        }
    }

    #[test]
    fn descendant_memory_is_counted() {
        assert_eq!(parse_pids("812 813 \n"), vec![812, 813]);
        assert!(parse_pids("").is_empty());

        let Ok(mut child) = std::process::Command::new("sleep").arg("5").spawn() else {
            return;
        };
        let me = std::process::id();
        let child_rss = read_rss_kb(child.id()).unwrap_or(0);
        if read_children(me).contains(&child.id()) {
            assert!(read_tree_rss_kb(me, true).unwrap() > child_rss);
            assert!(read_tree_rss_kb(me, false).unwrap() >= child_rss);
        }
        assert_eq!(read_tree_rss_kb(child.id(), false), None);
        let _ = child.kill();
        let _ = child.wait();
    }

    #[test]
    fn partial_confinement_needs_explicit_consent() {
        let complete = Confinement {
            namespaces: true,
            permission_flag: Some("--permission"),
        };
        let no_namespaces = Confinement {
            namespaces: false,
            ..complete
        };
        let no_permissions = Confinement {
            permission_flag: None,
            ..complete
        };

        assert!(ensure_confined(1, complete, true).is_ok());
        assert!(ensure_confined(1, no_namespaces, true).is_err());
        assert!(ensure_confined(1, no_permissions, true).is_err());
        assert!(ensure_confined(1, no_permissions, false).is_ok());
    }

    #[test]
    fn missing_runtime_offers_no_confinement() {
        let confinement = Confinement::detect(Path::new("/nonexistent/bin/node"));
        assert!(!confinement.is_complete());
        assert_eq!(confinement.permission_flag, None);
    }

    #[tokio::test]
    async fn bounded_reader_drains_excess_output() {
        let data = vec![b'x'; 10_000];
        let kept = read_bounded(&data[..], 100).await.unwrap();
        assert_eq!(kept.len(), 100);
    }

    #[test]
    fn run_directories_are_fresh_per_invocation() {
        let base = std::env::temp_dir().join(format!("judge-runner-test-{}", std::process::id()));
        let config = SandboxConfig {
            node_path: "/opt/node/bin/node".to_string(),
            work_dir: Some(base.clone()),
            require_confinement: false,
            ..SandboxConfig::default()
        };
        let runner = ProcessRunner::build(7, &config).unwrap();
        assert!(runner.work_dir.is_absolute());
        let first = runner.create_run_directory().unwrap();
        fs::write(first.join("leftover"), "state").unwrap();
        let second = runner.create_run_directory().unwrap();
        assert_ne!(first, second);
        assert_eq!(fs::read_dir(&second).unwrap().count(), 0);
        let _ = fs::remove_dir_all(base);
    }
}
