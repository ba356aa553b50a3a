//! The script wrapped around candidate code, and the reading of its report.

use std::time::Duration;

use anyhow::{Result, bail};
use serde::Deserialize;
use serde_json::Value;

use crate::validator::is_identifier;

use super::{ExecutionOutcome, OutcomeKind};

pub(super) const SCRIPT_NAME: &str = "main.js";

const REPORT_MARKER: &str = "__JUDGE_REPORT__:";
const ENTRY_PLACEHOLDER: &str = "__ENTRY__";
const ARGS_PLACEHOLDER: &str = "__ARGS__";
const MAX_FAULT_MESSAGE_CHARS: usize = 1000;

/// Captures the arguments and hides the module loader before any candidate
/// code runs. The arguments are part of the script so the runtime never reads
/// anything but its own entry file.
const PRELUDE: &str = r#"const __judgeStdout = process.stdout;
const __judgeExit = process.exit.bind(process);
const __judgePerf = performance;
const __judgeArgs = __ARGS__;
require = undefined;
module = undefined;
exports = undefined;
"#;

const TRAILER: &str = r#"
;(function () {
  const emit = (report) => {
    __judgeStdout.write("\n__JUDGE_REPORT__:" + JSON.stringify(report) + "\n");
    __judgeExit(0);
  };
  const describe = (err) => {
    if (err instanceof Error) {
      return err.name + ": " + err.message;
    }
    try {
      return "Uncaught " + String(err);
    } catch (_) {
      return "Uncaught exception";
    }
  };
  const started = __judgePerf.now();
  const elapsed = () => __judgePerf.now() - started;
  let result;
  try {
    if (typeof __ENTRY__ !== "function") {
      throw new TypeError("__ENTRY__ is not a function");
    }
    result = __ENTRY__(...__judgeArgs);
  } catch (err) {
    emit({ fault: describe(err), elapsedMs: elapsed() });
    return;
  }
  Promise.resolve(result).then(
    (value) => {
      try {
        emit({ value: value === undefined ? null : value, elapsedMs: elapsed() });
      } catch (err) {
        emit({ fault: describe(err), elapsedMs: elapsed() });
      }
    },
    (err) => emit({ fault: describe(err), elapsedMs: elapsed() }),
  );
})();
"#;

/// Builds the script that calls `entry_point` from `source` with `inputs`
pub(super) fn render_script(source: &str, entry_point: &str, inputs: &[Value]) -> Result<String> {
    if !is_identifier(entry_point) {
        bail!("Refusing to render harness for entry point {entry_point:?}");
    }
    let args = serde_json::to_string(inputs)?;

    let mut script = String::with_capacity(
        PRELUDE.len() + args.len() + source.len() + TRAILER.len() + 64,
    );
    script.push_str(&PRELUDE.replace(ARGS_PLACEHOLDER, &args));
    script.push_str(source);
    script.push('\n');
    script.push_str(&TRAILER.replace(ENTRY_PLACEHOLDER, entry_point));
    Ok(script)
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct Report {
    #[serde(default)]
    value: Value,
    fault: Option<String>,
    elapsed_ms: Option<f64>,
}

fn find_report(stdout: &[u8]) -> Option<Report> {
    String::from_utf8_lossy(stdout)
        .lines()
        .rev()
        .find_map(|line| line.strip_prefix(REPORT_MARKER))
        .and_then(|json| serde_json::from_str(json).ok())
}

/// How the supervised process ended, before looking at its output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Termination {
    Exited {
        code: Option<i32>,
        signal: Option<i32>,
    },
    TimedOut,
    MemoryExceeded,
}

/// Everything a backend collected from one run
pub(super) struct RawRun {
    pub termination: Termination,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub wall_time: Duration,
    pub memory_kb: Option<u64>,
}

/// Turns a finished process into the outcome of the candidate call
pub(super) fn interpret(run: RawRun) -> ExecutionOutcome {
    let wall_ms = run.wall_time.as_millis() as u64;
    let finish = |kind, elapsed_ms| ExecutionOutcome {
        kind,
        elapsed_ms,
        memory_kb: run.memory_kb,
    };

    let (code, signal) = match run.termination {
        Termination::TimedOut => return finish(OutcomeKind::TimedOut, wall_ms),
        Termination::MemoryExceeded => return finish(OutcomeKind::MemoryExceeded, wall_ms),
        Termination::Exited { code, signal } => (code, signal),
    };

    if let Some(report) = find_report(&run.stdout) {
        let elapsed_ms = report
            .elapsed_ms
            .filter(|ms| ms.is_finite() && *ms >= 0.0)
            .map_or(wall_ms, |ms| ms.round() as u64);
        let kind = match report.fault {
            Some(message) => OutcomeKind::Fault(truncate(&message)),
            None => OutcomeKind::Success(report.value),
        };
        return finish(kind, elapsed_ms);
    }

    let stderr = String::from_utf8_lossy(&run.stderr);
    if is_out_of_memory(&stderr) {
        return finish(OutcomeKind::MemoryExceeded, wall_ms);
    }
    if signal == Some(libc::SIGXCPU) {
        return finish(OutcomeKind::TimedOut, wall_ms);
    }

    let message = first_error_line(&stderr).unwrap_or_else(|| match (code, signal) {
        (_, Some(signal)) => format!("Process killed by signal {signal} without returning"),
        (Some(code), None) => format!("Process exited with code {code} without returning"),
        (None, None) => "Process ended without returning".to_string(),
    });
    finish(OutcomeKind::Fault(truncate(&message)), wall_ms)
}

fn is_out_of_memory(stderr: &str) -> bool {
    stderr.contains("heap out of memory")
        || stderr.contains("Allocation failed")
        || stderr.contains("Cannot allocate memory")
}

/// Picks the `SomethingError: message` line out of an uncaught-exception dump
fn first_error_line(stderr: &str) -> Option<String> {
    let is_error_line = |line: &&str| {
        line.split_once(':').is_some_and(|(name, _)| {
            name.ends_with("Error") && name.chars().all(|c| c.is_ascii_alphanumeric())
        })
    };
    let lines = stderr.lines().map(str::trim);
    lines
        .clone()
        .find(is_error_line)
        .or_else(|| lines.filter(|l| !l.is_empty()).last())
        .map(str::to_string)
}

fn truncate(message: &str) -> String {
    match message.char_indices().nth(MAX_FAULT_MESSAGE_CHARS) {
        Some((idx, _)) => format!("{}...", &message[..idx]),
        None => message.to_string(),
    }
}
