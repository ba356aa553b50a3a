use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::Problem;
use crate::config::JudgeConfig;
use crate::sandbox::{ResourceLimits, SandboxRunner};
use crate::validator::Validator;
use crate::verdict::{Classifier, ClassifierError, Step, Verdict};

/// A request to judge one piece of code, immutable once queued
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub submitter_id: String,
    pub problem_id: String,
    pub source_code: String,
    pub entry_point_name: String,
}

#[derive(Debug, Error)]
pub enum JudgeError {
    /// The sandbox machinery itself failed; nothing is known about the code
    #[error("sandbox failure: {0:#}")]
    Sandbox(anyhow::Error),
    #[error(transparent)]
    Classifier(#[from] ClassifierError),
}

/// Judge-wide defaults a problem may override
#[derive(Debug, Clone, Copy)]
pub struct DefaultLimits {
    pub time_limit_ms: u64,
    pub memory_limit_mb: u64,
}

impl From<&JudgeConfig> for DefaultLimits {
    fn from(config: &JudgeConfig) -> Self {
        Self {
            time_limit_ms: config.time_limit_ms.0,
            memory_limit_mb: config.memory_limit_mb.0,
        }
    }
}

/// Runs the validate -> execute -> compare -> classify pipeline
///
/// A `Judge` is pure with respect to its inputs: it reads the problem,
/// drives one sandbox, and returns the verdict without touching any
/// durable state.
pub struct Judge {
    validator: Validator,
    sandbox: Arc<dyn SandboxRunner>,
    defaults: DefaultLimits,
}

impl Judge {
    pub fn new(
        validator: Validator,
        sandbox: Arc<dyn SandboxRunner>,
        defaults: DefaultLimits,
    ) -> Self {
        Self {
            validator,
            sandbox,
            defaults,
        }
    }

    pub fn limits_for(&self, problem: &Problem) -> ResourceLimits {
        let time_limit_ms = problem
            .time_limit_ms
            .map_or(self.defaults.time_limit_ms, |ms| ms.0);
        let memory_limit_mb = problem
            .memory_limit_mb
            .map_or(self.defaults.memory_limit_mb, |mb| mb.0);
        ResourceLimits {
            time_limit: std::time::Duration::from_millis(time_limit_ms),
            memory_limit_kb: memory_limit_mb * 1024,
        }
    }

    pub async fn judge(
        &self,
        submission: &Submission,
        problem: &Problem,
    ) -> Result<Verdict, JudgeError> {
        let limits = self.limits_for(problem);
        let mut classifier = Classifier::new(problem.cases.len(), limits);

        let validation = self
            .validator
            .validate(&submission.source_code, &submission.entry_point_name);
        if let Err(e) = &validation {
            log::info!(
                "Submission by {} for {} rejected before execution: {e}",
                submission.submitter_id,
                problem.id
            );
        }

        let mut step = classifier.validated(validation)?;
        while step == Step::Continue {
            let Some(index) = classifier.current_case() else {
                break;
            };
            let case = &problem.cases[index];

            let outcome = self
                .sandbox
                .execute(
                    &submission.source_code,
                    &submission.entry_point_name,
                    &case.inputs,
                    &limits,
                )
                .await
                .map_err(JudgeError::Sandbox)?;
            log::debug!(
                "Case {} of {} on {}: {:?} in {} ms",
                index + 1,
                problem.id,
                self.sandbox.name(),
                outcome.kind,
                outcome.elapsed_ms
            );

            step = classifier.observe(case, outcome)?;
        }

        let verdict = classifier.into_verdict()?;
        log::info!(
            "Judged submission by {} for {}: {} ({}/{} passed, {} ms)",
            submission.submitter_id,
            problem.id,
            verdict.status.as_str(),
            verdict.tests_passed,
            verdict.tests_total,
            verdict.elapsed_ms
        );
        Ok(verdict)
    }
}
