use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::catalog::TestCase;
use crate::comparator::values_equal;
use crate::sandbox::{ExecutionOutcome, OutcomeKind, ResourceLimits};
use crate::validator::ValidationError;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Accepted,
    WrongAnswer,
    RuntimeError,
    TimeLimitExceeded,
    CompileError,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Accepted => "Accepted",
            Status::WrongAnswer => "WrongAnswer",
            Status::RuntimeError => "RuntimeError",
            Status::TimeLimitExceeded => "TimeLimitExceeded",
            Status::CompileError => "CompileError",
        }
    }
}

impl std::str::FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Accepted" => Ok(Status::Accepted),
            "WrongAnswer" => Ok(Status::WrongAnswer),
            "RuntimeError" => Ok(Status::RuntimeError),
            "TimeLimitExceeded" => Ok(Status::TimeLimitExceeded),
            "CompileError" => Ok(Status::CompileError),
            other => Err(format!("unknown status {other:?}")),
        }
    }
}

/// The first test case whose output did not match
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FailingCase {
    pub input: Vec<Value>,
    pub expected: Value,
    pub actual: Value,
}

/// Terminal classification of one submission
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    pub status: Status,
    /// Slowest single executed test case
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failing_case: Option<FailingCase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub tests_passed: usize,
    pub tests_total: usize,
    pub memory_measured: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peak_memory_kb: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cannot handle {event} while {state}")]
pub struct ClassifierError {
    pub state: &'static str,
    pub event: &'static str,
}

/// Whether the harness should run another test case
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    Done,
}

#[derive(Debug, Clone, PartialEq)]
enum State {
    Validating,
    Running {
        index: usize,
        slowest_ms: u64,
        peak_memory_kb: Option<u64>,
        memory_measured: bool,
    },
    Done(Verdict),
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            State::Validating => "validating",
            State::Running { .. } => "running",
            State::Done(_) => "done",
        }
    }
}

/// State machine turning one submission's events into its verdict
///
/// `Validating -> Running(0) -> ... -> Running(n-1) -> Done`, with a direct
/// `Validating -> Done` edge for compile errors. The first outcome that is
/// not a matching success ends the run; `Done` is never left.
#[derive(Debug, Clone)]
pub struct Classifier {
    state: State,
    total: usize,
    limits: ResourceLimits,
}

impl Classifier {
    pub fn new(total: usize, limits: ResourceLimits) -> Self {
        Self {
            state: State::Validating,
            total,
            limits,
        }
    }

    /// Index of the test case expected next, while running
    pub fn current_case(&self) -> Option<usize> {
        match self.state {
            State::Running { index, .. } => Some(index),
            _ => None,
        }
    }

    pub fn verdict(&self) -> Option<&Verdict> {
        match &self.state {
            State::Done(verdict) => Some(verdict),
            _ => None,
        }
    }

    pub fn into_verdict(self) -> Result<Verdict, ClassifierError> {
        match self.state {
            State::Done(verdict) => Ok(verdict),
            other => Err(ClassifierError {
                state: other.name(),
                event: "finish",
            }),
        }
    }

    pub fn validated(
        &mut self,
        result: Result<(), ValidationError>,
    ) -> Result<Step, ClassifierError> {
        if self.state != State::Validating {
            return Err(ClassifierError {
                state: self.state.name(),
                event: "validation result",
            });
        }

        self.state = match result {
            Err(e) => State::Done(Verdict {
                status: Status::CompileError,
                elapsed_ms: 0,
                failing_case: None,
                message: Some(e.to_string()),
                tests_passed: 0,
                tests_total: self.total,
                memory_measured: false,
                peak_memory_kb: None,
            }),
            Ok(()) if self.total == 0 => State::Done(Verdict {
                status: Status::Accepted,
                elapsed_ms: 0,
                failing_case: None,
                message: None,
                tests_passed: 0,
                tests_total: 0,
                memory_measured: false,
                peak_memory_kb: None,
            }),
            Ok(()) => State::Running {
                index: 0,
                slowest_ms: 0,
                peak_memory_kb: None,
                memory_measured: true,
            },
        };
        Ok(self.step())
    }

    /// Feeds the outcome of the current test case
    pub fn observe(
        &mut self,
        case: &TestCase,
        outcome: ExecutionOutcome,
    ) -> Result<Step, ClassifierError> {
        let State::Running {
            index,
            slowest_ms,
            peak_memory_kb,
            memory_measured,
        } = self.state
        else {
            return Err(ClassifierError {
                state: self.state.name(),
                event: "test outcome",
            });
        };

        let slowest_ms = slowest_ms.max(outcome.elapsed_ms);
        let peak_memory_kb = match (peak_memory_kb, outcome.memory_kb) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        let memory_measured = memory_measured && outcome.memory_kb.is_some();
        let case_number = index + 1;
        let total = self.total;

        let failure = match outcome.kind {
            OutcomeKind::Success(actual) if values_equal(&actual, &case.expected) => None,
            OutcomeKind::Success(actual) => Some((
                Status::WrongAnswer,
                Some(FailingCase {
                    input: case.inputs.clone(),
                    expected: case.expected.clone(),
                    actual,
                }),
                format!("Wrong answer on test case {case_number}"),
            )),
            OutcomeKind::Fault(message) => Some((Status::RuntimeError, None, message)),
            OutcomeKind::TimedOut => Some((
                Status::TimeLimitExceeded,
                None,
                format!(
                    "Time limit of {} ms exceeded on test case {case_number}",
                    self.limits.time_limit.as_millis()
                ),
            )),
            OutcomeKind::MemoryExceeded => Some((
                Status::RuntimeError,
                None,
                format!(
                    "Memory limit exceeded ({} KB) on test case {case_number}",
                    self.limits.memory_limit_kb
                ),
            )),
        };

        let make_verdict = |status, failing_case, message, tests_passed| Verdict {
            status,
            elapsed_ms: slowest_ms,
            failing_case,
            message,
            tests_passed,
            tests_total: total,
            memory_measured,
            peak_memory_kb,
        };

        self.state = match failure {
            Some((status, failing_case, message)) => {
                State::Done(make_verdict(status, failing_case, Some(message), index))
            }
            None if case_number == total => {
                State::Done(make_verdict(Status::Accepted, None, None, total))
            }
            None => State::Running {
                index: case_number,
                slowest_ms,
                peak_memory_kb,
                memory_measured,
            },
        };
        Ok(self.step())
    }

    fn step(&self) -> Step {
        match self.state {
            State::Done(_) => Step::Done,
            _ => Step::Continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    fn limits() -> ResourceLimits {
        ResourceLimits {
            time_limit: Duration::from_millis(2000),
            memory_limit_kb: 256 * 1024,
        }
    }

    fn case(a: i64, b: i64, expected: i64) -> TestCase {
        TestCase {
            inputs: vec![json!(a), json!(b)],
            expected: json!(expected),
        }
    }

    fn outcome(kind: OutcomeKind, elapsed_ms: u64) -> ExecutionOutcome {
        ExecutionOutcome {
            kind,
            elapsed_ms,
            memory_kb: Some(40_000 + elapsed_ms),
        }
    }

    #[test]
    fn compile_error_goes_straight_to_done() {
        let mut classifier = Classifier::new(3, limits());
        let step = classifier.validated(Err(ValidationError::Empty)).unwrap();
        assert_eq!(step, Step::Done);

        let verdict = classifier.into_verdict().unwrap();
        assert_eq!(verdict.status, Status::CompileError);
        assert_eq!(verdict.elapsed_ms, 0);
        assert_eq!(verdict.message.as_deref(), Some("Source code is empty"));
    }

    #[test]
    fn accepted_reports_slowest_case() {
        let cases = [case(2, 3, 5), case(0, 0, 0), case(1, 1, 2)];
        let mut classifier = Classifier::new(cases.len(), limits());
        classifier.validated(Ok(())).unwrap();

        let times = [4, 17, 9];
        for (i, c) in cases.iter().enumerate() {
            assert_eq!(classifier.current_case(), Some(i));
            let step = classifier
                .observe(c, outcome(OutcomeKind::Success(c.expected.clone()), times[i]))
                .unwrap();
            assert_eq!(step, if i == 2 { Step::Done } else { Step::Continue });
        }

        let verdict = classifier.into_verdict().unwrap();
        assert_eq!(verdict.status, Status::Accepted);
        assert_eq!(verdict.elapsed_ms, 17);
        assert_eq!(verdict.tests_passed, 3);
        assert!(verdict.memory_measured);
        assert_eq!(verdict.peak_memory_kb, Some(40_017));
        assert_eq!(verdict.message, None);
    }

    #[test]
    fn wrong_answer_carries_the_failing_triple() {
        let cases = [case(0, 0, 0), case(2, 3, 5)];
        let mut classifier = Classifier::new(2, limits());
        classifier.validated(Ok(())).unwrap();
        classifier
            .observe(&cases[0], outcome(OutcomeKind::Success(json!(0)), 1))
            .unwrap();
        let step = classifier
            .observe(&cases[1], outcome(OutcomeKind::Success(json!(-1)), 2))
            .unwrap();
        assert_eq!(step, Step::Done);

        let verdict = classifier.verdict().unwrap();
        assert_eq!(verdict.status, Status::WrongAnswer);
        assert_eq!(verdict.tests_passed, 1);
        assert_eq!(
            verdict.failing_case,
            Some(FailingCase {
                input: vec![json!(2), json!(3)],
                expected: json!(5),
                actual: json!(-1),
            })
        );
        assert_eq!(verdict.message.as_deref(), Some("Wrong answer on test case 2"));
    }

    #[test]
    fn faults_and_resource_limits_map_to_statuses() {
        let c = case(1, 2, 3);
        let cases = [
            (OutcomeKind::Fault("Error: boom".to_string()), Status::RuntimeError, "Error: boom"),
            (
                OutcomeKind::TimedOut,
                Status::TimeLimitExceeded,
                "Time limit of 2000 ms exceeded on test case 1",
            ),
            (
                OutcomeKind::MemoryExceeded,
                Status::RuntimeError,
                "Memory limit exceeded (262144 KB) on test case 1",
            ),
        ];
        for (kind, status, message) in cases {
            let mut classifier = Classifier::new(1, limits());
            classifier.validated(Ok(())).unwrap();
            classifier.observe(&c, outcome(kind, 2000)).unwrap();
            let verdict = classifier.into_verdict().unwrap();
            assert_eq!(verdict.status, status);
            assert_eq!(verdict.message.as_deref(), Some(message));
            assert_eq!(verdict.failing_case, None);
        }
    }

    #[test]
    fn unmeasured_memory_is_flagged() {
        let c = case(1, 2, 3);
        let mut classifier = Classifier::new(1, limits());
        classifier.validated(Ok(())).unwrap();
        let unmeasured = ExecutionOutcome {
            kind: OutcomeKind::Success(json!(3)),
            elapsed_ms: 1,
            memory_kb: None,
        };
        classifier.observe(&c, unmeasured).unwrap();
        let verdict = classifier.into_verdict().unwrap();
        assert!(!verdict.memory_measured);
        assert_eq!(verdict.peak_memory_kb, None);
    }

    #[test]
    fn out_of_order_events_are_rejected() {
        let c = case(1, 2, 3);
        let mut classifier = Classifier::new(1, limits());
        assert!(
            classifier
                .observe(&c, outcome(OutcomeKind::TimedOut, 1))
                .is_err()
        );

        classifier.validated(Ok(())).unwrap();
        assert!(classifier.validated(Ok(())).is_err());
        assert!(classifier.clone().into_verdict().is_err());

        classifier
            .observe(&c, outcome(OutcomeKind::Success(json!(3)), 1))
            .unwrap();
        let err = classifier
            .observe(&c, outcome(OutcomeKind::Success(json!(3)), 1))
            .unwrap_err();
        assert_eq!(err.to_string(), "cannot handle test outcome while done");
    }

    #[test]
    fn verdict_serializes_with_camel_case_fields() {
        let verdict = Verdict {
            status: Status::WrongAnswer,
            elapsed_ms: 3,
            failing_case: Some(FailingCase {
                input: vec![json!(2), json!(3)],
                expected: json!(5),
                actual: json!(-1),
            }),
            message: None,
            tests_passed: 0,
            tests_total: 1,
            memory_measured: false,
            peak_memory_kb: None,
        };
        assert_eq!(
            serde_json::to_value(&verdict).unwrap(),
            json!({
                "status": "WrongAnswer",
                "elapsedMs": 3,
                "failingCase": { "input": [2, 3], "expected": 5, "actual": -1 },
                "testsPassed": 0,
                "testsTotal": 1,
                "memoryMeasured": false
            })
        );
    }
}
