use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{MegaByte, MilliSecond};

/// One ordered test case: the arguments passed to the entry point and the
/// value it must return.
///
/// In catalog files a case may also be written as a flat array whose last
/// element is the expected output, e.g. `[2, 3, 5]` for `add(2, 3) == 5`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(try_from = "TestCaseRepr")]
pub struct TestCase {
    pub inputs: Vec<Value>,
    pub expected: Value,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TestCaseRepr {
    // Tried first: a struct would also accept a two-element array
    Flat(Vec<Value>),
    Keyed { inputs: Vec<Value>, expected: Value },
}

impl TryFrom<TestCaseRepr> for TestCase {
    type Error = String;

    fn try_from(repr: TestCaseRepr) -> std::result::Result<Self, Self::Error> {
        match repr {
            TestCaseRepr::Keyed { inputs, expected } => Ok(Self { inputs, expected }),
            TestCaseRepr::Flat(mut values) => match values.pop() {
                Some(expected) => Ok(Self {
                    inputs: values,
                    expected,
                }),
                None => Err("a flat test case needs at least the expected output".to_string()),
            },
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Problem {
    pub id: String,
    pub name: String,
    /// Name of the function the candidate must define
    pub entry_point: String,
    pub cases: Vec<TestCase>,
    pub time_limit_ms: Option<MilliSecond>,
    pub memory_limit_mb: Option<MegaByte>,
}

/// Read-only access to problems and their hidden test suites.
///
/// The judge only ever borrows problems from the catalog; it never accepts
/// test cases from a caller.
pub trait ProblemCatalog: Send + Sync {
    fn problem(&self, id: &str) -> Option<Arc<Problem>>;
}

/// Catalog loaded once from the configuration file
pub struct StaticCatalog {
    problems: HashMap<String, Arc<Problem>>,
}

impl StaticCatalog {
    pub fn new(problems: Vec<Problem>) -> Result<Self> {
        let mut map = HashMap::with_capacity(problems.len());
        for problem in problems {
            if problem.cases.is_empty() {
                bail!("Problem {} has no test cases", problem.id);
            }
            let id = problem.id.clone();
            if map.insert(id.clone(), Arc::new(problem)).is_some() {
                bail!("Duplicate problem id {id}");
            }
        }
        log::info!("Loaded {} problems into catalog", map.len());
        Ok(Self { problems: map })
    }

    pub fn len(&self) -> usize {
        self.problems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.problems.is_empty()
    }
}

impl ProblemCatalog for StaticCatalog {
    fn problem(&self, id: &str) -> Option<Arc<Problem>> {
        self.problems.get(id).cloned()
    }
}
