//! Scenario fixture loading and management.

use serde::{Deserialize, Serialize};

/// One condvar stress scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioSpec {
    /// Scenario identifier.
    pub name: String,
    /// Number of waiter threads.
    pub waiters: usize,
    /// Signal batch sizes issued once every waiter is queued; `-1` wakes
    /// all remaining waiters.
    pub signal_batches: Vec<i32>,
    /// Relative deadline for each waiter, nanoseconds; absent means wait
    /// forever.
    #[serde(default)]
    pub deadline_ns: Option<i64>,
    /// How many times the runner repeats the scenario.
    #[serde(default = "default_iterations")]
    pub iterations: usize,
}

fn default_iterations() -> usize {
    1
}

/// A named collection of scenarios, loadable from JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioSet {
    /// Schema version.
    pub version: String,
    /// Individual scenarios.
    pub scenarios: Vec<ScenarioSpec>,
}

impl ScenarioSet {
    /// Load a scenario set from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize the scenario set to pretty JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Load a scenario set from a file path.
    pub fn from_file(path: &std::path::Path) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let set = Self::from_json(&content)?;
        Ok(set)
    }

    /// The built-in scenario suite.
    #[must_use]
    pub fn builtin() -> Self {
        Self {
            version: "1".to_string(),
            scenarios: vec![
                ScenarioSpec {
                    name: "single-signal".to_string(),
                    waiters: 1,
                    signal_batches: vec![1],
                    deadline_ns: None,
                    iterations: 20,
                },
                ScenarioSpec {
                    name: "broadcast-three".to_string(),
                    waiters: 3,
                    signal_batches: vec![-1],
                    deadline_ns: None,
                    iterations: 20,
                },
                ScenarioSpec {
                    name: "fifo-eight".to_string(),
                    waiters: 8,
                    signal_batches: vec![3, 3, 2],
                    deadline_ns: None,
                    iterations: 10,
                },
                ScenarioSpec {
                    name: "partial-wake".to_string(),
                    waiters: 6,
                    signal_batches: vec![2],
                    deadline_ns: None,
                    iterations: 10,
                },
                ScenarioSpec {
                    name: "timeout-sweep".to_string(),
                    waiters: 4,
                    signal_batches: vec![],
                    deadline_ns: Some(20_000_000),
                    iterations: 5,
                },
            ],
        }
    }
}
