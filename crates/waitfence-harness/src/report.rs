//! Report generation for scenario runs.

use serde::{Deserialize, Serialize};

/// Aggregated result of repeating one scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioResult {
    /// Scenario name.
    pub scenario: String,
    /// Iterations executed.
    pub iterations: usize,
    /// Iterations whose outcome satisfied every invariant.
    pub passed: usize,
    /// Iterations that violated an invariant.
    pub failed: usize,
    /// One note per failed iteration.
    pub notes: Vec<String>,
}

impl ScenarioResult {
    #[must_use]
    pub fn is_pass(&self) -> bool {
        self.failed == 0
    }
}

/// A harness run report combining every scenario's results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioReport {
    /// Report title.
    pub title: String,
    /// Unix timestamp (seconds) of the run.
    pub timestamp: u64,
    /// Per-scenario results.
    pub results: Vec<ScenarioResult>,
}

impl ScenarioReport {
    #[must_use]
    pub fn new(title: impl Into<String>, results: Vec<ScenarioResult>) -> Self {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_secs());
        Self {
            title: title.into(),
            timestamp,
            results,
        }
    }

    /// Total failed iterations across all scenarios.
    #[must_use]
    pub fn total_failed(&self) -> usize {
        self.results.iter().map(|result| result.failed).sum()
    }

    /// Render the report as markdown.
    #[must_use]
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("# {}\n\n", self.title));
        out.push_str(&format!("- Timestamp: {}\n", self.timestamp));
        out.push_str(&format!("- Scenarios: {}\n", self.results.len()));
        out.push_str(&format!("- Failed iterations: {}\n\n", self.total_failed()));

        out.push_str("| Scenario | Iterations | Passed | Failed | Status |\n");
        out.push_str("|----------|-----------:|-------:|-------:|--------|\n");
        for result in &self.results {
            let status = if result.is_pass() { "PASS" } else { "FAIL" };
            out.push_str(&format!(
                "| {} | {} | {} | {} | {} |\n",
                result.scenario, result.iterations, result.passed, result.failed, status
            ));
        }
        for result in &self.results {
            for note in &result.notes {
                out.push_str(&format!("\n- `{}`: {}", result.scenario, note));
            }
        }
        out
    }

    /// Render the report as JSON.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|e| format!("{{\"error\": \"{e}\"}}"))
    }
}
