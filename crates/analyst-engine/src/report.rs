//! Aggregated request outcome
//!
//! The report is what the caller always gets back, failure or not: per-step
//! status, the partial-results policy in force, the aggregated answer and,
//! for aborted requests, why.

use analyst_core::{ErrorKind, PartialResults, RequestId, Step, StepError, StepStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Write as _;

/// Outcome of one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    pub index: usize,
    pub description: String,
    pub status: StepStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl From<&Step> for StepReport {
    fn from(step: &Step) -> Self {
        Self {
            index: step.index(),
            description: step.description().to_string(),
            status: step.status(),
            attempts: step.attempts(),
            error: step.last_error().cloned(),
            result: step.result().cloned(),
        }
    }
}

/// Why a request stopped early
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortInfo {
    pub kind: ErrorKind,
    pub message: String,
}

/// Aggregated outcome of one analysis request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub request_id: RequestId,
    /// True iff every planned step succeeded
    pub overall_success: bool,
    pub partial_results: PartialResults,
    pub steps: Vec<StepReport>,
    pub aggregated_answer: String,
    /// Succeeded step results, with JSON arrays embedded in text unpacked
    pub results: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort: Option<AbortInfo>,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

impl AnalysisReport {
    /// Report for a request that ended before any step ran
    #[must_use]
    pub fn aborted(
        request_id: RequestId,
        policy: PartialResults,
        abort: AbortInfo,
        started_at: DateTime<Utc>,
        elapsed_ms: u64,
    ) -> Self {
        Self {
            request_id,
            overall_success: false,
            partial_results: policy,
            steps: Vec::new(),
            aggregated_answer: String::new(),
            results: Vec::new(),
            abort: Some(abort),
            started_at,
            elapsed_ms,
        }
    }

    /// Aggregate executed (and unexecuted) steps
    ///
    /// Under [`PartialResults::Reject`] any failure empties the answer.
    #[must_use]
    pub fn from_steps(
        request_id: RequestId,
        policy: PartialResults,
        steps: &[Step],
        abort: Option<AbortInfo>,
        started_at: DateTime<Utc>,
        elapsed_ms: u64,
    ) -> Self {
        let overall_success = abort.is_none()
            && !steps.is_empty()
            && steps.iter().all(|s| s.status() == StepStatus::Succeeded);
        let answer_allowed = overall_success || policy == PartialResults::Return;

        let (aggregated_answer, results) = if answer_allowed {
            let succeeded: Vec<&Step> = steps
                .iter()
                .filter(|s| s.status() == StepStatus::Succeeded)
                .collect();
            (
                aggregate_answer(&succeeded),
                succeeded
                    .iter()
                    .filter_map(|s| s.result())
                    .flat_map(extract_results)
                    .collect(),
            )
        } else {
            (String::new(), Vec::new())
        };

        Self {
            request_id,
            overall_success,
            partial_results: policy,
            steps: steps.iter().map(StepReport::from).collect(),
            aggregated_answer,
            results,
            abort,
            started_at,
            elapsed_ms,
        }
    }

    /// Status of each step, in plan order
    #[must_use]
    pub fn statuses(&self) -> Vec<StepStatus> {
        self.steps.iter().map(|s| s.status).collect()
    }
}

fn aggregate_answer(succeeded: &[&Step]) -> String {
    if let [only] = succeeded {
        return only.result().map(render_value).unwrap_or_default();
    }
    let mut out = String::new();
    for step in succeeded {
        let rendered = step.result().map(render_value).unwrap_or_default();
        let _ = writeln!(out, "{}. {}: {rendered}", step.index() + 1, step.description());
    }
    out.truncate(out.trim_end().len());
    out
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    }
}

/// Structured results carried by one step result
///
/// Text holding a JSON array (typical of printed output) is unpacked into
/// the array's elements; arrays are flattened one level; anything else is a
/// single result.
#[must_use]
pub fn extract_results(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items.clone(),
        Value::String(text) => match embedded_array(text) {
            Some(items) => items,
            None => vec![value.clone()],
        },
        other => vec![other.clone()],
    }
}

fn embedded_array(text: &str) -> Option<Vec<Value>> {
    let open = text.find('[')?;
    let close = text.rfind(']')?;
    if open >= close {
        return None;
    }
    match serde_json::from_str(&text[open..=close]) {
        Ok(Value::Array(items)) => Some(items),
        _ => None,
    }
}
