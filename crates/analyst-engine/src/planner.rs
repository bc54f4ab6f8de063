//! Planning
//!
//! Turns a question plus data metadata into an ordered list of step
//! descriptions. One completion call per plan; parsing failures are returned
//! as [`PlanningError::Malformed`] and the controller decides whether to ask
//! again.

use crate::error::PlanningError;
use analyst_core::{ColumnType, CompletionConfig, DataFormat, DataMetadata};
use analyst_llm::prompt::ANALYST_SYSTEM;
use analyst_llm::{CompletionClient, CompletionRequest, PromptTemplate};
use serde_json::Value;
use std::fmt::Write as _;

const PLAN_TEMPLATE: PromptTemplate = PromptTemplate::new(
    "Break the following data analysis question into a short, ordered list of steps.\n\
     Each step must be answerable by one self-contained Python script.\n\n\
     Question: {question}\n\n\
     Available data:\n{metadata}\n\
     Respond with JSON only, in this form:\n\
     {\"plan\": \"one-line summary\", \"steps\": [\"first step\", \"second step\"]}\n\
     Use at most {max_steps} steps.",
);

/// Plans analysis steps through the completion client
#[derive(Debug, Clone)]
pub struct Planner {
    client: CompletionClient,
    config: CompletionConfig,
    max_steps: usize,
}

impl Planner {
    #[must_use]
    pub fn new(client: CompletionClient, config: CompletionConfig, max_steps: usize) -> Self {
        Self {
            client,
            config,
            max_steps: max_steps.max(1),
        }
    }

    /// Ask for a plan and parse it
    ///
    /// # Errors
    /// `Completion` when the service fails (after its own retries),
    /// `Malformed` when the response holds no steps.
    pub async fn plan(
        &self,
        question: &str,
        metadata: &[DataMetadata],
    ) -> Result<Vec<String>, PlanningError> {
        let max_steps = self.max_steps.to_string();
        let described = describe_metadata(metadata);
        let prompt = PLAN_TEMPLATE.render(&[
            ("question", question),
            ("metadata", &described),
            ("max_steps", &max_steps),
        ]);

        let completion = self
            .client
            .complete(
                CompletionRequest::new(prompt).with_system(ANALYST_SYSTEM),
                &self.config,
            )
            .await?;
        tracing::debug!(attempts = completion.attempts, "plan completion received");

        let mut steps = parse_plan(&completion.text)?;
        if steps.len() > self.max_steps {
            tracing::warn!(
                steps = steps.len(),
                max_steps = self.max_steps,
                "plan longer than allowed, truncating"
            );
            steps.truncate(self.max_steps);
        }
        tracing::info!(steps = steps.len(), "plan ready");
        Ok(steps)
    }
}

/// Extract ordered step descriptions from completion text
///
/// Accepts, in order of preference:
/// - a JSON object with a `steps` array (bare, fenced, or embedded in prose)
/// - a bare JSON array of strings
/// - a numbered or bulleted list
///
/// # Errors
/// `Malformed` when none of these yields at least one step.
pub fn parse_plan(text: &str) -> Result<Vec<String>, PlanningError> {
    let steps = json_candidates(text)
        .into_iter()
        .find_map(|candidate| {
            serde_json::from_str::<Value>(candidate)
                .ok()
                .and_then(steps_from_json)
        })
        .unwrap_or_else(|| steps_from_list(text));

    if steps.is_empty() {
        return Err(PlanningError::Malformed {
            reason: "no steps found in plan response".into(),
            response: text.to_string(),
        });
    }
    Ok(steps)
}

fn json_candidates(text: &str) -> Vec<&str> {
    let mut candidates = vec![text.trim()];
    candidates.extend(fenced_blocks(text));
    if let (Some(open), Some(close)) = (text.find('{'), text.rfind('}')) {
        if open < close {
            candidates.push(&text[open..=close]);
        }
    }
    if let (Some(open), Some(close)) = (text.find('['), text.rfind(']')) {
        if open < close {
            candidates.push(&text[open..=close]);
        }
    }
    candidates
}

/// Bodies of Markdown code fences, in order
pub(crate) fn fenced_blocks(text: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find("```") {
        let after = &rest[open + 3..];
        // skip the info string (```json, ```python)
        let body_start = after.find('\n').map_or(after.len(), |i| i + 1);
        let body = &after[body_start..];
        match body.find("```") {
            Some(close) => {
                blocks.push(body[..close].trim());
                rest = &body[close + 3..];
            }
            None => {
                blocks.push(body.trim());
                break;
            }
        }
    }
    blocks
}

fn steps_from_json(value: Value) -> Option<Vec<String>> {
    let items = match value {
        Value::Object(mut map) => match map.remove("steps") {
            Some(Value::Array(items)) => items,
            _ => return None,
        },
        Value::Array(items) => items,
        _ => return None,
    };

    let steps: Vec<String> = items
        .into_iter()
        .filter_map(|item| match item {
            Value::String(s) => Some(s),
            Value::Object(map) => ["description", "step", "task"]
                .iter()
                .find_map(|key| map.get(*key).and_then(Value::as_str).map(str::to_string)),
            _ => None,
        })
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    (!steps.is_empty()).then_some(steps)
}

fn steps_from_list(text: &str) -> Vec<String> {
    text.lines().filter_map(list_item).collect()
}

fn list_item(line: &str) -> Option<String> {
    let line = line.trim();
    let rest = if let Some(rest) = line.strip_prefix(&['-', '*', '•'][..]) {
        rest
    } else {
        let digits = line.find(|c: char| !c.is_ascii_digit())?;
        if digits == 0 {
            return None;
        }
        line[digits..].strip_prefix(&['.', ')', ':'][..])?
    };
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let item = rest.trim();
    (!item.is_empty()).then(|| item.to_string())
}

/// Render metadata for prompts
///
/// Each source is named by the key scripts use to reach it (`DATA['name']`).
#[must_use]
pub fn describe_metadata(metadata: &[DataMetadata]) -> String {
    if metadata.is_empty() {
        return "(no data sources)\n".to_string();
    }
    let mut out = String::new();
    for meta in metadata {
        let format = match meta.format {
            DataFormat::Csv => "csv",
            DataFormat::Json => "json",
            DataFormat::Text => "text",
        };
        let _ = writeln!(
            out,
            "- DATA['{}'] ({format}, {} rows)",
            meta.source, meta.row_count
        );
        if !meta.schema.is_empty() {
            let columns: Vec<String> = meta
                .schema
                .iter()
                .map(|c| format!("{} ({})", c.name, type_name(c.dtype)))
                .collect();
            let _ = writeln!(out, "  columns: {}", columns.join(", "));
        }
        if !meta.sample_rows.is_empty() {
            out.push_str("  sample rows:\n");
            for row in &meta.sample_rows {
                let _ = writeln!(out, "    {row}");
            }
        }
    }
    out
}

fn type_name(dtype: ColumnType) -> &'static str {
    match dtype {
        ColumnType::Integer => "integer",
        ColumnType::Float => "float",
        ColumnType::Boolean => "boolean",
        ColumnType::String => "string",
        ColumnType::Empty => "empty",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn parses_json_object() {
        let steps =
            parse_plan(r#"{"plan": "totals", "steps": ["load data", "sum units"]}"#).unwrap();
        assert_eq!(steps, vec!["load data", "sum units"]);
    }

    #[test]
    fn parses_fenced_json_with_prose() {
        let text = "Here is the plan:\n```json\n\
                    {\"plan\": \"x\", \"steps\": [\"a\", \"b\", \"c\"]}\n```\nGood luck!";
        assert_eq!(parse_plan(text).unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn parses_embedded_json() {
        let text = "Sure. {\"steps\": [{\"description\": \"group by region\"}]} Done.";
        assert_eq!(parse_plan(text).unwrap(), vec!["group by region"]);
    }

    #[test]
    fn parses_bare_array() {
        assert_eq!(
            parse_plan(r#"["count rows", "average price"]"#).unwrap(),
            vec!["count rows", "average price"]
        );
    }

    #[test]
    fn parses_numbered_and_bulleted_lists() {
        let text = "Plan:\n1. Load the data\n2) Compute totals\n\n- Plot nothing\n* Report";
        assert_eq!(
            parse_plan(text).unwrap(),
            vec!["Load the data", "Compute totals", "Plot nothing", "Report"]
        );
    }

    #[test]
    fn rejects_text_without_steps() {
        let err = parse_plan("I cannot help with that.").unwrap_err();
        assert!(err.is_malformed());
        assert!(parse_plan(r#"{"steps": []}"#).unwrap_err().is_malformed());
        assert!(parse_plan("").unwrap_err().is_malformed());
    }

    #[test]
    fn ignores_numbers_that_are_not_list_items() {
        assert_eq!(list_item("2024 was a good year"), None);
        assert_eq!(list_item("3.5 million"), None);
        assert_eq!(list_item("-5"), None);
    }

    #[test]
    fn fences_are_split() {
        let blocks = fenced_blocks("a\n```python\nx = 1\n```\nb\n```\ny = 2\n```");
        assert_eq!(blocks, vec!["x = 1", "y = 2"]);
        assert_eq!(fenced_blocks("```\nunterminated"), vec!["unterminated"]);
    }

    #[test]
    fn metadata_description_names_handles() {
        let described = describe_metadata(&[sales_meta()]);
        assert!(described.contains("DATA['sales'] (csv, 4 rows)"));
        assert!(described.contains("units (integer)"));
        assert!(described.contains("\"region\":\"north\""));
        assert_eq!(describe_metadata(&[]), "(no data sources)\n");
    }

    fn sales_meta() -> DataMetadata {
        DataMetadata {
            source: "sales".into(),
            format: DataFormat::Csv,
            schema: vec![
                analyst_core::Column::new("region", ColumnType::String),
                analyst_core::Column::new("units", ColumnType::Integer),
            ],
            sample_rows: vec![serde_json::json!({"region": "north", "units": 10})],
            row_count: 4,
        }
    }

    proptest! {
        #[test]
        fn numbered_lists_keep_order(
            items in prop::collection::vec("[a-z][a-z ]{0,20}[a-z]", 1..8),
        ) {
            let text = items
                .iter()
                .enumerate()
                .map(|(i, item)| format!("{}. {item}", i + 1))
                .collect::<Vec<_>>()
                .join("\n");
            prop_assert_eq!(parse_plan(&text).unwrap(), items);
        }

        #[test]
        fn parsing_never_panics(text in ".{0,200}") {
            let _ = parse_plan(&text);
        }
    }
}
