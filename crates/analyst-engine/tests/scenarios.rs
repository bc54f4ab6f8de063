//! End-to-end behaviour of the correction loop with scripted collaborators

use analyst_core::{
    AnalysisRequest, AnalystConfig, ErrorKind, ExecutionOutcome, PartialResults, StepStatus,
    ViolationPolicy,
};
use analyst_engine::{Analyst, AnalysisReport};
use analyst_llm::LlmError;
use analyst_sandbox::{CodeExecutor, ExecutionRequest, SandboxError};
use analyst_test_utils::{
    config_with_retry, execution_error, import_violation, plan_json, sales_metadata, succeeded,
    test_config, timeout, write_sales_csv, ScriptedCompletion, ScriptedExecutor,
};
use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn code(body: &str) -> String {
    format!("```python\n{body}\n```")
}

async fn run(
    config: AnalystConfig,
    completions: &Arc<ScriptedCompletion>,
    executor: &Arc<ScriptedExecutor>,
) -> AnalysisReport {
    let analyst = Analyst::new(config, completions.clone(), executor.clone());
    let request = AnalysisRequest::new(
        "How many units were sold?",
        Vec::new(),
        vec![sales_metadata()],
    );
    analyst.run(request).await
}

#[tokio::test]
async fn scenario_a_missing_column_is_corrected() {
    let completions = ScriptedCompletion::from_texts([
        plan_json(&["total revenue"]),
        code("result = rows[0]['revenue']"),
        code("result = sum(r['units'] * r['price'] for r in rows)"),
    ])
    .into_arc();
    let executor = Arc::new(ScriptedExecutor::new([
        execution_error("KeyError", "'revenue'"),
        succeeded(json!(95.0)),
    ]));

    let report = run(test_config(), &completions, &executor).await;

    assert!(report.overall_success);
    assert_eq!(report.steps.len(), 1);
    assert_eq!(report.steps[0].status, StepStatus::Succeeded);
    assert_eq!(report.steps[0].attempts, 2);
    assert_eq!(report.aggregated_answer, "95.0");
    // the second generation saw the first failure
    assert!(completions.prompts()[2].contains("KeyError: 'revenue'"));
}

#[tokio::test]
async fn scenario_b_violation_is_corrected() {
    let completions = ScriptedCompletion::from_texts([
        plan_json(&["list files"]),
        code("import subprocess\nresult = subprocess.run(['ls'])"),
        code("result = 4"),
    ])
    .into_arc();
    let executor = Arc::new(ScriptedExecutor::new([
        import_violation("subprocess"),
        succeeded(json!(4)),
    ]));

    let report = run(test_config(), &completions, &executor).await;

    assert!(report.overall_success);
    assert_eq!(report.steps[0].attempts, 2);
    assert!(completions.prompts()[2].contains("blocked import of 'subprocess'"));
}

#[tokio::test]
async fn scenario_c_timeouts_exhaust_the_budget() {
    let completions = ScriptedCompletion::from_texts([
        plan_json(&["spin"]),
        code("while True: pass"),
        code("while True: pass"),
        code("while True: pass"),
        code("while True: pass"),
    ])
    .into_arc();
    let executor = Arc::new(ScriptedExecutor::new((0..4).map(|_| timeout(5_000))));

    let report = run(test_config(), &completions, &executor).await;

    assert!(!report.overall_success);
    let step = &report.steps[0];
    assert_eq!(step.status, StepStatus::Failed);
    assert_eq!(step.attempts, 4);
    assert_eq!(step.error.as_ref().unwrap().kind, ErrorKind::Timeout);
    assert_eq!(executor.calls(), 4);
    assert!(report.abort.is_none());
}

#[tokio::test(start_paused = true)]
async fn scenario_d_plan_survives_rate_limits() {
    let completions = ScriptedCompletion::new();
    completions
        .push_err(LlmError::RateLimited("429".into()))
        .push_err(LlmError::RateLimited("429".into()))
        .push_ok(plan_json(&["total units"]))
        .push_ok(code("result = 28"));
    let completions = completions.into_arc();
    let executor = Arc::new(ScriptedExecutor::new([succeeded(json!(28))]));

    let started = tokio::time::Instant::now();
    let report = run(config_with_retry(3, 1_000), &completions, &executor).await;

    assert!(report.overall_success);
    assert_eq!(completions.calls(), 4);
    // 1s + 2s of linear backoff before the plan arrived
    assert!(started.elapsed() >= Duration::from_millis(3_000));
}

#[tokio::test]
async fn violations_can_fail_fast() {
    let completions = ScriptedCompletion::from_texts([
        plan_json(&["list files"]),
        code("import os"),
        code("result = 1"),
    ])
    .into_arc();
    let executor = Arc::new(ScriptedExecutor::new([import_violation("os"), succeeded(json!(1))]));
    let mut config = test_config();
    config.orchestration.violation_policy = ViolationPolicy::FailFast;

    let report = run(config, &completions, &executor).await;

    assert!(!report.overall_success);
    assert_eq!(report.steps[0].attempts, 1);
    assert_eq!(
        report.steps[0].error.as_ref().unwrap().kind,
        ErrorKind::SandboxViolation
    );
    assert_eq!(executor.calls(), 1);
}

#[tokio::test]
async fn partial_results_are_returned_by_default() {
    let completions = ScriptedCompletion::from_texts([
        plan_json(&["broken step", "total units"]),
        code("result = x"),
        code("result = x"),
        code("result = 28"),
    ])
    .into_arc();
    let executor = Arc::new(ScriptedExecutor::new([
        execution_error("NameError", "name 'x' is not defined"),
        execution_error("NameError", "name 'x' is not defined"),
        succeeded(json!(28)),
    ]));

    let report = run(config_with_retry(1, 0), &completions, &executor).await;

    assert!(!report.overall_success);
    assert_eq!(report.partial_results, PartialResults::Return);
    assert_eq!(report.statuses(), vec![StepStatus::Failed, StepStatus::Succeeded]);
    assert_eq!(report.aggregated_answer, "28");
    assert_eq!(report.results, vec![json!(28)]);
}

#[tokio::test]
async fn partial_results_can_be_rejected() {
    let completions = ScriptedCompletion::from_texts([
        plan_json(&["broken step", "total units"]),
        code("result = x"),
    ])
    .into_arc();
    let executor = Arc::new(ScriptedExecutor::new([execution_error(
        "NameError",
        "name 'x' is not defined",
    )]));
    let mut config = config_with_retry(0, 0);
    config.orchestration.partial_results = PartialResults::Reject;

    let report = run(config, &completions, &executor).await;

    assert!(!report.overall_success);
    assert_eq!(report.statuses(), vec![StepStatus::Failed, StepStatus::Pending]);
    assert!(report.aggregated_answer.is_empty());
    assert!(report.results.is_empty());
    assert_eq!(report.partial_results, PartialResults::Reject);
}

#[tokio::test]
async fn fatal_completion_aborts_the_request() {
    let completions = ScriptedCompletion::new();
    completions
        .push_ok(plan_json(&["first", "second"]))
        .push_err(LlmError::Authentication("invalid api key".into()));
    let completions = completions.into_arc();
    let executor = Arc::new(ScriptedExecutor::default());

    let report = run(test_config(), &completions, &executor).await;

    assert!(!report.overall_success);
    let abort = report.abort.as_ref().unwrap();
    assert_eq!(abort.kind, ErrorKind::FatalCompletion);
    assert_eq!(report.statuses(), vec![StepStatus::Failed, StepStatus::Pending]);
    assert_eq!(executor.calls(), 0);
    // fatal errors are not retried
    assert_eq!(completions.calls(), 2);
}

#[tokio::test]
async fn exhausted_generation_fails_only_its_step() {
    let completions = ScriptedCompletion::new();
    completions.push_ok(plan_json(&["first", "second"]));
    for _ in 0..4 {
        completions.push_err(LlmError::Unavailable {
            status: 503,
            message: "busy".into(),
        });
    }
    completions.push_ok(code("result = 2"));
    let completions = completions.into_arc();
    let executor = Arc::new(ScriptedExecutor::new([succeeded(json!(2))]));

    let report = run(test_config(), &completions, &executor).await;

    assert!(report.abort.is_none());
    assert_eq!(report.statuses(), vec![StepStatus::Failed, StepStatus::Succeeded]);
    assert_eq!(
        report.steps[0].error.as_ref().unwrap().kind,
        ErrorKind::TransientExhausted
    );
}

#[tokio::test]
async fn malformed_plan_is_retried_once() {
    let completions = ScriptedCompletion::from_texts([
        "I am not sure what to do.".to_string(),
        plan_json(&["total units"]),
        code("result = 28"),
    ])
    .into_arc();
    let executor = Arc::new(ScriptedExecutor::new([succeeded(json!(28))]));

    let report = run(test_config(), &completions, &executor).await;
    assert!(report.overall_success);
    assert_eq!(completions.calls(), 3);
}

#[tokio::test]
async fn twice_malformed_plan_aborts() {
    let completions = ScriptedCompletion::from_texts(["no plan here", "still no plan"]).into_arc();
    let executor = Arc::new(ScriptedExecutor::default());

    let report = run(test_config(), &completions, &executor).await;

    assert!(!report.overall_success);
    assert!(report.steps.is_empty());
    assert_eq!(report.abort.as_ref().unwrap().kind, ErrorKind::Planning);
    assert_eq!(completions.calls(), 2);
}

#[tokio::test]
async fn replanning_can_be_disabled() {
    let completions = ScriptedCompletion::from_texts(["no plan here", "unused"]).into_arc();
    let executor = Arc::new(ScriptedExecutor::default());
    let mut config = test_config();
    config.orchestration.replan_on_malformed = false;

    let report = run(config, &completions, &executor).await;
    assert_eq!(report.abort.as_ref().unwrap().kind, ErrorKind::Planning);
    assert_eq!(completions.calls(), 1);
}

#[tokio::test]
async fn long_plans_are_truncated() {
    let completions = ScriptedCompletion::from_texts([
        plan_json(&["a", "b", "c"]),
        code("result = 1"),
        code("result = 2"),
    ])
    .into_arc();
    let executor = Arc::new(ScriptedExecutor::new([succeeded(json!(1)), succeeded(json!(2))]));
    let mut config = test_config();
    config.orchestration.max_steps = 2;

    let report = run(config, &completions, &executor).await;
    assert!(report.overall_success);
    assert_eq!(report.steps.len(), 2);
}

#[tokio::test]
async fn earlier_results_flow_into_later_steps() {
    let completions = ScriptedCompletion::from_texts([
        plan_json(&["units per region", "best region"]),
        code("result = {'north': 16}"),
        code("result = max(PREVIOUS_RESULTS[0], key=PREVIOUS_RESULTS[0].get)"),
    ])
    .into_arc();
    let executor = Arc::new(ScriptedExecutor::new([
        succeeded(json!({"north": 16})),
        succeeded(json!("north")),
    ]));

    let report = run(test_config(), &completions, &executor).await;

    assert!(report.overall_success);
    assert_eq!(
        executor.previous_results(),
        vec![vec![], vec![json!({"north": 16})]]
    );
    assert!(completions.prompts()[2].contains("PREVIOUS_RESULTS[0] = {\"north\":16}"));
    assert_eq!(
        report.aggregated_answer,
        "1. units per region: {\"north\":16}\n2. best region: north"
    );
}

/// Executor that burns its whole time limit, like a script that never returns
struct StallingExecutor;

#[async_trait]
impl CodeExecutor for StallingExecutor {
    async fn execute(
        &self,
        request: &ExecutionRequest<'_>,
    ) -> Result<ExecutionOutcome, SandboxError> {
        let limit = request.timeout.unwrap_or(Duration::from_secs(30));
        tokio::time::sleep(limit).await;
        Ok(ExecutionOutcome::Timeout {
            limit_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
        })
    }
}

#[tokio::test(start_paused = true)]
async fn request_budget_stops_new_attempts() {
    let completions = ScriptedCompletion::from_texts([
        plan_json(&["spin", "never reached"]),
        code("while True: pass"),
    ])
    .into_arc();
    let mut config = test_config();
    config.orchestration.request_budget_ms = Some(2_000);
    let analyst = Analyst::new(config, completions.clone(), Arc::new(StallingExecutor));

    let started = tokio::time::Instant::now();
    let report = analyst
        .run(AnalysisRequest::new("q", Vec::new(), Vec::new()))
        .await;

    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(report.statuses(), vec![StepStatus::Failed, StepStatus::Pending]);
    assert_eq!(report.steps[0].attempts, 1);
    assert_eq!(report.steps[0].error.as_ref().unwrap().kind, ErrorKind::Deadline);
    assert_eq!(report.abort.as_ref().unwrap().kind, ErrorKind::Deadline);
}

#[tokio::test]
async fn submit_analysis_summarizes_data() {
    let dir = tempfile::tempdir().unwrap();
    let sales = write_sales_csv(dir.path());
    let completions = ScriptedCompletion::from_texts([
        plan_json(&["total units"]),
        code("result = 28"),
    ])
    .into_arc();
    let executor = Arc::new(ScriptedExecutor::new([succeeded(json!(28))]));
    let analyst = Analyst::new(test_config(), completions.clone(), executor.clone());

    let report = analyst.submit_analysis("How many units?", &[sales]).await;

    assert!(report.overall_success);
    let plan_prompt = &completions.prompts()[0];
    assert!(plan_prompt.contains("DATA['sales'] (csv, 4 rows)"));
    assert!(plan_prompt.contains("units (integer)"));
    assert!(plan_prompt.contains("price (float)"));
}

#[tokio::test]
async fn unreadable_data_yields_structured_abort() {
    let completions = ScriptedCompletion::new().into_arc();
    let executor = Arc::new(ScriptedExecutor::default());
    let analyst = Analyst::new(test_config(), completions.clone(), executor);

    let missing = analyst_core::DataHandle::from_path("/nonexistent/analyst/sales.csv");
    let report = analyst.submit_analysis("q", &[missing]).await;

    assert!(!report.overall_success);
    assert_eq!(report.abort.as_ref().unwrap().kind, ErrorKind::Internal);
    assert_eq!(completions.calls(), 0);
}
