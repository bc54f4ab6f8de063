//! Correction loop and request orchestration
//!
//! [`CorrectionLoop`] drives one step through generate → execute → evaluate
//! until it succeeds or its attempt budget is spent. [`Analyst`] plans a
//! request, runs its steps strictly in plan order and aggregates a report.
//!
//! Neither keeps state between requests; all per-request state lives on the
//! stack of `run`, and every attempt gets its own scratch space from the
//! executor.

use crate::error::{PlanningError, RequestError};
use crate::generator::{CodeGenerator, Correction, GenerationRequest};
use crate::planner::Planner;
use crate::report::{AbortInfo, AnalysisReport};
use crate::summarizer::FileSummarizer;
use analyst_core::{
    AnalysisRequest, AnalystConfig, Attempt, DataHandle, DataMetadata, Disposition, ErrorKind,
    ExecutionOutcome, PartialResults, RequestId, RetryDecision, RetryPolicy, Retrier,
    StateMachineError, Step, StepError, StepStatus, ViolationPolicy,
};
use analyst_llm::{CompletionClient, CompletionService};
use analyst_sandbox::{CodeExecutor, ExecutionRequest};
use chrono::Utc;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::Instrument;

/// Request-scoped inputs shared by every step
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    pub request_id: RequestId,
    pub question: &'a str,
    pub data: &'a [DataHandle],
    pub metadata: &'a [DataMetadata],
    /// Results of earlier succeeded steps, in plan order
    pub previous_results: &'a [Value],
    /// Wall-clock end of the request budget
    pub deadline: Option<Instant>,
}

/// Drives single steps through the correction cycle
pub struct CorrectionLoop {
    generator: CodeGenerator,
    executor: Arc<dyn CodeExecutor>,
    policy: RetryPolicy,
    violations: ViolationPolicy,
}

impl std::fmt::Debug for CorrectionLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrectionLoop")
            .field("policy", &self.policy)
            .field("violations", &self.violations)
            .finish_non_exhaustive()
    }
}

impl CorrectionLoop {
    /// Corrections happen immediately; only the budget of `retry` applies.
    #[must_use]
    pub fn new(
        generator: CodeGenerator,
        executor: Arc<dyn CodeExecutor>,
        retry: RetryPolicy,
        violations: ViolationPolicy,
    ) -> Self {
        Self {
            generator,
            executor,
            policy: RetryPolicy::immediate(retry.max_retries),
            violations,
        }
    }

    /// Attempts allowed per step
    #[inline]
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.policy.max_attempts()
    }

    /// Run one step to a terminal status
    ///
    /// The returned step is `Succeeded` or `Failed`; its history holds every
    /// executed attempt.
    pub async fn run_step(&self, index: usize, description: &str, ctx: &StepContext<'_>) -> Step {
        let span = tracing::info_span!("step", index, description);
        async move {
            let mut step = Step::new(index, description, self.max_attempts());
            if let Err(e) = self.drive(&mut step, ctx).await {
                tracing::error!(error = %e, "step state machine violated");
                // best effort; a terminal step cannot be failed again
                let _ = step.fail(StepError::new(ErrorKind::Internal, e.to_string()));
            }
            match step.status() {
                StepStatus::Succeeded => {
                    tracing::info!(attempts = step.attempts(), "step succeeded");
                }
                status => tracing::warn!(
                    attempts = step.attempts(),
                    ?status,
                    kind = ?step.last_error().map(|e| e.kind),
                    "step did not succeed"
                ),
            }
            step
        }
        .instrument(span)
        .await
    }

    async fn drive(&self, step: &mut Step, ctx: &StepContext<'_>) -> Result<(), StateMachineError> {
        let violations = self.violations;
        let classify = move |outcome: &ExecutionOutcome| match outcome {
            ExecutionOutcome::SandboxViolation(_) if violations == ViolationPolicy::FailFast => {
                Disposition::Abort
            }
            _ => Disposition::Retry,
        };

        let mut retrier = Retrier::new(self.policy);
        while let Some(attempt) = retrier.start_attempt() {
            if attempt > 1 && deadline_passed(ctx.deadline) {
                return step.fail(deadline_error(step.attempts()));
            }

            let prior = step.code().map(str::to_owned).zip(step.last_error().cloned());
            step.begin_attempt()?;
            tracing::info!(attempt, correction = prior.is_some(), "generating code");

            let request = GenerationRequest {
                question: ctx.question,
                step: step.description(),
                metadata: ctx.metadata,
                previous_results: ctx.previous_results,
                correction: prior.as_ref().map(|(code, error)| Correction { code, error }),
            };
            let generated = match within(ctx.deadline, self.generator.generate(&request)).await {
                Some(generated) => generated,
                None => return step.fail(deadline_error(step.attempts())),
            };
            let code = match generated {
                Ok(code) => code,
                Err(e) => {
                    tracing::warn!(
                        attempt,
                        error = %e,
                        fatal = e.is_fatal(),
                        "code generation failed"
                    );
                    return step.fail(e.to_step_error());
                }
            };
            step.code_ready(code.clone())?;

            let label = format!(
                "{}-s{}-a{attempt}",
                short_id(ctx.request_id),
                step.index()
            );
            let mut request = ExecutionRequest::new(&code, ctx.data)
                .with_previous_results(ctx.previous_results)
                .with_label(label);
            if let Some(deadline) = ctx.deadline {
                request = request.with_timeout(deadline.saturating_duration_since(Instant::now()));
            }

            let started = Instant::now();
            let outcome = match self.executor.execute(&request).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(attempt, error = %e, "sandbox failed to run script");
                    return step.fail(StepError::new(ErrorKind::Internal, e.to_string()));
                }
            };
            let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            tracing::info!(attempt, outcome = ?outcome.kind(), duration_ms, "attempt executed");

            step.record(Attempt {
                number: attempt,
                code,
                outcome: outcome.clone(),
                duration_ms,
            })?;
            if outcome.is_success() {
                return Ok(());
            }

            match retrier.on_failure(&outcome, &classify) {
                RetryDecision::RetryAfter(_) => {
                    tracing::info!(
                        attempt,
                        kind = ?outcome.kind(),
                        "attempt failed, regenerating with error context"
                    );
                }
                RetryDecision::GiveUp(reason) => {
                    tracing::warn!(attempt, ?reason, "giving up on step");
                    break;
                }
            }
        }

        let error = step.last_error().cloned().unwrap_or_else(|| {
            StepError::new(ErrorKind::Internal, "step ended without an outcome")
        });
        step.fail(error)
    }
}

/// Analysis entry point
///
/// Built once from an immutable configuration and the two external seams;
/// safe to share across concurrent requests.
#[derive(Debug)]
pub struct Analyst {
    config: AnalystConfig,
    planner: Planner,
    correction: CorrectionLoop,
    summarizer: FileSummarizer,
}

impl Analyst {
    #[must_use]
    pub fn new(
        config: AnalystConfig,
        service: Arc<dyn CompletionService>,
        executor: Arc<dyn CodeExecutor>,
    ) -> Self {
        let client = CompletionClient::new(service, config.retry);
        let planner = Planner::new(
            client.clone(),
            config.completion.clone(),
            config.orchestration.max_steps,
        );
        let generator =
            CodeGenerator::new(client, config.completion.clone(), &config.sandbox.policy);
        let correction = CorrectionLoop::new(
            generator,
            executor,
            config.retry,
            config.orchestration.violation_policy,
        );
        Self {
            config,
            planner,
            correction,
            summarizer: FileSummarizer::new(),
        }
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &AnalystConfig {
        &self.config
    }

    /// Summarize `data`, then answer `question` against it
    ///
    /// Always returns a report; unreadable data aborts with kind `internal`.
    pub async fn submit_analysis(&self, question: &str, data: &[DataHandle]) -> AnalysisReport {
        let started_at = Utc::now();
        let started = Instant::now();
        let metadata: Result<Vec<DataMetadata>, _> =
            data.iter().map(|h| self.summarizer.summarize(h)).collect();
        match metadata {
            Ok(metadata) => self.run(AnalysisRequest::new(question, data.to_vec(), metadata)).await,
            Err(e) => {
                let error = RequestError::from(e);
                tracing::error!(error = %error, "could not summarize data");
                AnalysisReport::aborted(
                    RequestId::new(),
                    self.config.orchestration.partial_results,
                    abort_info(&error),
                    started_at,
                    elapsed_ms(started),
                )
            }
        }
    }

    /// Plan and execute a prepared request
    pub async fn run(&self, request: AnalysisRequest) -> AnalysisReport {
        let span = tracing::info_span!("analysis", request_id = %request.id());
        self.run_inner(&request).instrument(span).await
    }

    async fn run_inner(&self, request: &AnalysisRequest) -> AnalysisReport {
        let started_at = Utc::now();
        let started = Instant::now();
        let orchestration = &self.config.orchestration;
        let policy = orchestration.partial_results;
        let deadline = orchestration
            .request_budget_ms
            .map(|ms| started + Duration::from_millis(ms));
        tracing::info!(
            sources = request.data().len(),
            budget_ms = ?orchestration.request_budget_ms,
            "analysis started"
        );

        let plan = match within(deadline, self.plan(request)).await {
            Some(Ok(plan)) => plan,
            Some(Err(e)) => {
                let error = RequestError::from(e);
                tracing::error!(error = %error, "planning failed, aborting request");
                return AnalysisReport::aborted(
                    request.id(),
                    policy,
                    abort_info(&error),
                    started_at,
                    elapsed_ms(started),
                );
            }
            None => {
                let error = self.deadline_error();
                tracing::error!(error = %error, "request budget spent during planning");
                return AnalysisReport::aborted(
                    request.id(),
                    policy,
                    abort_info(&error),
                    started_at,
                    elapsed_ms(started),
                );
            }
        };

        let max_attempts = self.correction.max_attempts();
        let mut steps: Vec<Step> = plan
            .iter()
            .enumerate()
            .map(|(i, description)| Step::new(i, description.as_str(), max_attempts))
            .collect();
        let mut results: Vec<Value> = Vec::new();
        let mut abort = None;

        for (index, description) in plan.iter().enumerate() {
            if deadline_passed(deadline) {
                abort = Some(abort_info(&self.deadline_error()));
                break;
            }
            let ctx = StepContext {
                request_id: request.id(),
                question: request.question(),
                data: request.data(),
                metadata: request.metadata(),
                previous_results: &results,
                deadline,
            };
            let step = self.correction.run_step(index, description, &ctx).await;

            let failure = step
                .last_error()
                .filter(|_| step.status() == StepStatus::Failed)
                .cloned();
            if let Some(result) = step.result() {
                results.push(result.clone());
            }
            steps[index] = step;

            if let Some(error) = failure {
                if error.kind.aborts_request() || error.kind == ErrorKind::Deadline {
                    tracing::error!(index, kind = %error.kind, "step failure aborts the request");
                    abort = Some(AbortInfo {
                        kind: error.kind,
                        message: error.message,
                    });
                    break;
                }
                if policy == PartialResults::Reject {
                    tracing::warn!(index, "step failed and partial results are rejected, stopping");
                    break;
                }
            }
        }

        let report = AnalysisReport::from_steps(
            request.id(),
            policy,
            &steps,
            abort,
            started_at,
            elapsed_ms(started),
        );
        tracing::info!(
            success = report.overall_success,
            steps = report.steps.len(),
            elapsed_ms = report.elapsed_ms,
            "analysis finished"
        );
        report
    }

    async fn plan(&self, request: &AnalysisRequest) -> Result<Vec<String>, PlanningError> {
        match self.planner.plan(request.question(), request.metadata()).await {
            Err(e) if e.is_malformed() && self.config.orchestration.replan_on_malformed => {
                tracing::warn!(error = %e, "plan malformed, asking once more");
                self.planner.plan(request.question(), request.metadata()).await
            }
            other => other,
        }
    }

    fn deadline_error(&self) -> RequestError {
        RequestError::Deadline {
            budget_ms: self.config.orchestration.request_budget_ms.unwrap_or_default(),
        }
    }
}

fn abort_info(error: &RequestError) -> AbortInfo {
    AbortInfo {
        kind: error.kind(),
        message: error.to_string(),
    }
}

fn deadline_error(attempts: u32) -> StepError {
    StepError::new(
        ErrorKind::Deadline,
        format!("request budget spent after {attempts} attempts"),
    )
}

fn deadline_passed(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

/// Run `fut` to completion, or until `deadline`
async fn within<F: Future>(deadline: Option<Instant>, fut: F) -> Option<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut).await.ok(),
        None => Some(fut.await),
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn short_id(id: RequestId) -> String {
    id.0.simple().to_string().chars().take(8).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use analyst_test_utils::{
        execution_error, import_violation, sales_metadata, succeeded, test_config, timeout,
        ScriptedCompletion, ScriptedExecutor,
    };
    use serde_json::json;

    fn correction_loop(
        completions: Arc<ScriptedCompletion>,
        executor: Arc<ScriptedExecutor>,
        max_retries: u32,
        violations: ViolationPolicy,
    ) -> CorrectionLoop {
        let config = test_config();
        let client = CompletionClient::new(completions, RetryPolicy::immediate(0));
        let generator = CodeGenerator::new(client, config.completion, &config.sandbox.policy);
        let retry = RetryPolicy::linear(max_retries, 1_000);
        CorrectionLoop::new(generator, executor, retry, violations)
    }

    fn context<'a>(metadata: &'a [DataMetadata], previous: &'a [Value]) -> StepContext<'a> {
        StepContext {
            request_id: RequestId::new(),
            question: "how many units were sold?",
            data: &[],
            metadata,
            previous_results: previous,
            deadline: None,
        }
    }

    fn code(n: u32) -> String {
        format!("```python\nresult = {n}\n```")
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt() {
        let completions = ScriptedCompletion::from_texts([code(1)]).into_arc();
        let executor = Arc::new(ScriptedExecutor::new([succeeded(json!(28))]));
        let cl = correction_loop(completions, executor.clone(), 3, ViolationPolicy::SharedBudget);
        let metadata = vec![sales_metadata()];

        let step = cl.run_step(0, "sum units", &context(&metadata, &[])).await;
        assert_eq!(step.status(), StepStatus::Succeeded);
        assert_eq!(step.attempts(), 1);
        assert_eq!(step.result(), Some(&json!(28)));
        assert_eq!(executor.codes(), vec!["result = 1\n"]);
    }

    #[tokio::test]
    async fn correction_prompt_carries_previous_error() {
        let completions = ScriptedCompletion::from_texts([code(1), code(2)]).into_arc();
        let executor = Arc::new(ScriptedExecutor::new([
            execution_error("KeyError", "'revenue'"),
            succeeded(json!(28)),
        ]));
        let cl = correction_loop(completions.clone(), executor, 3, ViolationPolicy::SharedBudget);

        let step = cl.run_step(0, "sum revenue", &context(&[], &[])).await;
        assert_eq!(step.status(), StepStatus::Succeeded);
        assert_eq!(step.attempts(), 2);
        assert_eq!(step.history().len(), 2);

        let prompts = completions.prompts();
        assert!(!prompts[0].contains("previous script"));
        assert!(prompts[1].contains("The previous script for this step failed"));
        assert!(prompts[1].contains("result = 1"));
        assert!(prompts[1].contains("KeyError: 'revenue'"));
    }

    #[tokio::test]
    async fn attempts_are_bounded() {
        let completions = ScriptedCompletion::from_texts((1..=3).map(code)).into_arc();
        let executor = Arc::new(ScriptedExecutor::new([
            timeout(100),
            timeout(100),
            timeout(100),
        ]));
        let cl = correction_loop(
            completions.clone(),
            executor.clone(),
            2,
            ViolationPolicy::SharedBudget,
        );

        let step = cl.run_step(0, "loop forever", &context(&[], &[])).await;
        assert_eq!(step.status(), StepStatus::Failed);
        assert_eq!(step.attempts(), 3);
        assert_eq!(step.last_error().unwrap().kind, ErrorKind::Timeout);
        assert_eq!(executor.calls(), 3);
        assert_eq!(completions.remaining(), 0);
    }

    #[tokio::test]
    async fn fail_fast_stops_on_violation() {
        let completions = ScriptedCompletion::from_texts([code(1), code(2)]).into_arc();
        let executor = Arc::new(ScriptedExecutor::new([
            import_violation("subprocess"),
            succeeded(json!(1)),
        ]));
        let cl = correction_loop(completions, executor.clone(), 3, ViolationPolicy::FailFast);

        let step = cl.run_step(0, "list files", &context(&[], &[])).await;
        assert_eq!(step.status(), StepStatus::Failed);
        assert_eq!(step.attempts(), 1);
        assert_eq!(step.last_error().unwrap().kind, ErrorKind::SandboxViolation);
        assert_eq!(executor.calls(), 1);
    }

    #[tokio::test]
    async fn empty_generation_fails_without_retry() {
        let completions =
            ScriptedCompletion::from_texts(["I cannot write that script."]).into_arc();
        let executor = Arc::new(ScriptedExecutor::default());
        let cl = correction_loop(completions, executor.clone(), 3, ViolationPolicy::SharedBudget);

        let step = cl.run_step(0, "anything", &context(&[], &[])).await;
        assert_eq!(step.status(), StepStatus::Failed);
        assert_eq!(step.attempts(), 1);
        assert_eq!(step.last_error().unwrap().kind, ErrorKind::Generation);
        assert_eq!(executor.calls(), 0);
    }

    #[tokio::test]
    async fn sandbox_infrastructure_failure_is_internal() {
        let completions = ScriptedCompletion::from_texts([code(1)]).into_arc();
        // no scripted outcomes: the executor reports an infrastructure error
        let executor = Arc::new(ScriptedExecutor::default());
        let cl = correction_loop(completions, executor, 3, ViolationPolicy::SharedBudget);

        let step = cl.run_step(0, "anything", &context(&[], &[])).await;
        assert_eq!(step.status(), StepStatus::Failed);
        assert_eq!(step.last_error().unwrap().kind, ErrorKind::Internal);
    }

    #[tokio::test]
    async fn previous_results_reach_prompt_and_script() {
        let completions = ScriptedCompletion::from_texts([code(1)]).into_arc();
        let executor = Arc::new(ScriptedExecutor::new([succeeded(json!(2))]));
        let cl = correction_loop(
            completions.clone(),
            executor.clone(),
            0,
            ViolationPolicy::SharedBudget,
        );
        let previous = vec![json!({"north": 16})];

        cl.run_step(1, "compare regions", &context(&[], &previous)).await;
        assert!(completions.prompts()[0].contains("PREVIOUS_RESULTS[0] = {\"north\":16}"));
        assert_eq!(executor.previous_results(), vec![previous]);
    }

    #[test]
    fn short_ids_are_eight_chars() {
        assert_eq!(short_id(RequestId::new()).len(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn within_respects_deadline() {
        let deadline = Instant::now() + Duration::from_millis(50);
        let slow = tokio::time::sleep(Duration::from_secs(5));
        assert!(within(Some(deadline), slow).await.is_none());
        assert_eq!(within(None, async { 7 }).await, Some(7));
    }
}
