//! Sandboxed execution
//!
//! Every attempt runs in its own interpreter process:
//!
//! 1. Static scan; a violation or syntax error is returned without spawning
//! 2. Fresh scratch directory with read-only data copies
//! 3. `python -I -B -c <harness>` with a cleared environment, cwd in scratch
//! 4. Host-side watchdog; the child is killed when the limit elapses
//! 5. Output classified: violation > timeout > error > success
//! 6. Scratch directory removed

use crate::error::SandboxError;
use crate::harness::{
    parse_envelope, parse_violation, Envelope, HarnessContext, Markers, CONTEXT_FILE,
    HARNESS_SOURCE, SCRIPT_FILE,
};
use crate::scanner::{ScanReport, Scanner};
use crate::scratch::ScratchSpace;
use analyst_core::{
    DataHandle, ExecutionFault, ExecutionOutcome, SandboxConfig, Violation, ViolationCategory,
};
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::OnceCell;

/// Marked lines kept per stream
const MAX_MARKED_LINES: usize = 64;

/// One script to run
#[derive(Debug, Clone)]
pub struct ExecutionRequest<'a> {
    pub code: &'a str,
    pub data: &'a [DataHandle],
    /// Results of earlier steps, exposed as `PREVIOUS_RESULTS`
    pub previous_results: &'a [Value],
    /// Tighter limit than the configured one (remaining request budget)
    pub timeout: Option<Duration>,
    /// Scratch directory label
    pub label: String,
}

impl<'a> ExecutionRequest<'a> {
    #[must_use]
    pub fn new(code: &'a str, data: &'a [DataHandle]) -> Self {
        Self {
            code,
            data,
            previous_results: &[],
            timeout: None,
            label: "run".into(),
        }
    }

    #[inline]
    #[must_use]
    pub fn with_previous_results(mut self, results: &'a [Value]) -> Self {
        self.previous_results = results;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[inline]
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

/// Runs generated code and classifies the outcome
///
/// Implement this trait to substitute the execution backend.
#[async_trait]
pub trait CodeExecutor: Send + Sync {
    /// Execute one script
    ///
    /// Script failures are outcomes; `Err` means the sandbox itself broke.
    async fn execute(
        &self,
        request: &ExecutionRequest<'_>,
    ) -> Result<ExecutionOutcome, SandboxError>;
}

/// Out-of-process Python sandbox
#[derive(Debug)]
pub struct SandboxExecutor {
    config: SandboxConfig,
    scanner: Scanner,
    interpreter: OnceCell<PathBuf>,
}

impl SandboxExecutor {
    /// Create executor for `config`
    ///
    /// # Errors
    /// Returns `SandboxError::Parser` if the Python grammar cannot be loaded.
    pub fn new(config: SandboxConfig) -> Result<Self, SandboxError> {
        let scanner = Scanner::new(&config.policy)?;
        Ok(Self {
            config,
            scanner,
            interpreter: OnceCell::new(),
        })
    }

    /// Static scan only
    #[must_use]
    pub fn check(&self, code: &str) -> ScanReport {
        self.scanner.scan(code)
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Absolute path of the real interpreter, resolved once
    ///
    /// # Errors
    /// Returns `Spawn` or `Interpreter` if the configured python is unusable.
    pub async fn interpreter(&self) -> Result<&Path, SandboxError> {
        self.interpreter
            .get_or_try_init(|| resolve_interpreter(&self.config.python))
            .await
            .map(PathBuf::as_path)
    }

    async fn run_in(
        &self,
        scratch: &mut ScratchSpace,
        python: &Path,
        request: &ExecutionRequest<'_>,
        limit: Duration,
    ) -> Result<ExecutionOutcome, SandboxError> {
        scratch.stage_data(request.data).await?;
        let script = scratch.write(SCRIPT_FILE, request.code.as_bytes()).await?;
        let context = HarnessContext::new(
            self.scanner.policy(),
            &self.config,
            scratch.path(),
            scratch.staged(),
            request.previous_results,
        );
        let context_path = scratch
            .write(CONTEXT_FILE, &serde_json::to_vec(&context)?)
            .await?;
        let markers = Markers::generate();

        let mut command = Command::new(python);
        command
            .arg("-I")
            .arg("-B")
            .arg("-c")
            .arg(HARNESS_SOURCE)
            .arg(&script)
            .arg(&context_path)
            .arg(markers.nonce())
            .env_clear()
            .envs(sandbox_env(scratch.path()))
            .current_dir(scratch.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| SandboxError::Spawn {
            program: python.display().to_string(),
            source,
        })?;

        // Read both pipes while waiting so a chatty script cannot block on a full pipe
        let cap = self.config.max_output_bytes;
        let stdout = tokio::spawn(capture(child.stdout.take(), markers.result().to_string(), cap));
        let stderr = tokio::spawn(capture(
            child.stderr.take(),
            markers.violation().to_string(),
            cap,
        ));

        let exit = match tokio::time::timeout(limit, child.wait()).await {
            Ok(status) => Some(status.map_err(SandboxError::Wait)?.to_string()),
            Err(_) => {
                tracing::debug!(
                    limit_ms = millis(limit),
                    "watchdog fired, killing sandbox process"
                );
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "failed to kill sandbox process");
                }
                None
            }
        };

        let stdout = stdout
            .await
            .map_err(|e| SandboxError::Capture(e.to_string()))?;
        let stderr = stderr
            .await
            .map_err(|e| SandboxError::Capture(e.to_string()))?;

        Ok(classify(
            &RunOutput {
                exit,
                stdout,
                stderr,
            },
            limit,
            cap,
        ))
    }
}

#[async_trait]
impl CodeExecutor for SandboxExecutor {
    async fn execute(
        &self,
        request: &ExecutionRequest<'_>,
    ) -> Result<ExecutionOutcome, SandboxError> {
        let report = self.scanner.scan(request.code);
        if let Some(outcome) = report.blocking_outcome() {
            tracing::info!(
                label = %request.label,
                violations = report.violations.len(),
                kind = ?outcome.kind(),
                "script rejected before execution"
            );
            return Ok(outcome);
        }

        let python = self.interpreter().await?.to_path_buf();
        let limit = request
            .timeout
            .map_or(self.config.execution_timeout(), |t| t.min(self.config.execution_timeout()));

        let mut scratch =
            ScratchSpace::create(self.config.scratch_root.as_deref(), &request.label)?;
        let started = Instant::now();
        let outcome = self.run_in(&mut scratch, &python, request, limit).await;
        if let Err(e) = scratch.close() {
            tracing::warn!(error = %e, "scratch directory not removed");
        }

        if let Ok(outcome) = &outcome {
            tracing::info!(
                label = %request.label,
                kind = ?outcome.kind(),
                duration_ms = millis(started.elapsed()),
                "script executed"
            );
        }
        outcome
    }
}

/// Ask `python` for its real executable path
///
/// Launchers such as version-manager shims need the caller's environment,
/// which the sandbox clears; the resolved binary does not.
///
/// # Errors
/// Returns `Spawn` if `python` cannot be started, `Interpreter` if the
/// answer is unusable.
pub async fn resolve_interpreter(python: &str) -> Result<PathBuf, SandboxError> {
    let output = Command::new(python)
        .args(["-I", "-c", "import sys; print(sys.executable)"])
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|source| SandboxError::Spawn {
            program: python.to_string(),
            source,
        })?;
    if !output.status.success() {
        return Err(SandboxError::Interpreter(format!(
            "{python} exited with {}",
            output.status
        )));
    }
    let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if path.is_empty() {
        return Err(SandboxError::Interpreter(format!(
            "{python} did not report an executable"
        )));
    }
    tracing::debug!(python, resolved = %path, "resolved interpreter");
    Ok(PathBuf::from(path))
}

fn sandbox_env(scratch: &Path) -> Vec<(&'static str, std::ffi::OsString)> {
    let dir = scratch.as_os_str().to_os_string();
    vec![
        ("HOME", dir.clone()),
        ("TMPDIR", dir.clone()),
        ("MPLCONFIGDIR", dir),
        ("MPLBACKEND", "Agg".into()),
        ("LC_ALL", "C.UTF-8".into()),
        ("OPENBLAS_NUM_THREADS", "1".into()),
        ("OMP_NUM_THREADS", "1".into()),
        ("MKL_NUM_THREADS", "1".into()),
    ]
}

/// Lines read from one pipe
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct Stream {
    /// Payloads of marker-prefixed lines
    pub(crate) marked: Vec<String>,
    /// Everything else, newest `cap` bytes
    pub(crate) tail: String,
}

#[derive(Debug, Default)]
pub(crate) struct RunOutput {
    /// Exit status description; `None` when the watchdog fired
    pub(crate) exit: Option<String>,
    pub(crate) stdout: Stream,
    pub(crate) stderr: Stream,
}

async fn capture<R>(reader: Option<R>, marker: String, cap: usize) -> Stream
where
    R: AsyncRead + Unpin,
{
    let mut stream = Stream::default();
    let Some(reader) = reader else {
        return stream;
    };
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(|c| c == '\n' || c == '\r');
                if let Some(payload) = line.strip_prefix(marker.as_str()) {
                    if stream.marked.len() < MAX_MARKED_LINES {
                        stream.marked.push(payload.to_string());
                    }
                } else {
                    stream.tail.push_str(line);
                    stream.tail.push('\n');
                    keep_tail(&mut stream.tail, cap);
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "sandbox pipe read failed");
                break;
            }
        }
    }
    stream
}

/// Drop the front of `s` until it fits in `cap` bytes
fn keep_tail(s: &mut String, cap: usize) {
    if s.len() <= cap {
        return;
    }
    let mut cut = s.len() - cap;
    while !s.is_char_boundary(cut) {
        cut += 1;
    }
    s.drain(..cut);
}

fn tail_of(mut s: String, cap: usize) -> String {
    keep_tail(&mut s, cap);
    s
}

/// Classification priority: violation, timeout, error, success
pub(crate) fn classify(run: &RunOutput, limit: Duration, cap: usize) -> ExecutionOutcome {
    if let Some(violation) = run.stderr.marked.iter().find_map(|p| parse_violation(p)) {
        return ExecutionOutcome::SandboxViolation(violation);
    }
    let Some(exit) = &run.exit else {
        return ExecutionOutcome::Timeout {
            limit_ms: millis(limit),
        };
    };
    match run.stdout.marked.last().and_then(|p| parse_envelope(p)) {
        Some(Envelope::Ok { result, stdout }) => ExecutionOutcome::Succeeded {
            result,
            stdout: tail_of(stdout, cap),
        },
        Some(Envelope::Error { mut error, .. }) => {
            error.trace = error.trace.map(|t| tail_of(t, cap));
            ExecutionOutcome::ExecutionError(error)
        }
        Some(Envelope::Violation { message, .. }) => {
            ExecutionOutcome::SandboxViolation(Violation::new(ViolationCategory::Call, message))
        }
        None => {
            let mut fault = ExecutionFault::new(
                "AbnormalExit",
                format!("interpreter terminated without a result ({exit})"),
            );
            let stderr = run.stderr.tail.trim();
            if !stderr.is_empty() {
                fault = fault.with_trace(tail_of(stderr.to_string(), cap));
            }
            ExecutionOutcome::ExecutionError(fault)
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
