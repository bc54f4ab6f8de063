//! Analyst configuration
//!
//! Built once per process (defaults, then an optional TOML file, then
//! environment overrides supplied by the binary) and handed to every
//! component by reference. Nothing below this module reads the environment.

use crate::error::ConfigError;
use crate::retry::{Backoff, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnalystConfig {
    pub completion: CompletionConfig,
    pub retry: RetryPolicy,
    pub sandbox: SandboxConfig,
    pub orchestration: OrchestrationConfig,
}

/// Completion service parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CompletionConfig {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    /// OpenAI-compatible chat-completions URL
    pub endpoint: String,
    /// Longer prompts are cut in the middle
    pub max_prompt_chars: usize,
    /// Per-call HTTP timeout
    pub request_timeout_ms: u64,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            max_tokens: 800,
            temperature: 0.7,
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            max_prompt_chars: 12_000,
            request_timeout_ms: 60_000,
        }
    }
}

/// Sandbox process limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SandboxConfig {
    /// Interpreter executable
    pub python: String,
    /// Watchdog limit per attempt
    pub execution_timeout_ms: u64,
    /// Address-space limit (`ulimit -v`)
    pub memory_limit_mb: Option<u64>,
    /// CPU-time limit (`ulimit -t`)
    pub cpu_limit_secs: Option<u64>,
    /// Captured stdout/stderr are cut to this size
    pub max_output_bytes: usize,
    /// Parent of per-attempt scratch directories; system temp dir when unset
    pub scratch_root: Option<PathBuf>,
    pub policy: SandboxPolicy,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            python: "python3".to_string(),
            execution_timeout_ms: 30_000,
            memory_limit_mb: Some(2048),
            cpu_limit_secs: None,
            max_output_bytes: 64 * 1024,
            scratch_root: None,
            policy: SandboxPolicy::default(),
        }
    }
}

impl SandboxConfig {
    #[inline]
    #[must_use]
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }
}

/// Import whitelist and function blocklist
///
/// Shared by the static scanner and the runtime harness so both enforce the
/// same rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SandboxPolicy {
    /// Importable top-level modules
    pub allowed_modules: Vec<String>,
    /// Builtins that are removed from the script's namespace
    pub blocked_builtins: Vec<String>,
    /// Attribute names that are never callable (`os.system`, `shutil.rmtree`)
    pub blocked_attributes: Vec<String>,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self {
            allowed_modules: strings(&[
                "pandas",
                "numpy",
                "scipy",
                "statsmodels",
                "sklearn",
                "matplotlib",
                "seaborn",
                "math",
                "statistics",
                "random",
                "decimal",
                "fractions",
                "json",
                "csv",
                "re",
                "string",
                "textwrap",
                "datetime",
                "time",
                "calendar",
                "collections",
                "itertools",
                "functools",
                "operator",
                "heapq",
                "bisect",
                "copy",
                "typing",
                "dataclasses",
                "enum",
                "numbers",
                "warnings",
            ]),
            blocked_builtins: strings(&[
                "exec",
                "eval",
                "compile",
                "__import__",
                "globals",
                "locals",
                "vars",
                "getattr",
                "setattr",
                "delattr",
                "breakpoint",
                "input",
                "exit",
                "quit",
                "help",
                "memoryview",
            ]),
            blocked_attributes: strings(&[
                "system",
                "popen",
                "Popen",
                "fork",
                "forkpty",
                "execv",
                "execve",
                "execl",
                "execle",
                "execlp",
                "execlpe",
                "execvp",
                "execvpe",
                "spawnl",
                "spawnle",
                "spawnv",
                "spawnve",
                "posix_spawn",
                "posix_spawnp",
                "check_output",
                "check_call",
                "getoutput",
                "getstatusoutput",
                "urlopen",
                "urlretrieve",
                "create_connection",
                "rmtree",
                "kill",
                "killpg",
                "_exit",
            ]),
        }
    }
}

/// What a failed step means for the rest of the request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialResults {
    /// Run every step; answer with whatever succeeded
    #[default]
    Return,
    /// Stop at the first failed step; answer nothing
    Reject,
}

/// How sandbox violations count against the retry budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationPolicy {
    /// Violations consume the same budget as execution errors
    #[default]
    SharedBudget,
    /// First violation fails the step
    FailFast,
}

/// Controller behaviour
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OrchestrationConfig {
    pub partial_results: PartialResults,
    pub violation_policy: ViolationPolicy,
    /// Ask for a new plan once when the first one cannot be parsed
    pub replan_on_malformed: bool,
    /// Whole-request wall-clock budget
    pub request_budget_ms: Option<u64>,
    pub max_steps: usize,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            partial_results: PartialResults::Return,
            violation_policy: ViolationPolicy::SharedBudget,
            replan_on_malformed: true,
            request_budget_ms: None,
            max_steps: 10,
        }
    }
}

impl AnalystConfig {
    /// Parse from TOML text; missing sections take defaults
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Load from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Apply `ANALYST_*` overrides through `lookup`
    ///
    /// `lookup` is usually `|k| std::env::var(k).ok()`; tests pass a map.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("ANALYST_MODEL") {
            self.completion.model = v;
        }
        if let Some(v) = lookup("ANALYST_API_URL") {
            self.completion.endpoint = v;
        }
        if let Some(v) = parse_override(&lookup, "ANALYST_MAX_TOKENS")? {
            self.completion.max_tokens = v;
        }
        if let Some(v) = parse_override(&lookup, "ANALYST_TEMPERATURE")? {
            self.completion.temperature = v;
        }
        if let Some(v) = parse_override(&lookup, "ANALYST_MAX_RETRIES")? {
            self.retry.max_retries = v;
        }
        if let Some(delay_ms) = parse_override(&lookup, "ANALYST_RETRY_DELAY_MS")? {
            self.retry.backoff = match self.retry.backoff {
                Backoff::Exponential { max_ms, .. } => Backoff::Exponential {
                    initial_ms: delay_ms,
                    max_ms: max_ms.max(delay_ms),
                },
                Backoff::None | Backoff::Linear { .. } => Backoff::Linear { delay_ms },
            };
        }
        if let Some(v) = parse_override(&lookup, "ANALYST_CODE_EXECUTION_TIMEOUT_MS")? {
            self.sandbox.execution_timeout_ms = v;
        }
        Ok(self)
    }

    /// Reject values no component can work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.completion;
        if !(0.0..=2.0).contains(&c.temperature) {
            return Err(ConfigError::out_of_range("temperature", "must be within [0, 2]"));
        }
        if c.max_tokens == 0 {
            return Err(ConfigError::out_of_range("max_tokens", "must be positive"));
        }
        if c.model.trim().is_empty() {
            return Err(ConfigError::out_of_range("model", "must not be empty"));
        }
        if c.max_prompt_chars < 100 {
            return Err(ConfigError::out_of_range("max_prompt_chars", "must be at least 100"));
        }
        let s = &self.sandbox;
        if s.execution_timeout_ms == 0 {
            return Err(ConfigError::out_of_range(
                "execution_timeout_ms",
                "must be positive",
            ));
        }
        if s.max_output_bytes == 0 {
            return Err(ConfigError::out_of_range("max_output_bytes", "must be positive"));
        }
        if s.python.trim().is_empty() {
            return Err(ConfigError::out_of_range("python", "must name an interpreter"));
        }
        if s.policy.allowed_modules.is_empty() {
            return Err(ConfigError::out_of_range(
                "allowed_modules",
                "whitelist must not be empty",
            ));
        }
        if self.orchestration.max_steps == 0 {
            return Err(ConfigError::out_of_range("max_steps", "must be positive"));
        }
        Ok(())
    }
}

fn parse_override<F, T>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidOverride {
                key: key.to_string(),
                value: raw,
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = AnalystConfig::default();
        config.validate().unwrap();
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.max_attempts(), 4);
        assert_eq!(config.orchestration.partial_results, PartialResults::Return);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = AnalystConfig::from_toml_str(
            r#"
            [completion]
            model = "local-model"

            [retry]
            max_retries = 5
            backoff = { kind = "exponential", initial_ms = 100, max_ms = 2000 }

            [orchestration]
            partial_results = "reject"
            "#,
        )
        .unwrap();

        assert_eq!(config.completion.model, "local-model");
        assert_eq!(config.completion.max_tokens, 800);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(
            config.retry.backoff,
            Backoff::Exponential {
                initial_ms: 100,
                max_ms: 2000
            }
        );
        assert_eq!(config.orchestration.partial_results, PartialResults::Reject);
        assert_eq!(config.sandbox, SandboxConfig::default());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = AnalystConfig::from_toml_str("[completion]\nmodle = \"x\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn env_overrides_apply() {
        let config = AnalystConfig::default()
            .with_overrides(env(&[
                ("ANALYST_MODEL", "m"),
                ("ANALYST_MAX_RETRIES", "1"),
                ("ANALYST_RETRY_DELAY_MS", "250"),
                ("ANALYST_CODE_EXECUTION_TIMEOUT_MS", "5000"),
            ]))
            .unwrap();

        assert_eq!(config.completion.model, "m");
        assert_eq!(config.retry.max_retries, 1);
        assert_eq!(config.retry.backoff, Backoff::Linear { delay_ms: 250 });
        assert_eq!(config.sandbox.execution_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn bad_override_is_reported() {
        let err = AnalystConfig::default()
            .with_overrides(env(&[("ANALYST_TEMPERATURE", "warm")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidOverride { ref key, .. } if key == "ANALYST_TEMPERATURE"
        ));
    }

    #[test]
    fn validate_rejects_out_of_range() {
        let mut config = AnalystConfig::default();
        config.completion.temperature = 3.0;
        assert!(config.validate().is_err());

        let mut config = AnalystConfig::default();
        config.sandbox.execution_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = AnalystConfig::default();
        config.sandbox.policy.allowed_modules.clear();
        assert!(config.validate().is_err());
    }
}
