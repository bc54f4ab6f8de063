//! Python harness protocol
//!
//! The harness (`harness.py`, embedded at build time) runs inside the child
//! interpreter. The host hands it a JSON context file and a per-run nonce;
//! it answers with marker-prefixed lines:
//!
//! ```text
//! stderr: <<<ANALYST-VIOLATION {nonce}>>>{"category": ..., "resource": ..., "line": ...}
//! stdout: <<<ANALYST-RESULT {nonce}>>>{"status": "ok" | "error" | "violation", ...}
//! ```
//!
//! Violation lines are written the moment a blocked resource is touched, so a
//! script that swallows the exception is still classified as a violation.

use crate::policy::CompiledPolicy;
use analyst_core::{ExecutionFault, SandboxConfig, Violation, ViolationCategory};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

/// Harness source passed to `python -c`
pub const HARNESS_SOURCE: &str = include_str!("harness.py");

/// Script file name inside the scratch directory
pub const SCRIPT_FILE: &str = "analysis.py";

/// Context file name inside the scratch directory
pub const CONTEXT_FILE: &str = "context.json";

/// Everything the harness needs, written as JSON
#[derive(Debug, Serialize)]
pub struct HarnessContext<'a> {
    pub scratch: &'a Path,
    pub allowed_modules: Vec<&'a str>,
    pub blocked_builtins: BTreeMap<&'a str, ViolationCategory>,
    /// Handle name to file name under `data/`
    pub data: &'a BTreeMap<String, String>,
    pub previous_results: &'a [Value],
    pub max_output_bytes: usize,
    pub memory_limit_mb: Option<u64>,
    pub cpu_limit_secs: Option<u64>,
}

impl<'a> HarnessContext<'a> {
    #[must_use]
    pub fn new(
        policy: &'a CompiledPolicy,
        config: &SandboxConfig,
        scratch: &'a Path,
        data: &'a BTreeMap<String, String>,
        previous_results: &'a [Value],
    ) -> Self {
        Self {
            scratch,
            allowed_modules: policy.allowed_modules(),
            blocked_builtins: policy.blocked_builtins(),
            data,
            previous_results,
            max_output_bytes: config.max_output_bytes,
            memory_limit_mb: config.memory_limit_mb,
            cpu_limit_secs: config.cpu_limit_secs,
        }
    }
}

/// Marker prefixes for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Markers {
    nonce: String,
    result: String,
    violation: String,
}

impl Markers {
    /// Fresh random nonce
    #[must_use]
    pub fn generate() -> Self {
        Self::with_nonce(uuid::Uuid::new_v4().simple().to_string())
    }

    #[must_use]
    pub fn with_nonce(nonce: String) -> Self {
        Self {
            result: format!("<<<ANALYST-RESULT {nonce}>>>"),
            violation: format!("<<<ANALYST-VIOLATION {nonce}>>>"),
            nonce,
        }
    }

    #[inline]
    #[must_use]
    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    #[inline]
    #[must_use]
    pub fn result(&self) -> &str {
        &self.result
    }

    #[inline]
    #[must_use]
    pub fn violation(&self) -> &str {
        &self.violation
    }
}

/// Final report written by the harness
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Envelope {
    Ok {
        result: Value,
        #[serde(default)]
        stdout: String,
    },
    Error {
        error: ExecutionFault,
        #[serde(default)]
        stdout: String,
    },
    Violation {
        message: String,
        #[serde(default)]
        stdout: String,
    },
}

/// Parse a marked violation payload
#[must_use]
pub fn parse_violation(payload: &str) -> Option<Violation> {
    match serde_json::from_str(payload) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(error = %e, "unreadable violation record from harness");
            None
        }
    }
}

/// Parse a marked envelope payload
#[must_use]
pub fn parse_envelope(payload: &str) -> Option<Envelope> {
    match serde_json::from_str(payload) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(error = %e, "unreadable result envelope from harness");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use analyst_core::SandboxPolicy;
    use serde_json::json;

    #[test]
    fn harness_source_is_embedded() {
        assert!(HARNESS_SOURCE.contains("ANALYST-RESULT"));
        assert!(HARNESS_SOURCE.contains("addaudithook"));
    }

    #[test]
    fn markers_carry_nonce() {
        let m = Markers::with_nonce("abc".into());
        assert_eq!(m.result(), "<<<ANALYST-RESULT abc>>>");
        assert_eq!(m.violation(), "<<<ANALYST-VIOLATION abc>>>");
        assert_ne!(Markers::generate(), Markers::generate());
    }

    #[test]
    fn envelopes_decode() {
        let ok = parse_envelope(r#"{"status":"ok","result":[1,2],"stdout":"hi"}"#).unwrap();
        assert_eq!(
            ok,
            Envelope::Ok {
                result: json!([1, 2]),
                stdout: "hi".into()
            }
        );

        let err = parse_envelope(
            r#"{"status":"error","stdout":"",
                "error":{"kind":"KeyError","message":"'x'","trace":"tb"}}"#,
        )
        .unwrap();
        assert_eq!(
            err,
            Envelope::Error {
                error: ExecutionFault::new("KeyError", "'x'").with_trace("tb"),
                stdout: String::new()
            }
        );

        assert!(parse_envelope("not json").is_none());
    }

    #[test]
    fn violation_records_decode() {
        let v = parse_violation(r#"{"category":"file_system","resource":"/etc/passwd","line":3}"#)
            .unwrap();
        assert_eq!(
            v,
            Violation::new(ViolationCategory::FileSystem, "/etc/passwd").at_line(3)
        );
        let v = parse_violation(r#"{"category":"network","resource":"socket.connect","line":null}"#)
            .unwrap();
        assert_eq!(v.line, None);
    }

    #[test]
    fn context_serializes_policy() {
        let policy = CompiledPolicy::new(&SandboxPolicy::default());
        let config = SandboxConfig::default();
        let data = BTreeMap::from([("sales".to_string(), "sales.csv".to_string())]);
        let previous = vec![json!(42)];
        let ctx = HarnessContext::new(&policy, &config, Path::new("/tmp/s"), &data, &previous);

        let value = serde_json::to_value(&ctx).unwrap();
        assert_eq!(value["data"]["sales"], "sales.csv");
        assert_eq!(value["blocked_builtins"]["getattr"], "reflection");
        assert_eq!(value["previous_results"], json!([42]));
        assert!(value["allowed_modules"]
            .as_array()
            .unwrap()
            .contains(&json!("pandas")));
    }
}
