//! Run-level guard rails.
//!
//! `SafetyLimits` is plain configuration (it deserializes from the `safety`
//! section of the config file, missing fields take defaults). Enforcement
//! happens at three points: pre-flight (step count, input size), between steps
//! (`check` against a `SafetyTracker`) and after each step (output size).
//! File steps additionally consult the denylist.

use std::time::Instant;

use glob::Pattern;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

const MIB: u64 = 1024 * 1024;

/// Limits applied to every run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyLimits {
    /// Upper bound on enabled steps
    pub max_steps: u32,

    /// Serialized execution input, in bytes
    pub max_input_bytes: u64,

    /// Serialized output of one step, in bytes
    pub max_output_bytes: u64,

    /// Timeout for steps without their own `timeout`
    pub step_timeout_seconds: u64,

    pub run_timeout_seconds: u64,

    /// Globs for workspace paths file steps may not touch
    pub denylist_patterns: Vec<String>,
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_steps: 50,
            max_input_bytes: 10 * MIB,
            max_output_bytes: 10 * MIB,
            step_timeout_seconds: 5 * 60,
            run_timeout_seconds: 60 * 60,
            denylist_patterns: ["**/.env*", "**/secrets*", "**/*credential*", "**/*.pem", "**/*.key"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl SafetyLimits {
    /// Whether a workspace-relative path matches a denylist glob.
    ///
    /// Invalid patterns are ignored.
    pub fn is_denylisted(&self, path: &str) -> bool {
        let dotted = format!("./{}", path);
        self.denylist_patterns
            .iter()
            .filter_map(|p| Pattern::new(p).ok())
            .any(|pattern| pattern.matches(path) || pattern.matches(&dotted))
    }

    pub fn validate_path(&self, path: &str) -> Result<(), SafetyViolation> {
        if self.is_denylisted(path) {
            return Err(SafetyViolation::DenylistMatch {
                path: path.to_string(),
            });
        }
        Ok(())
    }

    pub fn validate_input(&self, input: &Value) -> Result<(), SafetyViolation> {
        within(byte_size(input), self.max_input_bytes)
            .map_err(|(actual, limit)| SafetyViolation::MaxInputBytes { actual, limit })
    }

    pub fn validate_output(&self, output: &Value) -> Result<(), SafetyViolation> {
        within(byte_size(output), self.max_output_bytes)
            .map_err(|(actual, limit)| SafetyViolation::MaxOutputBytes { actual, limit })
    }

    /// Pre-flight check on the number of enabled steps
    pub fn validate_step_count(&self, steps: usize) -> Result<(), SafetyViolation> {
        let actual = u32::try_from(steps).unwrap_or(u32::MAX);
        within(actual.into(), self.max_steps.into()).map_err(|_| SafetyViolation::MaxSteps {
            actual,
            limit: self.max_steps,
        })
    }

    /// Between-step check: step budget and run deadline
    pub fn check(&self, tracker: &SafetyTracker) -> Result<(), SafetyViolation> {
        if tracker.steps_executed >= self.max_steps {
            return Err(SafetyViolation::MaxSteps {
                actual: tracker.steps_executed,
                limit: self.max_steps,
            });
        }

        let elapsed_seconds = tracker.elapsed_seconds();
        if elapsed_seconds >= self.run_timeout_seconds {
            return Err(SafetyViolation::RunTimeout {
                elapsed_seconds,
                limit_seconds: self.run_timeout_seconds,
            });
        }

        Ok(())
    }
}

fn within(actual: u64, limit: u64) -> Result<(), (u64, u64)> {
    if actual > limit {
        Err((actual, limit))
    } else {
        Ok(())
    }
}

/// Strings count their raw bytes, everything else its compact JSON encoding
fn byte_size(value: &Value) -> u64 {
    let len = match value {
        Value::String(s) => s.len(),
        other => serde_json::to_vec(other).map(|v| v.len()).unwrap_or(0),
    };
    len as u64
}

/// Per-run usage, owned by the orchestrator loop
#[derive(Debug, Clone)]
pub struct SafetyTracker {
    pub steps_executed: u32,
    pub output_bytes: u64,
    pub started_at: Instant,
}

impl Default for SafetyTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SafetyTracker {
    pub fn new() -> Self {
        Self {
            steps_executed: 0,
            output_bytes: 0,
            started_at: Instant::now(),
        }
    }

    /// Count a completed step and its output
    pub fn record_step(&mut self, output: &Value) {
        self.steps_executed += 1;
        self.output_bytes += byte_size(output);
    }

    pub fn elapsed_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// A limit that was hit
#[derive(Debug, Clone, Error)]
pub enum SafetyViolation {
    #[error("step limit reached ({actual} of {limit})")]
    MaxSteps { actual: u32, limit: u32 },

    #[error("input is {actual} bytes, limit is {limit}")]
    MaxInputBytes { actual: u64, limit: u64 },

    #[error("output is {actual} bytes, limit is {limit}")]
    MaxOutputBytes { actual: u64, limit: u64 },

    #[error("run exceeded {limit_seconds}s (elapsed {elapsed_seconds}s)")]
    RunTimeout {
        elapsed_seconds: u64,
        limit_seconds: u64,
    },

    #[error("path '{path}' is denylisted")]
    DenylistMatch { path: String },
}
