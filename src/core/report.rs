use std::collections::BTreeMap;

use crate::core::ExecutionResult;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub arch: String,
    pub family: String,
}

impl Platform {
    pub fn current() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            family: std::env::consts::FAMILY.to_string(),
        }
    }
}

/// Derived counters. Never a source of truth; see [`Summary::from_results`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub total_duration_ms: u64,
}

impl Summary {
    pub fn from_results(results: &BTreeMap<String, ExecutionResult>) -> Self {
        let succeeded = results.values().filter(|r| r.success).count();
        let total_duration_ms = results
            .values()
            .fold(0u64, |acc, r| acc.saturating_add(r.duration_ms));
        Self {
            total: results.len(),
            succeeded,
            failed: results.len() - succeeded,
            total_duration_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationReport {
    pub schema_version: String,
    pub tool_version: String,
    pub project: ProjectInfo,
    pub generated_at: String,
    pub platform: Platform,
    pub results: BTreeMap<String, ExecutionResult>,
    pub summary: Summary,
}

impl AttestationReport {
    pub fn has_failures(&self) -> bool {
        self.summary.failed > 0
    }
}
