//! Issue / Fix data model
//!
//! Parsing is lenient: unknown enum values are kept as `Unknown`
//! variants so one odd field never discards a whole analysis.

use serde::{Deserialize, Serialize};

/// Issue severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    #[default]
    Warning,
    Info,
    #[serde(other)]
    Unknown,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::Warning => "warning",
            Severity::Info => "info",
            Severity::Unknown => "unknown",
        }
    }
}

/// Issue / fix priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Immediate,
    High,
    Medium,
    Low,
    #[default]
    #[serde(other)]
    Unknown,
}

impl Priority {
    /// Sort rank, lower runs first
    pub fn rank(&self) -> u8 {
        match self {
            Priority::Immediate => 1,
            Priority::High => 2,
            Priority::Medium => 3,
            Priority::Low => 4,
            Priority::Unknown => 5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Immediate => "immediate",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
            Priority::Unknown => "unknown",
        }
    }
}

/// Fix risk level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    /// Anything outside low|medium|high; rejected at validation
    #[serde(other)]
    Unrecognized,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Unrecognized => "unrecognized",
        }
    }

    /// Medium and high risk fixes get a checkpoint and a rollback offer
    pub fn needs_checkpoint(&self) -> bool {
        matches!(self, RiskLevel::Medium | RiskLevel::High)
    }
}

/// What an issue claims, used to cross-check against collected evidence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCategory {
    DiskFailure,
    OutdatedDriver,
    HighCpu,
    LowDiskSpace,
    #[serde(other)]
    Other,
}

/// A diagnosed problem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub priority: Priority,
    /// Missing confidence counts as unproven
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub actionable: bool,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub evidence: String,
    #[serde(default)]
    pub time_to_fix: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<IssueCategory>,
}

/// A remediation plan. Never executed without explicit user approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fix {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub risk_level: Option<RiskLevel>,
    #[serde(default = "default_requires_admin")]
    pub requires_admin: bool,
    #[serde(default)]
    pub automatable: bool,
    #[serde(default)]
    pub requires_restart: bool,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub technical_details: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

fn default_requires_admin() -> bool {
    true
}

impl Default for Fix {
    fn default() -> Self {
        Self {
            id: String::new(),
            title: String::new(),
            description: String::new(),
            risk_level: None,
            requires_admin: default_requires_admin(),
            automatable: false,
            requires_restart: false,
            steps: Vec::new(),
            commands: Vec::new(),
            technical_details: String::new(),
            priority: Priority::Unknown,
            confidence: None,
        }
    }
}

impl Fix {
    /// Confidence used for filtering; unproven fixes are kept
    pub fn effective_confidence(&self) -> f64 {
        self.confidence.unwrap_or(0.8)
    }

    /// Human label for step `index`, falling back to the command itself
    pub fn step_label(&self, index: usize) -> String {
        self.steps
            .get(index)
            .filter(|s| !s.trim().is_empty())
            .cloned()
            .or_else(|| self.commands.get(index).cloned())
            .unwrap_or_else(|| format!("Step {}", index + 1))
    }

    /// Assign a fresh id when the model left it blank
    pub fn ensure_id(mut self) -> Self {
        if self.id.trim().is_empty() {
            self.id = uuid::Uuid::new_v4().to_string();
        }
        self
    }
}

/// Structured analysis: the canonical synthesis output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Analysis {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub issues: Vec<Issue>,
    #[serde(default)]
    pub fixes: Vec<Fix>,
}

impl Analysis {
    pub fn is_empty(&self) -> bool {
        self.issues.is_empty() && self.fixes.is_empty()
    }
}
