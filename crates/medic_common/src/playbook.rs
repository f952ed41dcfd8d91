//! Playbook mode: canned investigations per problem type.
//!
//! `diagnose` feeds a fixed instruction message through the normal chat loop,
//! then synthesizes the answer. Structured JSON is preferred; bullet-point
//! scraping is the degraded fallback; when both yield nothing the report is
//! explicitly empty.

use crate::evidence::{apply_evidence_guard, EvidenceSnapshot};
use crate::orchestrator::{ChatOutcome, Orchestrator, SessionError};
use crate::reasoning::Usage;
use crate::shell::truncate_chars;
use crate::synthesis::{filter_and_rank, try_parse_analysis};
use crate::types::{Analysis, Fix, Issue, Priority, Severity};
use chrono::{NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Placeholder issues extracted from prose
const MAX_HEURISTIC_ISSUES: usize = 10;
const HEURISTIC_CONFIDENCE: f64 = 0.7;
const MIN_HEURISTIC_LINE: usize = 8;
const MAX_TITLE_CHARS: usize = 80;

static LIST_ITEM: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?m)^\s*(?:[-*\u{2022}]|\d{1,2}[.)])\s+(.+?)\s*$").ok());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProblemType {
    Crash,
    Slow,
    Network,
    Disk,
    Boot,
    General,
}

impl ProblemType {
    pub const ALL: [ProblemType; 6] = [
        ProblemType::Crash,
        ProblemType::Slow,
        ProblemType::Network,
        ProblemType::Disk,
        ProblemType::Boot,
        ProblemType::General,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProblemType::Crash => "crash",
            ProblemType::Slow => "slow",
            ProblemType::Network => "network",
            ProblemType::Disk => "disk",
            ProblemType::Boot => "boot",
            ProblemType::General => "general",
        }
    }

    fn description(&self) -> &'static str {
        match self {
            ProblemType::Crash => "The computer crashes, freezes or shows blue screens.",
            ProblemType::Slow => "The computer has become slow.",
            ProblemType::Network => "The network connection is unreliable or not working.",
            ProblemType::Disk => "There may be a problem with a disk.",
            ProblemType::Boot => "The computer has trouble starting up.",
            ProblemType::General => "Run a general health check.",
        }
    }

    /// Tools to run, in order
    pub fn tools(&self) -> &'static [&'static str] {
        match self {
            ProblemType::Crash => &[
                "check_event_logs",
                "check_disk_health",
                "check_drivers",
                "check_resources",
            ],
            ProblemType::Slow => &[
                "check_resources",
                "check_disk_space",
                "check_disk_health",
                "check_event_logs",
            ],
            ProblemType::Network => &["check_network", "check_drivers", "check_event_logs"],
            ProblemType::Disk => &["check_disk_health", "check_disk_space", "check_event_logs"],
            ProblemType::Boot => &["check_event_logs", "check_disk_health", "check_drivers"],
            ProblemType::General => &[
                "check_resources",
                "check_disk_health",
                "check_disk_space",
                "check_network",
                "check_event_logs",
            ],
        }
    }

    /// The canned user message for this problem
    pub fn instructions(&self) -> String {
        let mut message = format!("{}\n\nPlease investigate step by step:\n", self.description());
        for (i, tool) in self.tools().iter().enumerate() {
            message.push_str(&format!("{}. Call {}.\n", i + 1, tool));
        }
        message.push_str(
            "\nThen answer with the JSON analysis object only: summary, issues and fixes. \
             Use propose_fix for the most important fix if one is needed.",
        );
        message
    }
}

impl std::fmt::Display for ProblemType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ProblemType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        ProblemType::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == wanted)
            .ok_or_else(|| {
                format!(
                    "unknown problem type '{}' (expected one of: crash, slow, network, disk, boot, general)",
                    s
                )
            })
    }
}

/// Which synthesis path produced the analysis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SynthesisSource {
    Structured,
    Heuristic,
    Empty,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosisReport {
    pub problem: ProblemType,
    pub final_text: String,
    pub analysis: Analysis,
    pub source: SynthesisSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proposed_fix: Option<Fix>,
    #[serde(skip)]
    pub usage: Usage,
}

/// Bullet and numbered lines as placeholder issues. Best effort only.
pub fn extract_heuristic_issues(text: &str) -> Vec<Issue> {
    let Some(list_item) = LIST_ITEM.as_ref() else {
        return Vec::new();
    };
    list_item
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().trim_matches(|c| c == '*' || c == '`').trim())
        .filter(|line| line.chars().count() >= MIN_HEURISTIC_LINE)
        .take(MAX_HEURISTIC_ISSUES)
        .map(|line| Issue {
            severity: Severity::Warning,
            priority: Priority::Medium,
            confidence: HEURISTIC_CONFIDENCE,
            actionable: true,
            title: title_from(line),
            description: line.to_string(),
            evidence: "Extracted from the diagnostic summary".to_string(),
            time_to_fix: String::new(),
            category: None,
        })
        .collect()
}

fn title_from(line: &str) -> String {
    let head = line.split(['.', ':']).next().unwrap_or(line).trim();
    let head = if head.is_empty() { line } else { head };
    if head.chars().count() > MAX_TITLE_CHARS {
        let cut: String = head.chars().take(MAX_TITLE_CHARS).collect();
        format!("{}…", cut.trim_end())
    } else {
        head.to_string()
    }
}

/// First prose line that is not a list item
fn prose_summary(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .find(|line| {
            !line.is_empty()
                && !line.starts_with('#')
                && !LIST_ITEM.as_ref().is_some_and(|re| re.is_match(line))
        })
        .unwrap_or("The diagnosis found the following points.")
        .to_string()
}

/// Turn a finished chat into a report: structured, heuristic, or empty
pub fn build_report(
    problem: ProblemType,
    outcome: ChatOutcome,
    evidence: &EvidenceSnapshot,
    today: NaiveDate,
) -> DiagnosisReport {
    let text = outcome.final_text.trim();

    let (analysis, source) = match try_parse_analysis(text) {
        Ok(analysis) => (
            filter_and_rank(apply_evidence_guard(analysis, evidence, today)),
            SynthesisSource::Structured,
        ),
        Err(e) => {
            tracing::debug!("No structured analysis ({}), trying heuristic extraction", e);
            let issues = extract_heuristic_issues(text);
            if issues.is_empty() {
                (
                    Analysis {
                        summary: truncate_chars(text, 2000),
                        issues: Vec::new(),
                        fixes: Vec::new(),
                    },
                    SynthesisSource::Empty,
                )
            } else {
                let analysis = Analysis {
                    summary: prose_summary(text),
                    issues,
                    fixes: Vec::new(),
                };
                (filter_and_rank(analysis), SynthesisSource::Heuristic)
            }
        }
    };

    DiagnosisReport {
        problem,
        final_text: outcome.final_text,
        analysis,
        source,
        proposed_fix: outcome.proposed_fix,
        usage: outcome.usage,
    }
}

impl Orchestrator {
    /// Run the canned investigation for `problem` and synthesize the result
    pub async fn diagnose(&mut self, problem: ProblemType) -> Result<DiagnosisReport, SessionError> {
        tracing::info!("Diagnosing: {}", problem);
        let outcome = self.chat(&problem.instructions()).await?;
        let evidence = EvidenceSnapshot::from_conversation(self.conversation());
        let report = build_report(problem, outcome, &evidence, Utc::now().date_naive());
        tracing::info!(
            "Diagnosis {} via {:?}: {} issue(s), {} fix(es)",
            problem,
            report.source,
            report.analysis.issues.len(),
            report.analysis.fixes.len()
        );
        Ok(report)
    }
}
