//! Deterministic classification rules
//!
//! Thresholds the analysis must respect, and a guard that drops issues the
//! gathered evidence contradicts. A healthy disk flag always wins over log
//! noise.

use crate::orchestrator::Conversation;
use crate::reasoning::{ContentBlock, Role};
use crate::types::{Analysis, Issue, IssueCategory};
use chrono::{Months, NaiveDate};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;

/// Bad-block events above this count (with an unhealthy flag) mean failing
pub const BAD_BLOCK_THRESHOLD: u64 = 10;
/// Drivers older than this are stale
pub const DRIVER_STALE_MONTHS: u32 = 6;
/// Sustained CPU above this percentage is high
pub const HIGH_CPU_PERCENT: f64 = 80.0;
/// Free space below this percentage is low
pub const LOW_DISK_FREE_PERCENT: f64 = 10.0;

/// Health of one physical disk as reported by the disk collector
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskHealth {
    #[serde(default)]
    pub name: String,
    /// `None` when the collector could not tell
    #[serde(default)]
    pub is_healthy: Option<bool>,
    #[serde(default)]
    pub predict_failure: bool,
    #[serde(default)]
    pub bad_block_events: Option<u64>,
}

/// Disk failing iff the health flag is unhealthy AND (more than ten recent
/// bad-block events OR SMART predicts failure). Healthy or unknown never fails.
pub fn is_disk_failing(disk: &DiskHealth) -> bool {
    if disk.is_healthy != Some(false) {
        return false;
    }
    disk.predict_failure || disk.bad_block_events.unwrap_or(0) > BAD_BLOCK_THRESHOLD
}

/// Stale iff strictly older than six calendar months before `today`
pub fn is_driver_stale(driver_date: NaiveDate, today: NaiveDate) -> bool {
    match today.checked_sub_months(Months::new(DRIVER_STALE_MONTHS)) {
        Some(cutoff) => driver_date < cutoff,
        None => false,
    }
}

/// Sustained means at least two samples, every one above the threshold
pub fn is_cpu_sustained_high(samples: &[f64]) -> bool {
    samples.len() >= 2 && samples.iter().all(|s| *s > HIGH_CPU_PERCENT)
}

pub fn is_low_disk_space(free_percent: f64) -> bool {
    free_percent < LOW_DISK_FREE_PERCENT
}

#[derive(Debug, Clone, Deserialize)]
struct DriverEntry {
    #[serde(default)]
    date: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VolumeEntry {
    #[serde(default)]
    free_percent: Option<f64>,
}

/// Evidence gathered during a conversation, read from tool-result metrics
#[derive(Debug, Clone, Default)]
pub struct EvidenceSnapshot {
    pub disks: Vec<DiskHealth>,
    pub driver_dates: Vec<NaiveDate>,
    pub cpu_samples: Vec<f64>,
    pub volume_free_percents: Vec<f64>,
}

impl EvidenceSnapshot {
    /// Collect metrics from every successful tool result in the conversation
    pub fn from_conversation(conversation: &Conversation) -> Self {
        let mut tool_names: HashMap<&str, &str> = HashMap::new();
        let mut snapshot = Self::default();

        for turn in conversation.turns() {
            for block in &turn.content {
                match block {
                    ContentBlock::ToolUse { id, name, .. } if turn.role == Role::Assistant => {
                        tool_names.insert(id.as_str(), name.as_str());
                    }
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error: false,
                    } => {
                        if let Some(tool) = tool_names.get(tool_use_id.as_str()) {
                            snapshot.absorb(tool, content);
                        }
                    }
                    _ => {}
                }
            }
        }
        snapshot
    }

    /// Merge one tool summary's metrics
    pub fn absorb(&mut self, tool: &str, summary: &serde_json::Value) {
        let Some(metrics) = summary.get("metrics") else {
            return;
        };
        match tool {
            "check_disk_health" => {
                if let Some(disks) = metrics.get("disks") {
                    if let Ok(disks) = serde_json::from_value::<Vec<DiskHealth>>(disks.clone()) {
                        self.disks.extend(disks);
                    }
                }
            }
            "check_drivers" => {
                if let Some(drivers) = metrics.get("drivers") {
                    if let Ok(drivers) = serde_json::from_value::<Vec<DriverEntry>>(drivers.clone()) {
                        self.driver_dates.extend(
                            drivers
                                .iter()
                                .filter_map(|d| d.date.as_deref())
                                .filter_map(parse_driver_date),
                        );
                    }
                }
            }
            "check_resources" => {
                if let Some(samples) = metrics.get("cpuSamples").and_then(|s| s.as_array()) {
                    self.cpu_samples = samples.iter().filter_map(|s| s.as_f64()).collect();
                }
            }
            "check_disk_space" => {
                if let Some(volumes) = metrics.get("volumes") {
                    if let Ok(volumes) = serde_json::from_value::<Vec<VolumeEntry>>(volumes.clone()) {
                        self.volume_free_percents
                            .extend(volumes.iter().filter_map(|v| v.free_percent));
                    }
                }
            }
            _ => {}
        }
    }

    /// `Some(false)` when the evidence rules the category out,
    /// `Some(true)` when it confirms it, `None` when there is no evidence
    pub fn supports(&self, category: IssueCategory, today: NaiveDate) -> Option<bool> {
        match category {
            IssueCategory::DiskFailure => {
                let known: Vec<&DiskHealth> =
                    self.disks.iter().filter(|d| d.is_healthy.is_some()).collect();
                if known.is_empty() {
                    None
                } else {
                    Some(known.iter().any(|d| is_disk_failing(d)))
                }
            }
            IssueCategory::OutdatedDriver => {
                if self.driver_dates.is_empty() {
                    None
                } else {
                    Some(self.driver_dates.iter().any(|d| is_driver_stale(*d, today)))
                }
            }
            IssueCategory::HighCpu => {
                if self.cpu_samples.is_empty() {
                    None
                } else {
                    Some(is_cpu_sustained_high(&self.cpu_samples))
                }
            }
            IssueCategory::LowDiskSpace => {
                if self.volume_free_percents.is_empty() {
                    None
                } else {
                    Some(self.volume_free_percents.iter().any(|f| is_low_disk_space(*f)))
                }
            }
            IssueCategory::Other => None,
        }
    }
}

/// Accepts `2024-03-01`, `2024-03-01T00:00:00Z` and `03/01/2024`
fn parse_driver_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    let date_part = raw.split(['T', ' ']).next().unwrap_or(raw);
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(date_part, "%m/%d/%Y"))
        .ok()
}

/// Title keywords for issues the model left untagged. Space before failure:
/// "disk is full" must not read as a dying disk.
static CATEGORY_HINTS: Lazy<Vec<(IssueCategory, Regex)>> = Lazy::new(|| {
    let rules: &[(IssueCategory, &str)] = &[
        (
            IssueCategory::LowDiskSpace,
            r"(?i)\b(low|insufficient|running out of|out of)\b.*\bspace\b|\b(disk|drive|volume)\b.*\b(full|nearly full)\b",
        ),
        (
            IssueCategory::DiskFailure,
            r"(?i)\b(disk|drive|ssd|hdd|smart)\b.*\b(fail\w*|dying|degraded)\b|\bbad (block|sector)s?\b",
        ),
        (
            IssueCategory::OutdatedDriver,
            r"(?i)\b(outdated|old|stale|obsolete)\b.*\bdrivers?\b|\bdrivers?\b.*\b(outdated|out of date|old|stale)\b",
        ),
        (
            IssueCategory::HighCpu,
            r"(?i)\b(cpu|processor)\b.*\b(high|overload\w*|pegged|saturated|maxed)\b|\bhigh (cpu|processor)\b",
        ),
    ];

    rules
        .iter()
        .filter_map(|(category, pattern)| match Regex::new(pattern) {
            Ok(re) => Some((*category, re)),
            Err(e) => {
                tracing::error!("Invalid category hint {}: {}", pattern, e);
                None
            }
        })
        .collect()
});

/// Category from the issue tag, or a best guess from its title
pub fn effective_category(issue: &Issue) -> Option<IssueCategory> {
    issue.category.or_else(|| {
        CATEGORY_HINTS
            .iter()
            .find(|(_, re)| re.is_match(&issue.title))
            .map(|(category, _)| *category)
    })
}

/// Drop issues whose category the evidence rules out
pub fn apply_evidence_guard(mut analysis: Analysis, evidence: &EvidenceSnapshot, today: NaiveDate) -> Analysis {
    analysis.issues.retain(|issue| match effective_category(issue) {
        Some(category) => {
            let verdict = evidence.supports(category, today);
            if verdict == Some(false) {
                tracing::info!(
                    "Dropping issue '{}': evidence contradicts {:?}",
                    issue.title,
                    category
                );
            }
            verdict != Some(false)
        }
        None => true,
    });
    analysis
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn disk(healthy: Option<bool>, bad_blocks: u64) -> DiskHealth {
        DiskHealth {
            name: "disk0".to_string(),
            is_healthy: healthy,
            predict_failure: false,
            bad_block_events: Some(bad_blocks),
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_disk_bad_block_boundary() {
        assert!(!is_disk_failing(&disk(Some(false), 10)));
        assert!(is_disk_failing(&disk(Some(false), 11)));
    }

    #[test]
    fn test_healthy_flag_overrides_log_noise() {
        assert!(!is_disk_failing(&disk(Some(true), 500)));
        assert!(!is_disk_failing(&disk(None, 500)));
    }

    #[test]
    fn test_predicted_failure_needs_unhealthy_flag() {
        let mut d = disk(Some(false), 0);
        d.predict_failure = true;
        assert!(is_disk_failing(&d));
        d.is_healthy = Some(true);
        assert!(!is_disk_failing(&d));
    }

    #[test]
    fn test_driver_age_boundary() {
        let today = date(2026, 10, 17);
        assert!(!is_driver_stale(date(2026, 4, 17), today));
        assert!(is_driver_stale(date(2026, 4, 16), today));
        assert!(!is_driver_stale(date(2026, 9, 1), today));
    }

    #[test]
    fn test_driver_age_month_end() {
        // Aug 31 minus six months clamps to Feb 28
        let today = date(2025, 8, 31);
        assert!(!is_driver_stale(date(2025, 2, 28), today));
        assert!(is_driver_stale(date(2025, 2, 27), today));
    }

    #[test]
    fn test_cpu_sustained() {
        assert!(is_cpu_sustained_high(&[85.0, 92.0, 81.0]));
        assert!(!is_cpu_sustained_high(&[99.0]));
        assert!(!is_cpu_sustained_high(&[95.0, 80.0, 95.0]));
        assert!(!is_cpu_sustained_high(&[]));
    }

    #[test]
    fn test_low_disk_space_boundary() {
        assert!(is_low_disk_space(9.99));
        assert!(!is_low_disk_space(10.0));
    }

    #[test]
    fn test_parse_driver_date_formats() {
        assert_eq!(parse_driver_date("2024-03-01"), Some(date(2024, 3, 1)));
        assert_eq!(parse_driver_date("2024-03-01T00:00:00Z"), Some(date(2024, 3, 1)));
        assert_eq!(parse_driver_date("03/01/2024"), Some(date(2024, 3, 1)));
        assert_eq!(parse_driver_date("yesterday"), None);
    }

    #[test]
    fn test_absorb_and_guard() {
        let mut evidence = EvidenceSnapshot::default();
        evidence.absorb(
            "check_disk_health",
            &json!({"metrics": {"disks": [{"name": "C:", "isHealthy": true, "badBlockEvents": 40}]}}),
        );
        evidence.absorb(
            "check_resources",
            &json!({"metrics": {"cpuSamples": [95.0, 97.0, 91.0]}}),
        );

        let analysis = Analysis {
            summary: String::new(),
            issues: vec![
                Issue {
                    title: "Disk failing".to_string(),
                    category: Some(IssueCategory::DiskFailure),
                    confidence: 0.9,
                    ..Default::default()
                },
                Issue {
                    title: "CPU pegged".to_string(),
                    category: Some(IssueCategory::HighCpu),
                    confidence: 0.9,
                    ..Default::default()
                },
                Issue {
                    title: "Low space".to_string(),
                    category: Some(IssueCategory::LowDiskSpace),
                    confidence: 0.9,
                    ..Default::default()
                },
            ],
            fixes: Vec::new(),
        };

        let guarded = apply_evidence_guard(analysis, &evidence, date(2026, 10, 17));
        let titles: Vec<&str> = guarded.issues.iter().map(|i| i.title.as_str()).collect();
        // Disk contradicted, CPU confirmed, no space evidence at all
        assert_eq!(titles, vec!["CPU pegged", "Low space"]);
    }

    #[test]
    fn test_outdated_driver_guard() {
        let mut evidence = EvidenceSnapshot::default();
        evidence.absorb(
            "check_drivers",
            &json!({"metrics": {"drivers": [{"name": "gpu", "date": "2026-08-01"}]}}),
        );
        let today = date(2026, 10, 17);
        assert_eq!(evidence.supports(IssueCategory::OutdatedDriver, today), Some(false));

        evidence.absorb(
            "check_drivers",
            &json!({"metrics": {"drivers": [{"name": "wifi", "date": "2023-01-01"}]}}),
        );
        assert_eq!(evidence.supports(IssueCategory::OutdatedDriver, today), Some(true));
    }

    #[test]
    fn test_untagged_issue_category_from_title() {
        let untagged = |title: &str| Issue {
            title: title.to_string(),
            ..Default::default()
        };
        assert_eq!(
            effective_category(&untagged("Disk failing")),
            Some(IssueCategory::DiskFailure)
        );
        assert_eq!(
            effective_category(&untagged("Bad sectors reported on C:")),
            Some(IssueCategory::DiskFailure)
        );
        assert_eq!(
            effective_category(&untagged("Disk C: is nearly full")),
            Some(IssueCategory::LowDiskSpace)
        );
        assert_eq!(
            effective_category(&untagged("Outdated graphics driver")),
            Some(IssueCategory::OutdatedDriver)
        );
        assert_eq!(
            effective_category(&untagged("High CPU usage from antivirus scan")),
            Some(IssueCategory::HighCpu)
        );
        assert_eq!(effective_category(&untagged("Too many startup programs")), None);

        let tagged = Issue {
            title: "Disk failing".to_string(),
            category: Some(IssueCategory::Other),
            ..Default::default()
        };
        assert_eq!(effective_category(&tagged), Some(IssueCategory::Other));
    }

    #[test]
    fn test_guard_drops_untagged_disk_issue_when_smart_healthy() {
        let mut evidence = EvidenceSnapshot::default();
        evidence.absorb(
            "check_disk_health",
            &json!({"metrics": {"disks": [{"name": "C:", "isHealthy": true, "badBlockEvents": 25}]}}),
        );
        let analysis = Analysis {
            summary: String::new(),
            issues: vec![
                Issue {
                    title: "Disk failing".to_string(),
                    confidence: 0.9,
                    actionable: true,
                    ..Default::default()
                },
                Issue {
                    title: "Too many startup programs".to_string(),
                    confidence: 0.9,
                    actionable: true,
                    ..Default::default()
                },
            ],
            fixes: Vec::new(),
        };
        let guarded = apply_evidence_guard(analysis, &evidence, date(2026, 10, 17));
        let titles: Vec<&str> = guarded.issues.iter().map(|i| i.title.as_str()).collect();
        assert_eq!(titles, vec!["Too many startup programs"]);
    }
}
