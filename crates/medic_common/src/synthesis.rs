//! Result Synthesis & Filter Engine
//!
//! Turns raw model text into the canonical `Analysis`. Pure functions only:
//! no network, no files. Parse failures are repaired once, then replaced by
//! a fixed-shape fallback; nothing here ever returns an error to callers
//! outside this module except `try_parse_analysis`.

use crate::evidence::{apply_evidence_guard, EvidenceSnapshot};
use crate::types::{Analysis, Fix, Issue, Priority, Severity};
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;

/// Issues and fixes below this confidence are dropped
pub const MIN_CONFIDENCE: f64 = 0.7;

pub const FALLBACK_SUMMARY: &str =
    "The analysis could not be read. Try running the diagnosis again.";

static TRAILING_COMMA: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r",(\s*[\]}])").ok());

/// Synthesis errors (internal; public entry points degrade instead)
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SynthesisError {
    #[error("No JSON object found in response")]
    NoJson,

    #[error("JSON could not be parsed after repair: {0}")]
    Unparsable(String),
}

/// Strip markdown code fences from a response
fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let clean = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    clean.strip_suffix("```").unwrap_or(clean).trim()
}

/// Outermost `{...}` span
fn outermost_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (start < end).then(|| &text[start..=end])
}

/// Mechanical repairs for common model mistakes
pub fn repair_json(json: &str) -> String {
    let mut fixed = json
        .replace(['\u{201C}', '\u{201D}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    fixed = escape_inside_strings(&fixed);

    // Control characters outside strings are noise
    fixed = fixed
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\t' | '\r'))
        .collect();

    match TRAILING_COMMA.as_ref() {
        Some(re) => re.replace_all(&fixed, "$1").into_owned(),
        None => fixed,
    }
}

/// Walk string literals: escape raw newlines and control characters, and
/// escape quotes that do not look like the end of the string.
fn escape_inside_strings(json: &str) -> String {
    let chars: Vec<char> = json.chars().collect();
    let mut out = String::with_capacity(json.len() + 16);
    let mut in_string = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if !in_string {
            if c == '"' {
                in_string = true;
            }
            out.push(c);
            i += 1;
            continue;
        }

        match c {
            '\\' => {
                out.push(c);
                if let Some(next) = chars.get(i + 1) {
                    out.push(*next);
                    i += 1;
                }
            }
            '"' => {
                let next = chars[i + 1..].iter().find(|ch| !ch.is_whitespace());
                if matches!(next, None | Some(',' | ':' | '}' | ']')) {
                    in_string = false;
                    out.push('"');
                } else {
                    out.push_str("\\\"");
                }
            }
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {}
            c => out.push(c),
        }
        i += 1;
    }
    out
}

/// Parse a structured analysis, repairing once on failure
pub fn try_parse_analysis(raw: &str) -> Result<Analysis, SynthesisError> {
    let clean = strip_code_fences(raw);
    let object = outermost_object(clean).ok_or(SynthesisError::NoJson)?;

    match serde_json::from_str::<Analysis>(object) {
        Ok(analysis) => Ok(normalize(analysis)),
        Err(first) => {
            tracing::debug!("analysis JSON invalid ({}), attempting repair", first);
            let repaired = repair_json(object);
            serde_json::from_str::<Analysis>(&repaired)
                .map(normalize)
                .map_err(|e| SynthesisError::Unparsable(e.to_string()))
        }
    }
}

/// Parse, degrading to the fallback payload on any failure
pub fn parse_analysis(raw: &str) -> Analysis {
    match try_parse_analysis(raw) {
        Ok(analysis) => analysis,
        Err(e) => {
            tracing::warn!("Analysis synthesis failed: {}", e);
            fallback_analysis(&e.to_string())
        }
    }
}

/// Fixed-shape payload used when nothing could be parsed
pub fn fallback_analysis(reason: &str) -> Analysis {
    Analysis {
        summary: FALLBACK_SUMMARY.to_string(),
        issues: vec![Issue {
            severity: Severity::Warning,
            priority: Priority::Low,
            confidence: 1.0,
            actionable: true,
            title: "Analysis Error".to_string(),
            description: "The diagnostic response was not in the expected format.".to_string(),
            evidence: reason.to_string(),
            time_to_fix: String::new(),
            category: None,
        }],
        fixes: Vec::new(),
    }
}

fn normalize(mut analysis: Analysis) -> Analysis {
    analysis.fixes = analysis.fixes.into_iter().map(Fix::ensure_id).collect();
    analysis
}

/// Issue survives iff confident enough and either actionable or critical
pub fn keep_issue(issue: &Issue) -> bool {
    if issue.confidence.is_nan() || issue.confidence < MIN_CONFIDENCE {
        return false;
    }
    issue.actionable || issue.severity == Severity::Critical
}

pub fn keep_fix(fix: &Fix) -> bool {
    let confidence = fix.effective_confidence();
    !confidence.is_nan() && confidence >= MIN_CONFIDENCE
}

/// Deterministic filter and ordering. Idempotent.
pub fn filter_and_rank(mut analysis: Analysis) -> Analysis {
    analysis.issues.retain(keep_issue);
    analysis.fixes.retain(keep_fix);

    // Vec::sort_by is stable
    analysis.issues.sort_by(|a, b| {
        a.priority.rank().cmp(&b.priority.rank()).then_with(|| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
    });
    analysis.fixes.sort_by_key(|f| f.priority.rank());
    analysis
}

/// Full pipeline: parse (or fall back), check against evidence, filter
pub fn synthesize(raw: &str, evidence: &EvidenceSnapshot, today: NaiveDate) -> Analysis {
    filter_and_rank(apply_evidence_guard(parse_analysis(raw), evidence, today))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IssueCategory;

    fn issue(title: &str, severity: Severity, priority: Priority, confidence: f64, actionable: bool) -> Issue {
        Issue {
            severity,
            priority,
            confidence,
            actionable,
            title: title.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_with_code_fences_and_prose() {
        let raw = "Here is the analysis:\n```json\n{\"summary\": \"Disk nearly full\", \"issues\": [], \"fixes\": []}\n```";
        let analysis = try_parse_analysis(raw).unwrap();
        assert_eq!(analysis.summary, "Disk nearly full");
    }

    #[test]
    fn test_trailing_comma_repaired() {
        let raw = r#"{"summary": "ok", "issues": [{"title": "Low space", "confidence": 0.9,},], "fixes": [],}"#;
        let analysis = try_parse_analysis(raw).unwrap();
        assert_eq!(analysis.issues.len(), 1);
        assert_eq!(analysis.issues[0].title, "Low space");
    }

    #[test]
    fn test_control_character_repaired() {
        let raw = "{\"summary\": \"bell\u{0007} here\", \"issues\": []}";
        let analysis = try_parse_analysis(raw).unwrap();
        assert_eq!(analysis.summary, "bell here");
    }

    #[test]
    fn test_raw_newline_and_inner_quotes_repaired() {
        let raw = "{\"summary\": \"The \"Print Spooler\" service\ncrashed\", \"issues\": []}";
        let analysis = try_parse_analysis(raw).unwrap();
        assert_eq!(analysis.summary, "The \"Print Spooler\" service\ncrashed");
    }

    #[test]
    fn test_smart_quotes_repaired() {
        let raw = "{\u{201C}summary\u{201D}: \u{201C}ok\u{201D}}";
        assert_eq!(try_parse_analysis(raw).unwrap().summary, "ok");
    }

    #[test]
    fn test_no_json_is_error_and_fallback() {
        assert_eq!(
            try_parse_analysis("I could not determine anything."),
            Err(SynthesisError::NoJson)
        );
        let analysis = parse_analysis("I could not determine anything.");
        assert_eq!(analysis.summary, FALLBACK_SUMMARY);
        assert_eq!(analysis.issues.len(), 1);
        assert_eq!(analysis.issues[0].title, "Analysis Error");
        assert!(analysis.fixes.is_empty());
    }

    #[test]
    fn test_garbage_json_falls_back() {
        let analysis = parse_analysis("{ this is : not [ json at all }");
        assert_eq!(analysis.issues[0].title, "Analysis Error");
    }

    #[test]
    fn test_fallback_survives_filter() {
        let filtered = filter_and_rank(fallback_analysis("x"));
        assert_eq!(filtered.issues.len(), 1);
    }

    #[test]
    fn test_filter_rules() {
        let analysis = Analysis {
            summary: String::new(),
            issues: vec![
                issue("low confidence", Severity::Critical, Priority::High, 0.69, true),
                issue("info passive", Severity::Info, Priority::Low, 0.95, false),
                issue("info actionable", Severity::Info, Priority::Low, 0.95, true),
                issue("critical passive", Severity::Critical, Priority::Immediate, 0.7, false),
                issue("warning passive", Severity::Warning, Priority::Medium, 0.8, false),
            ],
            fixes: vec![
                Fix {
                    title: "unsure".to_string(),
                    confidence: Some(0.5),
                    ..Default::default()
                },
                Fix {
                    title: "unscored".to_string(),
                    ..Default::default()
                },
            ],
        };
        let filtered = filter_and_rank(analysis);
        let titles: Vec<&str> = filtered.issues.iter().map(|i| i.title.as_str()).collect();
        assert_eq!(titles, vec!["critical passive", "info actionable"]);
        assert_eq!(filtered.fixes.len(), 1);
        assert_eq!(filtered.fixes[0].title, "unscored");
    }

    #[test]
    fn test_filter_invariant_holds() {
        let raw = r#"{"issues": [
            {"title": "a", "severity": "critical", "confidence": 0.71, "actionable": false},
            {"title": "b", "severity": "warning", "confidence": 0.99, "actionable": true},
            {"title": "c", "severity": "info", "confidence": 0.99, "actionable": false},
            {"title": "d", "severity": "warning", "actionable": true},
            {"title": "e", "severity": "weird", "confidence": 0.9, "actionable": true},
            {"title": "f", "severity": "warning", "confidence": 0.9, "actionable": false},
            {"title": "g", "severity": "weird", "confidence": 0.9, "actionable": false}
        ]}"#;
        let filtered = filter_and_rank(parse_analysis(raw));
        let titles: Vec<&str> = filtered.issues.iter().map(|i| i.title.as_str()).collect();
        assert_eq!(titles.len(), 3);
        assert!(!titles.contains(&"f") && !titles.contains(&"g"));
        for issue in &filtered.issues {
            assert!(issue.confidence >= MIN_CONFIDENCE);
            assert!(issue.actionable || issue.severity == Severity::Critical);
        }
    }

    #[test]
    fn test_ordering_priority_then_confidence() {
        let analysis = Analysis {
            summary: String::new(),
            issues: vec![
                issue("low", Severity::Warning, Priority::Low, 0.99, true),
                issue("unknown", Severity::Warning, Priority::Unknown, 0.99, true),
                issue("high-0.8", Severity::Warning, Priority::High, 0.8, true),
                issue("immediate", Severity::Critical, Priority::Immediate, 0.75, true),
                issue("high-0.9", Severity::Warning, Priority::High, 0.9, true),
            ],
            fixes: vec![
                Fix {
                    title: "low".to_string(),
                    priority: Priority::Low,
                    confidence: Some(0.99),
                    ..Default::default()
                },
                Fix {
                    title: "immediate".to_string(),
                    priority: Priority::Immediate,
                    confidence: Some(0.71),
                    ..Default::default()
                },
            ],
        };
        let ranked = filter_and_rank(analysis);
        let titles: Vec<&str> = ranked.issues.iter().map(|i| i.title.as_str()).collect();
        assert_eq!(titles, vec!["immediate", "high-0.9", "high-0.8", "low", "unknown"]);
        assert_eq!(ranked.fixes[0].title, "immediate");
    }

    #[test]
    fn test_filter_is_idempotent() {
        let raw = r#"{"summary": "s", "issues": [
            {"title": "x", "severity": "warning", "priority": "low", "confidence": 0.8, "actionable": true},
            {"title": "y", "severity": "critical", "priority": "immediate", "confidence": 0.9},
            {"title": "z", "severity": "info", "priority": "high", "confidence": 0.95, "actionable": false},
            {"title": "w", "severity": "warning", "priority": "high", "confidence": 0.8, "actionable": true}
        ], "fixes": [
            {"id": "f1", "title": "a", "priority": "low", "commands": ["x"]},
            {"id": "f2", "title": "b", "priority": "high", "commands": ["y"], "confidence": 0.9}
        ]}"#;
        let once = filter_and_rank(parse_analysis(raw));
        let twice = filter_and_rank(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_missing_fix_ids_are_filled() {
        let analysis = parse_analysis(r#"{"fixes": [{"title": "t", "commands": ["c"]}]}"#);
        assert!(!analysis.fixes[0].id.is_empty());
    }

    #[test]
    fn test_synthesize_applies_guard() {
        let mut evidence = EvidenceSnapshot::default();
        evidence.absorb(
            "check_disk_space",
            &serde_json::json!({"metrics": {"volumes": [{"mount": "/", "freePercent": 42.0}]}}),
        );
        let raw = r#"{"summary": "s", "issues": [
            {"title": "Disk almost full", "category": "low_disk_space", "severity": "warning",
             "priority": "high", "confidence": 0.9, "actionable": true}
        ]}"#;
        let today = NaiveDate::from_ymd_opt(2026, 10, 17).unwrap();
        let analysis = synthesize(raw, &evidence, today);
        assert!(analysis.issues.is_empty());

        let parsed = parse_analysis(raw);
        assert_eq!(parsed.issues[0].category, Some(IssueCategory::LowDiskSpace));
    }
}
