//! Plain-text rendering of analyses, fixes and execution records.
//!
//! Renderers return strings so they stay testable; colors are applied by
//! the caller only when writing to a terminal.

use medic_common::fix_executor::{CheckpointStatus, FixExecutionRecord};
use medic_common::reasoning::ToolSchema;
use medic_common::{Analysis, Fix, Issue, Severity};
use owo_colors::OwoColorize;
use std::fmt::Write;

/// Severity marker shown in front of an issue
pub fn severity_marker(severity: Severity) -> &'static str {
    match severity {
        Severity::Critical => "[CRITICAL]",
        Severity::Warning => "[WARNING]",
        Severity::Info => "[INFO]",
        Severity::Unknown => "[?]",
    }
}

pub fn render_issue(index: usize, issue: &Issue) -> String {
    let mut out = format!(
        "{}. {} {} ({}, {:.0}% confidence)\n",
        index,
        severity_marker(issue.severity),
        issue.title,
        issue.priority.as_str(),
        issue.confidence * 100.0
    );
    if !issue.description.is_empty() {
        let _ = writeln!(out, "   {}", issue.description);
    }
    if !issue.evidence.is_empty() {
        let _ = writeln!(out, "   Evidence: {}", issue.evidence);
    }
    if !issue.time_to_fix.is_empty() {
        let _ = writeln!(out, "   Time to fix: {}", issue.time_to_fix);
    }
    out
}

/// Header line plus one line per step
pub fn render_fix(index: usize, fix: &Fix) -> String {
    let risk = fix.risk_level.map(|r| r.as_str()).unwrap_or("unspecified");
    let mut out = format!("{}. {} [risk: {}]\n", index, fix.title, risk);
    if !fix.description.is_empty() {
        let _ = writeln!(out, "   {}", fix.description);
    }
    for (i, command) in fix.commands.iter().enumerate() {
        let label = fix.step_label(i);
        if label == *command {
            let _ = writeln!(out, "   {}) {}", i + 1, command);
        } else {
            let _ = writeln!(out, "   {}) {}\n      $ {}", i + 1, label, command);
        }
    }
    let mut flags = Vec::new();
    if fix.requires_admin {
        flags.push("requires administrator");
    }
    if fix.requires_restart {
        flags.push("restart required");
    }
    if !flags.is_empty() {
        let _ = writeln!(out, "   ({})", flags.join(", "));
    }
    out
}

pub fn render_analysis(analysis: &Analysis) -> String {
    let mut out = String::new();
    if !analysis.summary.is_empty() {
        let _ = writeln!(out, "{}\n", analysis.summary);
    }
    if analysis.issues.is_empty() {
        out.push_str("No issues found.\n");
    } else {
        let _ = writeln!(out, "Issues ({}):", analysis.issues.len());
        for (i, issue) in analysis.issues.iter().enumerate() {
            out.push_str(&render_issue(i + 1, issue));
        }
    }
    if !analysis.fixes.is_empty() {
        let _ = writeln!(out, "\nSuggested fixes ({}):", analysis.fixes.len());
        for (i, fix) in analysis.fixes.iter().enumerate() {
            out.push_str(&render_fix(i + 1, fix));
        }
    }
    out
}

pub fn render_record(record: &FixExecutionRecord) -> String {
    let mut out = String::new();
    for step in &record.steps {
        let mark = if step.success { "ok" } else { "FAILED" };
        let _ = writeln!(out, "  [{}] {}: {}", mark, step.index + 1, step.step);
        if let Some(error) = &step.error {
            let _ = writeln!(out, "        {}", error);
        }
    }
    if let Some(index) = record.aborted_at {
        let _ = writeln!(out, "  Stopped at step {}; later steps were not run.", index + 1);
    }
    match record.checkpoint {
        CheckpointStatus::Created => out.push_str("  Restore point created.\n"),
        CheckpointStatus::Failed => out.push_str("  Restore point could not be created.\n"),
        CheckpointStatus::Skipped => {}
    }
    let _ = writeln!(out, "{}", record.summary());
    if !record.success && record.can_rollback {
        out.push_str("Run `medicctl rollback` to open system restore.\n");
    }
    out
}

pub fn render_tools(schemas: &[ToolSchema]) -> String {
    let width = schemas.iter().map(|s| s.name.len()).max().unwrap_or(0);
    let mut out = String::new();
    for schema in schemas {
        let _ = writeln!(out, "{:width$}  {}", schema.name, schema.description, width = width);
    }
    out
}

/// Bold section header for terminals
pub fn header(text: &str, color: bool) -> String {
    if color {
        text.bold().to_string()
    } else {
        text.to_string()
    }
}
