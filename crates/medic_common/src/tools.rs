//! Tool Registry & Dispatcher
//!
//! Maps a tool name from the model to exactly one collector invocation and
//! squeezes the collector report into a compact summary (counts + top-N) to
//! keep prompts small.
//!
//! Two reserved tools never touch a collector:
//! - `propose_fix`: captured for human approval, never executed
//! - `run_diagnostic_command`: ad-hoc read-only command behind a deny-list

use crate::collector::{CollectorOptions, CollectorRegistry, InvestigationStep};
use crate::reasoning::{ToolCall, ToolSchema};
use crate::shell::ShellRunner;
use crate::types::Fix;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

pub const PROPOSE_FIX: &str = "propose_fix";
pub const RUN_DIAGNOSTIC_COMMAND: &str = "run_diagnostic_command";

/// Tool name -> (collector, action)
const TOOL_ROUTES: &[(&str, &str, &str)] = &[
    ("check_disk_health", "disk", "health"),
    ("check_disk_space", "disk", "space"),
    ("check_drivers", "drivers", "list"),
    ("check_event_logs", "eventlog", "recent"),
    ("check_network", "network", "status"),
    ("check_resources", "resources", "usage"),
];

/// Route for a collector-backed tool
pub fn route_for(tool: &str) -> Option<(&'static str, &'static str)> {
    TOOL_ROUTES
        .iter()
        .find(|(name, _, _)| *name == tool)
        .map(|(_, collector, action)| (*collector, *action))
}

/// Fixed tool schema sent on every round-trip
pub fn tool_schemas() -> Vec<ToolSchema> {
    fn schema(name: &str, description: &str, input_schema: serde_json::Value) -> ToolSchema {
        ToolSchema {
            name: name.to_string(),
            description: description.to_string(),
            input_schema,
        }
    }
    let no_input = json!({"type": "object", "properties": {}});

    vec![
        schema(
            "check_disk_health",
            "Read SMART / storage health status and recent bad-block event counts.",
            json!({
                "type": "object",
                "properties": {
                    "device": {"type": "string", "description": "Device to inspect (default: system disk)"},
                    "hours": {"type": "integer", "description": "Look-back window for bad-block events (default: 24)"}
                }
            }),
        ),
        schema(
            "check_disk_space",
            "Report free space per volume.",
            no_input.clone(),
        ),
        schema(
            "check_drivers",
            "List installed drivers / kernel modules with versions where available.",
            no_input.clone(),
        ),
        schema(
            "check_event_logs",
            "Read recent error-level system log entries.",
            json!({
                "type": "object",
                "properties": {
                    "hours": {"type": "integer", "description": "Look-back window in hours (default: 24)"}
                }
            }),
        ),
        schema(
            "check_network",
            "Report network adapters, addresses, routes and DNS servers.",
            no_input.clone(),
        ),
        schema(
            "check_resources",
            "Sample CPU usage several times, memory usage and top processes.",
            json!({
                "type": "object",
                "properties": {
                    "samples": {"type": "integer", "description": "CPU samples to take (default: 3)"}
                }
            }),
        ),
        schema(
            RUN_DIAGNOSTIC_COMMAND,
            "Run one read-only diagnostic command. State-changing commands are refused.",
            json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string", "description": "The command to run"}
                },
                "required": ["command"]
            }),
        ),
        schema(
            PROPOSE_FIX,
            "Propose a remediation plan for the user to approve. Nothing is executed.",
            json!({
                "type": "object",
                "properties": {
                    "title": {"type": "string"},
                    "description": {"type": "string"},
                    "riskLevel": {"type": "string", "enum": ["low", "medium", "high"]},
                    "requiresAdmin": {"type": "boolean"},
                    "requiresRestart": {"type": "boolean"},
                    "steps": {"type": "array", "items": {"type": "string"}},
                    "commands": {"type": "array", "items": {"type": "string"}},
                    "technicalDetails": {"type": "string"}
                },
                "required": ["title", "description", "riskLevel", "steps", "commands"]
            }),
        ),
    ]
}

// ============================================================================
// Diagnostic deny-list
// ============================================================================

/// Substrings that disqualify an ad-hoc diagnostic command.
/// State-changing verbs first, then command/script injection primitives.
const DIAGNOSTIC_DENY_PATTERNS: &[&str] = &[
    // State-changing verbs
    "remove",
    "delete",
    "del ",
    "erase",
    "rm ",
    "rmdir",
    "set-",
    "new-",
    "format",
    "restart",
    "stop-",
    "kill",
    "shutdown",
    "reboot",
    "chmod",
    "chown",
    "sudo",
    "reg add",
    "sc config",
    "systemctl start",
    "systemctl stop",
    "systemctl enable",
    "systemctl disable",
    // Injection primitives
    "invoke-expression",
    "invoke-command",
    "start-process",
    "invoke-webrequest",
    "downloadstring",
    "encodedcommand",
    "cmd /c",
    "cmd.exe",
    "bash -c",
    "sh -c",
    "eval ",
    "$(",
    "`",
    ";",
    "&&",
    "||",
    ">",
];

/// Word-level rules: interpreters fed through a pipe and writes via pipes
static DIAGNOSTIC_DENY_RULES: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    let rules: &[(&str, &str)] = &[
        ("iex", r"(?i)\biex\b"),
        (
            "interpreter",
            r"(?i)(^|\|)\s*(sh|bash|zsh|dash|ksh|powershell|pwsh|cmd|python[0-9.]*|perl|ruby|node)(\.exe)?\b",
        ),
        ("xargs", r"(?i)\bxargs\b"),
        (
            "file write",
            r"(?i)\b(out-file|tee|tee-object|set-content|add-content|copy-item|move-item|cp|mv|install)\b",
        ),
    ];

    rules
        .iter()
        .filter_map(|(label, pattern)| match Regex::new(pattern) {
            Ok(re) => Some((*label, re)),
            Err(e) => {
                tracing::error!("Invalid diagnostic pattern {}: {}", pattern, e);
                None
            }
        })
        .collect()
});

/// Deny-list patterns matched by `command`; empty means allowed
pub fn diagnostic_violations(command: &str) -> Vec<&'static str> {
    let lower = command.to_lowercase();
    let mut matched: Vec<&'static str> = DIAGNOSTIC_DENY_PATTERNS
        .iter()
        .copied()
        .filter(|pattern| lower.contains(pattern))
        .collect();
    matched.extend(
        DIAGNOSTIC_DENY_RULES
            .iter()
            .filter(|(_, re)| re.is_match(command))
            .map(|(label, _)| *label),
    );
    matched
}

pub fn is_diagnostic_command_allowed(command: &str) -> bool {
    !command.trim().is_empty() && diagnostic_violations(command).is_empty()
}

// ============================================================================
// Dispatch
// ============================================================================

/// Outcome of one tool call
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub content: serde_json::Value,
    pub is_error: bool,
    /// Set only by `propose_fix`
    pub proposed_fix: Option<Fix>,
}

impl ToolOutput {
    fn ok(content: serde_json::Value) -> Self {
        Self {
            content,
            is_error: false,
            proposed_fix: None,
        }
    }

    fn error(content: serde_json::Value) -> Self {
        Self {
            content,
            is_error: true,
            proposed_fix: None,
        }
    }
}

/// Executes tool calls against collectors and the host shell
pub struct ToolDispatcher {
    collectors: CollectorRegistry,
    shell: Arc<dyn ShellRunner>,
    command_timeout: Duration,
    max_findings: usize,
}

impl ToolDispatcher {
    pub fn new(collectors: CollectorRegistry, shell: Arc<dyn ShellRunner>) -> Self {
        Self {
            collectors,
            shell,
            command_timeout: Duration::from_secs(60),
            max_findings: 5,
        }
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_max_findings(mut self, max: usize) -> Self {
        self.max_findings = max.max(1);
        self
    }

    pub fn schemas(&self) -> Vec<ToolSchema> {
        tool_schemas()
    }

    /// Execute one call. Never fails: every problem becomes a structured result.
    pub async fn dispatch(&self, call: &ToolCall) -> ToolOutput {
        match call.name.as_str() {
            PROPOSE_FIX => propose_fix(&call.input),
            RUN_DIAGNOSTIC_COMMAND => self.run_diagnostic_command(&call.input).await,
            name => match route_for(name) {
                Some((collector, action)) => self.run_collector(name, collector, action, call).await,
                None => {
                    tracing::warn!("Model requested unknown tool '{}'", name);
                    ToolOutput::error(json!({
                        "status": "not_implemented",
                        "tool": name,
                        "message": format!("Tool '{}' is not implemented", name),
                    }))
                }
            },
        }
    }

    async fn run_collector(
        &self,
        tool: &str,
        collector: &str,
        action: &str,
        call: &ToolCall,
    ) -> ToolOutput {
        let config = call.input.as_object().cloned().unwrap_or_default();
        let step = InvestigationStep::new(action).with_config(config);
        let options = CollectorOptions {
            timeout: self.command_timeout,
            ..Default::default()
        };

        match self.collectors.investigate(collector, &step, &options).await {
            Ok(report) => ToolOutput::ok(summarize_report(tool, &report, self.max_findings)),
            Err(e) => {
                tracing::warn!("Collector '{}' failed for {}: {}", collector, tool, e);
                ToolOutput::error(json!({
                    "tool": tool,
                    "error": e.to_string(),
                    "findings": [format!("{} could not be collected", tool)],
                    "recommendations": [],
                }))
            }
        }
    }

    async fn run_diagnostic_command(&self, input: &serde_json::Value) -> ToolOutput {
        let command = input
            .get("command")
            .and_then(|c| c.as_str())
            .unwrap_or("")
            .trim();

        if command.is_empty() {
            return ToolOutput::error(json!({
                "error": "Missing 'command' parameter",
            }));
        }

        let violations = diagnostic_violations(command);
        if !violations.is_empty() {
            tracing::warn!("Refused diagnostic command '{}': {:?}", command, violations);
            return ToolOutput::error(json!({
                "error": "Command refused: only read-only diagnostic commands are allowed here. Use propose_fix for changes.",
                "command": command,
                "matched": violations,
            }));
        }

        match self.shell.run(command, self.command_timeout).await {
            Ok(output) => {
                let lines: Vec<&str> = output.stdout.lines().collect();
                ToolOutput {
                    content: json!({
                        "command": command,
                        "exitCode": output.exit_code,
                        "lineCount": lines.len(),
                        "output": crate::shell::truncate_chars(&output.stdout, 4000),
                        "stderr": crate::shell::truncate_chars(&output.stderr, 1000),
                    }),
                    is_error: !output.success(),
                    proposed_fix: None,
                }
            }
            Err(e) => ToolOutput::error(json!({
                "command": command,
                "error": e.to_string(),
            })),
        }
    }
}

fn propose_fix(input: &serde_json::Value) -> ToolOutput {
    match serde_json::from_value::<Fix>(input.clone()) {
        Ok(fix) if !fix.commands.is_empty() => {
            let fix = fix.ensure_id();
            ToolOutput {
                content: json!({
                    "status": "proposed",
                    "fixId": fix.id,
                    "message": "Fix recorded and shown to the user for approval. It has not been executed.",
                }),
                is_error: false,
                proposed_fix: Some(fix),
            }
        }
        Ok(_) => ToolOutput::error(json!({
            "error": "Fix proposal rejected: 'commands' must not be empty",
        })),
        Err(e) => ToolOutput::error(json!({
            "error": format!("Fix proposal could not be read: {}", e),
        })),
    }
}

/// Compact summary: counts plus top-N findings and recommendations
pub fn summarize_report(tool: &str, report: &serde_json::Value, max_findings: usize) -> serde_json::Value {
    let findings = report
        .get("findings")
        .and_then(|f| f.as_array())
        .cloned()
        .unwrap_or_default();
    let recommendations = report
        .get("recommendations")
        .and_then(|r| r.as_array())
        .cloned()
        .unwrap_or_default();

    let mut summary = json!({
        "tool": tool,
        "findingCount": findings.len(),
        "topFindings": findings.iter().take(max_findings).collect::<Vec<_>>(),
        "recommendationCount": recommendations.len(),
        "recommendations": recommendations.iter().take(3).collect::<Vec<_>>(),
    });

    if let Some(metrics) = report.get("metrics") {
        summary["metrics"] = metrics.clone();
    }
    if findings.is_empty() && report.get("findings").is_none() {
        // Non-conventional report: pass a bounded rendering through
        summary["raw"] = json!(crate::shell::truncate_chars(&report.to_string(), 2000));
    }
    summary
}
