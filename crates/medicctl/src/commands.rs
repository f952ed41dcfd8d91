//! Command implementations for medicctl

use crate::approval;
use crate::progress::{thinking_spinner, CliEventSink};
use crate::render::{header, render_analysis, render_fix, render_record, render_tools};
use anyhow::{bail, Context, Result};
use indicatif::ProgressBar;
use medic_common::evidence::EvidenceSnapshot;
use medic_common::platform::{HostPlatform, Platform};
use medic_common::reasoning::{HttpReasoningService, Usage};
use medic_common::shell::{HostShell, ShellRunner};
use medic_common::synthesis::synthesize;
use medic_common::tools::tool_schemas;
use medic_common::{
    DiagnosisReport, ExecutionLock, Fix, FixExecutionRecord, FixExecutor, MedicConfig, Orchestrator,
    ProblemType, ReasoningService,
};
use serde::Serialize;
use std::io::{self, BufRead, IsTerminal, Write};
use std::path::Path;
use std::sync::Arc;

/// Everything a command needs, built once per invocation
pub struct App {
    pub config: MedicConfig,
    pub json: bool,
    shell: Arc<dyn ShellRunner>,
    platform: Arc<dyn Platform>,
    reasoning: Option<Arc<dyn ReasoningService>>,
    lock: ExecutionLock,
}

impl App {
    /// Backed by the real machine
    pub fn new(config: MedicConfig, json: bool) -> Self {
        let shell: Arc<dyn ShellRunner> = Arc::new(HostShell);
        let platform = Arc::new(HostPlatform::new(shell.clone()));
        Self::with_backends(config, json, shell, platform)
    }

    pub fn with_backends(
        config: MedicConfig,
        json: bool,
        shell: Arc<dyn ShellRunner>,
        platform: Arc<dyn Platform>,
    ) -> Self {
        Self {
            config,
            json,
            shell,
            platform,
            reasoning: None,
            lock: ExecutionLock::new(),
        }
    }

    /// Use this service instead of the configured HTTP endpoint
    pub fn with_reasoning(mut self, service: Arc<dyn ReasoningService>) -> Self {
        self.reasoning = Some(service);
        self
    }

    fn color(&self) -> bool {
        !self.json && io::stdout().is_terminal()
    }

    fn reasoning_service(&self) -> Result<Arc<dyn ReasoningService>> {
        if let Some(service) = &self.reasoning {
            return Ok(service.clone());
        }
        let service = HttpReasoningService::new(self.config.reasoning.clone())
            .context("Cannot reach the reasoning service")?;
        Ok(Arc::new(service))
    }

    fn orchestrator(&self, bar: &ProgressBar) -> Result<Orchestrator> {
        let events = Arc::new(CliEventSink::new(bar.clone(), self.json));
        Ok(
            Orchestrator::from_config(&self.config, self.reasoning_service()?, self.shell.clone())
                .with_events(events),
        )
    }

    fn executor(&self) -> FixExecutor {
        let events = Arc::new(CliEventSink::new(ProgressBar::hidden(), self.json));
        FixExecutor::from_config(
            &self.config,
            self.shell.clone(),
            self.platform.clone(),
            self.lock.clone(),
        )
        .with_events(events)
    }

    fn print_json<T: Serialize>(&self, value: &T) -> Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }

    /// Ask (unless `yes`), then run the fix. `None` when the user declined.
    pub async fn approve_and_execute(&self, fix: &Fix, yes: bool) -> Result<Option<FixExecutionRecord>> {
        if !yes {
            if self.json {
                bail!("Fix approval needs a terminal; pass --yes to approve in --json mode");
            }
            if !approval::request_approval_stdio(fix).context("Failed to read approval")? {
                return Ok(None);
            }
        }

        let record = self.executor().execute_or_report(fix).await;
        if self.json {
            self.print_json(&record)?;
        } else {
            print!("{}", render_record(&record));
        }
        Ok(Some(record))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChatJson<'a> {
    final_text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    proposed_fix: Option<&'a Fix>,
    usage: Usage,
}

/// `chat [MESSAGE]`: one-shot, or a loop on stdin
pub async fn chat(app: &App, message: Option<String>) -> Result<()> {
    // Tool progress prints as plain lines between prompts
    let mut orch = app.orchestrator(&ProgressBar::hidden())?;

    if let Some(message) = message {
        return chat_turn(app, &mut orch, &message).await;
    }

    if app.json {
        bail!("Interactive chat is not available in --json mode; pass a message");
    }
    println!("Describe your problem. Type 'reset' to start over, 'exit' to quit.");
    let stdin = io::stdin();
    loop {
        print!("\nyou> ");
        io::stdout().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        match line.trim() {
            "" => continue,
            "exit" | "quit" => break,
            "reset" => {
                orch.reset();
                println!("Conversation cleared.");
            }
            message => {
                if let Err(e) = chat_turn(app, &mut orch, message).await {
                    eprintln!("Error: {:#}", e);
                }
            }
        }
    }
    Ok(())
}

async fn chat_turn(app: &App, orch: &mut Orchestrator, message: &str) -> Result<()> {
    let outcome = orch.chat(message).await.context("Diagnostic session failed")?;

    if app.json {
        app.print_json(&ChatJson {
            final_text: &outcome.final_text,
            proposed_fix: outcome.proposed_fix.as_ref(),
            usage: outcome.usage,
        })?;
        return Ok(());
    }

    println!("\n{}", outcome.final_text.trim());
    if let Some(fix) = &outcome.proposed_fix {
        if let Some(record) = app.approve_and_execute(fix, false).await? {
            orch.record_fix_outcome(&record);
        }
    }
    Ok(())
}

/// Fixes offered after a diagnosis: synthesized ones, then the proposal
pub fn candidate_fixes(report: &DiagnosisReport) -> Vec<Fix> {
    let mut fixes = report.analysis.fixes.clone();
    if let Some(proposed) = &report.proposed_fix {
        if !fixes.iter().any(|f| f.id == proposed.id) {
            fixes.push(proposed.clone());
        }
    }
    fixes
}

/// `diagnose <PROBLEM> [--apply N]`
pub async fn diagnose(app: &App, problem: ProblemType, apply: Option<usize>) -> Result<()> {
    let spinner = thinking_spinner(!app.json);
    let mut orch = app.orchestrator(&spinner)?;
    let result = orch.diagnose(problem).await;
    spinner.finish_and_clear();
    let report = result.with_context(|| format!("Diagnosis '{}' failed", problem))?;

    if app.json {
        app.print_json(&report)?;
    } else {
        println!("{}\n", header(&format!("Diagnosis: {}", problem), app.color()));
        print!("{}", render_analysis(&report.analysis));
        if let Some(fix) = &report.proposed_fix {
            if !report.analysis.fixes.iter().any(|f| f.id == fix.id) {
                println!("\n{}", header("Proposed fix:", app.color()));
                print!("{}", render_fix(report.analysis.fixes.len() + 1, fix));
            }
        }
    }

    if let Some(n) = apply {
        let fixes = candidate_fixes(&report);
        let fix = n
            .checked_sub(1)
            .and_then(|i| fixes.get(i))
            .with_context(|| format!("No fix number {} ({} available)", n, fixes.len()))?;
        app.approve_and_execute(fix, false).await?;
    }
    Ok(())
}

/// `analyze [FILE]`: synthesis only, no service calls
pub fn analyze(app: &App, file: Option<&Path>) -> Result<()> {
    let raw = match file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?,
        None => io::read_to_string(io::stdin()).context("Failed to read stdin")?,
    };
    let analysis = synthesize(&raw, &EvidenceSnapshot::default(), chrono::Utc::now().date_naive());

    if app.json {
        app.print_json(&analysis)
    } else {
        print!("{}", render_analysis(&analysis));
        Ok(())
    }
}

/// Read a Fix from a JSON file
pub fn load_fix(path: &Path) -> Result<Fix> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let fix: Fix = serde_json::from_str(&text)
        .with_context(|| format!("{} is not a valid fix", path.display()))?;
    Ok(fix.ensure_id())
}

/// `apply <FIX_JSON> [--yes]`
pub async fn apply(app: &App, path: &Path, yes: bool) -> Result<()> {
    let fix = load_fix(path)?;
    match app.approve_and_execute(&fix, yes).await? {
        Some(record) if !record.success => bail!(
            "{}",
            record.error.unwrap_or_else(|| "fix failed".to_string())
        ),
        _ => Ok(()),
    }
}

/// `rollback`: open the platform restore tool
pub async fn rollback(app: &App) -> Result<()> {
    app.executor()
        .restore_system()
        .await
        .context("Could not start system restore")?;
    if !app.json {
        println!("System restore has been opened. Follow its instructions to finish.");
    }
    Ok(())
}

/// `tools`
pub fn tools(app: &App) -> Result<()> {
    let schemas = tool_schemas();
    if app.json {
        let list: Vec<_> = schemas
            .iter()
            .map(|s| serde_json::json!({"name": s.name, "description": s.description}))
            .collect();
        app.print_json(&list)
    } else {
        print!("{}", render_tools(&schemas));
        Ok(())
    }
}
