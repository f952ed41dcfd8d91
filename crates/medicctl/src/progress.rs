//! Terminal progress: spinner while the model thinks, one line per tool call
//! and fix step.

use indicatif::{ProgressBar, ProgressStyle};
use medic_common::events::ToolStatus;
use medic_common::{EventSink, MedicEvent};
use owo_colors::OwoColorize;
use std::io::IsTerminal;
use std::time::Duration;

const SPINNER_FRAMES: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

/// Spinner on a terminal, hidden otherwise
pub fn thinking_spinner(enabled: bool) -> ProgressBar {
    if !enabled || !std::io::stderr().is_terminal() {
        return ProgressBar::hidden();
    }
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner()
        .tick_strings(SPINNER_FRAMES)
        .template("{spinner:.cyan} {msg}")
    {
        spinner.set_style(style);
    }
    spinner.set_message("medic (thinking)...");
    spinner.enable_steady_tick(Duration::from_millis(120));
    spinner
}

/// Format one event as a progress line; `None` for events not shown
pub fn describe_event(event: &MedicEvent) -> Option<String> {
    match event {
        MedicEvent::Tool {
            tool,
            status: ToolStatus::Executing,
            ..
        } => Some(format!("running {}", tool)),
        MedicEvent::Tool {
            tool,
            status: ToolStatus::Failed,
            ..
        } => Some(format!("{} returned an error", tool)),
        MedicEvent::Tool { .. } => None,
        MedicEvent::FixState { .. } => None,
        MedicEvent::FixStep {
            index,
            total,
            command,
            success: None,
            ..
        } => Some(format!("[{}/{}] {}", index + 1, total, command)),
        MedicEvent::FixStep {
            index,
            success: Some(false),
            ..
        } => Some(format!("step {} failed", index + 1)),
        MedicEvent::FixStep { .. } => None,
        MedicEvent::FixFinished {
            succeeded, failed, ..
        } => Some(format!("{} step(s) succeeded, {} failed", succeeded, failed)),
    }
}

/// Event sink that draws on stderr; silent in `--json` mode
pub struct CliEventSink {
    bar: ProgressBar,
    quiet: bool,
}

impl CliEventSink {
    pub fn new(bar: ProgressBar, quiet: bool) -> Self {
        Self { bar, quiet }
    }
}

impl EventSink for CliEventSink {
    fn emit(&self, event: MedicEvent) {
        tracing::debug!(?event, "progress");
        if self.quiet {
            return;
        }
        let Some(line) = describe_event(&event) else {
            return;
        };
        if let MedicEvent::Tool {
            status: ToolStatus::Executing,
            ..
        } = &event
        {
            self.bar.set_message(line.clone());
        }
        if self.bar.is_hidden() {
            eprintln!("  {}", line.dimmed());
        } else {
            self.bar.println(format!("  {}", line.dimmed()));
        }
    }
}
