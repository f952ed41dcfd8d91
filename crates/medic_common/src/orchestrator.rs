//! Conversation Orchestrator
//!
//! The loop: USER -> SERVICE -> TOOL CALLS -> TOOL RESULTS -> SERVICE -> ANSWER
//!
//! Tool calls inside one assistant turn run sequentially, in order, and their
//! results are appended as one aggregated tool-result turn. The loop is bounded
//! by an iteration ceiling and a wall-clock budget.

use crate::collectors::standard_registry;
use crate::config::MedicConfig;
use crate::events::{EventSink, MedicEvent, NullSink, ToolStatus};
use crate::fix_executor::FixExecutionRecord;
use crate::reasoning::{
    ContentBlock, ReasoningError, ReasoningRequest, ReasoningService, Role, StopReason, Turn, Usage,
};
use crate::shell::ShellRunner;
use crate::tools::ToolDispatcher;
use crate::types::Fix;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

pub const DEFAULT_MAX_ITERATIONS: usize = 10;
pub const MIN_ITERATIONS: usize = 3;
pub const MAX_ITERATIONS: usize = 50;
pub const DEFAULT_BUDGET: Duration = Duration::from_secs(600);

pub const SYSTEM_PROMPT: &str = r#"You are Medic, a careful computer diagnostics assistant.

Investigate the user's problem with the diagnostic tools before drawing conclusions.
Call several tools when the problem is broad. Tools are read-only; you cannot change
the system yourself. When a change is needed, call propose_fix: the user reviews and
approves every fix before it runs.

Classification rules (follow them exactly):
- A disk is failing only when its health flag is unhealthy AND it has more than 10
  recent bad-block events or a predicted failure. A healthy flag overrides log noise.
- A driver is outdated only when it is more than 6 months old.
- High CPU means sustained usage above 80% across samples, not a single spike.
- Low disk space means less than 10% free.

When you have finished investigating, answer with a single JSON object:
{
  "summary": "one or two sentences",
  "issues": [{"title": "", "description": "", "evidence": "",
              "severity": "critical|warning|info", "priority": "immediate|high|medium|low",
              "confidence": 0.0, "actionable": true, "timeToFix": "",
              "category": "disk_failure|outdated_driver|high_cpu|low_disk_space|other"}],
  "fixes": [{"id": "", "title": "", "description": "", "riskLevel": "low|medium|high",
             "requiresAdmin": true, "automatable": true, "requiresRestart": false,
             "steps": [], "commands": [], "technicalDetails": "",
             "priority": "immediate|high|medium|low", "confidence": 0.0}]
}
Only report issues the evidence supports. An empty issues list is a valid answer."#;

/// Session failures. Tool and collector problems never end up here.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("Reasoning service failed: {0}")]
    Reasoning(#[from] ReasoningError),

    #[error("Reasoning service did not finish within {secs} seconds")]
    ReasoningTimeout { secs: u64 },

    #[error("Gave up after {limit} reasoning rounds without a final answer")]
    LoopExceeded { limit: usize },
}

/// Ordered, append-only turn history owned by one orchestrator
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    turns: Vec<Turn>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// Append a turn. A user-side turn right after another user-side turn
    /// is folded into it, so roles strictly alternate.
    pub fn push(&mut self, turn: Turn) {
        match self.turns.last_mut() {
            Some(last) if last.role.is_user_side() && turn.role.is_user_side() => {
                last.content.extend(turn.content);
            }
            _ => self.turns.push(turn),
        }
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    fn clear(&mut self) {
        self.turns.clear();
    }
}

/// Result of one `chat` call
#[derive(Debug, Clone, PartialEq)]
pub struct ChatOutcome {
    pub final_text: String,
    /// Last valid `propose_fix` input of this chat, awaiting approval
    pub proposed_fix: Option<Fix>,
    /// Tokens used by this chat alone
    pub usage: Usage,
}

pub struct Orchestrator {
    service: Arc<dyn ReasoningService>,
    dispatcher: ToolDispatcher,
    conversation: Conversation,
    events: Arc<dyn EventSink>,
    max_iterations: usize,
    budget: Duration,
    usage: Usage,
}

impl Orchestrator {
    pub fn new(service: Arc<dyn ReasoningService>, dispatcher: ToolDispatcher) -> Self {
        Self {
            service,
            dispatcher,
            conversation: Conversation::new(),
            events: Arc::new(NullSink),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            budget: DEFAULT_BUDGET,
            usage: Usage::default(),
        }
    }

    /// Wire the standard collectors and session limits from configuration
    pub fn from_config(
        config: &MedicConfig,
        service: Arc<dyn ReasoningService>,
        shell: Arc<dyn ShellRunner>,
    ) -> Self {
        let dispatcher = ToolDispatcher::new(standard_registry(config, shell.clone()), shell)
            .with_command_timeout(config.tools.command_timeout())
            .with_max_findings(config.tools.max_findings);
        Self::new(service, dispatcher)
            .with_max_iterations(config.session.effective_max_iterations())
            .with_budget(config.session.budget())
    }

    pub fn with_max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = max.clamp(MIN_ITERATIONS, MAX_ITERATIONS);
        self
    }

    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn dispatcher(&self) -> &ToolDispatcher {
        &self.dispatcher
    }

    /// Tokens used since creation or the last reset
    pub fn usage(&self) -> Usage {
        self.usage
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    /// Drop the conversation and usage counters
    pub fn reset(&mut self) {
        self.conversation.clear();
        self.usage = Usage::default();
    }

    /// Run one user message through the tool-use loop
    pub async fn chat(&mut self, message: &str) -> Result<ChatOutcome, SessionError> {
        self.conversation.push(Turn::user(message));

        let deadline = Instant::now() + self.budget;
        let mut proposed_fix = None;
        let mut usage = Usage::default();

        for iteration in 1..=self.max_iterations {
            let request = ReasoningRequest {
                system: SYSTEM_PROMPT.to_string(),
                turns: self.conversation.turns().to_vec(),
                tools: self.dispatcher.schemas(),
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            let response = match tokio::time::timeout(remaining, self.service.converse(&request)).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(SessionError::ReasoningTimeout {
                        secs: self.budget.as_secs(),
                    })
                }
            };
            debug!(
                "Round {}/{}: stop={:?}, {} block(s), {} in / {} out tokens",
                iteration,
                self.max_iterations,
                response.stop_reason,
                response.content.len(),
                response.usage.input_tokens,
                response.usage.output_tokens
            );
            usage.add(response.usage);
            self.usage.add(response.usage);

            let calls = response.tool_calls();
            if response.stop_reason == StopReason::End || calls.is_empty() {
                let final_text = response.text_content();
                self.conversation.push(Turn {
                    role: Role::Assistant,
                    content: response.content,
                });
                return Ok(ChatOutcome {
                    final_text,
                    proposed_fix,
                    usage,
                });
            }

            self.conversation.push(Turn {
                role: Role::Assistant,
                content: response.content,
            });

            let mut results = Vec::with_capacity(calls.len());
            for call in &calls {
                info!("Tool call {} ({})", call.name, call.id);
                self.events.emit(MedicEvent::Tool {
                    tool: call.name.clone(),
                    input: call.input.clone(),
                    status: ToolStatus::Executing,
                });

                let output = self.dispatcher.dispatch(call).await;

                self.events.emit(MedicEvent::Tool {
                    tool: call.name.clone(),
                    input: call.input.clone(),
                    status: if output.is_error {
                        ToolStatus::Failed
                    } else {
                        ToolStatus::Completed
                    },
                });
                if let Some(fix) = output.proposed_fix {
                    info!("Fix proposed: {} ({})", fix.title, fix.id);
                    proposed_fix = Some(fix);
                }
                results.push(ContentBlock::ToolResult {
                    tool_use_id: call.id.clone(),
                    content: output.content,
                    is_error: output.is_error,
                });
            }
            self.conversation.push(Turn {
                role: Role::ToolResult,
                content: results,
            });
        }

        Err(SessionError::LoopExceeded {
            limit: self.max_iterations,
        })
    }

    /// Tell the model what happened when a fix ran
    pub fn record_fix_outcome(&mut self, record: &FixExecutionRecord) {
        let mut text = format!("Fix execution result: {}", record.summary());
        for step in &record.steps {
            let status = if step.success { "ok" } else { "failed" };
            text.push_str(&format!("\n- step {} [{}] {}", step.index + 1, status, step.command));
            if let Some(error) = &step.error {
                text.push_str(&format!(": {}", error));
            }
        }
        self.conversation.push(Turn::user(text));
    }
}
