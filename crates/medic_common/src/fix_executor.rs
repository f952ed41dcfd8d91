//! Fix Execution State Machine
//!
//! Validating -> SafetyChecking -> (Checkpointing) -> Executing[i] -> Verifying -> Complete
//!
//! `Error` is reachable from any state. `RolledBack` only through an explicit
//! `rollback()` call. Fixes reaching this module have already been approved
//! by the user; nothing here asks again.

use crate::config::MedicConfig;
use crate::events::{EventSink, MedicEvent, NullSink};
use crate::platform::{Platform, PlatformError};
use crate::safety::{scan_fix_commands, SafetyViolation};
use crate::shell::ShellRunner;
use crate::types::{Fix, RiskLevel};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(300);

/// Max characters of step output kept in a record
const MAX_STEP_OUTPUT: usize = 8 * 1024;

// =============================================================================
// Execution lock
// =============================================================================

/// Exclusive right to change the live system. Clones share the same flag.
///
/// Not a queue: a second caller is refused, never parked.
#[derive(Debug, Clone, Default)]
pub struct ExecutionLock {
    busy: Arc<AtomicBool>,
}

impl ExecutionLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock if free. Released when the guard drops.
    pub fn try_acquire(&self) -> Option<ExecutionGuard> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ExecutionGuard {
                busy: Arc::clone(&self.busy),
            })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
pub struct ExecutionGuard {
    busy: Arc<AtomicBool>,
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

// =============================================================================
// States and records
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Validating,
    SafetyChecking,
    Checkpointing,
    Executing,
    Verifying,
    Complete,
    Error,
    RolledBack,
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionState::Validating => "validating",
            ExecutionState::SafetyChecking => "safety_checking",
            ExecutionState::Checkpointing => "checkpointing",
            ExecutionState::Executing => "executing",
            ExecutionState::Verifying => "verifying",
            ExecutionState::Complete => "complete",
            ExecutionState::Error => "error",
            ExecutionState::RolledBack => "rolled_back",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of one command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepOutcome {
    pub index: usize,
    pub step: String,
    pub command: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Created,
    Failed,
    Skipped,
}

/// Result of one execution attempt. Never mutated after `execute` returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixExecutionRecord {
    pub fix_id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<RiskLevel>,
    pub success: bool,
    pub steps: Vec<StepOutcome>,
    pub succeeded: usize,
    pub failed: usize,
    pub requires_restart: bool,
    pub can_rollback: bool,
    pub checkpoint: CheckpointStatus,
    /// Index of the step that stopped a high-risk fix
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted_at: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl FixExecutionRecord {
    /// Record for a fix that was refused before any command ran
    fn rejected(fix: &Fix, error: &FixError, started_at: DateTime<Utc>) -> Self {
        Self {
            fix_id: fix.id.clone(),
            title: fix.title.clone(),
            risk_level: fix.risk_level,
            success: false,
            steps: Vec::new(),
            succeeded: 0,
            failed: 0,
            requires_restart: false,
            can_rollback: false,
            checkpoint: CheckpointStatus::Skipped,
            aborted_at: None,
            error: Some(error.to_string()),
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// One-line human summary
    pub fn summary(&self) -> String {
        if self.success {
            format!(
                "Fix \"{}\" completed: {} of {} steps succeeded{}",
                self.title,
                self.succeeded,
                self.steps.len(),
                if self.requires_restart { ", restart required" } else { "" }
            )
        } else {
            format!(
                "Fix \"{}\" failed: {}",
                self.title,
                self.error.as_deref().unwrap_or("unknown error")
            )
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FixError {
    #[error("Another fix is already running; try again when it finishes")]
    Busy,

    #[error("Invalid fix: {0}")]
    Validation(String),

    #[error("Fix rejected by safety check: {}", format_violations(.0))]
    SafetyRejection(Vec<SafetyViolation>),

    #[error("Administrative privileges required. {0}")]
    AdminRequired(String),

    #[error("Rollback unavailable: {0}")]
    RollbackUnavailable(String),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),
}

fn format_violations(violations: &[SafetyViolation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Structural checks. Returns the validated risk level.
pub fn validate_fix(fix: &Fix) -> Result<RiskLevel, FixError> {
    if fix.title.trim().is_empty() {
        return Err(FixError::Validation("missing title".to_string()));
    }
    if fix.description.trim().is_empty() {
        return Err(FixError::Validation("missing description".to_string()));
    }
    if fix.commands.is_empty() {
        return Err(FixError::Validation("no commands".to_string()));
    }
    if let Some(blank) = fix.commands.iter().position(|c| c.trim().is_empty()) {
        return Err(FixError::Validation(format!("command {} is empty", blank + 1)));
    }
    match fix.risk_level {
        None => Err(FixError::Validation("missing riskLevel".to_string())),
        Some(RiskLevel::Unrecognized) => Err(FixError::Validation(
            "riskLevel must be one of low, medium, high".to_string(),
        )),
        Some(level) => Ok(level),
    }
}

// =============================================================================
// Executor
// =============================================================================

pub struct FixExecutor {
    shell: Arc<dyn ShellRunner>,
    platform: Arc<dyn Platform>,
    lock: ExecutionLock,
    events: Arc<dyn EventSink>,
    step_timeout: Duration,
}

impl FixExecutor {
    pub fn new(shell: Arc<dyn ShellRunner>, platform: Arc<dyn Platform>, lock: ExecutionLock) -> Self {
        Self {
            shell,
            platform,
            lock,
            events: Arc::new(NullSink),
            step_timeout: DEFAULT_STEP_TIMEOUT,
        }
    }

    pub fn from_config(
        config: &MedicConfig,
        shell: Arc<dyn ShellRunner>,
        platform: Arc<dyn Platform>,
        lock: ExecutionLock,
    ) -> Self {
        Self::new(shell, platform, lock).with_step_timeout(config.fix.step_timeout())
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub fn lock(&self) -> &ExecutionLock {
        &self.lock
    }

    fn transition(&self, fix_id: &str, state: ExecutionState) {
        info!("Fix {}: {}", fix_id, state);
        self.events.emit(MedicEvent::FixState {
            fix_id: fix_id.to_string(),
            state: state.to_string(),
        });
    }

    /// Run an approved fix. Rejections before the first command are errors;
    /// step failures are reported inside the record.
    pub async fn execute(&self, fix: &Fix) -> Result<FixExecutionRecord, FixError> {
        let _guard = self.lock.try_acquire().ok_or_else(|| {
            warn!("Fix {} refused: executor busy", fix.id);
            FixError::Busy
        })?;
        let started_at = Utc::now();

        self.transition(&fix.id, ExecutionState::Validating);
        let risk = match validate_fix(fix) {
            Ok(risk) => risk,
            Err(e) => return Err(self.fail(&fix.id, e)),
        };

        self.transition(&fix.id, ExecutionState::SafetyChecking);
        let violations = scan_fix_commands(&fix.commands);
        if !violations.is_empty() {
            warn!(
                "Fix {} rejected: {} destructive command(s)",
                fix.id,
                violations.len()
            );
            return Err(self.fail(&fix.id, FixError::SafetyRejection(violations)));
        }
        if fix.requires_admin && !self.platform.is_elevated().await {
            let hint = self.platform.elevation_hint();
            return Err(self.fail(&fix.id, FixError::AdminRequired(hint)));
        }

        let checkpoint = if risk.needs_checkpoint() {
            self.transition(&fix.id, ExecutionState::Checkpointing);
            let description = format!("Before fix: {}", fix.title);
            match self.platform.create_checkpoint(&description).await {
                Ok(()) => CheckpointStatus::Created,
                Err(e) => {
                    warn!("Checkpoint failed for fix {}, continuing: {}", fix.id, e);
                    CheckpointStatus::Failed
                }
            }
        } else {
            CheckpointStatus::Skipped
        };

        self.transition(&fix.id, ExecutionState::Executing);
        let (steps, aborted_at) = self.run_steps(fix, risk).await;

        self.transition(&fix.id, ExecutionState::Verifying);
        let succeeded = steps.iter().filter(|s| s.success).count();
        let failed = steps.len() - succeeded;
        let success = match risk {
            RiskLevel::High => failed == 0,
            _ => succeeded > 0,
        };
        let error = if success {
            None
        } else if let Some(index) = aborted_at {
            Some(format!(
                "step {} failed; remaining steps were not run",
                index + 1
            ))
        } else {
            Some("every step failed".to_string())
        };

        let record = FixExecutionRecord {
            fix_id: fix.id.clone(),
            title: fix.title.clone(),
            risk_level: Some(risk),
            success,
            steps,
            succeeded,
            failed,
            requires_restart: fix.requires_restart && succeeded > 0,
            can_rollback: risk.needs_checkpoint(),
            checkpoint,
            aborted_at,
            error,
            started_at,
            finished_at: Utc::now(),
        };

        self.transition(
            &fix.id,
            if success {
                ExecutionState::Complete
            } else {
                ExecutionState::Error
            },
        );
        self.events.emit(MedicEvent::FixFinished {
            fix_id: fix.id.clone(),
            success,
            succeeded,
            failed,
        });
        info!("{}", record.summary());
        Ok(record)
    }

    /// Like `execute`, but every rejection becomes a `success: false` record
    pub async fn execute_or_report(&self, fix: &Fix) -> FixExecutionRecord {
        let started_at = Utc::now();
        match self.execute(fix).await {
            Ok(record) => record,
            Err(e) => FixExecutionRecord::rejected(fix, &e, started_at),
        }
    }

    async fn run_steps(&self, fix: &Fix, risk: RiskLevel) -> (Vec<StepOutcome>, Option<usize>) {
        let total = fix.commands.len();
        let mut steps = Vec::with_capacity(total);

        for (index, command) in fix.commands.iter().enumerate() {
            self.events.emit(MedicEvent::FixStep {
                fix_id: fix.id.clone(),
                index,
                total,
                command: command.clone(),
                success: None,
            });
            info!("Fix {} step {}/{}: {}", fix.id, index + 1, total, command);

            let outcome = self.run_step(fix, index, command).await;
            let success = outcome.success;
            if !success {
                warn!(
                    "Fix {} step {} failed: {}",
                    fix.id,
                    index + 1,
                    outcome.error.as_deref().unwrap_or("")
                );
            }
            self.events.emit(MedicEvent::FixStep {
                fix_id: fix.id.clone(),
                index,
                total,
                command: command.clone(),
                success: Some(success),
            });
            steps.push(outcome);

            if !success && risk == RiskLevel::High {
                return (steps, Some(index));
            }
        }
        (steps, None)
    }

    async fn run_step(&self, fix: &Fix, index: usize, command: &str) -> StepOutcome {
        let step = fix.step_label(index);
        match self.shell.run(command, self.step_timeout).await {
            Ok(output) if output.success() => StepOutcome {
                index,
                step,
                command: command.to_string(),
                success: true,
                output: Some(crate::shell::truncate_chars(&output.combined(), MAX_STEP_OUTPUT)),
                error: None,
                duration_ms: output.duration_ms,
            },
            Ok(output) => {
                let detail = output.combined();
                let error = match output.exit_code {
                    Some(code) if detail.is_empty() => format!("exit code {}", code),
                    Some(code) => format!("exit code {}: {}", code, detail),
                    None if detail.is_empty() => "terminated by signal".to_string(),
                    None => detail,
                };
                StepOutcome {
                    index,
                    step,
                    command: command.to_string(),
                    success: false,
                    output: None,
                    error: Some(crate::shell::truncate_chars(&error, MAX_STEP_OUTPUT)),
                    duration_ms: output.duration_ms,
                }
            }
            Err(e) => StepOutcome {
                index,
                step,
                command: command.to_string(),
                success: false,
                output: None,
                error: Some(e.to_string()),
                duration_ms: 0,
            },
        }
    }

    fn fail(&self, fix_id: &str, error: FixError) -> FixError {
        warn!("Fix {} not executed: {}", fix_id, error);
        self.transition(fix_id, ExecutionState::Error);
        error
    }

    /// Hand off to the platform restore tool. Only offered for medium/high risk.
    pub async fn rollback(&self, record: &FixExecutionRecord) -> Result<(), FixError> {
        if !record.can_rollback {
            return Err(FixError::RollbackUnavailable(
                "rollback is only offered for medium and high risk fixes".to_string(),
            ));
        }
        self.restore_system().await?;
        self.transition(&record.fix_id, ExecutionState::RolledBack);
        Ok(())
    }

    /// Launch system restore without a record (operator-initiated)
    pub async fn restore_system(&self) -> Result<(), FixError> {
        self.platform.launch_system_restore().await.map_err(|e| match e {
            PlatformError::Unsupported(what) => FixError::RollbackUnavailable(format!(
                "{} is not supported on this platform",
                what
            )),
            other => FixError::Platform(other),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingSink;
    use crate::platform::FakePlatform;
    use crate::safety::DestructiveKind;
    use crate::shell::{CommandOutput, FakeShell, ShellError};

    fn fix(risk: RiskLevel, commands: &[&str]) -> Fix {
        Fix {
            id: "fix-1".to_string(),
            title: "Repair network stack".to_string(),
            description: "Resets DNS cache and adapters".to_string(),
            risk_level: Some(risk),
            commands: commands.iter().map(|c| c.to_string()).collect(),
            ..Default::default()
        }
    }

    fn executor(shell: Arc<FakeShell>, platform: Arc<FakePlatform>) -> FixExecutor {
        FixExecutor::new(shell, platform, ExecutionLock::new())
    }

    #[tokio::test]
    async fn test_high_risk_first_failure_aborts() {
        let shell = Arc::new(FakeShell::new().fail_on("first"));
        let exec = executor(shell.clone(), Arc::new(FakePlatform::new()));

        let record = exec
            .execute(&fix(RiskLevel::High, &["first", "second", "third"]))
            .await
            .unwrap();

        assert!(!record.success);
        assert_eq!(record.steps.len(), 1);
        assert_eq!(record.aborted_at, Some(0));
        assert_eq!(shell.calls(), vec!["first".to_string()]);
        assert!(record.can_rollback);
        assert!(record.error.unwrap().contains("step 1"));
    }

    #[tokio::test]
    async fn test_low_risk_continues_past_failure() {
        let shell = Arc::new(FakeShell::new().fail_on("middle"));
        let exec = executor(shell.clone(), Arc::new(FakePlatform::new()));

        let record = exec
            .execute(&fix(RiskLevel::Low, &["one", "middle", "three"]))
            .await
            .unwrap();

        assert!(record.success);
        assert_eq!(shell.calls().len(), 3);
        let outcomes: Vec<bool> = record.steps.iter().map(|s| s.success).collect();
        assert_eq!(outcomes, vec![true, false, true]);
        assert_eq!((record.succeeded, record.failed), (2, 1));
        assert!(record.steps[1].error.as_deref().unwrap().contains("exit code 1"));
        assert!(!record.can_rollback);
        assert_eq!(record.checkpoint, CheckpointStatus::Skipped);
    }

    #[tokio::test]
    async fn test_medium_risk_all_failed_is_failure() {
        let shell = Arc::new(FakeShell::new().error_on(
            "slow",
            ShellError::Timeout {
                command: "slow".to_string(),
                secs: 300,
            },
        ));
        let exec = executor(shell, Arc::new(FakePlatform::new()));
        let record = exec.execute(&fix(RiskLevel::Medium, &["slow"])).await.unwrap();
        assert!(!record.success);
        assert_eq!(record.error.as_deref(), Some("every step failed"));
        assert!(record.steps[0].error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_deny_list_match_anywhere_rejects_before_execution() {
        let shell = Arc::new(FakeShell::new());
        let exec = executor(shell.clone(), Arc::new(FakePlatform::new()));

        let result = exec
            .execute(&fix(RiskLevel::Low, &["ipconfig /flushdns", "format C:", "bcdedit /set x"]))
            .await;

        match result {
            Err(FixError::SafetyRejection(violations)) => {
                assert_eq!(violations.len(), 2);
                assert_eq!(violations[0].kind, DestructiveKind::DriveFormat);
                assert_eq!(violations[0].index, 1);
            }
            other => panic!("expected safety rejection, got {:?}", other),
        }
        assert!(shell.calls().is_empty());
        assert!(!exec.lock().is_busy());
    }

    #[tokio::test]
    async fn test_second_execution_is_busy() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let shell = Arc::new(FakeShell::new().with_gate(gate.clone()));
        let exec = Arc::new(executor(shell.clone(), Arc::new(FakePlatform::new())));

        let first = {
            let exec = exec.clone();
            tokio::spawn(async move { exec.execute(&fix(RiskLevel::Low, &["slow step"])).await })
        };
        while shell.calls().is_empty() {
            tokio::task::yield_now().await;
        }

        let second = exec.execute(&fix(RiskLevel::Low, &["other"])).await;
        assert_eq!(second, Err(FixError::Busy));

        gate.notify_one();
        let record = first.await.unwrap().unwrap();
        assert!(record.success);
        assert_eq!(shell.calls(), vec!["slow step".to_string()]);
        assert!(!exec.lock().is_busy());
    }

    #[tokio::test]
    async fn test_admin_required() {
        let shell = Arc::new(FakeShell::new());
        let exec = executor(shell.clone(), Arc::new(FakePlatform::new().unelevated()));

        let result = exec.execute(&fix(RiskLevel::Low, &["net stop spooler"])).await;
        assert!(matches!(result, Err(FixError::AdminRequired(_))));
        assert!(shell.calls().is_empty());

        let mut user_level = fix(RiskLevel::Low, &["ipconfig /flushdns"]);
        user_level.requires_admin = false;
        assert!(exec.execute(&user_level).await.unwrap().success);
    }

    #[tokio::test]
    async fn test_checkpoint_failure_proceeds() {
        let shell = Arc::new(FakeShell::new());
        let platform = Arc::new(FakePlatform::new().failing_checkpoints());
        let exec = executor(shell.clone(), platform.clone());

        let record = exec.execute(&fix(RiskLevel::High, &["a", "b"])).await.unwrap();
        assert!(record.success);
        assert_eq!(record.checkpoint, CheckpointStatus::Failed);
        assert_eq!(platform.checkpoints().len(), 1);
        assert_eq!(shell.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_validation() {
        let exec = executor(Arc::new(FakeShell::new()), Arc::new(FakePlatform::new()));

        let mut no_commands = fix(RiskLevel::Low, &[]);
        assert!(matches!(exec.execute(&no_commands).await, Err(FixError::Validation(_))));
        no_commands.commands = vec!["x".to_string()];
        no_commands.risk_level = Some(RiskLevel::Unrecognized);
        assert!(matches!(exec.execute(&no_commands).await, Err(FixError::Validation(_))));
        no_commands.risk_level = None;
        assert!(matches!(exec.execute(&no_commands).await, Err(FixError::Validation(_))));

        let mut untitled = fix(RiskLevel::Low, &["x"]);
        untitled.title.clear();
        let record = exec.execute_or_report(&untitled).await;
        assert!(!record.success);
        assert!(record.error.unwrap().contains("missing title"));
    }

    #[tokio::test]
    async fn test_events_trace_state_machine() {
        let sink = Arc::new(RecordingSink::new());
        let exec = executor(
            Arc::new(FakeShell::new().respond("echo", CommandOutput::ok("hi"))),
            Arc::new(FakePlatform::new()),
        )
        .with_events(sink.clone());

        let record = exec.execute(&fix(RiskLevel::Medium, &["echo hi"])).await.unwrap();
        assert_eq!(record.steps[0].output.as_deref(), Some("hi"));

        let states: Vec<String> = sink
            .events()
            .into_iter()
            .filter_map(|e| match e {
                MedicEvent::FixState { state, .. } => Some(state),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                "validating",
                "safety_checking",
                "checkpointing",
                "executing",
                "verifying",
                "complete"
            ]
        );
        assert!(matches!(
            sink.events().last(),
            Some(MedicEvent::FixFinished { success: true, succeeded: 1, failed: 0, .. })
        ));
    }

    #[tokio::test]
    async fn test_rollback_only_for_medium_and_high() {
        let platform = Arc::new(FakePlatform::new());
        let exec = executor(Arc::new(FakeShell::new()), platform.clone());

        let low = exec.execute(&fix(RiskLevel::Low, &["a"])).await.unwrap();
        assert!(matches!(
            exec.rollback(&low).await,
            Err(FixError::RollbackUnavailable(_))
        ));

        let high = exec.execute(&fix(RiskLevel::High, &["a"])).await.unwrap();
        exec.rollback(&high).await.unwrap();
        assert_eq!(platform.restore_count(), 1);
    }
}
