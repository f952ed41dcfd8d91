//! Conversation Scenario Tests
//!
//! End-to-end flows through the orchestrator, synthesis and fix executor
//! using scripted fakes. No network, no real shell.

use medic_common::collector::{CollectorRegistry, StaticCollector};
use medic_common::evidence::EvidenceSnapshot;
use medic_common::fix_executor::{ExecutionLock, FixExecutor};
use medic_common::platform::FakePlatform;
use medic_common::reasoning::{ContentBlock, ReasoningResponse, Role, ScriptedReasoningService};
use medic_common::shell::FakeShell;
use medic_common::synthesis::synthesize;
use medic_common::tools::ToolDispatcher;
use medic_common::{Orchestrator, ProblemType, RiskLevel, SessionError, SynthesisSource};
use serde_json::json;
use std::sync::Arc;

fn registry() -> CollectorRegistry {
    CollectorRegistry::new()
        .with(Arc::new(StaticCollector::new("disk").respond(
            "health",
            json!({
                "findings": [
                    "sda: SMART overall-health self-assessment test result: PASSED",
                    "kernel: sda: bad block at sector 91823 (logged 14 months ago)"
                ],
                "recommendations": [],
                "metrics": {
                    "disks": [{"name": "sda", "isHealthy": true, "badBlockEvents": 1}]
                }
            }),
        )))
        .with(Arc::new(StaticCollector::new("resources").respond(
            "usage",
            json!({"findings": ["CPU 35%"], "metrics": {"cpuSamples": [35.0, 41.0, 38.0]}}),
        )))
}

fn orchestrator(service: Arc<ScriptedReasoningService>) -> Orchestrator {
    Orchestrator::new(
        service,
        ToolDispatcher::new(registry(), Arc::new(FakeShell::new())),
    )
}

// ============================================================================
// Healthy SMART data beats stale log noise
// ============================================================================

#[tokio::test]
async fn test_healthy_smart_yields_no_issues() {
    let final_text = r#"```json
{
  "summary": "The disk reports healthy SMART status. One old bad-block entry was found in the logs.",
  "issues": [
    {"title": "Disk failing", "description": "Bad block entry in kernel log",
     "evidence": "bad block at sector 91823", "severity": "critical", "priority": "immediate",
     "confidence": 0.85, "actionable": true, "category": "disk_failure"}
  ],
  "fixes": []
}
```"#;
    let service = Arc::new(ScriptedReasoningService::replies(vec![
        ReasoningResponse::tool_use(vec![("toolu_1", "check_disk_health", json!({}))]),
        ReasoningResponse::text(final_text),
    ]));
    let mut orch = orchestrator(service.clone());

    let outcome = orch.chat("My computer makes clicking noises").await.unwrap();
    assert!(outcome.proposed_fix.is_none());
    assert_eq!(service.call_count(), 2);

    let evidence = EvidenceSnapshot::from_conversation(orch.conversation());
    assert_eq!(evidence.disks.len(), 1);

    let today = chrono::Utc::now().date_naive();
    let analysis = synthesize(&outcome.final_text, &evidence, today);
    assert!(analysis.issues.is_empty(), "{:?}", analysis.issues);
    assert!(analysis.summary.contains("healthy"));
}

#[tokio::test]
async fn test_playbook_diagnose_structured() {
    let service = Arc::new(ScriptedReasoningService::replies(vec![
        ReasoningResponse::tool_use(vec![
            ("toolu_1", "check_disk_health", json!({})),
            ("toolu_2", "check_resources", json!({})),
        ]),
        ReasoningResponse::text(
            r#"{"summary": "No hardware faults.", "issues": [
                {"title": "CPU overloaded", "severity": "warning", "priority": "high",
                 "confidence": 0.9, "actionable": true, "category": "high_cpu"},
                {"title": "Too many startup programs", "severity": "warning", "priority": "medium",
                 "confidence": 0.8, "actionable": true, "category": "other"}
            ]}"#,
        ),
    ]));
    let mut orch = orchestrator(service.clone());

    let report = orch.diagnose(ProblemType::Slow).await.unwrap();
    assert_eq!(report.source, SynthesisSource::Structured);
    let titles: Vec<&str> = report.analysis.issues.iter().map(|i| i.title.as_str()).collect();
    assert_eq!(titles, vec!["Too many startup programs"]);

    let first_request = &service.requests()[0];
    match &first_request.turns[0].content[0] {
        ContentBlock::Text { text } => assert!(text.contains("check_resources")),
        other => panic!("unexpected first block {:?}", other),
    }
}

#[tokio::test]
async fn test_playbook_diagnose_empty_contract() {
    let service = Arc::new(ScriptedReasoningService::replies(vec![ReasoningResponse::text(
        "I could not find anything wrong.",
    )]));
    let mut orch = orchestrator(service);

    let report = orch.diagnose(ProblemType::Boot).await.unwrap();
    assert_eq!(report.source, SynthesisSource::Empty);
    assert!(report.analysis.issues.is_empty());
    assert!(report.analysis.fixes.is_empty());
    assert_eq!(report.analysis.summary, "I could not find anything wrong.");
}

// ============================================================================
// Loop control
// ============================================================================

#[tokio::test]
async fn test_endless_tool_use_hits_ceiling() {
    let service = Arc::new(ScriptedReasoningService::repeating(ReasoningResponse::tool_use(
        vec![("toolu_x", "check_resources", json!({}))],
    )));
    let mut orch = orchestrator(service.clone()).with_max_iterations(4);

    let err = orch.chat("why so slow").await.unwrap_err();
    assert!(matches!(err, SessionError::LoopExceeded { limit: 4 }));
    assert_eq!(service.call_count(), 4);
}

#[tokio::test]
async fn test_refused_command_goes_back_to_model() {
    let shell = Arc::new(FakeShell::new());
    let service = Arc::new(ScriptedReasoningService::replies(vec![
        ReasoningResponse::tool_use(vec![(
            "toolu_1",
            "run_diagnostic_command",
            json!({"command": "Restart-Service spooler"}),
        )]),
        ReasoningResponse::text("I cannot restart services myself."),
    ]));
    let mut orch = Orchestrator::new(service.clone(), ToolDispatcher::new(registry(), shell.clone()));

    let outcome = orch.chat("printer stuck").await.unwrap();
    assert_eq!(outcome.final_text, "I cannot restart services myself.");
    assert!(shell.calls().is_empty());

    let second = &service.requests()[1];
    let result = second.turns.last().unwrap();
    assert_eq!(result.role, Role::ToolResult);
    assert!(matches!(
        &result.content[0],
        ContentBlock::ToolResult { is_error: true, content, .. } if content["error"].as_str().unwrap().contains("refused")
    ));
}

// ============================================================================
// Proposal -> approval -> execution -> feedback
// ============================================================================

#[tokio::test]
async fn test_proposed_fix_round_trip() {
    let service = Arc::new(ScriptedReasoningService::replies(vec![
        ReasoningResponse::tool_use(vec![(
            "toolu_1",
            "propose_fix",
            json!({"title": "Broken proposal"}),
        )]),
        ReasoningResponse::tool_use(vec![(
            "toolu_2",
            "propose_fix",
            json!({
                "id": "fix-dns",
                "title": "Flush DNS cache",
                "description": "Clears stale DNS entries",
                "riskLevel": "low",
                "requiresAdmin": false,
                "automatable": true,
                "steps": ["Flush the resolver cache"],
                "commands": ["resolvectl flush-caches"]
            }),
        )]),
        ReasoningResponse::text("I proposed a fix for the DNS problem."),
        ReasoningResponse::text("Great, the DNS cache was flushed."),
    ]));
    let mut orch = orchestrator(service.clone());

    let outcome = orch.chat("websites do not load").await.unwrap();
    let fix = outcome.proposed_fix.expect("fix proposed");
    assert_eq!(fix.id, "fix-dns");
    assert_eq!(fix.risk_level, Some(RiskLevel::Low));

    let shell = Arc::new(FakeShell::new());
    let executor = FixExecutor::new(shell.clone(), Arc::new(FakePlatform::new()), ExecutionLock::new());
    let record = executor.execute(&fix).await.unwrap();
    assert!(record.success);
    assert_eq!(shell.calls(), vec!["resolvectl flush-caches".to_string()]);

    orch.record_fix_outcome(&record);
    let follow_up = orch.chat("did it work?").await.unwrap();
    assert_eq!(follow_up.final_text, "Great, the DNS cache was flushed.");
    assert!(follow_up.proposed_fix.is_none());

    let last_request = service.requests().pop().unwrap();
    let fed_back = last_request.turns.iter().any(|turn| {
        turn.role == Role::User
            && turn.content.iter().any(|b| {
                matches!(b, ContentBlock::Text { text } if text.contains("Flush DNS cache"))
            })
    });
    assert!(fed_back);
}
