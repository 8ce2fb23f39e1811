//! The re-evaluation contract (§4.6): reacts to risk-changed, sod-detected,
//! sla-breach, fraud-alert, user-terminated and role-revoked events by
//! re-running the Policy Engine and diffing the result against the live
//! workflow's remaining steps.

use model::{
    ActorType, ApproverType, AuditRecord, Decision, ReEvaluationAction, StepId, StepStatus, Workflow, WorkflowContext, WorkflowEvent,
    WorkflowEventType, WorkflowStatus, WorkflowStep,
};
use policy::PolicyEngine;
use resolver::ApproverResolver;

fn is_eligible(event_type: WorkflowEventType) -> bool {
    matches!(
        event_type,
        WorkflowEventType::RiskChanged
            | WorkflowEventType::SodDetected
            | WorkflowEventType::SlaBreach
            | WorkflowEventType::FraudAlert
            | WorkflowEventType::UserTerminated
            | WorkflowEventType::RoleRevoked
    )
}

/// Applies any `risk_score`/`sod_conflicts`/`critical_sod_conflicts` fields
/// present in the event payload onto a cloned context, leaving the original
/// workflow's context untouched until [`apply_action`] commits a change.
fn patched_context(context: &WorkflowContext, event: &WorkflowEvent) -> WorkflowContext {
    let mut patched = context.clone();
    if let Some(score) = event.payload.get("risk_score").and_then(|v| v.as_u64()) {
        patched.risk_score = score.min(100) as u8;
    }
    if let Some(conflicts) = event.payload.get("sod_conflicts").and_then(|v| v.as_array()) {
        patched.sod_conflicts = conflicts.iter().filter_map(|v| v.as_str().map(String::from)).collect();
    }
    if let Some(conflicts) = event.payload.get("critical_sod_conflicts").and_then(|v| v.as_array()) {
        patched.critical_sod_conflicts = conflicts.iter().filter_map(|v| v.as_str().map(String::from)).collect();
    }
    patched
}

fn remaining_step_indices(workflow: &Workflow) -> Vec<usize> {
    workflow.steps.iter().enumerate().filter(|(_, s)| matches!(s.status, StepStatus::Pending | StepStatus::Active)).map(|(i, _)| i).collect()
}

/// Computes the action the re-evaluation engine would take, without
/// mutating `workflow`. The caller applies it via [`apply_action`].
pub async fn re_evaluate(
    workflow: &Workflow,
    event: &WorkflowEvent,
    engine: &PolicyEngine,
    resolver: &ApproverResolver,
    policy_set_id: Option<&str>,
) -> ReEvaluationAction {
    if workflow.status.is_terminal() || !is_eligible(event.event_type) {
        return ReEvaluationAction::NoChange;
    }

    match event.event_type {
        WorkflowEventType::FraudAlert => return ReEvaluationAction::Pause,
        WorkflowEventType::UserTerminated | WorkflowEventType::RoleRevoked => return ReEvaluationAction::AutoReject,
        WorkflowEventType::SlaBreach => {
            if let Some(active) = workflow.active_step() {
                return ReEvaluationAction::Escalate { step_id: active.id };
            }
            return ReEvaluationAction::NotifyOnly;
        },
        _ => {},
    }

    let patched = patched_context(&workflow.context, event);
    let evaluation = match engine.evaluate(&patched, policy_set_id) {
        Ok(e) => e,
        Err(_) => return ReEvaluationAction::NotifyOnly,
    };

    if evaluation.actions.iter().any(|a| matches!(a, model::PolicyAction::AutoReject { .. })) {
        return ReEvaluationAction::AutoReject;
    }

    let remaining_indices = remaining_step_indices(workflow);
    let remaining_types: Vec<ApproverType> = remaining_indices.iter().map(|&i| workflow.steps[i].approver_type).collect();

    let new_assembly = match assembler::assemble_from_evaluation(resolver, patched, evaluation, workflow.policy_id.clone()).await {
        Ok(result) => result,
        Err(_) => return ReEvaluationAction::NotifyOnly,
    };

    if new_assembly.workflow.steps.is_empty() {
        return if new_assembly.workflow.status == model::WorkflowStatus::AutoApproved {
            ReEvaluationAction::AutoApproveRemaining
        } else {
            ReEvaluationAction::AutoReject
        };
    }

    let new_types: Vec<ApproverType> = new_assembly.workflow.steps.iter().map(|s| s.approver_type).collect();

    if new_types == remaining_types {
        return ReEvaluationAction::NoChange;
    }

    if new_types.len() > remaining_types.len() && remaining_types.iter().all(|t| new_types.contains(t)) {
        let added = new_types.iter().find(|t| !remaining_types.contains(t)).copied().unwrap();
        let insert_after = remaining_indices.last().map(|&i| workflow.steps[i].id);
        return ReEvaluationAction::AddStep { approver_type: added, insert_after };
    }

    if new_types.len() < remaining_types.len() && new_types.iter().all(|t| remaining_types.contains(t)) {
        let removed_type = remaining_types.iter().find(|t| !new_types.contains(t)).copied().unwrap();
        let removed_index = remaining_indices.into_iter().find(|&i| workflow.steps[i].approver_type == removed_type).unwrap();
        return ReEvaluationAction::RemoveStep { step_id: workflow.steps[removed_index].id };
    }

    ReEvaluationAction::Reorder
}

/// Applies a previously-computed [`ReEvaluationAction`] to `workflow`,
/// preserving the audit trail. Never touches an already-terminal step; an
/// ACTIVE step removed by `RemoveStep` transitions to SKIPPED rather than
/// being deleted outright, keeping the step numbering stable for audit.
pub fn apply_action(workflow: &mut Workflow, action: &ReEvaluationAction, now: chrono::DateTime<chrono::Utc>) {
    match action {
        ReEvaluationAction::NoChange | ReEvaluationAction::NotifyOnly => {
            workflow.push_audit(AuditRecord::new("system", ActorType::System, "reevaluation.no_change", "re-evaluation produced no structural change"));
        },
        ReEvaluationAction::Pause => {
            workflow.status = WorkflowStatus::WaitingApproval;
            workflow.push_audit(AuditRecord::new("system", ActorType::System, "reevaluation.paused", "workflow paused pending manual review"));
        },
        ReEvaluationAction::AutoReject => {
            for step in workflow.steps.iter_mut().filter(|s| !s.is_terminal()) {
                step.status = StepStatus::Cancelled;
            }
            workflow.status = WorkflowStatus::AutoRejected;
            workflow.final_decision = Some(Decision::Rejected);
            workflow.completed_at = Some(now);
            workflow.push_audit(AuditRecord::new("system", ActorType::Policy, "reevaluation.auto_rejected", "re-evaluation auto-rejected the workflow"));
        },
        ReEvaluationAction::AutoApproveRemaining => {
            for step in workflow.steps.iter_mut().filter(|s| !s.is_terminal()) {
                step.status = StepStatus::Skipped;
            }
            workflow.status = WorkflowStatus::Approved;
            workflow.final_decision = Some(Decision::Approved);
            workflow.push_audit(AuditRecord::new(
                "system",
                ActorType::Policy,
                "reevaluation.auto_approved_remaining",
                "re-evaluation auto-approved all remaining steps",
            ));
        },
        ReEvaluationAction::Escalate { step_id } => {
            workflow.push_audit(
                AuditRecord::new("system", ActorType::Policy, "reevaluation.escalation_requested", "re-evaluation flagged a step for escalation")
                    .with_detail("step_id", serde_json::json!(step_id.to_string())),
            );
        },
        ReEvaluationAction::RemoveStep { step_id } => remove_step(workflow, *step_id, now),
        ReEvaluationAction::AddStep { approver_type, insert_after } => add_step(workflow, *approver_type, *insert_after, now),
        ReEvaluationAction::Reorder => {
            workflow.push_audit(AuditRecord::new(
                "system",
                ActorType::Policy,
                "reevaluation.reorder_requested",
                "re-evaluation detected a remaining-step reorder; manual review recommended",
            ));
        },
    }
}

fn remove_step(workflow: &mut Workflow, step_id: StepId, now: chrono::DateTime<chrono::Utc>) {
    let was_active = workflow.step(step_id).map(|s| s.status == StepStatus::Active).unwrap_or(false);
    if let Some(step) = workflow.step_mut(step_id) {
        if step.is_terminal() {
            return;
        }
        step.status = StepStatus::Skipped;
    }
    workflow.push_audit(
        AuditRecord::new("system", ActorType::Policy, "reevaluation.step_removed", "re-evaluation removed a no-longer-required step")
            .with_detail("step_id", serde_json::json!(step_id.to_string())),
    );

    if was_active {
        if let Some(next) = workflow.steps.iter_mut().skip(workflow.current_step + 1).find(|s| s.status == StepStatus::Pending) {
            next.status = StepStatus::Active;
            next.activated_at = Some(now);
            next.due_at = Some(now + chrono::Duration::hours(next.sla_hours as i64));
            workflow.current_step += 1;
        } else if workflow.steps.iter().all(|s| s.is_terminal()) {
            workflow.status = WorkflowStatus::Approved;
            workflow.final_decision = Some(Decision::Approved);
        }
    }
}

fn add_step(workflow: &mut Workflow, approver_type: ApproverType, insert_after: Option<StepId>, now: chrono::DateTime<chrono::Utc>) {
    let insert_index = match insert_after {
        Some(id) => workflow.steps.iter().position(|s| s.id == id).map(|i| i + 1).unwrap_or(workflow.steps.len()),
        None => workflow.steps.len(),
    };

    let new_step = WorkflowStep {
        id: StepId::new(),
        step_number: 0, // renumbered below
        name: format!("{approver_type} approval"),
        description: "added by re-evaluation".into(),
        approver_type,
        resolved_approver: None,
        sla_hours: assembler::default_sla_hours(workflow.context.risk_level()),
        reminder_at_hours: vec![12, 6, 2],
        escalation_at_hours: None,
        activated_at: None,
        due_at: None,
        decided_at: None,
        status: StepStatus::Pending,
        decision: None,
        decision_comments: None,
        delegation_history: Vec::new(),
        escalation_history: Vec::new(),
        matched_rule_id: "reevaluation".into(),
        require_justification: false,
    };

    workflow.steps.insert(insert_index, new_step);
    for (i, step) in workflow.steps.iter_mut().enumerate() {
        step.step_number = (i + 1) as u32;
    }

    workflow.push_audit(
        AuditRecord::new("system", ActorType::Policy, "reevaluation.step_added", format!("re-evaluation added a {approver_type} approval step"))
            .with_detail("inserted_at_index", serde_json::json!(insert_index)),
    );
    let _ = now;
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use model::{Combinator, Identity, PolicyAction, PolicyCondition, PolicyRule, PolicySet, ProcessType, RequestId, WorkflowId, WorkflowStatus};
    use resolver::{LineManagerResolver, StaticResolver};

    use super::*;

    fn context(risk_score: u8) -> WorkflowContext {
        WorkflowContext {
            request_id: RequestId::new(),
            process_type: ProcessType::AccessRequest,
            requester: Identity::new("u1", "Alice", "alice@example.com"),
            target_user: Identity::new("u1", "Alice", "alice@example.com"),
            target_manager: Some(Identity::new("m1", "Bob", "bob@example.com")),
            system_id: "SAP01".into(),
            system_name: "SAP Finance".into(),
            role_id: "FI_AP_CLERK".into(),
            role_name: "AP Clerk".into(),
            risk_score,
            sod_conflicts: vec![],
            critical_sod_conflicts: vec![],
            sensitive_data_tags: vec![],
            privileged_role: false,
            attributes: HashMap::new(),
        }
    }

    fn resolver_with_defaults() -> ApproverResolver {
        let resolver = ApproverResolver::default();
        resolver.register(ApproverType::LineManager, Arc::new(LineManagerResolver), vec![ApproverType::GovernanceDesk]);
        resolver.register(ApproverType::SecurityOfficer, Arc::new(StaticResolver::new(Identity::new("so1", "Sec", "sec@example.com"))), vec![]);
        resolver.register(ApproverType::GovernanceDesk, Arc::new(StaticResolver::new(Identity::new("gd1", "Desk", "desk@example.com"))), vec![]);
        resolver
    }

    fn workflow_pending_on_manager() -> Workflow {
        Workflow {
            id: WorkflowId::new(),
            process_type: ProcessType::AccessRequest,
            context: context(10),
            steps: vec![WorkflowStep {
                id: StepId::new(),
                step_number: 1,
                name: "line manager approval".into(),
                description: String::new(),
                approver_type: ApproverType::LineManager,
                resolved_approver: Some(Identity::new("m1", "Bob", "bob@example.com")),
                sla_hours: 48,
                reminder_at_hours: vec![12, 6, 2],
                escalation_at_hours: None,
                activated_at: Some(chrono::Utc::now()),
                due_at: Some(chrono::Utc::now() + chrono::Duration::hours(48)),
                decided_at: None,
                status: StepStatus::Active,
                decision: None,
                decision_comments: None,
                delegation_history: Vec::new(),
                escalation_history: Vec::new(),
                matched_rule_id: "manager-rule".into(),
                require_justification: false,
            }],
            current_step: 0,
            status: WorkflowStatus::InProgress,
            final_decision: None,
            created_at: chrono::Utc::now(),
            submitted_at: Some(chrono::Utc::now()),
            completed_at: None,
            policy_id: "p1".into(),
            matched_rule_ids: vec!["manager-rule".into()],
            assembly_explanation: String::new(),
            post_approval_tags: vec![],
            audit_log: vec![],
        }
    }

    #[tokio::test]
    async fn user_terminated_event_auto_rejects() {
        let workflow = workflow_pending_on_manager();
        let engine = PolicyEngine::new();
        let resolver = resolver_with_defaults();
        let event = WorkflowEvent::new(WorkflowEventType::UserTerminated, model::EventPriority::Critical, "hr-feed").for_workflow(workflow.id);
        let action = re_evaluate(&workflow, &event, &engine, &resolver, None).await;
        assert!(matches!(action, ReEvaluationAction::AutoReject));
    }

    #[tokio::test]
    async fn sla_breach_escalates_the_active_step() {
        let workflow = workflow_pending_on_manager();
        let engine = PolicyEngine::new();
        let resolver = resolver_with_defaults();
        let event = WorkflowEvent::new(WorkflowEventType::SlaBreach, model::EventPriority::High, "sla-scanner").for_workflow(workflow.id);
        let action = re_evaluate(&workflow, &event, &engine, &resolver, None).await;
        assert!(matches!(action, ReEvaluationAction::Escalate { .. }));
    }

    #[tokio::test]
    async fn risk_increase_adding_a_required_approver_yields_add_step() {
        let set = PolicySet {
            id: "p1".into(),
            version: 1,
            process_type: ProcessType::AccessRequest,
            strict_mode: true,
            rules: vec![
                PolicyRule {
                    id: "manager-rule".into(),
                    name: "manager".into(),
                    layer: "base".into(),
                    priority: 1,
                    active: true,
                    combinator: Combinator::And,
                    conditions: vec![],
                    actions: vec![PolicyAction::AddApprover { approver_type: ApproverType::LineManager, sla_override_hours: None, reason: "always".into() }],
                    valid_from: None,
                    valid_until: None,
                },
                PolicyRule {
                    id: "high-risk-rule".into(),
                    name: "high risk".into(),
                    layer: "base".into(),
                    priority: 2,
                    active: true,
                    combinator: Combinator::And,
                    conditions: vec![PolicyCondition { path: "context.risk_score".into(), op: model::ConditionOperator::Ge, value: serde_json::json!(50) }],
                    actions: vec![PolicyAction::AddApprover { approver_type: ApproverType::SecurityOfficer, sla_override_hours: None, reason: "high risk".into() }],
                    valid_from: None,
                    valid_until: None,
                },
            ],
        };
        let engine = PolicyEngine::new();
        engine.activate(set);
        let resolver = resolver_with_defaults();
        let workflow = workflow_pending_on_manager();

        let event = WorkflowEvent::new(WorkflowEventType::RiskChanged, model::EventPriority::High, "risk-engine")
            .for_workflow(workflow.id)
            .with_payload("risk_score", serde_json::json!(90));
        let action = re_evaluate(&workflow, &event, &engine, &resolver, Some("p1")).await;
        assert!(matches!(action, ReEvaluationAction::AddStep { approver_type: ApproverType::SecurityOfficer, .. }));
    }
}
