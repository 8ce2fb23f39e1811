//  LIB.rs
//    by Bas Kloosterman
//
//  Description:
//!   Implements the Workflow Executor: the deterministic state machine that
//!   advances a [`Workflow`] from submission through decisions to
//!   provisioning (§4.5).
//

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use model::{
    ActorType, AuditRecord, Decision, DelegationRecord, EscalationHistoryEntry, Identity, StepId, StepStatus, Workflow, WorkflowStatus, WorkflowStep,
};

pub mod event;

pub use event::{ExecutionEvent, ExecutionEventKind, EventSequencer};

#[derive(Debug, thiserror::Error)]
pub enum InvalidStateError {
    #[error("workflow {workflow_id} is in state {actual:?}, expected one of {expected:?}")]
    WorkflowState { workflow_id: model::WorkflowId, actual: WorkflowStatus, expected: Vec<WorkflowStatus> },
    #[error("step {step_id} is in state {actual:?}, expected {expected:?}")]
    StepState { step_id: StepId, actual: StepStatus, expected: StepStatus },
    #[error("step {0} does not exist on this workflow")]
    UnknownStep(StepId),
    #[error("provision requires final_decision == APPROVED, found {0:?}")]
    NotApproved(Option<Decision>),
    #[error("workflow {0} is already terminal and cannot be cancelled")]
    AlreadyTerminal(model::WorkflowId),
    #[error("step {0} requires a justification comment before a decision can be recorded")]
    JustificationRequired(StepId),
}

/// Invoked once a `provision` call outcome must be realized. Kept separate
/// from `on-step-complete`/`on-workflow-complete` because it alone is
/// expected to be long-running (§5): callers must not hold a per-workflow
/// lock across this call.
#[async_trait]
pub trait ProvisionCallback: Send + Sync {
    async fn provision(&self, workflow: &Workflow) -> bool;
}

/// Synchronous hooks invoked as part of the atomic decision-recording step
/// (§4.5 contract (d), (e)).
pub struct ExecutorCallbacks<'a> {
    pub on_step_complete: Option<&'a (dyn Fn(&Workflow, &WorkflowStep) + Send + Sync)>,
    pub on_workflow_complete: Option<&'a (dyn Fn(&Workflow) + Send + Sync)>,
}

impl<'a> Default for ExecutorCallbacks<'a> {
    fn default() -> Self { Self { on_step_complete: None, on_workflow_complete: None } }
}

fn require_workflow_status(workflow: &Workflow, allowed: &[WorkflowStatus]) -> Result<(), InvalidStateError> {
    if allowed.contains(&workflow.status) {
        Ok(())
    } else {
        Err(InvalidStateError::WorkflowState { workflow_id: workflow.id, actual: workflow.status, expected: allowed.to_vec() })
    }
}

fn activate_step(step: &mut WorkflowStep, now: DateTime<Utc>) {
    step.status = StepStatus::Active;
    step.activated_at = Some(now);
    step.due_at = Some(now + Duration::hours(step.sla_hours as i64));
}

/// `submit`: DRAFT → PENDING → IN_PROGRESS (with the first step activated),
/// folded into one call since no caller-visible state exists at bare PENDING
/// with zero steps (that shape only occurs for auto-decided workflows, which
/// never pass through `submit`).
pub fn submit(workflow: &mut Workflow, sequencer: &EventSequencer, now: DateTime<Utc>) -> Result<Vec<ExecutionEvent>, InvalidStateError> {
    require_workflow_status(workflow, &[WorkflowStatus::Draft])?;
    if workflow.steps.is_empty() {
        return Err(InvalidStateError::WorkflowState { workflow_id: workflow.id, actual: workflow.status, expected: vec![WorkflowStatus::Pending] });
    }

    workflow.status = WorkflowStatus::Pending;
    workflow.submitted_at = Some(now);
    let mut events = vec![sequencer.next(workflow.id, ExecutionEventKind::Submitted)];

    workflow.status = WorkflowStatus::InProgress;
    activate_step(&mut workflow.steps[0], now);
    events.push(sequencer.next(workflow.id, ExecutionEventKind::StepActivated { step_id: workflow.steps[0].id }));

    workflow.push_audit(AuditRecord::new("system", ActorType::System, "workflow.submitted", "workflow submitted and first step activated"));
    Ok(events)
}

/// `recordDecision`: atomically records a step decision and, on APPROVED,
/// advances the workflow. All five contractual effects either happen or
/// none do — preconditions are fully validated before any mutation.
pub fn record_decision(
    workflow: &mut Workflow,
    step_id: StepId,
    decision: Decision,
    by: &Identity,
    comments: Option<String>,
    sequencer: &EventSequencer,
    callbacks: &ExecutorCallbacks,
    now: DateTime<Utc>,
) -> Result<Vec<ExecutionEvent>, InvalidStateError> {
    require_workflow_status(workflow, &[WorkflowStatus::InProgress, WorkflowStatus::WaitingApproval])?;

    let step_index = workflow.steps.iter().position(|s| s.id == step_id).ok_or(InvalidStateError::UnknownStep(step_id))?;
    if workflow.steps[step_index].status != StepStatus::Active {
        return Err(InvalidStateError::StepState { step_id, actual: workflow.steps[step_index].status, expected: StepStatus::Active });
    }
    if workflow.steps[step_index].require_justification && comments.as_deref().map(str::trim).unwrap_or("").is_empty() {
        return Err(InvalidStateError::JustificationRequired(step_id));
    }

    let mut events = Vec::new();

    {
        let step = &mut workflow.steps[step_index];
        step.decision = Some(decision);
        step.decided_at = Some(now);
        step.decision_comments = comments;
        step.status = match decision {
            Decision::Approved => StepStatus::Approved,
            Decision::Rejected => StepStatus::Rejected,
        };
    }
    events.push(sequencer.next(workflow.id, ExecutionEventKind::DecisionRecorded { step_id, decision }));
    workflow.push_audit(
        AuditRecord::new(by.id.clone(), ActorType::User, "step.decision_recorded", format!("{decision:?} by {}", by.name))
            .with_detail("step_id", serde_json::json!(step_id.to_string())),
    );

    match decision {
        Decision::Rejected => {
            for step in workflow.steps.iter_mut().filter(|s| matches!(s.status, StepStatus::Pending | StepStatus::Active)) {
                step.status = StepStatus::Cancelled;
            }
            workflow.status = WorkflowStatus::Rejected;
            workflow.final_decision = Some(Decision::Rejected);
        },
        Decision::Approved => {
            workflow.current_step = step_index + 1;
            if let Some(next_step) = workflow.steps.get_mut(workflow.current_step) {
                activate_step(next_step, now);
                events.push(sequencer.next(workflow.id, ExecutionEventKind::StepActivated { step_id: next_step.id }));
            } else {
                workflow.status = WorkflowStatus::Approved;
                workflow.final_decision = Some(Decision::Approved);
            }
        },
    }

    if let Some(on_step_complete) = callbacks.on_step_complete {
        on_step_complete(workflow, &workflow.steps[step_index]);
    }
    if workflow.status.is_terminal() {
        if let Some(on_workflow_complete) = callbacks.on_workflow_complete {
            on_workflow_complete(workflow);
        }
    }

    Ok(events)
}

/// `delegate`: re-activates the same step under a new resolved approver,
/// resetting its SLA clock.
pub fn delegate(
    workflow: &mut Workflow,
    step_id: StepId,
    by: &Identity,
    to: Identity,
    reason: String,
    sequencer: &EventSequencer,
    now: DateTime<Utc>,
) -> Result<ExecutionEvent, InvalidStateError> {
    let step = workflow.step_mut(step_id).ok_or(InvalidStateError::UnknownStep(step_id))?;
    if step.status != StepStatus::Active {
        return Err(InvalidStateError::StepState { step_id, actual: step.status, expected: StepStatus::Active });
    }

    let from = step.resolved_approver.clone().unwrap_or_else(|| by.clone());
    step.delegation_history.push(DelegationRecord { from, to: to.clone(), reason: reason.clone(), when: now });
    step.resolved_approver = Some(to);
    step.status = StepStatus::Delegated;
    activate_step(step, now);

    workflow.push_audit(
        AuditRecord::new(by.id.clone(), ActorType::User, "step.delegated", format!("delegated by {}: {}", by.name, reason))
            .with_detail("step_id", serde_json::json!(step_id.to_string())),
    );
    Ok(sequencer.next(workflow.id, ExecutionEventKind::Delegated { step_id }))
}

/// `escalate`: re-activates the same step under the escalation target,
/// resetting its SLA clock, mirroring `delegate`'s shape.
pub fn escalate(
    workflow: &mut Workflow,
    step_id: StepId,
    by: &Identity,
    to: Identity,
    reason: String,
    sequencer: &EventSequencer,
    now: DateTime<Utc>,
) -> Result<ExecutionEvent, InvalidStateError> {
    let step = workflow.step_mut(step_id).ok_or(InvalidStateError::UnknownStep(step_id))?;
    if step.status != StepStatus::Active {
        return Err(InvalidStateError::StepState { step_id, actual: step.status, expected: StepStatus::Active });
    }

    let from = step.resolved_approver.clone();
    step.escalation_history.push(EscalationHistoryEntry {
        from: from.unwrap_or_else(|| by.clone()),
        to: to.clone(),
        reason: reason.clone(),
        when: now,
    });
    step.resolved_approver = Some(to);
    step.status = StepStatus::Escalated;
    activate_step(step, now);

    workflow.push_audit(
        AuditRecord::new(by.id.clone(), ActorType::User, "step.escalated", format!("escalated by {}: {}", by.name, reason))
            .with_detail("step_id", serde_json::json!(step_id.to_string())),
    );
    Ok(sequencer.next(workflow.id, ExecutionEventKind::Escalated { step_id }))
}

/// `cancel`: refused if the workflow is already terminal.
pub fn cancel(workflow: &mut Workflow, by: &Identity, reason: String, sequencer: &EventSequencer, now: DateTime<Utc>) -> Result<ExecutionEvent, InvalidStateError> {
    if workflow.status.is_terminal() {
        return Err(InvalidStateError::AlreadyTerminal(workflow.id));
    }

    for step in workflow.steps.iter_mut().filter(|s| !s.is_terminal()) {
        step.status = StepStatus::Cancelled;
    }
    workflow.status = WorkflowStatus::Cancelled;
    workflow.completed_at = Some(now);

    workflow.push_audit(AuditRecord::new(by.id.clone(), ActorType::User, "workflow.cancelled", format!("cancelled by {}: {}", by.name, reason)));
    Ok(sequencer.next(workflow.id, ExecutionEventKind::Cancelled))
}

/// `provision`: valid only once `final_decision == APPROVED`. The caller is
/// responsible for not holding any per-workflow lock across this call (§5):
/// this function itself performs the PROVISIONING transition, awaits the
/// callback, then resolves to COMPLETED or FAILED.
pub async fn provision(
    workflow: &mut Workflow,
    callback: &dyn ProvisionCallback,
    sequencer: &EventSequencer,
    now: DateTime<Utc>,
) -> Result<ExecutionEvent, InvalidStateError> {
    if workflow.final_decision != Some(Decision::Approved) {
        return Err(InvalidStateError::NotApproved(workflow.final_decision));
    }

    workflow.status = WorkflowStatus::Provisioning;
    let succeeded = callback.provision(workflow).await;

    workflow.status = if succeeded { WorkflowStatus::Completed } else { WorkflowStatus::Failed };
    workflow.completed_at = Some(now);

    workflow.push_audit(AuditRecord::new(
        "system",
        ActorType::System,
        "workflow.provisioned",
        if succeeded { "provisioning succeeded" } else { "provisioning failed" },
    ));
    Ok(sequencer.next(workflow.id, ExecutionEventKind::Provisioned { succeeded }))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use model::{ApproverType, ProcessType, RequestId, StepId as ModelStepId, WorkflowContext, WorkflowId};

    use super::*;

    struct AlwaysSucceeds;

    #[async_trait]
    impl ProvisionCallback for AlwaysSucceeds {
        async fn provision(&self, _workflow: &Workflow) -> bool { true }
    }

    fn step(name: &str) -> WorkflowStep {
        WorkflowStep {
            id: ModelStepId::new(),
            step_number: 1,
            name: name.into(),
            description: String::new(),
            approver_type: ApproverType::LineManager,
            resolved_approver: Some(Identity::new("m1", "Bob", "bob@example.com")),
            sla_hours: 48,
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
            matched_rule_id: "r".into(),
            require_justification: false,
        }
    }

    fn workflow_with_steps(steps: Vec<WorkflowStep>) -> Workflow {
        Workflow {
            id: WorkflowId::new(),
            process_type: ProcessType::AccessRequest,
            context: WorkflowContext {
                request_id: RequestId::new(),
                process_type: ProcessType::AccessRequest,
                requester: Identity::new("u1", "Alice", "alice@example.com"),
                target_user: Identity::new("u1", "Alice", "alice@example.com"),
                target_manager: None,
                system_id: "SAP01".into(),
                system_name: "SAP Finance".into(),
                role_id: "FI_AP_CLERK".into(),
                role_name: "AP Clerk".into(),
                risk_score: 10,
                sod_conflicts: vec![],
                critical_sod_conflicts: vec![],
                sensitive_data_tags: vec![],
                privileged_role: false,
                attributes: HashMap::new(),
            },
            steps,
            current_step: 0,
            status: WorkflowStatus::Draft,
            final_decision: None,
            created_at: Utc::now(),
            submitted_at: None,
            completed_at: None,
            policy_id: "p".into(),
            matched_rule_ids: vec![],
            assembly_explanation: String::new(),
            post_approval_tags: vec![],
            audit_log: vec![],
        }
    }

    #[test]
    fn submit_activates_first_step() {
        let mut workflow = workflow_with_steps(vec![step("one"), step("two")]);
        let sequencer = EventSequencer::new();
        submit(&mut workflow, &sequencer, Utc::now()).unwrap();
        assert_eq!(workflow.status, WorkflowStatus::InProgress);
        assert_eq!(workflow.steps[0].status, StepStatus::Active);
        assert_eq!(workflow.steps[1].status, StepStatus::Pending);
    }

    #[test]
    fn approval_advances_to_next_step_then_to_approved() {
        let mut workflow = workflow_with_steps(vec![step("one"), step("two")]);
        let sequencer = EventSequencer::new();
        submit(&mut workflow, &sequencer, Utc::now()).unwrap();

        let by = Identity::new("m1", "Bob", "bob@example.com");
        let first_id = workflow.steps[0].id;
        record_decision(&mut workflow, first_id, Decision::Approved, &by, None, &sequencer, &ExecutorCallbacks::default(), Utc::now()).unwrap();
        assert_eq!(workflow.steps[1].status, StepStatus::Active);
        assert_eq!(workflow.status, WorkflowStatus::InProgress);

        let second_id = workflow.steps[1].id;
        record_decision(&mut workflow, second_id, Decision::Approved, &by, None, &sequencer, &ExecutorCallbacks::default(), Utc::now()).unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Approved);
        assert_eq!(workflow.final_decision, Some(Decision::Approved));
    }

    #[test]
    fn rejection_cancels_remaining_steps() {
        let mut workflow = workflow_with_steps(vec![step("one"), step("two")]);
        let sequencer = EventSequencer::new();
        submit(&mut workflow, &sequencer, Utc::now()).unwrap();
        let by = Identity::new("m1", "Bob", "bob@example.com");
        let first_id = workflow.steps[0].id;
        record_decision(&mut workflow, first_id, Decision::Rejected, &by, None, &sequencer, &ExecutorCallbacks::default(), Utc::now()).unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Rejected);
        assert_eq!(workflow.steps[1].status, StepStatus::Cancelled);
    }

    #[test]
    fn record_decision_on_non_active_step_is_rejected() {
        let mut workflow = workflow_with_steps(vec![step("one")]);
        let sequencer = EventSequencer::new();
        let by = Identity::new("m1", "Bob", "bob@example.com");
        let step_id = workflow.steps[0].id;
        let err = record_decision(&mut workflow, step_id, Decision::Approved, &by, None, &sequencer, &ExecutorCallbacks::default(), Utc::now())
            .unwrap_err();
        assert!(matches!(err, InvalidStateError::WorkflowState { .. }));
    }

    #[test]
    fn decision_without_comments_is_rejected_when_justification_required() {
        let mut required_step = step("one");
        required_step.require_justification = true;
        let mut workflow = workflow_with_steps(vec![required_step]);
        let sequencer = EventSequencer::new();
        submit(&mut workflow, &sequencer, Utc::now()).unwrap();
        let by = Identity::new("m1", "Bob", "bob@example.com");
        let step_id = workflow.steps[0].id;

        let err = record_decision(&mut workflow, step_id, Decision::Approved, &by, None, &sequencer, &ExecutorCallbacks::default(), Utc::now())
            .unwrap_err();
        assert!(matches!(err, InvalidStateError::JustificationRequired(_)));

        record_decision(
            &mut workflow,
            step_id,
            Decision::Approved,
            &by,
            Some("reviewed the SoD conflict, approving".into()),
            &sequencer,
            &ExecutorCallbacks::default(),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(workflow.steps[0].status, StepStatus::Approved);
    }

    #[tokio::test]
    async fn provision_requires_approved_final_decision() {
        let mut workflow = workflow_with_steps(vec![step("one")]);
        let sequencer = EventSequencer::new();
        let err = provision(&mut workflow, &AlwaysSucceeds, &sequencer, Utc::now()).await.unwrap_err();
        assert!(matches!(err, InvalidStateError::NotApproved(None)));
    }

    #[tokio::test]
    async fn provision_transitions_to_completed_on_success() {
        let mut workflow = workflow_with_steps(vec![step("one")]);
        workflow.final_decision = Some(Decision::Approved);
        let sequencer = EventSequencer::new();
        provision(&mut workflow, &AlwaysSucceeds, &sequencer, Utc::now()).await.unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Completed);
    }

    #[test]
    fn cancel_refuses_when_already_terminal() {
        let mut workflow = workflow_with_steps(vec![step("one")]);
        workflow.status = WorkflowStatus::Completed;
        let sequencer = EventSequencer::new();
        let by = Identity::new("u1", "Alice", "alice@example.com");
        let err = cancel(&mut workflow, &by, "done".into(), &sequencer, Utc::now()).unwrap_err();
        assert!(matches!(err, InvalidStateError::AlreadyTerminal(_)));
    }
}
