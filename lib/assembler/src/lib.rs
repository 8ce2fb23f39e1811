//  LIB.rs
//    by Bas Kloosterman
//
//  Description:
//!   Implements the Workflow Assembler: turns a Policy Engine evaluation
//!   result into a concrete, ordered [`Workflow`] of approval steps, or an
//!   auto-decided workflow with none.
//

use chrono::Utc;
use model::{ApproverType, Decision, Identity, PolicyAction, RiskLevel, StepStatus, Workflow, WorkflowContext, WorkflowId, WorkflowStatus, WorkflowStep};
use policy::{EvaluationResult, PolicyEngine, PolicyError};
use resolver::{ApproverResolver, ResolutionError};

pub mod sla_default;

pub use sla_default::default_sla_hours;

#[derive(Debug, thiserror::Error)]
pub enum AssemblyError {
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error("could not staff step for approver type {approver_type}: {source}")]
    Unstaffed { approver_type: ApproverType, source: ResolutionError },
}

/// One surviving `ADD_APPROVER` action after deduplication, carrying enough
/// of its origin to compute SLA hours and report diagnostics.
#[derive(Debug, Clone)]
struct PendingStep {
    approver_type: ApproverType,
    sla_override_hours: Option<u32>,
    reason: String,
    matched_rule_id: String,
}

/// Diagnostics returned alongside the assembled workflow, read by "what-if"
/// simulation callers and the explanation surface.
#[derive(Debug, Clone, Default)]
pub struct AssemblyDiagnostics {
    pub rules_evaluated: usize,
    pub rules_matched: Vec<String>,
    pub steps_created: usize,
    pub decision_path: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct AssemblyResult {
    pub workflow: Workflow,
    pub diagnostics: AssemblyDiagnostics,
}

/// Assembles a workflow from `context` by evaluating `policy_set_id` (or the
/// engine's sole registered set) and resolving every surviving ADD_APPROVER
/// action through `resolver`.
pub async fn assemble(
    engine: &PolicyEngine,
    resolver: &ApproverResolver,
    context: WorkflowContext,
    policy_set_id: Option<&str>,
) -> Result<AssemblyResult, AssemblyError> {
    let evaluation = engine.evaluate(&context, policy_set_id)?;
    assemble_from_evaluation(resolver, context, evaluation, policy_set_id.unwrap_or("default").to_string()).await
}

/// Same algorithm as [`assemble`] but takes an already-computed evaluation,
/// so "what-if" simulation can reuse a candidate context's evaluation
/// without re-registering a policy set.
pub async fn assemble_from_evaluation(
    resolver: &ApproverResolver,
    context: WorkflowContext,
    evaluation: EvaluationResult,
    policy_id: String,
) -> Result<AssemblyResult, AssemblyError> {
    let mut diagnostics = AssemblyDiagnostics {
        rules_evaluated: evaluation.matched_rules.len(),
        rules_matched: evaluation.matched_rule_ids(),
        ..Default::default()
    };

    let now = Utc::now();
    let base_workflow = |status: WorkflowStatus| Workflow {
        id: WorkflowId::new(),
        process_type: context.process_type,
        context: context.clone(),
        steps: Vec::new(),
        current_step: 0,
        status,
        final_decision: None,
        created_at: now,
        submitted_at: None,
        completed_at: None,
        policy_id: policy_id.clone(),
        matched_rule_ids: diagnostics.rules_matched.clone(),
        assembly_explanation: String::new(),
        post_approval_tags: Vec::new(),
        audit_log: Vec::new(),
    };

    let all_actions: Vec<PolicyAction> = evaluation.actions.clone();

    // Step 2: AUTO_REJECT dominates everything else (§4.1).
    if let Some(reason) = auto_reject_reason(&all_actions) {
        diagnostics.decision_path.push(format!("auto-rejected: {reason}"));
        let mut workflow = base_workflow(WorkflowStatus::AutoRejected);
        workflow.final_decision = Some(Decision::Rejected);
        workflow.completed_at = Some(now);
        workflow.assembly_explanation = format!("Workflow auto-rejected at assembly: {reason}");
        return Ok(AssemblyResult { workflow, diagnostics });
    }

    let pending_steps = dedup_add_approver(&evaluation);

    // Step 3: AUTO_APPROVE only wins if no ADD_APPROVER survived dedup.
    if pending_steps.is_empty() && all_actions.iter().any(|a| matches!(a, PolicyAction::AutoApprove)) {
        diagnostics.decision_path.push("auto-approved: no approver steps required".into());
        let mut workflow = base_workflow(WorkflowStatus::AutoApproved);
        workflow.final_decision = Some(Decision::Approved);
        workflow.completed_at = Some(now);
        workflow.assembly_explanation = "Workflow auto-approved at assembly: no approval steps required".into();
        apply_post_approval_tags(&mut workflow, &all_actions);
        return Ok(AssemblyResult { workflow, diagnostics });
    }

    // Step 4: resolve each surviving step, in the order produced by evaluate.
    let mut steps = Vec::with_capacity(pending_steps.len());
    for (index, pending) in pending_steps.iter().enumerate() {
        let resolution = resolver
            .resolve(pending.approver_type, &context)
            .await
            .map_err(|source| AssemblyError::Unstaffed { approver_type: pending.approver_type, source })?;

        let sla_hours = compute_sla_hours(pending, &all_actions, context.risk_level());

        steps.push(WorkflowStep {
            id: model::StepId::new(),
            step_number: (index + 1) as u32,
            name: format!("{} approval", pending.approver_type),
            description: pending.reason.clone(),
            approver_type: pending.approver_type,
            resolved_approver: Some(resolve_principal(&resolution)),
            sla_hours,
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
            matched_rule_id: pending.matched_rule_id.clone(),
            require_justification: false,
        });
    }

    diagnostics.steps_created = steps.len();
    diagnostics.decision_path.push(format!("assembled {} step(s)", steps.len()));

    let mut workflow = base_workflow(WorkflowStatus::Pending);
    let explanation = format!(
        "Workflow assembled with {} step(s): {}",
        steps.len(),
        steps.iter().map(|s| s.approver_type.to_string()).collect::<Vec<_>>().join(", ")
    );
    workflow.steps = steps;
    workflow.assembly_explanation = explanation;
    apply_post_approval_tags(&mut workflow, &all_actions);

    Ok(AssemblyResult { workflow, diagnostics })
}

fn resolve_principal(resolution: &resolver::ResolutionResult) -> Identity {
    resolution.delegate.clone().unwrap_or_else(|| resolution.principal.clone())
}

fn auto_reject_reason(actions: &[PolicyAction]) -> Option<&str> {
    actions.iter().find_map(|a| match a {
        PolicyAction::AutoReject { reason } => Some(reason.as_str()),
        _ => None,
    })
}

/// Deduplicates ADD_APPROVER actions by approver type, keeping the first
/// occurrence in rule-evaluation order. Since rules are already sorted
/// ascending by (priority, rule id), "first occurrence" is exactly "earliest
/// / lowest-priority rule", and that rule's SLA override is what survives
/// (§4.1).
fn dedup_add_approver(evaluation: &EvaluationResult) -> Vec<PendingStep> {
    let mut seen = std::collections::HashSet::new();
    let mut pending = Vec::new();
    for rule_match in &evaluation.matched_rules {
        for action in &rule_match.actions {
            if let PolicyAction::AddApprover { approver_type, sla_override_hours, reason } = action {
                if seen.insert(*approver_type) {
                    pending.push(PendingStep {
                        approver_type: *approver_type,
                        sla_override_hours: *sla_override_hours,
                        reason: reason.clone(),
                        matched_rule_id: rule_match.rule_id.clone(),
                    });
                }
            }
        }
    }
    pending
}

/// SLA hours is the minimum of: the action's own override, any SET_SLA
/// action targeting the same approver type, and the risk-level default.
fn compute_sla_hours(pending: &PendingStep, actions: &[PolicyAction], risk_level: RiskLevel) -> u32 {
    let mut candidates = vec![default_sla_hours(risk_level)];
    if let Some(hours) = pending.sla_override_hours {
        candidates.push(hours);
    }
    for action in actions {
        if let PolicyAction::SetSla { approver_type, sla_hours } = action {
            if *approver_type == pending.approver_type {
                candidates.push(*sla_hours);
            }
        }
    }
    candidates.into_iter().min().unwrap_or_else(|| default_sla_hours(risk_level))
}

/// Applies the actions that don't create a step of their own: tags/notify
/// targets attach to the workflow, and `REQUIRE_JUSTIFICATION` marks every
/// assembled step so the executor refuses a decision without a comment.
fn apply_post_approval_tags(workflow: &mut Workflow, actions: &[PolicyAction]) {
    for action in actions {
        match action {
            PolicyAction::AddPostReview { label } => workflow.post_approval_tags.push(format!("post-review:{label}")),
            PolicyAction::Notify { target } => workflow.post_approval_tags.push(format!("notify:{target}")),
            PolicyAction::Tag { tag } => workflow.post_approval_tags.push(tag.clone()),
            PolicyAction::RequireJustification => {
                for step in &mut workflow.steps {
                    step.require_justification = true;
                }
            },
            _ => {},
        }
    }
}
