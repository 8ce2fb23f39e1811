//  LIB.rs
//    by Bas Kloosterman
//
//  Description:
//!   Implements the Audit/Explanation surface: a pluggable sink that records
//!   a workflow's append-only [`AuditRecord`] trail, and the `explain`
//!   operation that renders an audience-appropriate narrative of a
//!   workflow's current state (§6, §7).
//

use async_trait::async_trait;
use model::{Decision, StepStatus, Workflow, WorkflowId, WorkflowStatus};

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("could not deliver audit record for workflow {workflow_id}: {reason}")]
    DeliveryFailed { workflow_id: WorkflowId, reason: String },
}

/// A destination for audit records as they are appended to a workflow's log.
/// Kept separate from [`Workflow::push_audit`] (which is the source of
/// truth) so a tenant can additionally forward records to an external
/// compliance sink without the core depending on one.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, workflow_id: WorkflowId, record: &model::AuditRecord) -> Result<(), AuditError>;
}

/// Forwards every record to the `log` facade at `info` level. The default
/// sink wired into the orchestrator binary; good enough until a tenant
/// configures a real compliance-report pipeline (out of scope here).
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingAuditSink;

#[async_trait]
impl AuditSink for LoggingAuditSink {
    async fn record(&self, workflow_id: WorkflowId, record: &model::AuditRecord) -> Result<(), AuditError> {
        log::info!("[audit] workflow={workflow_id} event={} actor={} ({:?}) {}", record.event_type, record.actor, record.actor_type, record.description);
        Ok(())
    }
}

/// Who `explain` is rendering a narrative for; each gets a different level
/// of detail (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    Requester,
    Approver,
    Auditor,
}

/// Renders a human-readable narrative of `workflow`'s current state for
/// `audience`. For failure states, includes the error code, offending
/// rule/step (if any), and the last known successful transition (§7).
pub fn explain(workflow: &Workflow, audience: Audience) -> String {
    match audience {
        Audience::Requester => explain_for_requester(workflow),
        Audience::Approver => explain_for_approver(workflow),
        Audience::Auditor => explain_for_auditor(workflow),
    }
}

fn status_label(status: WorkflowStatus) -> &'static str {
    match status {
        WorkflowStatus::Draft => "not yet submitted",
        WorkflowStatus::Pending => "pending assembly",
        WorkflowStatus::InProgress => "in progress",
        WorkflowStatus::WaitingApproval => "paused pending manual review",
        WorkflowStatus::Approved => "approved",
        WorkflowStatus::Rejected => "rejected",
        WorkflowStatus::AutoApproved => "auto-approved",
        WorkflowStatus::AutoRejected => "auto-rejected",
        WorkflowStatus::Cancelled => "cancelled",
        WorkflowStatus::Provisioning => "being provisioned",
        WorkflowStatus::Completed => "completed",
        WorkflowStatus::Failed => "failed",
    }
}

fn rejection_reason(workflow: &Workflow) -> Option<String> {
    workflow
        .steps
        .iter()
        .find(|s| s.status == StepStatus::Rejected)
        .map(|s| s.decision_comments.clone().unwrap_or_else(|| format!("rejected by {}", s.resolved_approver.as_ref().map(|a| a.name.as_str()).unwrap_or("an approver"))))
}

/// The most recent audit entry recorded before the current (possibly
/// failing) state, used by the failure-narrative branch of `explain` (§7).
fn last_successful_transition(workflow: &Workflow) -> Option<&model::AuditRecord> { workflow.audit_log.iter().rev().nth(1) }

fn explain_for_requester(workflow: &Workflow) -> String {
    let mut out = format!(
        "Your request for {} on {} is {}.",
        workflow.context.role_name,
        workflow.context.system_name,
        status_label(workflow.status)
    );
    match workflow.status {
        WorkflowStatus::Rejected | WorkflowStatus::AutoRejected => {
            if let Some(reason) = rejection_reason(workflow) {
                out.push_str(&format!(" Reason: {reason}."));
            }
        },
        WorkflowStatus::Failed => {
            out.push_str(" Provisioning could not be completed; the access team has been notified.");
            if let Some(last) = last_successful_transition(workflow) {
                out.push_str(&format!(" Last successful step: {}.", last.description));
            }
        },
        _ if !workflow.status.is_terminal() => {
            if let Some(step) = workflow.active_step() {
                let approver = step.resolved_approver.as_ref().map(|a| a.name.as_str()).unwrap_or("an approver");
                out.push_str(&format!(" It is awaiting approval from {approver}."));
            }
        },
        _ => {},
    }
    out
}

fn explain_for_approver(workflow: &Workflow) -> String {
    let Some(step) = workflow.active_step() else {
        return format!("No step of this workflow is currently awaiting your action; workflow is {}.", status_label(workflow.status));
    };
    let due = step.due_at.map(|d| d.to_rfc3339()).unwrap_or_else(|| "no deadline set".into());
    format!(
        "Step {} ({}) for {} on {} is awaiting your decision, due {}. Matched rule: {}.",
        step.step_number, step.name, workflow.context.role_name, workflow.context.system_name, due, step.matched_rule_id
    )
}

fn explain_for_auditor(workflow: &Workflow) -> String {
    let mut out = format!(
        "Workflow {} (process {:?}) for requester {} is {}. Assembly: {}.",
        workflow.id,
        workflow.process_type,
        workflow.context.requester.id,
        status_label(workflow.status),
        workflow.assembly_explanation
    );
    if !workflow.matched_rule_ids.is_empty() {
        out.push_str(&format!(" Matched rules: {}.", workflow.matched_rule_ids.join(", ")));
    }
    for step in &workflow.steps {
        out.push_str(&format!(
            " Step {} [{}] approver={} status={:?} rule={};",
            step.step_number, step.name, step.approver_type, step.status, step.matched_rule_id
        ));
    }
    if workflow.status == WorkflowStatus::Failed {
        if let Some(last) = last_successful_transition(workflow) {
            out.push_str(&format!(" Last known successful transition: {} ({}).", last.description, last.event_type));
        }
    }
    if let Some(decision) = workflow.final_decision {
        out.push_str(&format!(" Final decision: {:?}.", decision));
    }
    out
}
