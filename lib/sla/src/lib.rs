//  LIB.rs
//    by Bas Kloosterman
//
//  Description:
//!   Implements the SLA Manager: per-step and per-workflow deadline
//!   tracking, escalation construction, and breach prediction.
//

use chrono::{DateTime, Datelike, Timelike, Utc};
use model::{ApproverType, EscalationAction, EscalationId, EscalationTrigger, Identity, StepId, StepStatus, Workflow, WorkflowStep};

pub mod business_hours;

pub use business_hours::{BusinessHoursConfig, business_hours_between};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlaStatus {
    OnTrack,
    Warning,
    Critical,
    Breached,
    Escalated,
    Completed,
}

impl SlaStatus {
    /// Severity used to pick the "worst" status across a workflow's steps.
    /// `Completed` ranks lowest (nothing to act on); `Breached` highest.
    fn severity(self) -> u8 {
        match self {
            Self::Completed => 0,
            Self::OnTrack => 1,
            Self::Escalated => 2,
            Self::Warning => 3,
            Self::Critical => 4,
            Self::Breached => 5,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SlaThresholds {
    pub warning_pct: f64,
    pub critical_pct: f64,
    pub breached_pct: f64,
}

impl Default for SlaThresholds {
    fn default() -> Self { Self { warning_pct: 75.0, critical_pct: 90.0, breached_pct: 100.0 } }
}

#[derive(Debug, Clone)]
pub struct SlaCheck {
    pub status: SlaStatus,
    pub elapsed_hours: f64,
    pub sla_hours: u32,
    pub remaining_hours: f64,
    pub percent_used: f64,
    pub recommendation: String,
    pub escalation_needed: bool,
}

/// Optional clock source for elapsed-time computation; `None` means
/// wall-clock hours, `Some` means business-hours-only counting (§4.4).
pub enum Clock<'a> {
    WallClock,
    BusinessHours(&'a BusinessHoursConfig),
}

pub fn check_step_sla(step: &WorkflowStep, now: DateTime<Utc>, thresholds: SlaThresholds, clock: &Clock) -> SlaCheck {
    if step.is_terminal() {
        return SlaCheck {
            status: SlaStatus::Completed,
            elapsed_hours: 0.0,
            sla_hours: step.sla_hours,
            remaining_hours: 0.0,
            percent_used: 100.0,
            recommendation: "step has reached a terminal status".into(),
            escalation_needed: false,
        };
    }
    if step.status == StepStatus::Escalated {
        return SlaCheck {
            status: SlaStatus::Escalated,
            elapsed_hours: 0.0,
            sla_hours: step.sla_hours,
            remaining_hours: step.sla_hours as f64,
            percent_used: 0.0,
            recommendation: "step is mid-escalation; SLA resets on re-activation".into(),
            escalation_needed: false,
        };
    }

    let Some(activated_at) = step.activated_at else {
        return SlaCheck {
            status: SlaStatus::OnTrack,
            elapsed_hours: 0.0,
            sla_hours: step.sla_hours,
            remaining_hours: step.sla_hours as f64,
            percent_used: 0.0,
            recommendation: "step has not yet been activated".into(),
            escalation_needed: false,
        };
    };

    let elapsed_hours = match clock {
        Clock::WallClock => (now - activated_at).num_milliseconds() as f64 / 3_600_000.0,
        Clock::BusinessHours(config) => business_hours_between(activated_at, now, config),
    };
    let sla_hours = step.sla_hours as f64;
    let percent_used = if sla_hours > 0.0 { (elapsed_hours / sla_hours) * 100.0 } else { 100.0 };
    let remaining_hours = (sla_hours - elapsed_hours).max(0.0);

    let status = if percent_used >= thresholds.breached_pct {
        SlaStatus::Breached
    } else if percent_used >= thresholds.critical_pct {
        SlaStatus::Critical
    } else if percent_used >= thresholds.warning_pct {
        SlaStatus::Warning
    } else {
        SlaStatus::OnTrack
    };

    let recommendation = match status {
        SlaStatus::Breached => "SLA breached: escalate immediately".to_string(),
        SlaStatus::Critical => "approaching breach: notify approver and prepare escalation".to_string(),
        SlaStatus::Warning => "send a reminder to the current approver".to_string(),
        _ => "no action needed".to_string(),
    };

    SlaCheck {
        status,
        elapsed_hours,
        sla_hours: step.sla_hours,
        remaining_hours,
        percent_used,
        recommendation,
        escalation_needed: matches!(status, SlaStatus::Critical | SlaStatus::Breached),
    }
}

#[derive(Debug, Clone)]
pub struct WorkflowSlaCheck {
    pub status: SlaStatus,
    pub total_sla_hours: u32,
    pub elapsed_hours: f64,
    pub per_step: Vec<(StepId, SlaCheck)>,
}

pub fn check_workflow_sla(workflow: &Workflow, now: DateTime<Utc>, thresholds: SlaThresholds, clock: &Clock) -> WorkflowSlaCheck {
    let per_step: Vec<(StepId, SlaCheck)> = workflow.steps.iter().map(|s| (s.id, check_step_sla(s, now, thresholds, clock))).collect();
    let status = per_step.iter().map(|(_, c)| c.status).max_by_key(|s| s.severity()).unwrap_or(SlaStatus::OnTrack);
    let total_sla_hours = workflow.steps.iter().map(|s| s.sla_hours).sum();
    let elapsed_hours = match workflow.submitted_at {
        Some(submitted_at) => match clock {
            Clock::WallClock => (now - submitted_at).num_milliseconds() as f64 / 3_600_000.0,
            Clock::BusinessHours(config) => business_hours_between(submitted_at, now, config),
        },
        None => 0.0,
    };
    WorkflowSlaCheck { status, total_sla_hours, elapsed_hours, per_step }
}

/// Scheduled reminder wall-clock times for a step, restricted to those still
/// in the future relative to `now`.
pub fn reminder_schedule_for(step: &WorkflowStep, now: DateTime<Utc>) -> Vec<DateTime<Utc>> {
    let Some(due_at) = step.due_at else { return Vec::new() };
    step.reminder_at_hours
        .iter()
        .map(|hours_before| due_at - chrono::Duration::hours(*hours_before as i64))
        .filter(|when| *when > now)
        .collect()
}

/// Fixed escalation chain (§4.4): named roles escalate toward more senior
/// named roles; everything else escalates to the catch-all governance desk.
pub fn default_escalation_target(approver_type: ApproverType) -> ApproverType {
    use ApproverType::*;
    match approver_type {
        LineManager => SecurityOfficer,
        SecurityOfficer => ComplianceOfficer,
        ComplianceOfficer => Ciso,
        _ => GovernanceDesk,
    }
}

pub fn create_escalation(
    step: &WorkflowStep,
    trigger: EscalationTrigger,
    target_type: Option<ApproverType>,
    now: DateTime<Utc>,
) -> EscalationAction {
    let elapsed_hours_at_creation =
        step.activated_at.map(|activated_at| (now - activated_at).num_milliseconds() as f64 / 3_600_000.0).unwrap_or(0.0);
    EscalationAction {
        id: EscalationId::new(),
        trigger,
        source_step: step.id,
        from_principal: step.resolved_approver.clone(),
        to_approver_type: target_type.unwrap_or_else(|| default_escalation_target(step.approver_type)),
        to_principal: None,
        original_sla_hours: step.sla_hours,
        elapsed_hours_at_creation,
        executed: false,
        created_at: now,
    }
}

/// Marks `action` executed and pushes it onto the step's history. Idempotent
/// w.r.t. `action.id`: a second call with an already-executed action (same
/// id) is a no-op, recognized by the `executed` flag the first call set.
pub fn execute_escalation(
    action: &mut EscalationAction,
    resolved_principal: Identity,
    step: &mut WorkflowStep,
    callback: Option<&dyn Fn(&EscalationAction)>,
) {
    if action.executed {
        return;
    }
    action.to_principal = Some(resolved_principal.clone());
    action.executed = true;

    step.escalation_history.push(model::EscalationHistoryEntry {
        from: action.from_principal.clone().unwrap_or_else(|| Identity::new("unknown", "unknown", "unknown@example.com")),
        to: resolved_principal,
        reason: format!("{:?}", action.trigger),
        when: action.created_at,
    });

    if let Some(callback) = callback {
        callback(action);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BreachPrediction {
    pub will_breach: bool,
    pub confidence: f64,
}

/// With a historical average response time, predicts breach by comparing
/// `activated_at + avg_response_hours` against `due_at` (confidence 0.7).
/// Without one, falls back to "already past 75% used" (confidence 0.3).
pub fn predict_breach(step: &WorkflowStep, avg_response_hours: Option<f64>, now: DateTime<Utc>) -> BreachPrediction {
    match (step.activated_at, step.due_at, avg_response_hours) {
        (Some(activated_at), Some(due_at), Some(avg)) => {
            let projected = activated_at + chrono::Duration::milliseconds((avg * 3_600_000.0) as i64);
            BreachPrediction { will_breach: projected > due_at, confidence: 0.7 }
        },
        _ => {
            let check = check_step_sla(step, now, SlaThresholds::default(), &Clock::WallClock);
            BreachPrediction { will_breach: check.percent_used > 75.0, confidence: 0.3 }
        },
    }
}

/// Weekday check used by the business-hours clock; kept here rather than in
/// `business_hours` so callers that only need a quick weekend guard (e.g. the
/// scheduled re-evaluation sweep) don't need the full module.
pub fn is_weekend(when: DateTime<Utc>) -> bool {
    matches!(when.weekday(), chrono::Weekday::Sat | chrono::Weekday::Sun)
}

pub fn hour_of(when: DateTime<Utc>) -> u32 { when.hour() }

#[cfg(test)]
mod tests {
    use model::{ApproverType, Decision, StepStatus};

    use super::*;

    fn step_activated(hours_ago: i64, sla_hours: u32) -> WorkflowStep {
        WorkflowStep {
            id: StepId::new(),
            step_number: 1,
            name: "line manager".into(),
            description: String::new(),
            approver_type: ApproverType::LineManager,
            resolved_approver: Some(Identity::new("m1", "Bob", "bob@example.com")),
            sla_hours,
            reminder_at_hours: vec![12, 6, 2],
            escalation_at_hours: None,
            activated_at: Some(Utc::now() - chrono::Duration::hours(hours_ago)),
            due_at: Some(Utc::now() - chrono::Duration::hours(hours_ago) + chrono::Duration::hours(sla_hours as i64)),
            decided_at: None,
            status: StepStatus::Active,
            decision: None,
            decision_comments: None,
            delegation_history: Vec::new(),
            escalation_history: Vec::new(),
            matched_rule_id: "rule".into(),
            require_justification: false,
        }
    }

    #[test]
    fn on_track_below_warning_threshold() {
        let step = step_activated(1, 48);
        let check = check_step_sla(&step, Utc::now(), SlaThresholds::default(), &Clock::WallClock);
        assert_eq!(check.status, SlaStatus::OnTrack);
    }

    #[test]
    fn warning_at_75_percent() {
        let step = step_activated(37, 48); // 37/48 ≈ 77%
        let check = check_step_sla(&step, Utc::now(), SlaThresholds::default(), &Clock::WallClock);
        assert_eq!(check.status, SlaStatus::Warning);
    }

    #[test]
    fn breached_past_100_percent() {
        let step = step_activated(50, 48);
        let check = check_step_sla(&step, Utc::now(), SlaThresholds::default(), &Clock::WallClock);
        assert_eq!(check.status, SlaStatus::Breached);
        assert!(check.escalation_needed);
    }

    #[test]
    fn completed_when_step_is_terminal() {
        let mut step = step_activated(100, 48);
        step.status = StepStatus::Approved;
        step.decision = Some(Decision::Approved);
        let check = check_step_sla(&step, Utc::now(), SlaThresholds::default(), &Clock::WallClock);
        assert_eq!(check.status, SlaStatus::Completed);
    }

    #[test]
    fn escalation_chain_follows_fixed_mapping() {
        assert_eq!(default_escalation_target(ApproverType::LineManager), ApproverType::SecurityOfficer);
        assert_eq!(default_escalation_target(ApproverType::SecurityOfficer), ApproverType::ComplianceOfficer);
        assert_eq!(default_escalation_target(ApproverType::ComplianceOfficer), ApproverType::Ciso);
        assert_eq!(default_escalation_target(ApproverType::RoleOwner), ApproverType::GovernanceDesk);
    }

    #[test]
    fn execute_escalation_is_idempotent() {
        let mut step = step_activated(10, 48);
        let mut action = create_escalation(&step, EscalationTrigger::SlaWarning, None, Utc::now());
        execute_escalation(&mut action, Identity::new("s1", "Security", "sec@example.com"), &mut step, None);
        assert_eq!(step.escalation_history.len(), 1);
        execute_escalation(&mut action, Identity::new("s1", "Security", "sec@example.com"), &mut step, None);
        assert_eq!(step.escalation_history.len(), 1);
    }

    #[test]
    fn predict_breach_uses_historical_average_when_available() {
        let step = step_activated(10, 48);
        let prediction = predict_breach(&step, Some(100.0), Utc::now());
        assert!(prediction.will_breach);
        assert_eq!(prediction.confidence, 0.7);
    }

    #[test]
    fn predict_breach_falls_back_without_history() {
        let step = step_activated(40, 48);
        let prediction = predict_breach(&step, None, Utc::now());
        assert_eq!(prediction.confidence, 0.3);
    }
}
