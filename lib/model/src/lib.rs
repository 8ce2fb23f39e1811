//  LIB.rs
//    by Bas Kloosterman
//
//  Description:
//!   Defines the core data model shared by every subsystem of the
//!   orchestrator: the request context handed in by callers, the policy
//!   vocabulary the Policy Engine evaluates, the workflow/step aggregate
//!   the Executor advances, and the audit/event types that tie the whole
//!   thing together.
//

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod ids;

pub use ids::*;


/***** CONTEXT *****/
/// The closed set of request shapes the orchestrator knows how to route.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessType {
    AccessRequest,
    RoleAssignment,
    EmergencyAccess,
    RoleChange,
    UserLifecycleEvent,
    Certification,
    PolicyException,
}

/// Risk is carried as a 0-100 score; the level is derived from it and is what
/// policy conditions and default-SLA lookups actually key off.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Derives a risk level from a 0-100 score. Bucket boundaries: <25 LOW, <50
    /// MEDIUM, <75 HIGH, else CRITICAL.
    pub fn from_score(score: u8) -> Self {
        match score {
            0..=24 => Self::Low,
            25..=49 => Self::Medium,
            50..=74 => Self::High,
            _ => Self::Critical,
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "LOW"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::High => write!(f, "HIGH"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// A bare identity reference: requesters, targets, managers and resolved
/// approvers are all represented this way.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub name: String,
    pub email: String,
}

impl Identity {
    pub fn new(id: impl Into<String>, name: impl Into<String>, email: impl Into<String>) -> Self {
        Self { id: id.into(), name: name.into(), email: email.into() }
    }
}

/// Immutable input to assembly. Owned by the caller; embedded verbatim onto
/// the resulting [`Workflow`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowContext {
    pub request_id: RequestId,
    pub process_type: ProcessType,
    pub requester: Identity,
    pub target_user: Identity,
    pub target_manager: Option<Identity>,
    pub system_id: String,
    pub system_name: String,
    pub role_id: String,
    pub role_name: String,
    pub risk_score: u8,
    pub sod_conflicts: Vec<String>,
    pub critical_sod_conflicts: Vec<String>,
    pub sensitive_data_tags: Vec<String>,
    pub privileged_role: bool,
    /// Open-ended predicate bag for custom rule conditions, e.g.
    /// `context.attributes["cost_center"]`.
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,
}

impl WorkflowContext {
    pub fn risk_level(&self) -> RiskLevel { RiskLevel::from_score(self.risk_score) }
}


/***** POLICY *****/
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConditionOperator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
    Contains,
    MatchesRegex,
    IsEmpty,
    AnyOf,
    AllOf,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Combinator {
    And,
    Or,
}

/// One leaf predicate over a dotted attribute path, e.g. `context.risk_score`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PolicyCondition {
    pub path: String,
    pub op: ConditionOperator,
    #[serde(default)]
    pub value: serde_json::Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApproverType {
    LineManager,
    RoleOwner,
    ProcessOwner,
    DataOwner,
    SystemOwner,
    SecurityOfficer,
    ComplianceOfficer,
    Ciso,
    FirefighterSupervisor,
    GovernanceDesk,
    Static,
}

impl fmt::Display for ApproverType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{:?}", self) }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PolicyAction {
    AddApprover { approver_type: ApproverType, sla_override_hours: Option<u32>, reason: String },
    AutoApprove,
    AutoReject { reason: String },
    SetSla { approver_type: ApproverType, sla_hours: u32 },
    RequireJustification,
    AddPostReview { label: String },
    Notify { target: String },
    Tag { tag: String },
}

/// A named, versioned predicate-plus-action. Rules are evaluated read-only
/// per request; no rule ever mutates another.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PolicyRule {
    pub id: String,
    pub name: String,
    pub layer: String,
    pub priority: i32,
    pub active: bool,
    pub combinator: Combinator,
    pub conditions: Vec<PolicyCondition>,
    pub actions: Vec<PolicyAction>,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
}

/// The active rule set for one tenant/process-type pair.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PolicySet {
    pub id: String,
    pub version: i64,
    pub process_type: ProcessType,
    pub rules: Vec<PolicyRule>,
    pub strict_mode: bool,
}


/***** WORKFLOW STEPS *****/
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Active,
    Approved,
    Rejected,
    Delegated,
    Escalated,
    Skipped,
    Cancelled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    Approved,
    Rejected,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DelegationRecord {
    pub from: Identity,
    pub to: Identity,
    pub reason: String,
    pub when: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EscalationHistoryEntry {
    pub from: Identity,
    pub to: Identity,
    pub reason: String,
    pub when: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: StepId,
    pub step_number: u32,
    pub name: String,
    pub description: String,
    pub approver_type: ApproverType,
    pub resolved_approver: Option<Identity>,
    pub sla_hours: u32,
    pub reminder_at_hours: Vec<u32>,
    pub escalation_at_hours: Option<u32>,
    pub activated_at: Option<DateTime<Utc>>,
    pub due_at: Option<DateTime<Utc>>,
    pub decided_at: Option<DateTime<Utc>>,
    pub status: StepStatus,
    pub decision: Option<Decision>,
    pub decision_comments: Option<String>,
    pub delegation_history: Vec<DelegationRecord>,
    pub escalation_history: Vec<EscalationHistoryEntry>,
    pub matched_rule_id: String,
    /// Set by the assembler when a matched rule carries `REQUIRE_JUSTIFICATION`
    /// (spec.md:35); the executor refuses to record a decision on this step
    /// without a non-empty comment.
    pub require_justification: bool,
}

impl WorkflowStep {
    /// True once the step can no longer transition (§4.5 step-level graph).
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, StepStatus::Approved | StepStatus::Rejected | StepStatus::Skipped | StepStatus::Cancelled)
    }
}


/***** WORKFLOW *****/
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    Draft,
    Pending,
    InProgress,
    WaitingApproval,
    Approved,
    Rejected,
    AutoApproved,
    AutoRejected,
    Cancelled,
    Provisioning,
    Completed,
    Failed,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::AutoApproved | Self::AutoRejected | Self::Rejected | Self::Cancelled | Self::Completed | Self::Failed
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActorType {
    #[serde(rename = "USER")]
    User,
    #[serde(rename = "SYSTEM")]
    System,
    #[serde(rename = "POLICY")]
    Policy,
}

/// One append-only audit entry. This is the format described in spec §6; it
/// is the source of truth for any compliance report built on top of the core.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditRecord {
    pub event_id: Uuid,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub actor_type: ActorType,
    pub description: String,
    #[serde(default)]
    pub details: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub evidence: HashMap<String, serde_json::Value>,
}

impl AuditRecord {
    pub fn new(actor: impl Into<String>, actor_type: ActorType, event_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            actor: actor.into(),
            actor_type,
            description: description.into(),
            details: HashMap::new(),
            evidence: HashMap::new(),
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }
}

/// Root aggregate. Exclusively owns its steps and audit log (§3 Ownership).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub process_type: ProcessType,
    pub context: WorkflowContext,
    pub steps: Vec<WorkflowStep>,
    pub current_step: usize,
    pub status: WorkflowStatus,
    pub final_decision: Option<Decision>,
    pub created_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub policy_id: String,
    pub matched_rule_ids: Vec<String>,
    pub assembly_explanation: String,
    pub post_approval_tags: Vec<String>,
    pub audit_log: Vec<AuditRecord>,
}

impl Workflow {
    pub fn push_audit(&mut self, record: AuditRecord) { self.audit_log.push(record); }

    pub fn active_step(&self) -> Option<&WorkflowStep> { self.steps.iter().find(|s| s.status == StepStatus::Active) }

    pub fn active_step_mut(&mut self) -> Option<&mut WorkflowStep> { self.steps.iter_mut().find(|s| s.status == StepStatus::Active) }

    pub fn step_mut(&mut self, step_id: StepId) -> Option<&mut WorkflowStep> { self.steps.iter_mut().find(|s| s.id == step_id) }

    pub fn step(&self, step_id: StepId) -> Option<&WorkflowStep> { self.steps.iter().find(|s| s.id == step_id) }
}


/***** ACCESS ITEMS *****/
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessItemStatus {
    Pending,
    Approved,
    Rejected,
    Provisioned,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccessItem {
    pub id: String,
    pub system_id: String,
    pub role_id: String,
    pub risk_level: RiskLevel,
    pub tags: Vec<String>,
    pub status: AccessItemStatus,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccessRequest {
    pub id: RequestId,
    pub workflow_id: Option<WorkflowId>,
    pub items: Vec<AccessItem>,
}


/***** ESCALATION *****/
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscalationTrigger {
    SlaWarning,
    SlaBreach,
    Ooo,
    Unresponsive,
    Manual,
    Predictive,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EscalationAction {
    pub id: EscalationId,
    pub trigger: EscalationTrigger,
    pub source_step: StepId,
    pub from_principal: Option<Identity>,
    pub to_approver_type: ApproverType,
    pub to_principal: Option<Identity>,
    pub original_sla_hours: u32,
    pub elapsed_hours_at_creation: f64,
    pub executed: bool,
    pub created_at: DateTime<Utc>,
}


/***** EVENTS *****/
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowEventType {
    RiskChanged,
    SodDetected,
    SlaWarning,
    SlaBreach,
    FraudAlert,
    UserTerminated,
    RoleRevoked,
    ProvisioningSucceeded,
    ProvisioningFailed,
    ExternalWebhook,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventPriority {
    Low,
    Normal,
    High,
    Critical,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub event_id: Uuid,
    pub event_type: WorkflowEventType,
    pub priority: EventPriority,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: HashMap<String, serde_json::Value>,
    pub affected_workflow_ids: Vec<WorkflowId>,
}

impl WorkflowEvent {
    pub fn new(event_type: WorkflowEventType, priority: EventPriority, source: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            priority,
            source: source.into(),
            timestamp: Utc::now(),
            payload: HashMap::new(),
            affected_workflow_ids: Vec::new(),
        }
    }

    pub fn for_workflow(mut self, id: WorkflowId) -> Self {
        self.affected_workflow_ids.push(id);
        self
    }

    pub fn with_payload(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }
}

/// Re-evaluation re-shapes a live workflow; this is the vocabulary of changes
/// it is allowed to apply (§4.6).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ReEvaluationAction {
    NoChange,
    AddStep { approver_type: ApproverType, insert_after: Option<StepId> },
    RemoveStep { step_id: StepId },
    Reorder,
    Escalate { step_id: StepId },
    AutoApproveRemaining,
    AutoReject,
    Pause,
    NotifyOnly,
}
