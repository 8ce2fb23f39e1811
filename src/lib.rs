//  LIB.rs
//    by Bas Kloosterman
//
//  Description:
//!   The Orchestrator facade (§6): the pure function boundary external
//!   callers use to submit requests, record approval decisions, and query
//!   workflow state. Owns the per-workflow lock registry (§5/§9) and wires
//!   together the six subsystem crates plus the event bus and audit sink.
//

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use model::{AccessRequest, Decision, EventPriority, Identity, ProcessType, Workflow, WorkflowContext, WorkflowEvent, WorkflowEventType, WorkflowId, StepId};
use resolver::ApproverResolver;
use sla::{BusinessHoursConfig, Clock, SlaStatus, SlaThresholds};
use tokio::sync::{mpsc, Mutex, RwLock};

pub use audit::Audience;

/***** CONFIG *****/
/// Loaded once at startup via `serde_yaml`, mirroring the teacher's
/// `JwtConfig`/`serde_yaml::from_reader` pattern.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub sla_thresholds: SlaThresholdsConfig,
    pub business_hours: Option<BusinessHoursConfig>,
    pub resolver_call_timeout_secs: u64,
    pub reevaluation_sweep_interval_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self { sla_thresholds: SlaThresholdsConfig::default(), business_hours: None, resolver_call_timeout_secs: 5, reevaluation_sweep_interval_secs: 60 }
    }
}

/// Serializable mirror of [`sla::SlaThresholds`] (that type carries no serde
/// derive since the `sla` crate has no config-loading concern of its own).
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SlaThresholdsConfig {
    pub warning_pct: f64,
    pub critical_pct: f64,
    pub breached_pct: f64,
}

impl Default for SlaThresholdsConfig {
    fn default() -> Self { let d = SlaThresholds::default(); Self { warning_pct: d.warning_pct, critical_pct: d.critical_pct, breached_pct: d.breached_pct } }
}

impl From<SlaThresholdsConfig> for SlaThresholds {
    fn from(c: SlaThresholdsConfig) -> Self { Self { warning_pct: c.warning_pct, critical_pct: c.critical_pct, breached_pct: c.breached_pct } }
}

impl OrchestratorConfig {
    pub fn from_yaml_reader<R: std::io::Read>(reader: R) -> Result<Self, serde_yaml::Error> { serde_yaml::from_reader(reader) }

    fn clock(&self) -> sla::Clock<'_> {
        match &self.business_hours {
            Some(cfg) => Clock::BusinessHours(cfg),
            None => Clock::WallClock,
        }
    }
}


/***** TENANCY *****/
/// Replaces the source's ambient current-tenant thread-local with an
/// explicit argument threaded through every facade call (§9).
#[derive(Debug, Clone)]
pub struct TenantContext {
    pub tenant_id: String,
    pub capabilities: TenantCapabilities,
}

/// Replaces decorator-based feature checks with an explicit admission check
/// at the core's entry points (§9).
#[derive(Debug, Clone, Default)]
pub struct TenantCapabilities {
    pub enabled_modules: HashSet<String>,
    pub enabled_features: HashSet<String>,
}

impl TenantCapabilities {
    pub fn all() -> Self {
        Self {
            enabled_modules: ["access_request", "role_assignment", "emergency_access", "role_change", "user_lifecycle_event", "certification", "policy_exception"]
                .into_iter()
                .map(String::from)
                .collect(),
            enabled_features: HashSet::new(),
        }
    }

    fn module_for(process_type: ProcessType) -> &'static str {
        match process_type {
            ProcessType::AccessRequest => "access_request",
            ProcessType::RoleAssignment => "role_assignment",
            ProcessType::EmergencyAccess => "emergency_access",
            ProcessType::RoleChange => "role_change",
            ProcessType::UserLifecycleEvent => "user_lifecycle_event",
            ProcessType::Certification => "certification",
            ProcessType::PolicyException => "policy_exception",
        }
    }

    fn require_module(&self, process_type: ProcessType) -> Result<(), OrchestratorError> {
        let module = Self::module_for(process_type);
        if self.enabled_modules.contains(module) {
            Ok(())
        } else {
            Err(OrchestratorError::ModuleNotEnabled(module.to_string()))
        }
    }

    pub fn require_feature(&self, feature: &str) -> Result<(), OrchestratorError> {
        if self.enabled_features.contains(feature) {
            Ok(())
        } else {
            Err(OrchestratorError::FeatureNotAvailable(feature.to_string()))
        }
    }
}


/***** ERRORS *****/
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("tenant id is required but was empty")]
    TenantRequired,
    #[error("feature '{0}' is not available to this tenant")]
    FeatureNotAvailable(String),
    #[error("module '{0}' is not enabled for this tenant")]
    ModuleNotEnabled(String),
    #[error("no workflow exists with id {0}")]
    UnknownWorkflow(WorkflowId),
    #[error(transparent)]
    Policy(#[from] policy::PolicyError),
    #[error(transparent)]
    Assembly(#[from] assembler::AssemblyError),
    #[error(transparent)]
    InvalidState(#[from] executor::InvalidStateError),
    #[error(transparent)]
    Audit(#[from] audit::AuditError),
}


/***** PROVISIONING CALLBACK *****/
pub use executor::ProvisionCallback;


/***** ORCHESTRATOR *****/
/// Owns the per-workflow lock map described in §5/§9: every mutating
/// operation acquires exactly one workflow's [`Mutex`], never more than one
/// at a time, so cross-workflow operations never deadlock against each
/// other.
pub struct Orchestrator {
    config: OrchestratorConfig,
    policy: policy::PolicyEngine,
    resolver: ApproverResolver,
    audit_sink: Arc<dyn audit::AuditSink>,
    event_bus: eventbus::EventBus,
    sequencer: executor::EventSequencer,
    workflows: RwLock<HashMap<WorkflowId, Arc<Mutex<Workflow>>>>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, resolver: ApproverResolver, audit_sink: Arc<dyn audit::AuditSink>) -> Self {
        Self {
            config,
            policy: policy::PolicyEngine::new(),
            resolver,
            audit_sink,
            event_bus: eventbus::EventBus::new(),
            sequencer: executor::EventSequencer::new(),
            workflows: RwLock::new(HashMap::new()),
        }
    }

    pub fn policy_engine(&self) -> &policy::PolicyEngine { &self.policy }

    pub fn event_bus(&self) -> &eventbus::EventBus { &self.event_bus }

    async fn checkout(&self, workflow_id: WorkflowId) -> Result<Arc<Mutex<Workflow>>, OrchestratorError> {
        self.workflows.read().await.get(&workflow_id).cloned().ok_or(OrchestratorError::UnknownWorkflow(workflow_id))
    }

    async fn record(&self, workflow: &Workflow) {
        for record in workflow.audit_log.iter().rev().take(1) {
            if let Err(e) = self.audit_sink.record(workflow.id, record).await {
                log::warn!("audit sink failed to record entry for workflow {}: {e}", workflow.id);
            }
        }
    }

    fn require_tenant(tenant: &TenantContext) -> Result<(), OrchestratorError> {
        if tenant.tenant_id.is_empty() {
            return Err(OrchestratorError::TenantRequired);
        }
        Ok(())
    }

    /// `submitRequest(context) → Workflow` (§6). Assembles the workflow from
    /// the active policy set, then — unless assembly already auto-decided it
    /// — activates the first step exactly as `executor::submit` would.
    pub async fn submit_request(
        &self,
        tenant: &TenantContext,
        context: WorkflowContext,
        policy_set_id: Option<&str>,
    ) -> Result<Workflow, OrchestratorError> {
        Self::require_tenant(tenant)?;
        tenant.capabilities.require_module(context.process_type)?;

        let mut result = assembler::assemble(&self.policy, &self.resolver, context, policy_set_id).await?;

        if result.workflow.status == model::WorkflowStatus::Pending && !result.workflow.steps.is_empty() {
            result.workflow.status = model::WorkflowStatus::Draft;
            executor::submit(&mut result.workflow, &self.sequencer, Utc::now())?;
        } else {
            // Auto-decided at assembly time (AUTO_APPROVED/AUTO_REJECTED): the
            // assembler itself never writes to the audit log, so this is the
            // one primary entry required by the audit-completeness property.
            result.workflow.push_audit(model::AuditRecord::new(
                "system",
                model::ActorType::Policy,
                "workflow.auto_decided",
                result.workflow.assembly_explanation.clone(),
            ));
        }

        self.record(&result.workflow).await;
        let workflow = result.workflow;
        self.workflows.write().await.insert(workflow.id, Arc::new(Mutex::new(workflow.clone())));
        Ok(workflow)
    }

    /// `recordDecision(workflowId, stepId, decision, by, comments) → Workflow`.
    pub async fn record_decision(
        &self,
        tenant: &TenantContext,
        workflow_id: WorkflowId,
        step_id: StepId,
        decision: Decision,
        by: &Identity,
        comments: Option<String>,
    ) -> Result<Workflow, OrchestratorError> {
        Self::require_tenant(tenant)?;
        let handle = self.checkout(workflow_id).await?;
        let mut workflow = handle.lock().await;
        executor::record_decision(&mut workflow, step_id, decision, by, comments, &self.sequencer, &executor::ExecutorCallbacks::default(), Utc::now())?;
        self.record(&workflow).await;
        Ok(workflow.clone())
    }

    pub async fn delegate(
        &self,
        tenant: &TenantContext,
        workflow_id: WorkflowId,
        step_id: StepId,
        by: &Identity,
        to: Identity,
        reason: String,
    ) -> Result<Workflow, OrchestratorError> {
        Self::require_tenant(tenant)?;
        let handle = self.checkout(workflow_id).await?;
        let mut workflow = handle.lock().await;
        executor::delegate(&mut workflow, step_id, by, to, reason, &self.sequencer, Utc::now())?;
        self.record(&workflow).await;
        Ok(workflow.clone())
    }

    pub async fn escalate(
        &self,
        tenant: &TenantContext,
        workflow_id: WorkflowId,
        step_id: StepId,
        by: &Identity,
        to: Identity,
        reason: String,
    ) -> Result<Workflow, OrchestratorError> {
        Self::require_tenant(tenant)?;
        let handle = self.checkout(workflow_id).await?;
        let mut workflow = handle.lock().await;
        executor::escalate(&mut workflow, step_id, by, to, reason, &self.sequencer, Utc::now())?;
        self.record(&workflow).await;
        Ok(workflow.clone())
    }

    pub async fn cancel(&self, tenant: &TenantContext, workflow_id: WorkflowId, by: &Identity, reason: String) -> Result<Workflow, OrchestratorError> {
        Self::require_tenant(tenant)?;
        let handle = self.checkout(workflow_id).await?;
        let mut workflow = handle.lock().await;
        executor::cancel(&mut workflow, by, reason, &self.sequencer, Utc::now())?;
        self.record(&workflow).await;
        Ok(workflow.clone())
    }

    /// `provision(by) → Workflow`. Per §5, the per-workflow lock must not be
    /// held across the (potentially long-running) provisioning callback: a
    /// snapshot is checked out, provisioned unlocked, then written back.
    pub async fn provision(
        &self,
        tenant: &TenantContext,
        workflow_id: WorkflowId,
        callback: &dyn ProvisionCallback,
    ) -> Result<Workflow, OrchestratorError> {
        Self::require_tenant(tenant)?;
        let handle = self.checkout(workflow_id).await?;

        let mut workflow = { handle.lock().await.clone() };
        executor::provision(&mut workflow, callback, &self.sequencer, Utc::now()).await?;

        let mut guard = handle.lock().await;
        *guard = workflow.clone();
        drop(guard);
        self.record(&workflow).await;
        Ok(workflow)
    }

    /// `simulate(context, policySetId?) → AssemblyResult` (§6): no state
    /// change, nothing is inserted into the workflow registry.
    pub async fn simulate(
        &self,
        tenant: &TenantContext,
        context: WorkflowContext,
        policy_set_id: Option<&str>,
    ) -> Result<assembler::AssemblyResult, OrchestratorError> {
        Self::require_tenant(tenant)?;
        tenant.capabilities.require_module(context.process_type)?;
        Ok(assembler::assemble(&self.policy, &self.resolver, context, policy_set_id).await?)
    }

    /// `explain(workflowId, audience) → string` (§6).
    pub async fn explain(&self, tenant: &TenantContext, workflow_id: WorkflowId, audience: Audience) -> Result<String, OrchestratorError> {
        Self::require_tenant(tenant)?;
        let handle = self.checkout(workflow_id).await?;
        let workflow = handle.lock().await;
        Ok(audit::explain(&workflow, audience))
    }

    pub async fn get_workflow(&self, workflow_id: WorkflowId) -> Option<Workflow> {
        let handle = self.workflows.read().await.get(&workflow_id).cloned()?;
        Some(handle.lock().await.clone())
    }

    pub async fn check_sla(&self, workflow_id: WorkflowId) -> Result<sla::WorkflowSlaCheck, OrchestratorError> {
        let handle = self.checkout(workflow_id).await?;
        let workflow = handle.lock().await;
        Ok(sla::check_workflow_sla(&workflow, Utc::now(), self.config.sla_thresholds.into(), &self.config.clock()))
    }

    /// Runs the Provisioning Gate (§4.7) over an [`AccessRequest`] tied to an
    /// already-approved workflow; does not itself mutate workflow state.
    pub fn evaluate_gate(&self, gate: &gate::ProvisioningGate, request: &AccessRequest) -> gate::ProvisioningGateResult { gate.evaluate(request) }

    /// Reacts to an external [`WorkflowEvent`] (§4.6): re-evaluates every
    /// affected, non-terminal workflow and applies the resulting action.
    pub async fn handle_event(&self, event: WorkflowEvent, policy_set_id: Option<&str>) -> Result<(), OrchestratorError> {
        for workflow_id in event.affected_workflow_ids.clone() {
            let Ok(handle) = self.checkout(workflow_id).await else { continue };
            let mut workflow = handle.lock().await;
            let action = eventbus::re_evaluate(&workflow, &event, &self.policy, &self.resolver, policy_set_id).await;
            eventbus::apply_action(&mut workflow, &action, Utc::now());
            self.record(&workflow).await;
        }
        self.event_bus.publish(event);
        Ok(())
    }

    /// Scheduled re-evaluation (§4.6): walks every non-terminal workflow and
    /// re-evaluates it even without an explicit `WorkflowEvent`, catching SLA
    /// drift nothing upstream got around to reporting. Synthesizes an
    /// `SlaBreach` event for any workflow whose active step's SLA clock has
    /// run out, since that's the only drift a workflow can accrue on its own
    /// between sweeps. Returns the number of workflows re-evaluated.
    pub async fn run_sweep(&self, policy_set_id: Option<&str>) -> usize {
        let workflow_ids: Vec<WorkflowId> = {
            let workflows = self.workflows.read().await;
            let mut ids = Vec::with_capacity(workflows.len());
            for (id, handle) in workflows.iter() {
                if !handle.lock().await.status.is_terminal() {
                    ids.push(*id);
                }
            }
            ids
        };

        let mut swept = 0;
        for workflow_id in workflow_ids {
            let Ok(handle) = self.checkout(workflow_id).await else { continue };
            let mut workflow = handle.lock().await;
            if workflow.status.is_terminal() {
                continue;
            }

            let sla_check = sla::check_workflow_sla(&workflow, Utc::now(), self.config.sla_thresholds.into(), &self.config.clock());
            if sla_check.status != SlaStatus::Breached {
                continue;
            }

            let event = WorkflowEvent::new(WorkflowEventType::SlaBreach, EventPriority::High, "sweep").for_workflow(workflow_id);
            let action = eventbus::re_evaluate(&workflow, &event, &self.policy, &self.resolver, policy_set_id).await;
            eventbus::apply_action(&mut workflow, &action, Utc::now());
            self.record(&workflow).await;
            swept += 1;
        }
        swept
    }

    /// Spawns the periodic sweep described in §4.6 as a background task,
    /// ticking every `reevaluation_sweep_interval_secs`. Mirrors the
    /// teacher's heartbeat-task shape: a `tokio::time::interval` loop
    /// selected against a stop channel, owned by the returned [`SweepHandle`].
    pub fn spawn_sweep(self: Arc<Self>, policy_set_id: Option<String>) -> SweepHandle {
        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
        let orchestrator = self;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(orchestrator.config.reevaluation_sweep_interval_secs));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        orchestrator.run_sweep(policy_set_id.as_deref()).await;
                    }
                    _ = stop_rx.recv() => break,
                }
            }
        });

        SweepHandle { _stop_tx: stop_tx }
    }
}

/// Stops the background sweep task when dropped.
pub struct SweepHandle {
    _stop_tx: mpsc::Sender<()>,
}
