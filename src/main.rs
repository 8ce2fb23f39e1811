//  MAIN.rs
//    by Bas Kloosterman
//
//  Description:
//!   Entrypoint to the `orchestratord` binary: wires a default policy set,
//!   approver registry and audit sink, then submits and decides one
//!   demonstration workflow end to end.
//

use std::env;
use std::sync::Arc;

use error_trace::ErrorTrace as _;
use humanlog::{DebugMode, HumanLogger};
use log::info;
use model::{ApproverType, Combinator, Identity, PolicyAction, PolicyRule, PolicySet, ProcessType};
use orchestrator::{Orchestrator, OrchestratorConfig, TenantCapabilities, TenantContext};
use resolver::{ApproverResolver, LineManagerResolver, StaticResolver};


/***** ARGUMENTS *****/
/// Trimmed down from the teacher's `clap`-derived `Arguments`: no HTTP
/// surface survives, so only the trace toggle remains, parsed by hand since
/// `clap` is not part of this crate's dependency stack.
struct Arguments {
    trace: bool,
}

impl Arguments {
    fn parse() -> Self { Self { trace: env::args().any(|a| a == "--trace") } }
}


/***** DEMO WIRING *****/
fn demo_orchestrator() -> Orchestrator {
    let approver_resolver = ApproverResolver::default();
    approver_resolver.register(ApproverType::LineManager, Arc::new(LineManagerResolver), resolver::default_fallback_chain(ApproverType::LineManager));
    approver_resolver.register(
        ApproverType::SecurityOfficer,
        Arc::new(StaticResolver::new(Identity::new("so1", "Security Officer", "security@example.com"))),
        resolver::default_fallback_chain(ApproverType::SecurityOfficer),
    );
    approver_resolver.register(
        ApproverType::GovernanceDesk,
        Arc::new(StaticResolver::new(Identity::new("gd1", "Governance Desk", "governance@example.com"))),
        vec![],
    );

    let orchestrator = Orchestrator::new(OrchestratorConfig::default(), approver_resolver, Arc::new(audit::LoggingAuditSink));
    orchestrator.policy_engine().activate(PolicySet {
        id: "default".into(),
        version: 1,
        process_type: ProcessType::AccessRequest,
        strict_mode: false,
        rules: vec![PolicyRule {
            id: "manager-approval".into(),
            name: "line manager approval required".into(),
            layer: "base".into(),
            priority: 1,
            active: true,
            combinator: Combinator::And,
            conditions: vec![],
            actions: vec![PolicyAction::AddApprover { approver_type: ApproverType::LineManager, sla_override_hours: None, reason: "every access request needs manager sign-off".into() }],
            valid_from: None,
            valid_until: None,
        }],
    });
    orchestrator
}

fn demo_context() -> model::WorkflowContext {
    model::WorkflowContext {
        request_id: model::RequestId::new(),
        process_type: ProcessType::AccessRequest,
        requester: Identity::new("u1", "Alice", "alice@example.com"),
        target_user: Identity::new("u1", "Alice", "alice@example.com"),
        target_manager: Some(Identity::new("m1", "Bob", "bob@example.com")),
        system_id: "SAP01".into(),
        system_name: "SAP Finance".into(),
        role_id: "FI_AP_CLERK".into(),
        role_name: "AP Clerk".into(),
        risk_score: 35,
        sod_conflicts: vec![],
        critical_sod_conflicts: vec![],
        sensitive_data_tags: vec![],
        privileged_role: false,
        attributes: std::collections::HashMap::new(),
    }
}


/***** ENTRYPOINT *****/
#[tokio::main]
async fn main() {
    let args = Arguments::parse();

    if let Err(err) = HumanLogger::terminal(if args.trace { DebugMode::Full } else { DebugMode::Debug }).init() {
        eprintln!("WARNING: Failed to setup logger: {err} (no logging for this session)");
    }
    info!("{} - v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    let orchestrator = demo_orchestrator();
    let tenant = TenantContext { tenant_id: "acme".into(), capabilities: TenantCapabilities::all() };

    let workflow = match orchestrator.submit_request(&tenant, demo_context(), None).await {
        Ok(workflow) => workflow,
        Err(err) => {
            log::error!("{}", err.trace());
            std::process::exit(1);
        },
    };
    info!("submitted workflow {} with {} step(s)", workflow.id, workflow.steps.len());

    let approver = workflow.steps[0].resolved_approver.clone().expect("line manager resolves from context.target_manager");
    let decided = match orchestrator
        .record_decision(&tenant, workflow.id, workflow.steps[0].id, model::Decision::Approved, &approver, Some("looks good".into()))
        .await
    {
        Ok(workflow) => workflow,
        Err(err) => {
            log::error!("{}", err.trace());
            std::process::exit(1);
        },
    };
    info!("workflow {} is now {:?}", decided.id, decided.status);

    let swept = orchestrator.run_sweep(None).await;
    info!("sweep re-evaluated {swept} non-terminal workflow(s)");

    let explanation = orchestrator.explain(&tenant, decided.id, orchestrator::Audience::Auditor).await.expect("workflow was just created");
    info!("{explanation}");
}
