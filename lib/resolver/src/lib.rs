//  LIB.rs
//    by Bas Kloosterman
//
//  Description:
//!   Implements the Approver Resolver: a pluggable registry that binds an
//!   [`ApproverType`] to a concrete principal, with per-type fallback chains
//!   and a circuit breaker guarding flaky external lookups.
//

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use model::{ApproverType, Identity, WorkflowContext};

pub mod circuit;

pub use circuit::{CircuitBreaker, CircuitState};

/// Where a resolved principal came from; surfaced for audit/explanation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionSource {
    Hr,
    Iam,
    Ldap,
    Registry,
    Static,
    Custom,
}

/// Successful outcome of [`ApproverResolverProvider::resolve`].
#[derive(Debug, Clone)]
pub struct ResolutionResult {
    pub principal: Identity,
    pub source: ResolutionSource,
    pub available: bool,
    pub ooo_until: Option<DateTime<Utc>>,
    pub delegate: Option<Identity>,
    /// Set when the returned principal is a delegate standing in for an
    /// out-of-office approver; preserves the original approver's id (§4.2).
    pub delegated_from: Option<String>,
    pub resolution_time: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum ResolutionError {
    #[error("resolver for approver type {0} returned no candidate")]
    Empty(ApproverType),
    #[error("resolver for approver type {0} failed: {1}")]
    ProviderFailed(ApproverType, String),
    #[error("circuit breaker for approver type {0} is open")]
    CircuitOpen(ApproverType),
    #[error("no resolver is registered for approver type {0}, and its fallback chain is exhausted")]
    Exhausted(ApproverType),
}

/// A single source of principals for one or more approver types (HR system,
/// LDAP, a static config table, ...). Implementations may perform network
/// I/O; the registry wraps each with a timeout and a circuit breaker.
#[async_trait]
pub trait ApproverResolverProvider: Send + Sync {
    async fn resolve(&self, approver_type: ApproverType, context: &WorkflowContext) -> Result<ResolutionResult, String>;
}

/// Binds a [`Identity`] to an [`ApproverType`] unconditionally; used to model
/// the STATIC approver type and as a deterministic stand-in in tests.
pub struct StaticResolver {
    principal: Identity,
}

impl StaticResolver {
    pub fn new(principal: Identity) -> Self { Self { principal } }
}

#[async_trait]
impl ApproverResolverProvider for StaticResolver {
    async fn resolve(&self, _approver_type: ApproverType, _context: &WorkflowContext) -> Result<ResolutionResult, String> {
        Ok(ResolutionResult {
            principal: self.principal.clone(),
            source: ResolutionSource::Static,
            available: true,
            ooo_until: None,
            delegate: None,
            delegated_from: None,
            resolution_time: Duration::from_millis(0),
        })
    }
}

/// Looks up `context.target_manager` for LINE_MANAGER requests; the
/// canonical resolver for the one approver type the context always carries
/// enough information to answer directly.
pub struct LineManagerResolver;

#[async_trait]
impl ApproverResolverProvider for LineManagerResolver {
    async fn resolve(&self, _approver_type: ApproverType, context: &WorkflowContext) -> Result<ResolutionResult, String> {
        let manager = context.target_manager.clone().ok_or_else(|| "context carries no target manager".to_string())?;
        Ok(ResolutionResult {
            principal: manager,
            source: ResolutionSource::Hr,
            available: true,
            ooo_until: None,
            delegate: None,
            delegated_from: None,
            resolution_time: Duration::from_millis(0),
        })
    }
}

/// Per-type wiring: the primary provider plus an ordered fallback chain of
/// other approver types to try if the primary is empty, erroring, or its
/// breaker is open.
struct RegisteredType {
    provider: Arc<dyn ApproverResolverProvider>,
    fallback_chain: Vec<ApproverType>,
    breaker: CircuitBreaker,
}

/// The pluggable registry described in §4.2. Resolution does not cache
/// across calls; callers that want memoization must do it themselves.
pub struct ApproverResolver {
    providers: Mutex<HashMap<ApproverType, RegisteredType>>,
    call_timeout: Duration,
}

impl Default for ApproverResolver {
    fn default() -> Self { Self::new(Duration::from_secs(5)) }
}

impl ApproverResolver {
    pub fn new(call_timeout: Duration) -> Self { Self { providers: Mutex::new(HashMap::new()), call_timeout } }

    pub fn register(&self, approver_type: ApproverType, provider: Arc<dyn ApproverResolverProvider>, fallback_chain: Vec<ApproverType>) {
        let mut providers = self.providers.lock().expect("resolver registry lock poisoned");
        providers.insert(approver_type, RegisteredType { provider, fallback_chain, breaker: CircuitBreaker::new() });
    }

    /// Resolves `approver_type`, walking the fallback chain on failure. The
    /// final [`ResolutionResult::delegated_from`] is only set by the provider
    /// itself (OOO substitution); fallback substitution is reported via the
    /// error path's `Exhausted` rather than silently swapping principals.
    pub async fn resolve(&self, approver_type: ApproverType, context: &WorkflowContext) -> Result<ResolutionResult, ResolutionError> {
        let mut candidates = vec![approver_type];
        {
            let providers = self.providers.lock().expect("resolver registry lock poisoned");
            if let Some(registered) = providers.get(&approver_type) {
                candidates.extend(registered.fallback_chain.iter().copied());
            }
        }

        let mut last_err = ResolutionError::Exhausted(approver_type);
        for candidate in candidates {
            match self.try_one(candidate, context).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    log::warn!("approver resolution for {} failed via candidate {}: {}", approver_type, candidate, e);
                    last_err = e;
                },
            }
        }
        Err(last_err)
    }

    async fn try_one(&self, approver_type: ApproverType, context: &WorkflowContext) -> Result<ResolutionResult, ResolutionError> {
        let started = Instant::now();

        let provider = {
            let providers = self.providers.lock().expect("resolver registry lock poisoned");
            let registered = providers.get(&approver_type).ok_or(ResolutionError::Exhausted(approver_type))?;
            if !registered.breaker.allow() {
                return Err(ResolutionError::CircuitOpen(approver_type));
            }
            Arc::clone(&registered.provider)
        };

        let outcome = match tokio::time::timeout(self.call_timeout, provider.resolve(approver_type, context)).await {
            Ok(Ok(result)) => Ok(Some(result)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(format!("resolver call timed out after {:?}", self.call_timeout)),
        };

        let mut providers = self.providers.lock().expect("resolver registry lock poisoned");
        let registered = providers.get_mut(&approver_type).ok_or(ResolutionError::Exhausted(approver_type))?;
        match outcome {
            Ok(Some(mut result)) => {
                registered.breaker.record_success();
                result.resolution_time = started.elapsed();
                Ok(result)
            },
            Ok(None) => {
                registered.breaker.record_failure();
                Err(ResolutionError::Empty(approver_type))
            },
            Err(e) => {
                registered.breaker.record_failure();
                Err(ResolutionError::ProviderFailed(approver_type, e))
            },
        }
    }
}

/// Default fallback chain per approver type, applied when a step's approver
/// cannot be staffed: escalate toward more senior/generic roles rather than
/// leaving the workflow unstaffed.
pub fn default_fallback_chain(approver_type: ApproverType) -> Vec<ApproverType> {
    use ApproverType::*;
    match approver_type {
        LineManager => vec![SecurityOfficer, GovernanceDesk],
        RoleOwner | ProcessOwner | DataOwner | SystemOwner => vec![GovernanceDesk],
        SecurityOfficer => vec![ComplianceOfficer, GovernanceDesk],
        ComplianceOfficer => vec![Ciso, GovernanceDesk],
        Ciso => vec![GovernanceDesk],
        FirefighterSupervisor => vec![SecurityOfficer, GovernanceDesk],
        GovernanceDesk | Static => vec![],
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use model::{ProcessType, RequestId};

    use super::*;

    fn context_with_manager(manager: Option<Identity>) -> WorkflowContext {
        WorkflowContext {
            request_id: RequestId::new(),
            process_type: ProcessType::AccessRequest,
            requester: Identity::new("u1", "Alice", "alice@example.com"),
            target_user: Identity::new("u1", "Alice", "alice@example.com"),
            target_manager: manager,
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
        }
    }

    #[tokio::test]
    async fn resolves_line_manager_from_context() {
        let registry = ApproverResolver::default();
        registry.register(ApproverType::LineManager, Arc::new(LineManagerResolver), vec![ApproverType::GovernanceDesk]);
        registry.register(ApproverType::GovernanceDesk, Arc::new(StaticResolver::new(Identity::new("g1", "Desk", "desk@example.com"))), vec![]);

        let context = context_with_manager(Some(Identity::new("m1", "Bob", "bob@example.com")));
        let result = registry.resolve(ApproverType::LineManager, &context).await.unwrap();
        assert_eq!(result.principal.id, "m1");
    }

    #[tokio::test]
    async fn falls_back_when_primary_is_empty() {
        let registry = ApproverResolver::default();
        registry.register(ApproverType::LineManager, Arc::new(LineManagerResolver), vec![ApproverType::GovernanceDesk]);
        registry.register(ApproverType::GovernanceDesk, Arc::new(StaticResolver::new(Identity::new("g1", "Desk", "desk@example.com"))), vec![]);

        let context = context_with_manager(None);
        let result = registry.resolve(ApproverType::LineManager, &context).await.unwrap();
        assert_eq!(result.principal.id, "g1");
    }

    #[tokio::test]
    async fn exhausted_chain_errors() {
        let registry = ApproverResolver::default();
        let context = context_with_manager(None);
        let err = registry.resolve(ApproverType::DataOwner, &context).await.unwrap_err();
        assert!(matches!(err, ResolutionError::Exhausted(_)));
    }
}
