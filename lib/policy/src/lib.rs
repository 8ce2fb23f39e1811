//  LIB.rs
//    by Bas Kloosterman
//
//  Description:
//!   Implements the Policy Engine: a pure evaluator of [`PolicySet`]s against
//!   a [`WorkflowContext`], plus the loader that turns a policy document into
//!   an internal [`PolicySet`].
//

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use model::{Combinator, ConditionOperator, PolicyAction, PolicyCondition, PolicyRule, PolicySet, WorkflowContext};
use regex::Regex;

pub mod document;
pub mod hash;

#[cfg(test)]
mod tests;


/***** ERRORS *****/
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("rule '{rule_id}' references unknown attribute path '{path}' while in strict mode")]
    UnknownAttribute { rule_id: String, path: String },
    #[error("rule '{rule_id}' uses unsupported operator '{op:?}' for path '{path}' (not a numeric value)")]
    NonNumericComparison { rule_id: String, path: String, op: ConditionOperator },
    #[error("rule '{rule_id}' uses 'contains' on a non-collection value at path '{path}'")]
    NotACollection { rule_id: String, path: String },
    #[error("rule '{rule_id}' uses 'matches-regex' on a non-string value at path '{path}'")]
    NotAString { rule_id: String, path: String },
    #[error("invalid regex pattern in rule '{rule_id}': {source}")]
    InvalidRegex { rule_id: String, source: regex::Error },
    #[error("no policy set is registered under id '{0}'")]
    UnknownPolicySet(String),
    #[error("policy document is malformed: {0}")]
    DocumentError(String),
}


/***** EVALUATION RESULT *****/
/// Outcome of evaluating one [`PolicyRule`] against a context.
#[derive(Debug, Clone)]
pub struct RuleMatch {
    pub rule_id: String,
    pub actions: Vec<PolicyAction>,
}

/// Result of [`PolicyEngine::evaluate`]: deterministic, side-effect free.
#[derive(Debug, Clone, Default)]
pub struct EvaluationResult {
    pub matched_rules: Vec<RuleMatch>,
    pub actions: Vec<PolicyAction>,
}

impl EvaluationResult {
    pub fn matched_rule_ids(&self) -> Vec<String> { self.matched_rules.iter().map(|m| m.rule_id.clone()).collect() }
}


/***** ENGINE *****/
/// Holds the active [`PolicySet`] per id. Hot-swapping a set (`activate`)
/// atomically replaces the `Arc` pointer; in-flight evaluations keep whatever
/// pointer they captured on entry (spec §5, "shared-resource policy").
#[derive(Default)]
pub struct PolicyEngine {
    sets: RwLock<HashMap<String, Arc<PolicySet>>>,
}

impl PolicyEngine {
    pub fn new() -> Self { Self { sets: RwLock::new(HashMap::new()) } }

    /// Atomically activates (or replaces) a policy set under its own id.
    pub fn activate(&self, set: PolicySet) {
        let mut sets = self.sets.write().expect("policy set registry lock poisoned");
        sets.insert(set.id.clone(), Arc::new(set));
    }

    pub fn get(&self, policy_set_id: &str) -> Option<Arc<PolicySet>> {
        self.sets.read().expect("policy set registry lock poisoned").get(policy_set_id).cloned()
    }

    /// Evaluates the named policy set (or, if omitted, the single registered
    /// set when exactly one exists) against `context`. Pure: no state is
    /// mutated and no I/O is performed.
    pub fn evaluate(&self, context: &WorkflowContext, policy_set_id: Option<&str>) -> Result<EvaluationResult, PolicyError> {
        let set = match policy_set_id {
            Some(id) => self.get(id).ok_or_else(|| PolicyError::UnknownPolicySet(id.to_string()))?,
            None => {
                let sets = self.sets.read().expect("policy set registry lock poisoned");
                if sets.len() == 1 {
                    sets.values().next().cloned().unwrap()
                } else {
                    return Err(PolicyError::UnknownPolicySet("<none specified, and registry does not hold exactly one set>".into()));
                }
            },
        };
        evaluate_set(&set, context)
    }
}

/// Standalone evaluation over an explicit [`PolicySet`], used directly by
/// "what-if" simulation callers that hold their own candidate set without
/// registering it.
pub fn evaluate_set(set: &PolicySet, context: &WorkflowContext) -> Result<EvaluationResult, PolicyError> {
    let context_value = serde_json::to_value(context).map_err(|e| PolicyError::DocumentError(e.to_string()))?;

    let mut active: Vec<&PolicyRule> = set.rules.iter().filter(|r| r.active && in_validity_window(r)).collect();
    // Ascending (priority, rule id) order, per §4.1.
    active.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));

    let mut result = EvaluationResult::default();
    for rule in active {
        if rule_matches(rule, &context_value, set.strict_mode)? {
            result.matched_rules.push(RuleMatch { rule_id: rule.id.clone(), actions: rule.actions.clone() });
            result.actions.extend(rule.actions.iter().cloned());
        }
    }
    Ok(result)
}

fn in_validity_window(rule: &PolicyRule) -> bool {
    let now = chrono::Utc::now();
    if let Some(from) = rule.valid_from {
        if now < from {
            return false;
        }
    }
    if let Some(until) = rule.valid_until {
        if now >= until {
            return false;
        }
    }
    true
}

fn rule_matches(rule: &PolicyRule, context: &serde_json::Value, strict: bool) -> Result<bool, PolicyError> {
    let mut outcomes = Vec::with_capacity(rule.conditions.len());
    for condition in &rule.conditions {
        outcomes.push(evaluate_condition(rule, condition, context, strict)?);
    }
    if outcomes.is_empty() {
        // A rule with no conditions always matches; used for unconditional
        // defaults (e.g. a catch-all NOTIFY action).
        return Ok(true);
    }
    Ok(match rule.combinator {
        Combinator::And => outcomes.into_iter().all(|b| b),
        Combinator::Or => outcomes.into_iter().any(|b| b),
    })
}

fn evaluate_condition(rule: &PolicyRule, condition: &PolicyCondition, context: &serde_json::Value, strict: bool) -> Result<bool, PolicyError> {
    let actual = match resolve_path(context, &condition.path) {
        Some(v) => v,
        None => {
            if strict {
                return Err(PolicyError::UnknownAttribute { rule_id: rule.id.clone(), path: condition.path.clone() });
            }
            log::warn!("rule '{}' references missing attribute '{}'; treating as not-matched", rule.id, condition.path);
            return Ok(missing_attribute_outcome(condition.op));
        },
    };
    apply_operator(rule, condition, &actual)
}

/// Per §4.1: a missing attribute "compares unequal to any literal and
/// collection-membership returns false" in non-strict mode.
fn missing_attribute_outcome(op: ConditionOperator) -> bool {
    matches!(op, ConditionOperator::Ne)
}

fn apply_operator(rule: &PolicyRule, condition: &PolicyCondition, actual: &serde_json::Value) -> Result<bool, PolicyError> {
    use ConditionOperator::*;
    let path = &condition.path;
    match condition.op {
        Eq => Ok(actual == &condition.value),
        Ne => Ok(actual != &condition.value),
        Lt | Le | Gt | Ge => {
            let (a, b) = (as_f64(actual), as_f64(&condition.value));
            match (a, b) {
                (Some(a), Some(b)) => Ok(match condition.op {
                    Lt => a < b,
                    Le => a <= b,
                    Gt => a > b,
                    Ge => a >= b,
                    _ => unreachable!(),
                }),
                _ => Err(PolicyError::NonNumericComparison { rule_id: rule.id.clone(), path: path.clone(), op: condition.op }),
            }
        },
        In => Ok(condition.value.as_array().map(|arr| arr.contains(actual)).unwrap_or(false)),
        NotIn => Ok(!condition.value.as_array().map(|arr| arr.contains(actual)).unwrap_or(false)),
        Contains => match actual.as_array() {
            Some(arr) => Ok(arr.contains(&condition.value)),
            None => Err(PolicyError::NotACollection { rule_id: rule.id.clone(), path: path.clone() }),
        },
        MatchesRegex => {
            let s = actual.as_str().ok_or_else(|| PolicyError::NotAString { rule_id: rule.id.clone(), path: path.clone() })?;
            let pattern = condition.value.as_str().unwrap_or_default();
            let anchored = anchor_pattern(pattern);
            let re = Regex::new(&anchored).map_err(|source| PolicyError::InvalidRegex { rule_id: rule.id.clone(), source })?;
            Ok(re.is_match(s))
        },
        IsEmpty => Ok(is_empty(actual)),
        AnyOf => Ok(condition.value.as_array().map(|arr| arr.contains(actual)).unwrap_or(false)),
        AllOf => match (actual.as_array(), condition.value.as_array()) {
            (Some(actual_arr), Some(expected)) => Ok(expected.iter().all(|e| actual_arr.contains(e))),
            _ => Err(PolicyError::NotACollection { rule_id: rule.id.clone(), path: path.clone() }),
        },
    }
}

fn as_f64(value: &serde_json::Value) -> Option<f64> { value.as_f64() }

fn is_empty(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => true,
        serde_json::Value::String(s) => s.is_empty(),
        serde_json::Value::Array(a) => a.is_empty(),
        serde_json::Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

/// `matches-regex` "anchors the pattern implicitly at both ends unless the
/// pattern contains an unescaped `^` or `$`" (§4.1).
fn anchor_pattern(pattern: &str) -> String {
    let starts_anchored = pattern.starts_with('^');
    let ends_anchored = pattern.ends_with('$') && !pattern.ends_with("\\$");
    let mut out = String::with_capacity(pattern.len() + 2);
    if !starts_anchored {
        out.push('^');
    }
    out.push_str(pattern);
    if !ends_anchored {
        out.push('$');
    }
    out
}

/// Resolves a dotted attribute path (`context.risk_score`,
/// `context.sod_conflicts.length`) against the serialized context. The
/// `context.` prefix is optional and stripped if present.
fn resolve_path(root: &serde_json::Value, path: &str) -> Option<serde_json::Value> {
    let path = path.strip_prefix("context.").unwrap_or(path);
    let mut current = root;
    let segments: Vec<&str> = path.split('.').collect();
    for (i, segment) in segments.iter().enumerate() {
        if *segment == "length" && i == segments.len() - 1 {
            return Some(match current {
                serde_json::Value::Array(a) => serde_json::Value::from(a.len()),
                serde_json::Value::String(s) => serde_json::Value::from(s.len()),
                serde_json::Value::Object(o) => serde_json::Value::from(o.len()),
                _ => return None,
            });
        }
        current = match current {
            serde_json::Value::Object(map) => map.get(*segment)?,
            _ => return None,
        };
    }
    Some(current.clone())
}
