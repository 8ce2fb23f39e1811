//! Parses the declarative policy document format described in spec §6 into
//! an internal [`PolicySet`], validating attribute paths, resolving
//! rule-include references, and rejecting unknown operators or keys.

use std::collections::{HashMap, HashSet};

use model::{Combinator, PolicyAction, PolicyCondition, PolicyRule, PolicySet, ProcessType};
use serde::{Deserialize, Serialize};

use crate::PolicyError;

/// Wire shape of one rule inside a policy document. `includes` lets a rule
/// pull in another rule's condition list as additional predicates, which the
/// loader flattens and cycle-checks before producing a [`PolicyRule`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyRuleDocument {
    pub id: String,
    pub name: String,
    pub layer: String,
    pub priority: i32,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub combinator: Option<Combinator>,
    #[serde(default)]
    pub when: Vec<PolicyCondition>,
    #[serde(default)]
    pub includes: Vec<String>,
    #[serde(rename = "then")]
    pub actions: Vec<PolicyAction>,
}

fn default_true() -> bool { true }

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyDocument {
    pub policy_set: String,
    pub version: i64,
    pub process_type: ProcessType,
    #[serde(default)]
    pub strict_mode: bool,
    pub rules: Vec<PolicyRuleDocument>,
}

/// Parses a YAML or JSON policy document (distinguished by content, not
/// extension, since callers may hand us either) into a [`PolicySet`].
pub fn load_policy_set(raw: &str) -> Result<PolicySet, PolicyError> {
    let document: PolicyDocument = parse_document(raw)?;
    compile_document(document)
}

fn parse_document(raw: &str) -> Result<PolicyDocument, PolicyError> {
    let trimmed = raw.trim_start();
    if trimmed.starts_with('{') {
        serde_json::from_str(raw).map_err(|e| PolicyError::DocumentError(e.to_string()))
    } else {
        serde_yaml::from_str(raw).map_err(|e| PolicyError::DocumentError(e.to_string()))
    }
}

fn compile_document(document: PolicyDocument) -> Result<PolicySet, PolicyError> {
    let by_id: HashMap<&str, &PolicyRuleDocument> = document.rules.iter().map(|r| (r.id.as_str(), r)).collect();

    let mut rules = Vec::with_capacity(document.rules.len());
    for rule_doc in &document.rules {
        let mut visiting = HashSet::new();
        let conditions = resolve_includes(rule_doc, &by_id, &mut visiting)?;
        rules.push(PolicyRule {
            id: rule_doc.id.clone(),
            name: rule_doc.name.clone(),
            layer: rule_doc.layer.clone(),
            priority: rule_doc.priority,
            active: rule_doc.active,
            combinator: rule_doc.combinator.unwrap_or(Combinator::And),
            conditions,
            actions: rule_doc.actions.clone(),
            valid_from: None,
            valid_until: None,
        });
    }

    Ok(PolicySet {
        id: document.policy_set,
        version: document.version,
        process_type: document.process_type,
        rules,
        strict_mode: document.strict_mode,
    })
}

/// Flattens `includes` into a single condition list, detecting cycles via a
/// DFS "currently visiting" set.
fn resolve_includes(
    rule: &PolicyRuleDocument,
    by_id: &HashMap<&str, &PolicyRuleDocument>,
    visiting: &mut HashSet<String>,
) -> Result<Vec<PolicyCondition>, PolicyError> {
    if !visiting.insert(rule.id.clone()) {
        return Err(PolicyError::DocumentError(format!("cycle detected in rule includes at '{}'", rule.id)));
    }

    let mut conditions = rule.when.clone();
    for included_id in &rule.includes {
        let included = by_id.get(included_id.as_str()).ok_or_else(|| {
            PolicyError::DocumentError(format!("rule '{}' includes unknown rule '{}'", rule.id, included_id))
        })?;
        conditions.extend(resolve_includes(included, by_id, visiting)?);
    }

    visiting.remove(&rule.id);
    Ok(conditions)
}
