//  LIB.rs
//    by Bas Kloosterman
//
//  Description:
//!   Implements the Provisioning Gate: decides, per [`AccessItem`], whether
//!   an approved item may be enacted, under one of four strategies (§4.7).
//

use model::{AccessItem, AccessItemStatus, AccessRequest, RiskLevel};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningStrategy {
    AllOrNothing,
    PartialAllowed,
    RiskBasedPartial,
    /// Provision an APPROVED item iff it carries no tag from `blocklist`.
    TagBased { blocklist: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Enact,
    Hold,
}

#[derive(Debug, Clone)]
pub struct ItemDecision {
    pub item_id: String,
    pub decision: GateDecision,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct ProvisioningGateResult {
    pub items: Vec<ItemDecision>,
}

impl ProvisioningGateResult {
    pub fn enacted(&self) -> Vec<&str> {
        self.items.iter().filter(|i| i.decision == GateDecision::Enact).map(|i| i.item_id.as_str()).collect()
    }
}

pub struct ProvisioningGate {
    strategy: ProvisioningStrategy,
}

impl ProvisioningGate {
    pub fn new(strategy: ProvisioningStrategy) -> Self { Self { strategy } }

    /// Evaluates every item in `request`. Invariant held regardless of
    /// strategy: a non-APPROVED item is never enacted.
    pub fn evaluate(&self, request: &AccessRequest) -> ProvisioningGateResult {
        let all_approved = request.items.iter().all(|i| i.status == AccessItemStatus::Approved);

        let items = request
            .items
            .iter()
            .map(|item| {
                if item.status != AccessItemStatus::Approved {
                    return ItemDecision { item_id: item.id.clone(), decision: GateDecision::Hold, reason: format!("item status is {:?}, not APPROVED", item.status) };
                }
                self.decide_approved_item(item, all_approved)
            })
            .collect();

        ProvisioningGateResult { items }
    }

    fn decide_approved_item(&self, item: &AccessItem, all_approved: bool) -> ItemDecision {
        match &self.strategy {
            ProvisioningStrategy::AllOrNothing => {
                if all_approved {
                    ItemDecision { item_id: item.id.clone(), decision: GateDecision::Enact, reason: "all items in the request are approved".into() }
                } else {
                    ItemDecision { item_id: item.id.clone(), decision: GateDecision::Hold, reason: "holding until every item in the request is approved".into() }
                }
            },
            ProvisioningStrategy::PartialAllowed => {
                ItemDecision { item_id: item.id.clone(), decision: GateDecision::Enact, reason: "item approved; partial provisioning allowed".into() }
            },
            ProvisioningStrategy::RiskBasedPartial => {
                if matches!(item.risk_level, RiskLevel::Low | RiskLevel::Medium) {
                    ItemDecision { item_id: item.id.clone(), decision: GateDecision::Enact, reason: format!("{:?}-risk item provisions immediately", item.risk_level) }
                } else if all_approved {
                    ItemDecision { item_id: item.id.clone(), decision: GateDecision::Enact, reason: format!("{:?}-risk item held until all items approved", item.risk_level) }
                } else {
                    ItemDecision { item_id: item.id.clone(), decision: GateDecision::Hold, reason: format!("{:?}-risk item held pending remaining approvals", item.risk_level) }
                }
            },
            ProvisioningStrategy::TagBased { blocklist } => {
                if let Some(blocked) = item.tags.iter().find(|t| blocklist.contains(t)) {
                    ItemDecision { item_id: item.id.clone(), decision: GateDecision::Hold, reason: format!("item carries blocked tag '{blocked}'") }
                } else {
                    ItemDecision { item_id: item.id.clone(), decision: GateDecision::Enact, reason: "item carries no blocked tag".into() }
                }
            },
        }
    }
}
