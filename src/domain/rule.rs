//! Tenant-defined anomaly rules.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::transaction::{FlagType, Severity};

/// Comparison operators understood by the rule evaluator.
///
/// Operators this build does not know deserialize to `Unknown`, which never matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    NotContains,
    In,
    NotIn,
    Regex,
    Between,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleCondition {
    /// Dot-path into the camelCase transaction view, e.g. `counterpartyIban`.
    pub field: String,
    pub operator: ConditionOperator,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnomalyRule {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub flag_type: FlagType,
    pub enabled: bool,
    pub severity: Severity,
    /// `None` applies the rule to every tenant.
    pub tenant_id: Option<String>,
    /// AND-combined.
    #[serde(default)]
    pub conditions: Vec<RuleCondition>,
    /// Advisory metadata for downstream consumers; never interpreted here.
    #[serde(default)]
    pub actions: Value,
}

impl AnomalyRule {
    pub fn applies_to(&self, tenant_id: &str) -> bool {
        self.enabled
            && self
                .tenant_id
                .as_deref()
                .map_or(true, |owner| owner == tenant_id)
    }
}
