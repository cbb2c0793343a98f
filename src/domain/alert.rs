use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::transaction::{FlagType, Severity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Open,
    Investigating,
    Resolved,
    Dismissed,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Open => "open",
            AlertStatus::Investigating => "investigating",
            AlertStatus::Resolved => "resolved",
            AlertStatus::Dismissed => "dismissed",
        }
    }
}

/// Alert as requested by the anomaly engine, before persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAlert {
    pub tenant_id: String,
    pub transaction_id: Uuid,
    pub account_id: Uuid,
    #[serde(rename = "type")]
    pub alert_type: FlagType,
    pub severity: Severity,
    pub title: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BankingAlert {
    pub id: Uuid,
    pub tenant_id: String,
    pub transaction_id: Uuid,
    pub account_id: Uuid,
    #[serde(rename = "type")]
    pub alert_type: FlagType,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    pub status: AlertStatus,
    pub assigned_to: Option<String>,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BankingAlert {
    /// Every alert starts life open and unassigned.
    pub fn open(new: NewAlert, id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            id,
            tenant_id: new.tenant_id,
            transaction_id: new.transaction_id,
            account_id: new.account_id,
            alert_type: new.alert_type,
            severity: new.severity,
            title: new.title,
            description: new.description,
            status: AlertStatus::Open,
            assigned_to: None,
            resolved_by: None,
            resolved_at: None,
            resolution: None,
            created_at: now,
            updated_at: now,
        }
    }
}
