//! Canonical transaction entity.
//! Provider-agnostic representation every detector and rule operates on.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Credit,
    Debit,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Credit => "credit",
            Direction::Debit => "debit",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Booked,
    Pending,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Booked => "booked",
            TransactionStatus::Pending => "pending",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Contribution of one flag of this severity to the anomaly score.
    pub fn weight(&self) -> u32 {
        match self {
            Severity::Low => 10,
            Severity::Medium => 25,
            Severity::High => 50,
            Severity::Critical => 100,
        }
    }

    pub fn triggers_alert(&self) -> bool {
        matches!(self, Severity::High | Severity::Critical)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

/// Closed set of anomaly kinds. `UnusualFrequency`, `Velocity` and
/// `ManualFlag` are only ever produced by custom rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagType {
    UnusualAmount,
    UnusualTime,
    UnusualFrequency,
    UnknownCounterparty,
    HighRiskCountry,
    RoundAmount,
    Structuring,
    Velocity,
    DormantActivation,
    CategoryMismatch,
    Duplicate,
    ManualFlag,
}

impl FlagType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlagType::UnusualAmount => "unusual_amount",
            FlagType::UnusualTime => "unusual_time",
            FlagType::UnusualFrequency => "unusual_frequency",
            FlagType::UnknownCounterparty => "unknown_counterparty",
            FlagType::HighRiskCountry => "high_risk_country",
            FlagType::RoundAmount => "round_amount",
            FlagType::Structuring => "structuring",
            FlagType::Velocity => "velocity",
            FlagType::DormantActivation => "dormant_activation",
            FlagType::CategoryMismatch => "category_mismatch",
            FlagType::Duplicate => "duplicate",
            FlagType::ManualFlag => "manual_flag",
        }
    }

    /// Rule id recorded on flags raised by the built-in detector of this type.
    pub fn builtin_rule_id(&self) -> String {
        format!("builtin:{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionFlag {
    #[serde(rename = "type")]
    pub flag_type: FlagType,
    pub severity: Severity,
    pub message: String,
    pub rule_id: String,
    pub detected_at: DateTime<Utc>,
}

/// Provider passthrough fields kept on the canonical record.
///
/// Deliberately a fixed set: anything not listed here is dropped by the mapper.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_transaction_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_to_end_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mandate_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bank_transaction_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proprietary_bank_transaction_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creditor_id: Option<String>,
}

impl TransactionMetadata {
    pub fn is_empty(&self) -> bool {
        *self == TransactionMetadata::default()
    }
}

/// Mapper output: a canonical transaction before the store assigns identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTransaction {
    pub account_id: Uuid,
    pub external_id: String,
    pub amount: BigDecimal,
    pub currency: String,
    pub direction: Direction,
    pub status: TransactionStatus,
    pub booking_date: DateTime<Utc>,
    pub value_date: DateTime<Utc>,
    pub description: String,
    pub merchant_name: Option<String>,
    pub merchant_category: Option<String>,
    pub counterparty_name: Option<String>,
    pub counterparty_iban: Option<String>,
    pub reference: Option<String>,
    pub category: Option<String>,
    #[serde(default)]
    pub metadata: TransactionMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: Uuid,
    pub account_id: Uuid,
    pub external_id: String,
    pub amount: BigDecimal,
    pub currency: String,
    pub direction: Direction,
    pub status: TransactionStatus,
    pub booking_date: DateTime<Utc>,
    pub value_date: DateTime<Utc>,
    pub description: String,
    pub merchant_name: Option<String>,
    pub merchant_category: Option<String>,
    pub counterparty_name: Option<String>,
    pub counterparty_iban: Option<String>,
    pub reference: Option<String>,
    pub category: Option<String>,
    #[serde(default)]
    pub metadata: TransactionMetadata,
    pub anomaly_score: Option<u32>,
    #[serde(default)]
    pub flags: Vec<TransactionFlag>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    /// Materializes a freshly inserted row.
    pub fn from_new(new: NewTransaction, id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            id,
            account_id: new.account_id,
            external_id: new.external_id,
            amount: new.amount,
            currency: new.currency,
            direction: new.direction,
            status: new.status,
            booking_date: new.booking_date,
            value_date: new.value_date,
            description: new.description,
            merchant_name: new.merchant_name,
            merchant_category: new.merchant_category,
            counterparty_name: new.counterparty_name,
            counterparty_iban: new.counterparty_iban,
            reference: new.reference,
            category: new.category,
            metadata: new.metadata,
            anomaly_score: None,
            flags: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Applies provider data to an existing row, keeping its identity.
    /// Returns true when any provider-sourced field actually changed.
    pub fn apply_update(&mut self, new: NewTransaction, now: DateTime<Utc>) -> bool {
        let current = NewTransaction {
            account_id: self.account_id,
            external_id: self.external_id.clone(),
            amount: self.amount.clone(),
            currency: self.currency.clone(),
            direction: self.direction,
            status: self.status,
            booking_date: self.booking_date,
            value_date: self.value_date,
            description: self.description.clone(),
            merchant_name: self.merchant_name.clone(),
            merchant_category: self.merchant_category.clone(),
            counterparty_name: self.counterparty_name.clone(),
            counterparty_iban: self.counterparty_iban.clone(),
            reference: self.reference.clone(),
            category: self.category.clone(),
            metadata: self.metadata.clone(),
        };
        if current == new {
            return false;
        }

        self.amount = new.amount;
        self.currency = new.currency;
        self.direction = new.direction;
        self.status = new.status;
        self.booking_date = new.booking_date;
        self.value_date = new.value_date;
        self.description = new.description;
        self.merchant_name = new.merchant_name;
        self.merchant_category = new.merchant_category;
        self.counterparty_name = new.counterparty_name;
        self.counterparty_iban = new.counterparty_iban;
        self.reference = new.reference;
        self.category = new.category;
        self.metadata = new.metadata;
        // Changed provider data needs a fresh analysis.
        self.anomaly_score = None;
        self.updated_at = now;
        true
    }

    /// Identity used for counterparty history: IBAN when known, else the name.
    pub fn counterparty_key(&self) -> Option<&str> {
        self.counterparty_iban
            .as_deref()
            .or(self.counterparty_name.as_deref())
            .filter(|key| !key.trim().is_empty())
    }
}
