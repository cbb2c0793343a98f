//! Canonical banking model shared by the sync pipeline and the anomaly engine.

pub mod account;
pub mod alert;
pub mod rule;
pub mod transaction;

pub use account::{AccountType, BankAccount, BankConnection, ConnectionStatus};
pub use alert::{AlertStatus, BankingAlert, NewAlert};
pub use rule::{AnomalyRule, ConditionOperator, RuleCondition};
pub use transaction::{
    Direction, FlagType, NewTransaction, Severity, Transaction, TransactionFlag,
    TransactionMetadata, TransactionStatus,
};
