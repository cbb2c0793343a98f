//! Capability interfaces the pipeline consumes.
//! The sync orchestrator and the anomaly engine only ever talk to the outside
//! world through these traits.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{
    AnomalyRule, BankAccount, BankConnection, BankingAlert, Direction, NewAlert, NewTransaction,
    Transaction, TransactionFlag,
};
use crate::provider::types::{
    AccountDetailsResponse, BalancesResponse, ProviderAccount, Requisition, TransactionsResponse,
};

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// What an upsert keyed on `(account_id, external_id)` did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertKind {
    Created,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    pub transaction: Transaction,
    pub kind: UpsertKind,
}

#[async_trait]
pub trait ConnectionRepository: Send + Sync {
    async fn get_connection(&self, id: Uuid) -> RepositoryResult<Option<BankConnection>>;

    async fn list_linked_connections(&self) -> RepositoryResult<Vec<BankConnection>>;

    async fn get_accounts_by_connection(&self, connection_id: Uuid)
        -> RepositoryResult<Vec<BankAccount>>;

    async fn save_account(&self, account: &BankAccount) -> RepositoryResult<BankAccount>;

    async fn update_account_balance(
        &self,
        account_id: Uuid,
        balance: &BigDecimal,
        at: DateTime<Utc>,
    ) -> RepositoryResult<()>;

    async fn update_connection_sync_time(
        &self,
        connection_id: Uuid,
        at: DateTime<Utc>,
    ) -> RepositoryResult<()>;
}

#[async_trait]
pub trait TransactionRepository: Send + Sync {
    async fn get_last_transaction(&self, account_id: Uuid) -> RepositoryResult<Option<Transaction>>;

    /// Atomic insert-or-update on `(account_id, external_id)`.
    async fn upsert_transaction(&self, tx: &NewTransaction) -> RepositoryResult<UpsertOutcome>;

    /// Account transactions booked within the last `days` days.
    async fn get_transactions_by_account(
        &self,
        account_id: Uuid,
        days: i64,
    ) -> RepositoryResult<Vec<Transaction>>;

    async fn get_average_amount(
        &self,
        account_id: Uuid,
        direction: Direction,
    ) -> RepositoryResult<Option<BigDecimal>>;

    /// Distinct counterparty identities (IBAN, else name) seen on the account's
    /// other transactions.
    async fn get_known_counterparties(
        &self,
        account_id: Uuid,
        exclude_transaction: Uuid,
    ) -> RepositoryResult<Vec<String>>;

    /// Most recent booking date strictly before `before`.
    async fn get_last_activity_date(
        &self,
        account_id: Uuid,
        before: DateTime<Utc>,
    ) -> RepositoryResult<Option<DateTime<Utc>>>;

    /// Replaces score and flags; never appends to a previous pass.
    async fn update_transaction_analysis(
        &self,
        transaction_id: Uuid,
        score: u32,
        flags: &[TransactionFlag],
    ) -> RepositoryResult<()>;

    /// Account transactions written since `since` or never analyzed.
    async fn list_transactions_to_analyze(
        &self,
        account_id: Uuid,
        since: DateTime<Utc>,
    ) -> RepositoryResult<Vec<Transaction>>;
}

#[async_trait]
pub trait AlertRepository: Send + Sync {
    async fn create_alert(&self, alert: &NewAlert) -> RepositoryResult<BankingAlert>;
}

#[async_trait]
pub trait RuleRepository: Send + Sync {
    /// Rules owned by the tenant plus global rules, enabled or not.
    async fn list_rules(&self, tenant_id: &str) -> RepositoryResult<Vec<AnomalyRule>>;
}

/// Everything the sync orchestrator needs from persistence.
pub trait SyncStore: ConnectionRepository + TransactionRepository {}

impl<T: ConnectionRepository + TransactionRepository> SyncStore for T {}

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Provider rejected credentials: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Rate limited by provider: {0}")]
    RateLimited(String),

    #[error("Provider returned {status}: {body}")]
    Server { status: u16, body: String },

    #[error("Invalid response from provider: {0}")]
    InvalidResponse(String),

    #[error("Circuit breaker open: {0}")]
    CircuitBreakerOpen(String),

    #[error("Provider call timed out: {0}")]
    Timeout(String),
}

impl ProviderError {
    /// Worth retrying at the call site with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Request(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            ProviderError::RateLimited(_) | ProviderError::Timeout(_) => true,
            ProviderError::Server { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Open-banking provider capability. Token lifecycle stays behind this trait.
#[async_trait]
pub trait ProviderGateway: Send + Sync {
    async fn get_requisition(&self, id: &str) -> Result<Requisition, ProviderError>;

    async fn get_account(&self, id: &str) -> Result<ProviderAccount, ProviderError>;

    async fn get_account_details(&self, id: &str) -> Result<AccountDetailsResponse, ProviderError>;

    async fn get_account_balances(&self, id: &str) -> Result<BalancesResponse, ProviderError>;

    async fn get_account_transactions(
        &self,
        id: &str,
        date_from: NaiveDate,
        date_to: NaiveDate,
    ) -> Result<TransactionsResponse, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_transient_client_errors_are_not() {
        let server = ProviderError::Server {
            status: 503,
            body: "unavailable".to_string(),
        };
        assert!(server.is_transient());

        let client = ProviderError::Server {
            status: 400,
            body: "bad".to_string(),
        };
        assert!(!client.is_transient());

        assert!(ProviderError::RateLimited("slow down".to_string()).is_transient());
        assert!(!ProviderError::Unauthorized("expired".to_string()).is_transient());
        assert!(!ProviderError::NotFound("acc".to_string()).is_transient());
    }
}
