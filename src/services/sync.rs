//! Incremental per-connection synchronization against the open-banking provider.
//!
//! A connection sync first discovers provider accounts the store does not know
//! yet and persists them, then syncs every account with a bounded number of
//! workers. Failures below the connection level are collected into the
//! account's [`SyncResult`] instead of being raised.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::{
    AccountType, BankAccount, BankConnection, ConnectionStatus, TransactionStatus,
};
use crate::ports::{
    ProviderError, ProviderGateway, RepositoryError, SyncStore, UpsertKind,
};
use crate::provider::types::RawTransaction;
use crate::services::mapper::TransactionMapper;

const DEFAULT_CURRENCY: &str = "EUR";

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Accounts synced concurrently within one connection.
    pub concurrency: usize,
    /// Cold-start window for accounts with no stored transaction.
    pub lookback_days: i64,
    pub account_timeout: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            lookback_days: 90,
            account_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub account_id: Uuid,
    pub new_transactions: u32,
    pub updated_transactions: u32,
    pub errors: Vec<String>,
    pub synced_at: DateTime<Utc>,
}

impl SyncResult {
    fn new(account_id: Uuid) -> Self {
        Self {
            account_id,
            new_transactions: 0,
            updated_transactions: 0,
            errors: Vec::new(),
            synced_at: Utc::now(),
        }
    }

    /// Part of the account could not be synced.
    pub fn is_degraded(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Nothing new, nothing changed and nothing failed.
    pub fn is_up_to_date(&self) -> bool {
        self.new_transactions == 0 && self.updated_transactions == 0 && self.errors.is_empty()
    }
}

/// Conditions that abort a whole connection sync.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Bank connection {0} not found")]
    ConnectionNotFound(Uuid),

    #[error("Bank connection {id} is {}, expected linked", .status.as_str())]
    ConnectionNotLinked { id: Uuid, status: ConnectionStatus },

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

#[derive(Error, Debug)]
enum AccountSyncError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("lookback of {0} day(s) is out of range")]
    InvalidLookback(i64),
}

pub struct SyncService {
    store: Arc<dyn SyncStore>,
    provider: Arc<dyn ProviderGateway>,
    mapper: TransactionMapper,
    options: SyncOptions,
}

impl SyncService {
    pub fn new(
        store: Arc<dyn SyncStore>,
        provider: Arc<dyn ProviderGateway>,
        options: SyncOptions,
    ) -> Self {
        Self {
            store,
            provider,
            mapper: TransactionMapper::default(),
            options,
        }
    }

    pub fn with_mapper(mut self, mapper: TransactionMapper) -> Self {
        self.mapper = mapper;
        self
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    pub async fn linked_connections(&self) -> Result<Vec<BankConnection>, SyncError> {
        Ok(self.store.list_linked_connections().await?)
    }

    pub async fn sync_connection(&self, connection_id: Uuid) -> Result<Vec<SyncResult>, SyncError> {
        let (_keep_open, cancel) = watch::channel(false);
        self.sync_connection_with_cancel(connection_id, cancel).await
    }

    /// Syncs every account of a linked connection. Flipping `cancel` to true
    /// stops new accounts from starting and abandons in-flight ones; the
    /// results already completed are still returned.
    pub async fn sync_connection_with_cancel(
        &self,
        connection_id: Uuid,
        cancel: watch::Receiver<bool>,
    ) -> Result<Vec<SyncResult>, SyncError> {
        let connection = self
            .store
            .get_connection(connection_id)
            .await?
            .ok_or(SyncError::ConnectionNotFound(connection_id))?;

        if connection.status != ConnectionStatus::Linked {
            return Err(SyncError::ConnectionNotLinked {
                id: connection_id,
                status: connection.status,
            });
        }

        info!(connection_id = %connection_id, known_accounts = connection.accounts.len(), "Starting connection sync");

        let mut accounts = connection.accounts.clone();
        accounts.extend(self.discover_accounts(&connection).await);

        let concurrency = self.options.concurrency.max(1);
        let account_count = accounts.len();
        let mut completed: Vec<(usize, SyncResult)> = stream::iter(accounts.into_iter().enumerate())
            .map(|(index, account)| {
                let cancel = cancel.clone();
                async move {
                    let cancelled = *cancel.borrow();
                    if cancelled {
                        return None;
                    }
                    tokio::select! {
                        result = self.sync_account_with_timeout(&account) => Some((index, result)),
                        _ = cancelled_signal(cancel) => {
                            warn!(account_id = %account.id, "Account sync cancelled");
                            None
                        }
                    }
                }
            })
            .buffer_unordered(concurrency)
            .filter_map(|outcome| async move { outcome })
            .collect()
            .await;
        completed.sort_by_key(|(index, _)| *index);
        let results: Vec<SyncResult> = completed.into_iter().map(|(_, result)| result).collect();

        if let Err(e) = self
            .store
            .update_connection_sync_time(connection_id, Utc::now())
            .await
        {
            warn!(connection_id = %connection_id, error = %e, "Failed to stamp connection sync time");
        }

        info!(
            connection_id = %connection_id,
            accounts = account_count,
            synced = results.len(),
            degraded = results.iter().filter(|r| r.is_degraded()).count(),
            "Connection sync finished"
        );
        Ok(results)
    }

    /// Persists provider accounts the connection does not know yet and returns them.
    /// A failing requisition or account lookup leaves that account for the next run.
    pub async fn discover_accounts(&self, connection: &BankConnection) -> Vec<BankAccount> {
        let requisition = match self.provider.get_requisition(&connection.requisition_id).await {
            Ok(requisition) => requisition,
            Err(e) => {
                warn!(
                    connection_id = %connection.id,
                    error = %e,
                    "Requisition lookup failed, syncing known accounts only"
                );
                return Vec::new();
            }
        };

        let mut discovered: Vec<BankAccount> = Vec::new();
        for external_id in &requisition.accounts {
            if connection.knows_account(external_id)
                || discovered.iter().any(|a| &a.external_id == external_id)
            {
                continue;
            }
            match self.discover_account(connection.id, external_id).await {
                Ok(account) => {
                    info!(
                        connection_id = %connection.id,
                        account_id = %account.id,
                        external_id = %external_id,
                        "Discovered new bank account"
                    );
                    discovered.push(account);
                }
                Err(e) => warn!(
                    connection_id = %connection.id,
                    external_id = %external_id,
                    error = %e,
                    "Account discovery failed"
                ),
            }
        }
        discovered
    }

    async fn discover_account(
        &self,
        connection_id: Uuid,
        external_id: &str,
    ) -> Result<BankAccount, AccountSyncError> {
        let summary = self.provider.get_account(external_id).await?;
        let details = self.provider.get_account_details(external_id).await?.account;
        let balances = self.provider.get_account_balances(external_id).await?;

        let current = balances.current();
        let balance = current.and_then(|b| BigDecimal::from_str(b.balance_amount.amount.trim()).ok());
        let currency = details
            .currency
            .clone()
            .or_else(|| current.map(|b| b.balance_amount.currency.clone()))
            .unwrap_or_else(|| DEFAULT_CURRENCY.to_string());

        let account = BankAccount {
            id: Uuid::new_v4(),
            connection_id,
            external_id: external_id.to_string(),
            iban: details.iban.or(summary.iban),
            owner_name: details.owner_name.or(summary.owner_name),
            currency,
            account_type: AccountType::from_cash_account_type(details.cash_account_type.as_deref()),
            balance_updated_at: balance.as_ref().map(|_| Utc::now()),
            balance,
            status: summary.status.unwrap_or_else(|| "ready".to_string()),
        };

        Ok(self.store.save_account(&account).await?)
    }

    async fn sync_account_with_timeout(&self, account: &BankAccount) -> SyncResult {
        match timeout(self.options.account_timeout, self.sync_account(account)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(account_id = %account.id, "Account sync timed out");
                let mut result = SyncResult::new(account.id);
                result
                    .errors
                    .push(format!("sync timed out after {:?}", self.options.account_timeout));
                result
            }
        }
    }

    /// Fetches the account's window, upserts every row and refreshes the balance.
    /// Never fails: problems end up in the result's error list.
    pub async fn sync_account(&self, account: &BankAccount) -> SyncResult {
        let mut result = SyncResult::new(account.id);

        if let Err(e) = self.sync_account_window(account, &mut result).await {
            warn!(account_id = %account.id, error = %e, "Account sync failed");
            result.errors.push(e.to_string());
        }

        result.synced_at = Utc::now();
        info!(
            account_id = %account.id,
            new = result.new_transactions,
            updated = result.updated_transactions,
            errors = result.errors.len(),
            "Account synced"
        );
        result
    }

    async fn sync_account_window(
        &self,
        account: &BankAccount,
        result: &mut SyncResult,
    ) -> Result<(), AccountSyncError> {
        let now = Utc::now();
        let window_start = match self.store.get_last_transaction(account.id).await? {
            Some(last) => last.booking_date,
            None => lookback_start(now, self.options.lookback_days)
                .ok_or(AccountSyncError::InvalidLookback(self.options.lookback_days))?,
        };

        let response = self
            .provider
            .get_account_transactions(
                &account.external_id,
                window_start.date_naive(),
                now.date_naive(),
            )
            .await?;
        let buckets = response.transactions;

        for raw in &buckets.booked {
            match self.upsert_row(raw, account.id, TransactionStatus::Booked).await {
                Ok(UpsertKind::Created) => result.new_transactions += 1,
                Ok(UpsertKind::Updated) => result.updated_transactions += 1,
                Ok(UpsertKind::Unchanged) => {}
                Err(e) => result.errors.push(e),
            }
        }

        // Pending rows are superseded later by the booked row carrying the same id.
        for raw in &buckets.pending {
            match self.upsert_row(raw, account.id, TransactionStatus::Pending).await {
                Ok(UpsertKind::Created) | Ok(UpsertKind::Updated) => result.new_transactions += 1,
                Ok(UpsertKind::Unchanged) => {}
                Err(e) => result.errors.push(e),
            }
        }

        let balances = self.provider.get_account_balances(&account.external_id).await?;
        if let Some(current) = balances.current() {
            match BigDecimal::from_str(current.balance_amount.amount.trim()) {
                Ok(amount) => {
                    self.store
                        .update_account_balance(account.id, &amount, Utc::now())
                        .await?
                }
                Err(_) => result.errors.push(format!(
                    "invalid balance amount '{}'",
                    current.balance_amount.amount
                )),
            }
        }

        Ok(())
    }

    async fn upsert_row(
        &self,
        raw: &RawTransaction,
        account_id: Uuid,
        status: TransactionStatus,
    ) -> Result<UpsertKind, String> {
        let mapped = self
            .mapper
            .map(raw, account_id, status)
            .map_err(|e| e.to_string())?;
        let outcome = self
            .store
            .upsert_transaction(&mapped)
            .await
            .map_err(|e| format!("transaction {}: {}", mapped.external_id, e))?;
        Ok(outcome.kind)
    }
}

/// Cold-start window start, `None` when the lookback is not a positive
/// number of days that fits before `now`.
fn lookback_start(now: DateTime<Utc>, lookback_days: i64) -> Option<DateTime<Utc>> {
    if lookback_days < 1 {
        return None;
    }
    chrono::Duration::try_days(lookback_days).and_then(|window| now.checked_sub_signed(window))
}

/// Resolves once cancellation is requested; never resolves if the sender is gone.
async fn cancelled_signal(mut cancel: watch::Receiver<bool>) {
    if cancel.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}
