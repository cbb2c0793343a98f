//! In-memory implementation of every repository port.
//! Backs dry runs from the CLI and the integration tests.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::{
    AnomalyRule, BankAccount, BankConnection, BankingAlert, Direction, NewAlert, NewTransaction,
    Transaction, TransactionFlag,
};
use crate::ports::{
    AlertRepository, ConnectionRepository, RepositoryError, RepositoryResult, RuleRepository,
    TransactionRepository, UpsertKind, UpsertOutcome,
};

#[derive(Default)]
pub struct InMemoryStore {
    connections: RwLock<HashMap<Uuid, BankConnection>>,
    accounts: RwLock<Vec<BankAccount>>,
    transactions: RwLock<Vec<Transaction>>,
    alerts: RwLock<Vec<BankingAlert>>,
    rules: RwLock<Vec<AnomalyRule>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_connection(&self, connection: BankConnection) {
        let mut accounts = self.accounts.write().await;
        for account in &connection.accounts {
            if !accounts.iter().any(|a| a.id == account.id) {
                accounts.push(account.clone());
            }
        }
        self.connections.write().await.insert(connection.id, connection);
    }

    /// Seeds an already-persisted transaction, bypassing the upsert path.
    pub async fn insert_transaction(&self, tx: Transaction) {
        self.transactions.write().await.push(tx);
    }

    pub async fn add_rule(&self, rule: AnomalyRule) {
        self.rules.write().await.push(rule);
    }

    pub async fn transactions(&self) -> Vec<Transaction> {
        self.transactions.read().await.clone()
    }

    pub async fn transaction(&self, id: Uuid) -> Option<Transaction> {
        self.transactions.read().await.iter().find(|t| t.id == id).cloned()
    }

    pub async fn accounts(&self) -> Vec<BankAccount> {
        self.accounts.read().await.clone()
    }

    pub async fn alerts(&self) -> Vec<BankingAlert> {
        self.alerts.read().await.clone()
    }
}

#[async_trait]
impl ConnectionRepository for InMemoryStore {
    async fn get_connection(&self, id: Uuid) -> RepositoryResult<Option<BankConnection>> {
        let connection = self.connections.read().await.get(&id).cloned();
        match connection {
            Some(mut connection) => {
                connection.accounts = self.get_accounts_by_connection(id).await?;
                Ok(Some(connection))
            }
            None => Ok(None),
        }
    }

    async fn list_linked_connections(&self) -> RepositoryResult<Vec<BankConnection>> {
        let ids: Vec<Uuid> = self
            .connections
            .read()
            .await
            .values()
            .filter(|c| c.status == crate::domain::ConnectionStatus::Linked)
            .map(|c| c.id)
            .collect();

        let mut linked = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(connection) = self.get_connection(id).await? {
                linked.push(connection);
            }
        }
        Ok(linked)
    }

    async fn get_accounts_by_connection(
        &self,
        connection_id: Uuid,
    ) -> RepositoryResult<Vec<BankAccount>> {
        Ok(self
            .accounts
            .read()
            .await
            .iter()
            .filter(|a| a.connection_id == connection_id)
            .cloned()
            .collect())
    }

    async fn save_account(&self, account: &BankAccount) -> RepositoryResult<BankAccount> {
        let mut accounts = self.accounts.write().await;
        if let Some(existing) = accounts.iter().find(|a| {
            a.connection_id == account.connection_id && a.external_id == account.external_id
        }) {
            return Ok(existing.clone());
        }
        accounts.push(account.clone());
        Ok(account.clone())
    }

    async fn update_account_balance(
        &self,
        account_id: Uuid,
        balance: &BigDecimal,
        at: DateTime<Utc>,
    ) -> RepositoryResult<()> {
        let mut accounts = self.accounts.write().await;
        let account = accounts
            .iter_mut()
            .find(|a| a.id == account_id)
            .ok_or_else(|| RepositoryError::NotFound(account_id.to_string()))?;
        account.balance = Some(balance.clone());
        account.balance_updated_at = Some(at);
        Ok(())
    }

    async fn update_connection_sync_time(
        &self,
        connection_id: Uuid,
        at: DateTime<Utc>,
    ) -> RepositoryResult<()> {
        let mut connections = self.connections.write().await;
        let connection = connections
            .get_mut(&connection_id)
            .ok_or_else(|| RepositoryError::NotFound(connection_id.to_string()))?;
        connection.last_synced_at = Some(at);
        Ok(())
    }
}

#[async_trait]
impl TransactionRepository for InMemoryStore {
    async fn get_last_transaction(&self, account_id: Uuid) -> RepositoryResult<Option<Transaction>> {
        Ok(self
            .transactions
            .read()
            .await
            .iter()
            .filter(|t| t.account_id == account_id)
            .max_by_key(|t| t.booking_date)
            .cloned())
    }

    async fn upsert_transaction(&self, tx: &NewTransaction) -> RepositoryResult<UpsertOutcome> {
        let now = Utc::now();
        let mut transactions = self.transactions.write().await;

        if let Some(existing) = transactions
            .iter_mut()
            .find(|t| t.account_id == tx.account_id && t.external_id == tx.external_id)
        {
            let kind = if existing.apply_update(tx.clone(), now) {
                UpsertKind::Updated
            } else {
                UpsertKind::Unchanged
            };
            return Ok(UpsertOutcome {
                transaction: existing.clone(),
                kind,
            });
        }

        let created = Transaction::from_new(tx.clone(), Uuid::new_v4(), now);
        transactions.push(created.clone());
        Ok(UpsertOutcome {
            transaction: created,
            kind: UpsertKind::Created,
        })
    }

    async fn get_transactions_by_account(
        &self,
        account_id: Uuid,
        days: i64,
    ) -> RepositoryResult<Vec<Transaction>> {
        let since = Duration::try_days(days)
            .and_then(|window| Utc::now().checked_sub_signed(window))
            .ok_or_else(|| {
                RepositoryError::InvalidArgument(format!("day window {} is out of range", days))
            })?;
        let mut rows: Vec<Transaction> = self
            .transactions
            .read()
            .await
            .iter()
            .filter(|t| t.account_id == account_id && t.booking_date >= since)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.booking_date.cmp(&a.booking_date));
        Ok(rows)
    }

    async fn get_average_amount(
        &self,
        account_id: Uuid,
        direction: Direction,
    ) -> RepositoryResult<Option<BigDecimal>> {
        let transactions = self.transactions.read().await;
        let amounts: Vec<&BigDecimal> = transactions
            .iter()
            .filter(|t| t.account_id == account_id && t.direction == direction)
            .map(|t| &t.amount)
            .collect();
        if amounts.is_empty() {
            return Ok(None);
        }
        let total = amounts
            .iter()
            .fold(BigDecimal::from(0), |acc, amount| acc + *amount);
        Ok(Some(total / BigDecimal::from(amounts.len() as i64)))
    }

    async fn get_known_counterparties(
        &self,
        account_id: Uuid,
        exclude_transaction: Uuid,
    ) -> RepositoryResult<Vec<String>> {
        let transactions = self.transactions.read().await;
        let known: BTreeSet<String> = transactions
            .iter()
            .filter(|t| t.account_id == account_id && t.id != exclude_transaction)
            .filter_map(|t| t.counterparty_key().map(str::to_string))
            .collect();
        Ok(known.into_iter().collect())
    }

    async fn get_last_activity_date(
        &self,
        account_id: Uuid,
        before: DateTime<Utc>,
    ) -> RepositoryResult<Option<DateTime<Utc>>> {
        Ok(self
            .transactions
            .read()
            .await
            .iter()
            .filter(|t| t.account_id == account_id && t.booking_date < before)
            .map(|t| t.booking_date)
            .max())
    }

    async fn update_transaction_analysis(
        &self,
        transaction_id: Uuid,
        score: u32,
        flags: &[TransactionFlag],
    ) -> RepositoryResult<()> {
        let mut transactions = self.transactions.write().await;
        let tx = transactions
            .iter_mut()
            .find(|t| t.id == transaction_id)
            .ok_or_else(|| RepositoryError::NotFound(transaction_id.to_string()))?;
        tx.anomaly_score = Some(score);
        tx.flags = flags.to_vec();
        Ok(())
    }

    async fn list_transactions_to_analyze(
        &self,
        account_id: Uuid,
        since: DateTime<Utc>,
    ) -> RepositoryResult<Vec<Transaction>> {
        Ok(self
            .transactions
            .read()
            .await
            .iter()
            .filter(|t| {
                t.account_id == account_id && (t.updated_at >= since || t.anomaly_score.is_none())
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AlertRepository for InMemoryStore {
    async fn create_alert(&self, alert: &NewAlert) -> RepositoryResult<BankingAlert> {
        let created = BankingAlert::open(alert.clone(), Uuid::new_v4(), Utc::now());
        self.alerts.write().await.push(created.clone());
        Ok(created)
    }
}

#[async_trait]
impl RuleRepository for InMemoryStore {
    async fn list_rules(&self, tenant_id: &str) -> RepositoryResult<Vec<AnomalyRule>> {
        Ok(self
            .rules
            .read()
            .await
            .iter()
            .filter(|r| r.tenant_id.as_deref().map_or(true, |owner| owner == tenant_id))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TransactionMetadata, TransactionStatus};
    use chrono::TimeZone;
    use std::str::FromStr;

    fn new_tx(account_id: Uuid, external_id: &str, amount: &str) -> NewTransaction {
        let day = (Utc::now() - Duration::days(1)).date_naive();
        let when = Utc.from_utc_datetime(&day.and_hms_opt(12, 0, 0).unwrap());
        NewTransaction {
            account_id,
            external_id: external_id.to_string(),
            amount: BigDecimal::from_str(amount).unwrap(),
            currency: "EUR".to_string(),
            direction: Direction::Debit,
            status: TransactionStatus::Booked,
            booking_date: when,
            value_date: when,
            description: "Achat".to_string(),
            merchant_name: None,
            merchant_category: None,
            counterparty_name: Some("Boulangerie".to_string()),
            counterparty_iban: None,
            reference: None,
            category: None,
            metadata: TransactionMetadata::default(),
        }
    }

    #[tokio::test]
    async fn upsert_reports_created_updated_unchanged() {
        let store = InMemoryStore::new();
        let account = Uuid::new_v4();

        let first = store.upsert_transaction(&new_tx(account, "t1", "10.00")).await.unwrap();
        assert_eq!(first.kind, UpsertKind::Created);

        let again = store.upsert_transaction(&new_tx(account, "t1", "10.00")).await.unwrap();
        assert_eq!(again.kind, UpsertKind::Unchanged);
        assert_eq!(again.transaction.id, first.transaction.id);

        let changed = store.upsert_transaction(&new_tx(account, "t1", "12.50")).await.unwrap();
        assert_eq!(changed.kind, UpsertKind::Updated);
        assert_eq!(store.transactions().await.len(), 1);
    }

    #[tokio::test]
    async fn changed_upsert_puts_the_row_back_in_the_analysis_queue() {
        let store = InMemoryStore::new();
        let account = Uuid::new_v4();
        let first = store.upsert_transaction(&new_tx(account, "t1", "10.00")).await.unwrap();
        store
            .update_transaction_analysis(first.transaction.id, 20, &[])
            .await
            .unwrap();
        let future = Utc::now() + Duration::hours(1);
        assert!(store.list_transactions_to_analyze(account, future).await.unwrap().is_empty());

        store.upsert_transaction(&new_tx(account, "t1", "10.00")).await.unwrap();
        assert!(store.list_transactions_to_analyze(account, future).await.unwrap().is_empty());

        store.upsert_transaction(&new_tx(account, "t1", "12.50")).await.unwrap();
        let pending = store.list_transactions_to_analyze(account, future).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].anomaly_score, None);
    }

    #[tokio::test]
    async fn out_of_range_day_window_is_an_invalid_argument() {
        let store = InMemoryStore::new();
        let result = store.get_transactions_by_account(Uuid::new_v4(), i64::MAX).await;
        assert!(matches!(result, Err(RepositoryError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn same_external_id_on_other_account_is_distinct() {
        let store = InMemoryStore::new();
        store.upsert_transaction(&new_tx(Uuid::new_v4(), "t1", "10")).await.unwrap();
        store.upsert_transaction(&new_tx(Uuid::new_v4(), "t1", "10")).await.unwrap();
        assert_eq!(store.transactions().await.len(), 2);
    }

    #[tokio::test]
    async fn known_counterparties_exclude_the_given_transaction() {
        let store = InMemoryStore::new();
        let account = Uuid::new_v4();
        let only = store.upsert_transaction(&new_tx(account, "t1", "10")).await.unwrap();

        let known = store
            .get_known_counterparties(account, only.transaction.id)
            .await
            .unwrap();
        assert!(known.is_empty());

        store.upsert_transaction(&new_tx(account, "t2", "11")).await.unwrap();
        let known = store
            .get_known_counterparties(account, only.transaction.id)
            .await
            .unwrap();
        assert_eq!(known, vec!["Boulangerie".to_string()]);
    }

    #[tokio::test]
    async fn average_amount_by_direction() {
        let store = InMemoryStore::new();
        let account = Uuid::new_v4();
        store.upsert_transaction(&new_tx(account, "t1", "10")).await.unwrap();
        store.upsert_transaction(&new_tx(account, "t2", "30")).await.unwrap();

        let debit = store.get_average_amount(account, Direction::Debit).await.unwrap();
        assert_eq!(debit, Some(BigDecimal::from(20)));
        let credit = store.get_average_amount(account, Direction::Credit).await.unwrap();
        assert_eq!(credit, None);
    }
}
