//! Postgres implementation of the repository ports.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::domain::{
    AnomalyRule, BankAccount, BankConnection, BankingAlert, Direction, NewAlert, NewTransaction,
    Transaction, TransactionFlag, TransactionMetadata,
};
use crate::ports::{
    AlertRepository, ConnectionRepository, RepositoryError, RepositoryResult, RuleRepository,
    TransactionRepository, UpsertKind, UpsertOutcome,
};

/// Postgres-backed banking store.
#[derive(Clone)]
pub struct PgBankingStore {
    pool: PgPool,
}

impl PgBankingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

const TRANSACTION_COLUMNS: &str = r#"
    id, account_id, external_id, amount, currency, direction, status,
    booking_date, value_date, description, merchant_name, merchant_category,
    counterparty_name, counterparty_iban, reference, category, metadata,
    anomaly_score, flags, created_at, updated_at
"#;

#[async_trait]
impl ConnectionRepository for PgBankingStore {
    async fn get_connection(&self, id: Uuid) -> RepositoryResult<Option<BankConnection>> {
        let row = sqlx::query_as::<_, ConnectionRow>(
            "SELECT id, tenant_id, requisition_id, status, last_synced_at FROM bank_connections WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let accounts = self.get_accounts_by_connection(id).await?;
                Ok(Some(row.into_domain(accounts)?))
            }
            None => Ok(None),
        }
    }

    async fn list_linked_connections(&self) -> RepositoryResult<Vec<BankConnection>> {
        let rows = sqlx::query_as::<_, ConnectionRow>(
            r#"
            SELECT id, tenant_id, requisition_id, status, last_synced_at
            FROM bank_connections
            WHERE status = 'linked'
            ORDER BY last_synced_at ASC NULLS FIRST
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut connections = Vec::with_capacity(rows.len());
        for row in rows {
            let accounts = self.get_accounts_by_connection(row.id).await?;
            connections.push(row.into_domain(accounts)?);
        }
        Ok(connections)
    }

    async fn get_accounts_by_connection(
        &self,
        connection_id: Uuid,
    ) -> RepositoryResult<Vec<BankAccount>> {
        let rows = sqlx::query_as::<_, AccountRow>(
            "SELECT * FROM bank_accounts WHERE connection_id = $1 ORDER BY external_id",
        )
        .bind(connection_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(AccountRow::into_domain).collect()
    }

    async fn save_account(&self, account: &BankAccount) -> RepositoryResult<BankAccount> {
        let row = sqlx::query_as::<_, AccountRow>(
            r#"
            INSERT INTO bank_accounts (
                id, connection_id, external_id, iban, owner_name, currency,
                account_type, balance, balance_updated_at, status
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (connection_id, external_id) DO UPDATE SET
                iban = COALESCE(EXCLUDED.iban, bank_accounts.iban),
                owner_name = COALESCE(EXCLUDED.owner_name, bank_accounts.owner_name)
            RETURNING *
            "#,
        )
        .bind(account.id)
        .bind(account.connection_id)
        .bind(&account.external_id)
        .bind(&account.iban)
        .bind(&account.owner_name)
        .bind(&account.currency)
        .bind(account.account_type.as_str())
        .bind(&account.balance)
        .bind(account.balance_updated_at)
        .bind(&account.status)
        .fetch_one(&self.pool)
        .await?;

        row.into_domain()
    }

    async fn update_account_balance(
        &self,
        account_id: Uuid,
        balance: &BigDecimal,
        at: DateTime<Utc>,
    ) -> RepositoryResult<()> {
        let result = sqlx::query(
            "UPDATE bank_accounts SET balance = $2, balance_updated_at = $3 WHERE id = $1",
        )
        .bind(account_id)
        .bind(balance)
        .bind(at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(account_id.to_string()));
        }
        Ok(())
    }

    async fn update_connection_sync_time(
        &self,
        connection_id: Uuid,
        at: DateTime<Utc>,
    ) -> RepositoryResult<()> {
        let result = sqlx::query(
            "UPDATE bank_connections SET last_synced_at = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(connection_id)
        .bind(at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(connection_id.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl TransactionRepository for PgBankingStore {
    async fn get_last_transaction(&self, account_id: Uuid) -> RepositoryResult<Option<Transaction>> {
        let row = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {} FROM bank_transactions WHERE account_id = $1 ORDER BY booking_date DESC LIMIT 1",
            TRANSACTION_COLUMNS
        ))
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TransactionRow::into_domain).transpose()
    }

    async fn upsert_transaction(&self, tx: &NewTransaction) -> RepositoryResult<UpsertOutcome> {
        let metadata = serde_json::to_value(&tx.metadata)
            .map_err(|e| RepositoryError::Corrupt(e.to_string()))?;

        // The WHERE clause suppresses no-op updates, so an unchanged row
        // returns nothing and is read back separately.
        let upserted = sqlx::query_as::<_, UpsertRow>(&format!(
            r#"
            INSERT INTO bank_transactions (
                id, account_id, external_id, amount, currency, direction, status,
                booking_date, value_date, description, merchant_name, merchant_category,
                counterparty_name, counterparty_iban, reference, category, metadata
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ON CONFLICT (account_id, external_id) DO UPDATE SET
                amount = EXCLUDED.amount,
                currency = EXCLUDED.currency,
                direction = EXCLUDED.direction,
                status = EXCLUDED.status,
                booking_date = EXCLUDED.booking_date,
                value_date = EXCLUDED.value_date,
                description = EXCLUDED.description,
                merchant_name = EXCLUDED.merchant_name,
                merchant_category = EXCLUDED.merchant_category,
                counterparty_name = EXCLUDED.counterparty_name,
                counterparty_iban = EXCLUDED.counterparty_iban,
                reference = EXCLUDED.reference,
                category = EXCLUDED.category,
                metadata = EXCLUDED.metadata,
                anomaly_score = NULL,
                updated_at = NOW()
            WHERE (
                bank_transactions.amount, bank_transactions.currency, bank_transactions.direction,
                bank_transactions.status, bank_transactions.booking_date, bank_transactions.value_date,
                bank_transactions.description, bank_transactions.merchant_name,
                bank_transactions.merchant_category, bank_transactions.counterparty_name,
                bank_transactions.counterparty_iban, bank_transactions.reference,
                bank_transactions.category, bank_transactions.metadata
            ) IS DISTINCT FROM (
                EXCLUDED.amount, EXCLUDED.currency, EXCLUDED.direction,
                EXCLUDED.status, EXCLUDED.booking_date, EXCLUDED.value_date,
                EXCLUDED.description, EXCLUDED.merchant_name,
                EXCLUDED.merchant_category, EXCLUDED.counterparty_name,
                EXCLUDED.counterparty_iban, EXCLUDED.reference,
                EXCLUDED.category, EXCLUDED.metadata
            )
            RETURNING {}, (xmax = 0) AS inserted
            "#,
            TRANSACTION_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(tx.account_id)
        .bind(&tx.external_id)
        .bind(&tx.amount)
        .bind(&tx.currency)
        .bind(tx.direction.as_str())
        .bind(tx.status.as_str())
        .bind(tx.booking_date)
        .bind(tx.value_date)
        .bind(&tx.description)
        .bind(&tx.merchant_name)
        .bind(&tx.merchant_category)
        .bind(&tx.counterparty_name)
        .bind(&tx.counterparty_iban)
        .bind(&tx.reference)
        .bind(&tx.category)
        .bind(metadata)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = upserted {
            let kind = if row.inserted {
                UpsertKind::Created
            } else {
                UpsertKind::Updated
            };
            return Ok(UpsertOutcome {
                transaction: row.transaction.into_domain()?,
                kind,
            });
        }

        let existing = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {} FROM bank_transactions WHERE account_id = $1 AND external_id = $2",
            TRANSACTION_COLUMNS
        ))
        .bind(tx.account_id)
        .bind(&tx.external_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(UpsertOutcome {
            transaction: existing.into_domain()?,
            kind: UpsertKind::Unchanged,
        })
    }

    async fn get_transactions_by_account(
        &self,
        account_id: Uuid,
        days: i64,
    ) -> RepositoryResult<Vec<Transaction>> {
        let days = days_param(days)?;
        let rows = sqlx::query_as::<_, TransactionRow>(&format!(
            r#"
            SELECT {} FROM bank_transactions
            WHERE account_id = $1 AND booking_date >= NOW() - make_interval(days => $2)
            ORDER BY booking_date DESC
            "#,
            TRANSACTION_COLUMNS
        ))
        .bind(account_id)
        .bind(days)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TransactionRow::into_domain).collect()
    }

    async fn get_average_amount(
        &self,
        account_id: Uuid,
        direction: Direction,
    ) -> RepositoryResult<Option<BigDecimal>> {
        let average: Option<BigDecimal> = sqlx::query_scalar(
            "SELECT AVG(amount) FROM bank_transactions WHERE account_id = $1 AND direction = $2",
        )
        .bind(account_id)
        .bind(direction.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(average)
    }

    async fn get_known_counterparties(
        &self,
        account_id: Uuid,
        exclude_transaction: Uuid,
    ) -> RepositoryResult<Vec<String>> {
        let known: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT COALESCE(NULLIF(TRIM(counterparty_iban), ''), NULLIF(TRIM(counterparty_name), '')) AS key
            FROM bank_transactions
            WHERE account_id = $1
              AND id <> $2
              AND COALESCE(NULLIF(TRIM(counterparty_iban), ''), NULLIF(TRIM(counterparty_name), '')) IS NOT NULL
            "#,
        )
        .bind(account_id)
        .bind(exclude_transaction)
        .fetch_all(&self.pool)
        .await?;

        Ok(known)
    }

    async fn get_last_activity_date(
        &self,
        account_id: Uuid,
        before: DateTime<Utc>,
    ) -> RepositoryResult<Option<DateTime<Utc>>> {
        let last: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT MAX(booking_date) FROM bank_transactions WHERE account_id = $1 AND booking_date < $2",
        )
        .bind(account_id)
        .bind(before)
        .fetch_one(&self.pool)
        .await?;

        Ok(last)
    }

    async fn update_transaction_analysis(
        &self,
        transaction_id: Uuid,
        score: u32,
        flags: &[TransactionFlag],
    ) -> RepositoryResult<()> {
        let flags = serde_json::to_value(flags).map_err(|e| RepositoryError::Corrupt(e.to_string()))?;
        let result = sqlx::query(
            "UPDATE bank_transactions SET anomaly_score = $2, flags = $3 WHERE id = $1",
        )
        .bind(transaction_id)
        .bind(score as i32)
        .bind(flags)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(transaction_id.to_string()));
        }
        Ok(())
    }

    async fn list_transactions_to_analyze(
        &self,
        account_id: Uuid,
        since: DateTime<Utc>,
    ) -> RepositoryResult<Vec<Transaction>> {
        let rows = sqlx::query_as::<_, TransactionRow>(&format!(
            r#"
            SELECT {} FROM bank_transactions
            WHERE account_id = $1 AND (updated_at >= $2 OR anomaly_score IS NULL)
            ORDER BY booking_date
            "#,
            TRANSACTION_COLUMNS
        ))
        .bind(account_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TransactionRow::into_domain).collect()
    }
}

#[async_trait]
impl AlertRepository for PgBankingStore {
    async fn create_alert(&self, alert: &NewAlert) -> RepositoryResult<BankingAlert> {
        let row = sqlx::query_as::<_, AlertRow>(
            r#"
            INSERT INTO banking_alerts (
                id, tenant_id, transaction_id, account_id, type, severity, title, description, status
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'open')
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&alert.tenant_id)
        .bind(alert.transaction_id)
        .bind(alert.account_id)
        .bind(alert.alert_type.as_str())
        .bind(alert.severity.as_str())
        .bind(&alert.title)
        .bind(&alert.description)
        .fetch_one(&self.pool)
        .await?;

        row.into_domain()
    }
}

#[async_trait]
impl RuleRepository for PgBankingStore {
    async fn list_rules(&self, tenant_id: &str) -> RepositoryResult<Vec<AnomalyRule>> {
        let rows = sqlx::query_as::<_, RuleRow>(
            r#"
            SELECT * FROM anomaly_rules
            WHERE tenant_id IS NULL OR tenant_id = $1
            ORDER BY id
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(RuleRow::into_domain).collect()
    }
}

/// Decodes a snake_case text column into one of the closed domain enums.
fn parse_text<T: DeserializeOwned>(column: &str, value: String) -> RepositoryResult<T> {
    serde_json::from_value(Value::String(value.clone()))
        .map_err(|_| RepositoryError::Corrupt(format!("{} = '{}'", column, value)))
}

/// `make_interval` takes an `int4` day count.
fn days_param(days: i64) -> RepositoryResult<i32> {
    i32::try_from(days)
        .map_err(|_| RepositoryError::InvalidArgument(format!("day window {} is out of range", days)))
}

fn parse_json<T: DeserializeOwned>(column: &str, value: Value) -> RepositoryResult<T> {
    serde_json::from_value(value).map_err(|e| RepositoryError::Corrupt(format!("{}: {}", column, e)))
}

// Internal row types for SQLx. Not exposed outside the adapter.

#[derive(Debug, sqlx::FromRow)]
struct ConnectionRow {
    id: Uuid,
    tenant_id: String,
    requisition_id: String,
    status: String,
    last_synced_at: Option<DateTime<Utc>>,
}

impl ConnectionRow {
    fn into_domain(self, accounts: Vec<BankAccount>) -> RepositoryResult<BankConnection> {
        Ok(BankConnection {
            id: self.id,
            tenant_id: self.tenant_id,
            requisition_id: self.requisition_id,
            status: self.status.parse().map_err(RepositoryError::Corrupt)?,
            accounts,
            last_synced_at: self.last_synced_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AccountRow {
    id: Uuid,
    connection_id: Uuid,
    external_id: String,
    iban: Option<String>,
    owner_name: Option<String>,
    currency: String,
    account_type: String,
    balance: Option<BigDecimal>,
    balance_updated_at: Option<DateTime<Utc>>,
    status: String,
}

impl AccountRow {
    fn into_domain(self) -> RepositoryResult<BankAccount> {
        Ok(BankAccount {
            id: self.id,
            connection_id: self.connection_id,
            external_id: self.external_id,
            iban: self.iban,
            owner_name: self.owner_name,
            currency: self.currency,
            account_type: parse_text("account_type", self.account_type)?,
            balance: self.balance,
            balance_updated_at: self.balance_updated_at,
            status: self.status,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TransactionRow {
    id: Uuid,
    account_id: Uuid,
    external_id: String,
    amount: BigDecimal,
    currency: String,
    direction: String,
    status: String,
    booking_date: DateTime<Utc>,
    value_date: DateTime<Utc>,
    description: String,
    merchant_name: Option<String>,
    merchant_category: Option<String>,
    counterparty_name: Option<String>,
    counterparty_iban: Option<String>,
    reference: Option<String>,
    category: Option<String>,
    metadata: Option<Value>,
    anomaly_score: Option<i32>,
    flags: Option<Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct UpsertRow {
    #[sqlx(flatten)]
    transaction: TransactionRow,
    inserted: bool,
}

impl TransactionRow {
    fn into_domain(self) -> RepositoryResult<Transaction> {
        let metadata: TransactionMetadata = match self.metadata {
            Some(value) => parse_json("metadata", value)?,
            None => TransactionMetadata::default(),
        };
        let flags: Vec<TransactionFlag> = match self.flags {
            Some(value) => parse_json("flags", value)?,
            None => Vec::new(),
        };

        Ok(Transaction {
            id: self.id,
            account_id: self.account_id,
            external_id: self.external_id,
            amount: self.amount,
            currency: self.currency,
            direction: parse_text("direction", self.direction)?,
            status: parse_text("status", self.status)?,
            booking_date: self.booking_date,
            value_date: self.value_date,
            description: self.description,
            merchant_name: self.merchant_name,
            merchant_category: self.merchant_category,
            counterparty_name: self.counterparty_name,
            counterparty_iban: self.counterparty_iban,
            reference: self.reference,
            category: self.category,
            metadata,
            anomaly_score: self.anomaly_score.map(|s| s.max(0) as u32),
            flags,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AlertRow {
    id: Uuid,
    tenant_id: String,
    transaction_id: Uuid,
    account_id: Uuid,
    #[sqlx(rename = "type")]
    alert_type: String,
    severity: String,
    title: String,
    description: String,
    status: String,
    assigned_to: Option<String>,
    resolved_by: Option<String>,
    resolved_at: Option<DateTime<Utc>>,
    resolution: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl AlertRow {
    fn into_domain(self) -> RepositoryResult<BankingAlert> {
        Ok(BankingAlert {
            id: self.id,
            tenant_id: self.tenant_id,
            transaction_id: self.transaction_id,
            account_id: self.account_id,
            alert_type: parse_text("type", self.alert_type)?,
            severity: parse_text("severity", self.severity)?,
            title: self.title,
            description: self.description,
            status: parse_text("status", self.status)?,
            assigned_to: self.assigned_to,
            resolved_by: self.resolved_by,
            resolved_at: self.resolved_at,
            resolution: self.resolution,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RuleRow {
    id: String,
    tenant_id: Option<String>,
    name: String,
    description: Option<String>,
    #[sqlx(rename = "type")]
    flag_type: String,
    enabled: bool,
    severity: String,
    conditions: Value,
    actions: Option<Value>,
}

impl RuleRow {
    fn into_domain(self) -> RepositoryResult<AnomalyRule> {
        Ok(AnomalyRule {
            id: self.id,
            name: self.name,
            description: self.description.unwrap_or_default(),
            flag_type: parse_text("type", self.flag_type)?,
            enabled: self.enabled,
            severity: parse_text("severity", self.severity)?,
            tenant_id: self.tenant_id,
            conditions: parse_json("conditions", self.conditions)?,
            actions: self.actions.unwrap_or(Value::Null),
        })
    }
}
