#![allow(dead_code)]

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use finguard_core::adapters::InMemoryStore;
use finguard_core::domain::{
    AccountType, BankAccount, BankConnection, ConnectionStatus, Direction, Transaction,
    TransactionMetadata, TransactionStatus,
};
use finguard_core::ports::{ProviderError, ProviderGateway};
use finguard_core::provider::types::{
    AccountDetails, AccountDetailsResponse, AccountReference, Amount, Balance, BalancesResponse,
    ProviderAccount, RawTransaction, Requisition, TransactionBuckets, TransactionsResponse,
};

/// Scripted provider account.
#[derive(Debug, Clone, Default)]
pub struct FakeAccount {
    pub iban: Option<String>,
    pub currency: Option<String>,
    pub cash_account_type: Option<String>,
    pub booked: Vec<RawTransaction>,
    pub pending: Vec<RawTransaction>,
    pub balances: Vec<Balance>,
    pub fail_transactions: bool,
    pub transactions_delay: Option<Duration>,
}

#[derive(Default)]
pub struct FakeProvider {
    requisition_accounts: Mutex<Vec<String>>,
    accounts: Mutex<HashMap<String, FakeAccount>>,
    windows: Mutex<HashMap<String, (NaiveDate, NaiveDate)>>,
    requisition_fails: Mutex<bool>,
    pub transaction_calls: AtomicUsize,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an account the provider knows about and lists it on the requisition.
    pub fn add_account(&self, external_id: &str, account: FakeAccount) {
        self.requisition_accounts
            .lock()
            .unwrap()
            .push(external_id.to_string());
        self.accounts
            .lock()
            .unwrap()
            .insert(external_id.to_string(), account);
    }

    pub fn update_account(&self, external_id: &str, update: impl FnOnce(&mut FakeAccount)) {
        let mut accounts = self.accounts.lock().unwrap();
        if let Some(account) = accounts.get_mut(external_id) {
            update(account);
        }
    }

    pub fn fail_requisition(&self) {
        *self.requisition_fails.lock().unwrap() = true;
    }

    pub fn window_for(&self, external_id: &str) -> Option<(NaiveDate, NaiveDate)> {
        self.windows.lock().unwrap().get(external_id).copied()
    }

    fn account(&self, id: &str) -> Result<FakeAccount, ProviderError> {
        self.accounts
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(id.to_string()))
    }
}

#[async_trait]
impl ProviderGateway for FakeProvider {
    async fn get_requisition(&self, id: &str) -> Result<Requisition, ProviderError> {
        if *self.requisition_fails.lock().unwrap() {
            return Err(ProviderError::Server {
                status: 502,
                body: "bad gateway".to_string(),
            });
        }
        Ok(Requisition {
            id: id.to_string(),
            status: Some("LN".to_string()),
            accounts: self.requisition_accounts.lock().unwrap().clone(),
        })
    }

    async fn get_account(&self, id: &str) -> Result<ProviderAccount, ProviderError> {
        let account = self.account(id)?;
        Ok(ProviderAccount {
            id: id.to_string(),
            iban: account.iban,
            status: Some("READY".to_string()),
            ..Default::default()
        })
    }

    async fn get_account_details(&self, id: &str) -> Result<AccountDetailsResponse, ProviderError> {
        let account = self.account(id)?;
        Ok(AccountDetailsResponse {
            account: AccountDetails {
                resource_id: Some(id.to_string()),
                iban: account.iban,
                currency: account.currency,
                owner_name: Some("Atelier Dupont SARL".to_string()),
                cash_account_type: account.cash_account_type,
                ..Default::default()
            },
        })
    }

    async fn get_account_balances(&self, id: &str) -> Result<BalancesResponse, ProviderError> {
        let account = self.account(id)?;
        Ok(BalancesResponse {
            balances: account.balances,
        })
    }

    async fn get_account_transactions(
        &self,
        id: &str,
        date_from: NaiveDate,
        date_to: NaiveDate,
    ) -> Result<TransactionsResponse, ProviderError> {
        self.transaction_calls.fetch_add(1, Ordering::SeqCst);
        self.windows
            .lock()
            .unwrap()
            .insert(id.to_string(), (date_from, date_to));

        let account = self.account(id)?;
        if let Some(delay) = account.transactions_delay {
            tokio::time::sleep(delay).await;
        }
        if account.fail_transactions {
            return Err(ProviderError::Server {
                status: 500,
                body: "internal error".to_string(),
            });
        }
        Ok(TransactionsResponse {
            transactions: TransactionBuckets {
                booked: account.booked,
                pending: account.pending,
            },
        })
    }
}

pub fn raw_tx(id: &str, amount: &str, booking_date: &str, counterparty: &str) -> RawTransaction {
    let signed_credit = !amount.trim_start().starts_with('-');
    let mut raw = RawTransaction {
        transaction_id: Some(id.to_string()),
        booking_date: Some(booking_date.to_string()),
        transaction_amount: Some(Amount {
            amount: amount.to_string(),
            currency: "EUR".to_string(),
        }),
        remittance_information_unstructured: Some(format!("Paiement {}", counterparty)),
        ..Default::default()
    };
    if signed_credit {
        raw.debtor_name = Some(counterparty.to_string());
    } else {
        raw.creditor_name = Some(counterparty.to_string());
        raw.creditor_account = Some(AccountReference {
            iban: Some("FR7630006000011234567890189".to_string()),
        });
    }
    raw
}

pub fn balance(balance_type: &str, amount: &str) -> Balance {
    Balance {
        balance_amount: Amount {
            amount: amount.to_string(),
            currency: "EUR".to_string(),
        },
        balance_type: balance_type.to_string(),
        reference_date: None,
    }
}

pub fn bank_account(connection_id: Uuid, external_id: &str) -> BankAccount {
    BankAccount {
        id: Uuid::new_v4(),
        connection_id,
        external_id: external_id.to_string(),
        iban: None,
        owner_name: None,
        currency: "EUR".to_string(),
        account_type: AccountType::Checking,
        balance: None,
        balance_updated_at: None,
        status: "ready".to_string(),
    }
}

/// Seeds a connection with the given already-known account external ids.
pub async fn seed_connection(
    store: &InMemoryStore,
    status: ConnectionStatus,
    known_accounts: &[&str],
) -> BankConnection {
    let id = Uuid::new_v4();
    let connection = BankConnection {
        id,
        tenant_id: "tenant-a".to_string(),
        requisition_id: format!("req-{}", id),
        status,
        accounts: known_accounts
            .iter()
            .map(|external_id| bank_account(id, external_id))
            .collect(),
        last_synced_at: None,
    };
    store.insert_connection(connection.clone()).await;
    connection
}

/// Stored transaction for engine tests.
pub fn stored_tx(account_id: Uuid, amount: &str, booking_date: DateTime<Utc>) -> Transaction {
    Transaction {
        id: Uuid::new_v4(),
        account_id,
        external_id: Uuid::new_v4().to_string(),
        amount: BigDecimal::from_str(amount).unwrap(),
        currency: "EUR".to_string(),
        direction: Direction::Debit,
        status: TransactionStatus::Booked,
        booking_date,
        value_date: booking_date,
        description: "Paiement fournisseur".to_string(),
        merchant_name: None,
        merchant_category: None,
        counterparty_name: Some("Fournisseur Martin".to_string()),
        counterparty_iban: Some("FR7630006000011234567890189".to_string()),
        reference: None,
        category: None,
        metadata: TransactionMetadata::default(),
        anomaly_score: None,
        flags: Vec::new(),
        created_at: booking_date,
        updated_at: booking_date,
    }
}

pub fn shared(store: InMemoryStore) -> Arc<InMemoryStore> {
    Arc::new(store)
}
