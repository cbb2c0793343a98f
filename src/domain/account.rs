use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    Checking,
    Savings,
    Credit,
    Loan,
    Other,
}

impl AccountType {
    /// Maps an ISO 20022 cash account type code (`CACC`, `SVGS`, ...) reported by the provider.
    pub fn from_cash_account_type(code: Option<&str>) -> Self {
        match code.map(|c| c.trim().to_ascii_uppercase()).as_deref() {
            Some("CACC") | Some("CASH") | Some("TRAN") => AccountType::Checking,
            Some("SVGS") | Some("MOMA") => AccountType::Savings,
            Some("CARD") => AccountType::Credit,
            Some("LOAN") | Some("MGLD") => AccountType::Loan,
            _ => AccountType::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::Checking => "checking",
            AccountType::Savings => "savings",
            AccountType::Credit => "credit",
            AccountType::Loan => "loan",
            AccountType::Other => "other",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BankAccount {
    pub id: Uuid,
    pub connection_id: Uuid,
    pub external_id: String,
    pub iban: Option<String>,
    pub owner_name: Option<String>,
    pub currency: String,
    pub account_type: AccountType,
    pub balance: Option<BigDecimal>,
    pub balance_updated_at: Option<DateTime<Utc>>,
    pub status: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Linked,
    Pending,
    Expired,
    Revoked,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Linked => "linked",
            ConnectionStatus::Pending => "pending",
            ConnectionStatus::Expired => "expired",
            ConnectionStatus::Revoked => "revoked",
        }
    }
}

impl std::str::FromStr for ConnectionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linked" => Ok(ConnectionStatus::Linked),
            "pending" => Ok(ConnectionStatus::Pending),
            "expired" => Ok(ConnectionStatus::Expired),
            "revoked" => Ok(ConnectionStatus::Revoked),
            other => Err(format!("unknown connection status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BankConnection {
    pub id: Uuid,
    pub tenant_id: String,
    pub requisition_id: String,
    pub status: ConnectionStatus,
    /// Accounts known so far; used to detect newly discovered provider accounts.
    #[serde(default)]
    pub accounts: Vec<BankAccount>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl BankConnection {
    pub fn knows_account(&self, external_id: &str) -> bool {
        self.accounts.iter().any(|a| a.external_id == external_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_cash_account_types() {
        assert_eq!(AccountType::from_cash_account_type(Some("CACC")), AccountType::Checking);
        assert_eq!(AccountType::from_cash_account_type(Some("svgs")), AccountType::Savings);
        assert_eq!(AccountType::from_cash_account_type(Some("CARD")), AccountType::Credit);
        assert_eq!(AccountType::from_cash_account_type(Some("LOAN")), AccountType::Loan);
        assert_eq!(AccountType::from_cash_account_type(None), AccountType::Other);
    }

    #[test]
    fn parses_connection_status() {
        assert_eq!("linked".parse::<ConnectionStatus>(), Ok(ConnectionStatus::Linked));
        assert!("gone".parse::<ConnectionStatus>().is_err());
    }
}
