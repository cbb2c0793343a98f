//! Wire types of the open-banking provider API.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    pub access: String,
    #[serde(default)]
    pub access_expires: u64,
    #[serde(default)]
    pub refresh: Option<String>,
    #[serde(default)]
    pub refresh_expires: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessToken {
    pub access: String,
    #[serde(default)]
    pub access_expires: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Requisition {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub accounts: Vec<String>,
}

/// Account metadata (`/accounts/{id}/`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderAccount {
    pub id: String,
    #[serde(default)]
    pub iban: Option<String>,
    #[serde(default)]
    pub institution_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub owner_name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountDetailsResponse {
    pub account: AccountDetails,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountDetails {
    #[serde(default)]
    pub resource_id: Option<String>,
    #[serde(default)]
    pub iban: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub owner_name: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub product: Option<String>,
    #[serde(default)]
    pub cash_account_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Amount {
    /// Signed decimal string, e.g. `"-45.10"`.
    pub amount: String,
    pub currency: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BalancesResponse {
    #[serde(default)]
    pub balances: Vec<Balance>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Balance {
    pub balance_amount: Amount,
    pub balance_type: String,
    #[serde(default)]
    pub reference_date: Option<String>,
}

impl BalancesResponse {
    /// Current balance snapshot: `interimAvailable`, else `expected`.
    pub fn current(&self) -> Option<&Balance> {
        self.by_type("interimAvailable")
            .or_else(|| self.by_type("expected"))
    }

    fn by_type(&self, balance_type: &str) -> Option<&Balance> {
        self.balances
            .iter()
            .find(|b| b.balance_type == balance_type)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionsResponse {
    #[serde(default)]
    pub transactions: TransactionBuckets,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionBuckets {
    #[serde(default)]
    pub booked: Vec<RawTransaction>,
    #[serde(default)]
    pub pending: Vec<RawTransaction>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountReference {
    #[serde(default)]
    pub iban: Option<String>,
}

/// Provider-native transaction record, Berlin Group flavoured.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTransaction {
    #[serde(default)]
    pub transaction_id: Option<String>,
    #[serde(default)]
    pub internal_transaction_id: Option<String>,
    #[serde(default)]
    pub entry_reference: Option<String>,
    #[serde(default)]
    pub end_to_end_id: Option<String>,
    #[serde(default)]
    pub mandate_id: Option<String>,
    #[serde(default)]
    pub check_id: Option<String>,
    #[serde(default)]
    pub creditor_id: Option<String>,
    #[serde(default)]
    pub booking_date: Option<String>,
    #[serde(default)]
    pub booking_date_time: Option<String>,
    #[serde(default)]
    pub value_date: Option<String>,
    #[serde(default)]
    pub value_date_time: Option<String>,
    pub transaction_amount: Option<Amount>,
    #[serde(default)]
    pub creditor_name: Option<String>,
    #[serde(default)]
    pub creditor_account: Option<AccountReference>,
    #[serde(default)]
    pub debtor_name: Option<String>,
    #[serde(default)]
    pub debtor_account: Option<AccountReference>,
    #[serde(default)]
    pub remittance_information_unstructured: Option<String>,
    #[serde(default)]
    pub remittance_information_unstructured_array: Option<Vec<String>>,
    #[serde(default)]
    pub remittance_information_structured: Option<String>,
    #[serde(default)]
    pub bank_transaction_code: Option<String>,
    #[serde(default)]
    pub proprietary_bank_transaction_code: Option<String>,
    #[serde(default)]
    pub merchant_category_code: Option<String>,
    #[serde(default)]
    pub additional_information: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn balance(balance_type: &str, amount: &str) -> Balance {
        Balance {
            balance_amount: Amount {
                amount: amount.to_string(),
                currency: "EUR".to_string(),
            },
            balance_type: balance_type.to_string(),
            reference_date: None,
        }
    }

    #[test]
    fn current_balance_prefers_interim_available() {
        let response = BalancesResponse {
            balances: vec![balance("expected", "10.00"), balance("interimAvailable", "12.00")],
        };
        assert_eq!(response.current().unwrap().balance_amount.amount, "12.00");
    }

    #[test]
    fn current_balance_falls_back_to_expected() {
        let response = BalancesResponse {
            balances: vec![balance("closingBooked", "1.00"), balance("expected", "10.00")],
        };
        assert_eq!(response.current().unwrap().balance_amount.amount, "10.00");

        let none = BalancesResponse {
            balances: vec![balance("closingBooked", "1.00")],
        };
        assert!(none.current().is_none());
    }

    #[test]
    fn parses_transaction_payload() {
        let raw: TransactionsResponse = serde_json::from_str(
            r#"{
                "transactions": {
                    "booked": [{
                        "transactionId": "2026030201",
                        "bookingDate": "2026-03-02",
                        "transactionAmount": {"amount": "-45.10", "currency": "EUR"},
                        "creditorName": "EDF",
                        "creditorAccount": {"iban": "FR7630004000031234567890143"},
                        "remittanceInformationUnstructured": "Facture electricite"
                    }],
                    "pending": []
                }
            }"#,
        )
        .unwrap();

        let booked = &raw.transactions.booked[0];
        assert_eq!(booked.transaction_id.as_deref(), Some("2026030201"));
        assert_eq!(booked.transaction_amount.as_ref().unwrap().amount, "-45.10");
        assert_eq!(
            booked.creditor_account.as_ref().unwrap().iban.as_deref(),
            Some("FR7630004000031234567890143")
        );
        assert!(raw.transactions.pending.is_empty());
    }
}
