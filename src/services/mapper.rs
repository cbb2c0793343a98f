//! Provider transaction -> canonical transaction.

use std::str::FromStr;

use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{Direction, NewTransaction, TransactionMetadata, TransactionStatus};
use crate::provider::types::RawTransaction;

pub const NO_DESCRIPTION: &str = "Aucune description";

/// Ordered category table. The first category with a matching keyword wins,
/// so the order is part of the contract.
pub const CATEGORY_KEYWORDS: &[(&str, &[&str])] = &[
    ("salary", &["salaire", "salary", "payroll", "paie ", "remuneration"]),
    ("taxes", &["impot", "impôt", "dgfip", "urssaf", "tva", "taxe", "tax "]),
    (
        "utilities",
        &["edf", "engie", "electricite", "électricité", "veolia", "gaz", "orange", "sfr", "bouygues", "internet"],
    ),
    ("rent", &["loyer", "rent", "bail ", "location"]),
    ("suppliers", &["fournisseur", "supplier", "achat marchandise", "grossiste"]),
    ("services", &["prestation", "honoraires", "consulting", "abonnement", "subscription"]),
    ("equipment", &["materiel", "matériel", "equipment", "ordinateur", "mobilier"]),
    ("travel", &["sncf", "air france", "hotel", "hôtel", "uber", "taxi", "voyage", "travel"]),
    ("marketing", &["publicite", "publicité", "google ads", "meta ads", "marketing", "linkedin"]),
    ("insurance", &["assurance", "insurance", "axa", "allianz", "maif", "macif", "mutuelle"]),
    ("loans", &["pret ", "prêt", "emprunt", "loan", "echeance", "échéance"]),
    ("transfers", &["virement", "transfer", "vir "]),
    ("fees", &["frais", "commission", "cotisation", "agios", "fee "]),
    ("refunds", &["remboursement", "refund", "avoir"]),
];

#[derive(Error, Debug, PartialEq)]
pub enum MappingError {
    #[error("transaction {0} has no amount")]
    MissingAmount(String),

    #[error("transaction {external_id} has an unparseable amount '{raw}'")]
    InvalidAmount { external_id: String, raw: String },

    #[error("transaction {0} has no usable booking or value date")]
    MissingDate(String),

    #[error("provider omitted a transaction id and stable ids are required")]
    MissingExternalId,
}

#[derive(Debug, Clone, Default)]
pub struct TransactionMapper {
    /// Reject rows without a provider id instead of synthesizing one.
    pub require_stable_ids: bool,
}

impl TransactionMapper {
    pub fn new(require_stable_ids: bool) -> Self {
        Self { require_stable_ids }
    }

    pub fn map(
        &self,
        raw: &RawTransaction,
        account_id: Uuid,
        status: TransactionStatus,
    ) -> Result<NewTransaction, MappingError> {
        let external_id = self.external_id(raw)?;

        let amount = raw
            .transaction_amount
            .as_ref()
            .ok_or_else(|| MappingError::MissingAmount(external_id.clone()))?;
        let signed = BigDecimal::from_str(amount.amount.trim()).map_err(|_| {
            MappingError::InvalidAmount {
                external_id: external_id.clone(),
                raw: amount.amount.clone(),
            }
        })?;
        let direction = if signed > BigDecimal::from(0) {
            Direction::Credit
        } else {
            Direction::Debit
        };

        // Money comes from the debtor on a credit and goes to the creditor on a debit.
        let (counterparty_name, counterparty_account) = match direction {
            Direction::Credit => (&raw.debtor_name, &raw.debtor_account),
            Direction::Debit => (&raw.creditor_name, &raw.creditor_account),
        };
        let counterparty_name = non_empty(counterparty_name.as_deref());
        let counterparty_iban = counterparty_account
            .as_ref()
            .and_then(|a| non_empty(a.iban.as_deref()))
            .map(|iban| iban.replace(' ', "").to_ascii_uppercase());

        let booking_date = parse_date_time(raw.booking_date_time.as_deref())
            .or_else(|| parse_date(raw.booking_date.as_deref()))
            .or_else(|| parse_date_time(raw.value_date_time.as_deref()))
            .or_else(|| parse_date(raw.value_date.as_deref()))
            .ok_or_else(|| MappingError::MissingDate(external_id.clone()))?;
        let value_date = parse_date_time(raw.value_date_time.as_deref())
            .or_else(|| parse_date(raw.value_date.as_deref()))
            .unwrap_or(booking_date);

        let description = description(raw, counterparty_name.as_deref());
        let category = infer_category(&description, counterparty_name.as_deref());

        let merchant_category = non_empty(raw.merchant_category_code.as_deref());
        let merchant_name = merchant_category
            .as_ref()
            .and(counterparty_name.clone());

        Ok(NewTransaction {
            account_id,
            external_id,
            amount: signed.abs(),
            currency: amount.currency.trim().to_ascii_uppercase(),
            direction,
            status,
            booking_date,
            value_date,
            description,
            merchant_name,
            merchant_category,
            counterparty_name,
            counterparty_iban,
            reference: non_empty(raw.entry_reference.as_deref())
                .or_else(|| non_empty(raw.end_to_end_id.as_deref())),
            category: category.map(str::to_string),
            metadata: TransactionMetadata {
                internal_transaction_id: non_empty(raw.internal_transaction_id.as_deref()),
                entry_reference: non_empty(raw.entry_reference.as_deref()),
                end_to_end_id: non_empty(raw.end_to_end_id.as_deref()),
                mandate_id: non_empty(raw.mandate_id.as_deref()),
                bank_transaction_code: non_empty(raw.bank_transaction_code.as_deref()),
                proprietary_bank_transaction_code: non_empty(
                    raw.proprietary_bank_transaction_code.as_deref(),
                ),
                check_id: non_empty(raw.check_id.as_deref()),
                creditor_id: non_empty(raw.creditor_id.as_deref()),
            },
        })
    }

    fn external_id(&self, raw: &RawTransaction) -> Result<String, MappingError> {
        if let Some(id) = non_empty(raw.transaction_id.as_deref())
            .or_else(|| non_empty(raw.internal_transaction_id.as_deref()))
        {
            return Ok(id);
        }
        if self.require_stable_ids {
            return Err(MappingError::MissingExternalId);
        }
        // Synthesized ids cannot be deduplicated across syncs.
        let id = Uuid::new_v4().to_string();
        tracing::warn!(external_id = %id, "provider omitted transaction id, synthesized one");
        Ok(id)
    }
}

/// First category whose keywords appear in the description or counterparty name.
pub fn infer_category(description: &str, counterparty: Option<&str>) -> Option<&'static str> {
    let haystack = format!(
        "{} {} ",
        description.to_lowercase(),
        counterparty.unwrap_or_default().to_lowercase()
    );
    CATEGORY_KEYWORDS
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| haystack.contains(k)))
        .map(|(category, _)| *category)
}

fn description(raw: &RawTransaction, counterparty_name: Option<&str>) -> String {
    let unstructured = non_empty(raw.remittance_information_unstructured.as_deref()).or_else(|| {
        raw.remittance_information_unstructured_array
            .as_ref()
            .and_then(|lines| non_empty(Some(lines.join(" ").as_str())))
    });

    unstructured
        .or_else(|| non_empty(raw.remittance_information_structured.as_deref()))
        .or_else(|| non_empty(counterparty_name))
        .unwrap_or_else(|| NO_DESCRIPTION.to_string())
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn parse_date(value: Option<&str>) -> Option<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(value?.trim(), "%Y-%m-%d").ok()?;
    Some(date.and_hms_opt(0, 0, 0)?.and_utc())
}

fn parse_date_time(value: Option<&str>) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value?.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
