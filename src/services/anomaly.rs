//! Anomaly detection: built-in detectors, tenant rules, scoring and alerting.

use std::collections::HashMap;
use std::sync::Arc;

use bigdecimal::{BigDecimal, ToPrimitive};
use chrono::{DateTime, Duration, Timelike, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::{AnomalyRule, FlagType, NewAlert, Severity, Transaction, TransactionFlag};
use crate::ports::{AlertRepository, RepositoryResult, RuleRepository, TransactionRepository};
use crate::services::rules;

pub const MAX_SCORE: u32 = 100;
pub const FALLBACK_ALERT_TITLE: &str = "Anomalie détectée";

/// Jurisdictions under FATF call for action or increased monitoring.
pub const HIGH_RISK_COUNTRIES: &[&str] = &[
    "KP", "IR", "MM", "AF", "SY", "YE", "VE", "HT", "SS", "ML", "CD", "MZ", "NG", "ZA", "VU",
];

#[derive(Debug, Clone)]
pub struct AnomalyConfig {
    pub reporting_threshold: BigDecimal,
    /// Structuring band, in percent of the reporting threshold.
    pub structuring_low_pct: u32,
    pub structuring_high_pct: u32,
    pub round_amount_floor: BigDecimal,
    pub round_amount_unit: BigDecimal,
    pub unusual_ratio: u32,
    pub unusual_ratio_high: u32,
    pub unknown_counterparty_high_amount: BigDecimal,
    pub night_hours: (u32, u32),
    pub dormancy_days: i64,
    pub duplicate_window_days: i64,
    pub duplicate_tolerance_days: i64,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            reporting_threshold: BigDecimal::from(10_000),
            structuring_low_pct: 85,
            structuring_high_pct: 99,
            round_amount_floor: BigDecimal::from(5_000),
            round_amount_unit: BigDecimal::from(1_000),
            unusual_ratio: 5,
            unusual_ratio_high: 10,
            unknown_counterparty_high_amount: BigDecimal::from(1_000),
            night_hours: (1, 5),
            dormancy_days: 90,
            duplicate_window_days: 7,
            duplicate_tolerance_days: 1,
        }
    }
}

impl AnomalyConfig {
    fn structuring_band(&self) -> (BigDecimal, BigDecimal) {
        let hundred = BigDecimal::from(100);
        let low = &self.reporting_threshold * BigDecimal::from(self.structuring_low_pct) / &hundred;
        let high = &self.reporting_threshold * BigDecimal::from(self.structuring_high_pct) / &hundred;
        (low, high)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AnalysisResult {
    pub flags: Vec<TransactionFlag>,
    pub score: u32,
}

/// Outcome of [`AnomalyEngine::analyze_pending`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchAnalysis {
    pub analyzed: usize,
    /// Transactions whose analysis could not be stored.
    pub failed: Vec<Uuid>,
}

/// Additive, capped score: sum of severity weights, at most 100.
pub fn score(flags: &[TransactionFlag]) -> u32 {
    flags
        .iter()
        .map(|flag| flag.severity.weight())
        .sum::<u32>()
        .min(MAX_SCORE)
}

pub fn alert_title(flag_type: FlagType) -> &'static str {
    match flag_type {
        FlagType::UnusualAmount => "Montant inhabituel",
        FlagType::UnusualTime => "Horaire inhabituel",
        FlagType::UnusualFrequency => "Fréquence inhabituelle",
        FlagType::UnknownCounterparty => "Contrepartie inconnue",
        FlagType::HighRiskCountry => "Pays à risque",
        FlagType::RoundAmount => "Montant rond",
        FlagType::Structuring => "Fractionnement suspect",
        FlagType::Velocity => "Vélocité anormale",
        FlagType::DormantActivation => "Réactivation de compte dormant",
        FlagType::Duplicate => "Doublon potentiel",
        FlagType::CategoryMismatch | FlagType::ManualFlag => FALLBACK_ALERT_TITLE,
    }
}

pub struct AnomalyEngine {
    transactions: Arc<dyn TransactionRepository>,
    alerts: Arc<dyn AlertRepository>,
    rules: Vec<AnomalyRule>,
    config: AnomalyConfig,
}

impl AnomalyEngine {
    pub fn new(
        transactions: Arc<dyn TransactionRepository>,
        alerts: Arc<dyn AlertRepository>,
        rules: Vec<AnomalyRule>,
    ) -> Self {
        Self {
            transactions,
            alerts,
            rules,
            config: AnomalyConfig::default(),
        }
    }

    /// Builds an engine with the rules visible to `tenant_id`.
    pub async fn for_tenant(
        transactions: Arc<dyn TransactionRepository>,
        alerts: Arc<dyn AlertRepository>,
        rule_store: &dyn RuleRepository,
        tenant_id: &str,
    ) -> RepositoryResult<Self> {
        let rules = rule_store.list_rules(tenant_id).await?;
        Ok(Self::new(transactions, alerts, rules))
    }

    pub fn with_config(mut self, config: AnomalyConfig) -> Self {
        self.config = config;
        self
    }

    pub fn rules(&self) -> &[AnomalyRule] {
        &self.rules
    }

    /// Runs every detector and applicable custom rule, then raises one alert
    /// per high or critical flag. Never fails.
    pub async fn analyze_transaction(&self, tx: &Transaction, tenant_id: &str) -> AnalysisResult {
        let mut flags = self.builtin_flags(tx).await;
        flags.extend(self.custom_rule_flags(tx, tenant_id));

        let result = AnalysisResult {
            score: score(&flags),
            flags,
        };

        self.raise_alerts(tx, tenant_id, &result.flags).await;

        debug!(
            transaction_id = %tx.id,
            flags = result.flags.len(),
            score = result.score,
            "transaction analyzed"
        );
        result
    }

    /// Independent per-transaction analysis; no flag carries over between transactions.
    pub async fn analyze_transactions(
        &self,
        transactions: &[Transaction],
        tenant_id: &str,
    ) -> HashMap<Uuid, AnalysisResult> {
        let mut results = HashMap::with_capacity(transactions.len());
        for tx in transactions {
            let result = self.analyze_transaction(tx, tenant_id).await;
            results.insert(tx.id, result);
        }
        results
    }

    /// Analyzes and overwrites the stored score and flags of the transaction.
    pub async fn analyze_and_persist(
        &self,
        tx: &Transaction,
        tenant_id: &str,
    ) -> RepositoryResult<AnalysisResult> {
        let result = self.analyze_transaction(tx, tenant_id).await;
        self.transactions
            .update_transaction_analysis(tx.id, result.score, &result.flags)
            .await?;
        Ok(result)
    }

    /// Analyzes and persists every account transaction written since `since`
    /// or never analyzed. A row whose analysis cannot be stored is logged and
    /// left unscored, so the next pass picks it up again.
    pub async fn analyze_pending(
        &self,
        account_id: Uuid,
        since: DateTime<Utc>,
        tenant_id: &str,
    ) -> RepositoryResult<BatchAnalysis> {
        let pending = self
            .transactions
            .list_transactions_to_analyze(account_id, since)
            .await?;

        let mut batch = BatchAnalysis::default();
        for tx in &pending {
            match self.analyze_and_persist(tx, tenant_id).await {
                Ok(_) => batch.analyzed += 1,
                Err(e) => {
                    warn!(transaction_id = %tx.id, error = %e, "Failed to store analysis");
                    batch.failed.push(tx.id);
                }
            }
        }
        Ok(batch)
    }

    async fn builtin_flags(&self, tx: &Transaction) -> Vec<TransactionFlag> {
        let now = Utc::now();
        let mut flags = Vec::new();

        let detected = [
            self.guard(FlagType::UnusualAmount, self.unusual_amount(tx, now).await),
            self.unusual_time(tx, now),
            self.guard(FlagType::UnknownCounterparty, self.unknown_counterparty(tx, now).await),
            self.high_risk_country(tx, now),
            self.round_amount(tx, now),
            self.structuring(tx, now),
            self.guard(FlagType::DormantActivation, self.dormant_activation(tx, now).await),
            self.guard(FlagType::Duplicate, self.duplicate(tx, now).await),
        ];
        flags.extend(detected.into_iter().flatten());
        flags
    }

    /// A detector that cannot reach history simply does not fire.
    fn guard(
        &self,
        detector: FlagType,
        outcome: RepositoryResult<Option<TransactionFlag>>,
    ) -> Option<TransactionFlag> {
        match outcome {
            Ok(flag) => flag,
            Err(e) => {
                warn!(detector = detector.as_str(), error = %e, "detector skipped");
                None
            }
        }
    }

    fn custom_rule_flags(&self, tx: &Transaction, tenant_id: &str) -> Vec<TransactionFlag> {
        let applicable: Vec<&AnomalyRule> = self
            .rules
            .iter()
            .filter(|rule| rule.applies_to(tenant_id))
            .collect();
        if applicable.is_empty() {
            return Vec::new();
        }

        let doc = rules::transaction_document(tx);
        let now = Utc::now();
        applicable
            .into_iter()
            .filter(|rule| rules::evaluate_document(rule, &doc))
            .map(|rule| TransactionFlag {
                flag_type: rule.flag_type,
                severity: rule.severity,
                message: rule.description.clone(),
                rule_id: rule.id.clone(),
                detected_at: now,
            })
            .collect()
    }

    async fn raise_alerts(&self, tx: &Transaction, tenant_id: &str, flags: &[TransactionFlag]) {
        for flag in flags.iter().filter(|f| f.severity.triggers_alert()) {
            let alert = NewAlert {
                tenant_id: tenant_id.to_string(),
                transaction_id: tx.id,
                account_id: tx.account_id,
                alert_type: flag.flag_type,
                severity: flag.severity,
                title: alert_title(flag.flag_type).to_string(),
                description: flag.message.clone(),
            };
            match self.alerts.create_alert(&alert).await {
                Ok(created) => info!(
                    alert_id = %created.id,
                    transaction_id = %tx.id,
                    alert_type = flag.flag_type.as_str(),
                    "alert created"
                ),
                Err(e) => warn!(
                    transaction_id = %tx.id,
                    alert_type = flag.flag_type.as_str(),
                    error = %e,
                    "failed to create alert"
                ),
            }
        }
    }

    async fn unusual_amount(
        &self,
        tx: &Transaction,
        now: DateTime<Utc>,
    ) -> RepositoryResult<Option<TransactionFlag>> {
        let average = match self
            .transactions
            .get_average_amount(tx.account_id, tx.direction)
            .await?
        {
            Some(avg) if avg > BigDecimal::from(0) => avg,
            _ => return Ok(None),
        };

        let ratio = &tx.amount / &average;
        if ratio <= BigDecimal::from(self.config.unusual_ratio) {
            return Ok(None);
        }

        let severity = if ratio > BigDecimal::from(self.config.unusual_ratio_high) {
            Severity::High
        } else {
            Severity::Medium
        };
        let message = format!(
            "Montant {} {} environ {:.1} fois supérieur à la moyenne du compte ({} {})",
            tx.amount,
            tx.currency,
            ratio.to_f64().unwrap_or_default(),
            average.with_scale(2),
            tx.currency
        );
        Ok(Some(flag(FlagType::UnusualAmount, severity, message, now)))
    }

    fn unusual_time(&self, tx: &Transaction, now: DateTime<Utc>) -> Option<TransactionFlag> {
        let hour = tx.booking_date.hour();
        let (start, end) = self.config.night_hours;
        if hour < start || hour > end {
            return None;
        }
        Some(flag(
            FlagType::UnusualTime,
            Severity::Low,
            format!("Transaction enregistrée à une heure inhabituelle ({:02}h)", hour),
            now,
        ))
    }

    async fn unknown_counterparty(
        &self,
        tx: &Transaction,
        now: DateTime<Utc>,
    ) -> RepositoryResult<Option<TransactionFlag>> {
        let Some(key) = tx.counterparty_key() else {
            return Ok(None);
        };

        let known = self
            .transactions
            .get_known_counterparties(tx.account_id, tx.id)
            .await?;
        // No history yet: nothing to compare against.
        if known.is_empty() || known.iter().any(|k| k == key) {
            return Ok(None);
        }

        let severity = if tx.amount > self.config.unknown_counterparty_high_amount {
            Severity::Medium
        } else {
            Severity::Low
        };
        let name = tx.counterparty_name.as_deref().unwrap_or(key);
        Ok(Some(flag(
            FlagType::UnknownCounterparty,
            severity,
            format!("Première transaction avec la contrepartie {}", name),
            now,
        )))
    }

    fn high_risk_country(&self, tx: &Transaction, now: DateTime<Utc>) -> Option<TransactionFlag> {
        let iban = tx.counterparty_iban.as_deref()?;
        let country = iban.get(..2)?.to_ascii_uppercase();
        if !HIGH_RISK_COUNTRIES.contains(&country.as_str()) {
            return None;
        }
        Some(flag(
            FlagType::HighRiskCountry,
            Severity::High,
            format!("Contrepartie domiciliée dans un pays à haut risque ({})", country),
            now,
        ))
    }

    fn round_amount(&self, tx: &Transaction, now: DateTime<Utc>) -> Option<TransactionFlag> {
        if tx.amount < self.config.round_amount_floor {
            return None;
        }
        let remainder = tx.amount.clone() % self.config.round_amount_unit.clone();
        if remainder != BigDecimal::from(0) {
            return None;
        }
        Some(flag(
            FlagType::RoundAmount,
            Severity::Low,
            format!("Montant rond de {} {}", tx.amount.with_scale(0), tx.currency),
            now,
        ))
    }

    fn structuring(&self, tx: &Transaction, now: DateTime<Utc>) -> Option<TransactionFlag> {
        let (low, high) = self.config.structuring_band();
        if tx.amount < low || tx.amount > high {
            return None;
        }
        Some(flag(
            FlagType::Structuring,
            Severity::High,
            format!(
                "Montant de {} {} juste sous le seuil déclaratif de {}",
                tx.amount,
                tx.currency,
                self.config.reporting_threshold
            ),
            now,
        ))
    }

    async fn dormant_activation(
        &self,
        tx: &Transaction,
        now: DateTime<Utc>,
    ) -> RepositoryResult<Option<TransactionFlag>> {
        let Some(last) = self
            .transactions
            .get_last_activity_date(tx.account_id, tx.booking_date)
            .await?
        else {
            return Ok(None);
        };

        let idle = tx.booking_date - last;
        if idle <= Duration::days(self.config.dormancy_days) {
            return Ok(None);
        }
        Ok(Some(flag(
            FlagType::DormantActivation,
            Severity::Medium,
            format!("Compte inactif depuis {} jours", idle.num_days()),
            now,
        )))
    }

    async fn duplicate(
        &self,
        tx: &Transaction,
        now: DateTime<Utc>,
    ) -> RepositoryResult<Option<TransactionFlag>> {
        let recent = self
            .transactions
            .get_transactions_by_account(tx.account_id, self.config.duplicate_window_days)
            .await?;
        let tolerance = Duration::days(self.config.duplicate_tolerance_days);

        let twin = recent.iter().find(|other| {
            other.id != tx.id
                && other.amount == tx.amount
                && other.direction == tx.direction
                && other.counterparty_iban == tx.counterparty_iban
                && (other.booking_date - tx.booking_date) <= tolerance
                && (tx.booking_date - other.booking_date) <= tolerance
        });

        Ok(twin.map(|other| {
            flag(
                FlagType::Duplicate,
                Severity::Medium,
                format!(
                    "Doublon potentiel de la transaction {} du {}",
                    other.external_id,
                    other.booking_date.format("%d/%m/%Y")
                ),
                now,
            )
        }))
    }
}

fn flag(flag_type: FlagType, severity: Severity, message: String, now: DateTime<Utc>) -> TransactionFlag {
    TransactionFlag {
        flag_type,
        severity,
        message,
        rule_id: flag_type.builtin_rule_id(),
        detected_at: now,
    }
}
