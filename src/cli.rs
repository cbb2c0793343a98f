use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use uuid::Uuid;

use crate::adapters::{InMemoryStore, PgBankingStore};
use crate::config::Config;
use crate::domain::{AnomalyRule, Severity, Transaction};
use crate::error::AppError;
use crate::ports::{AlertRepository, RuleRepository, TransactionRepository};
use crate::services::anomaly::AnomalyEngine;
use crate::services::rules::{self, RuleIssue};
use crate::services::sync::SyncService;

#[derive(Parser)]
#[command(name = "finguard-core")]
#[command(about = "FinGuard Core - bank transaction sync and anomaly detection", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Sync every account of one bank connection
    Sync {
        /// Bank connection UUID
        #[arg(value_name = "CONNECTION_ID")]
        connection_id: Uuid,
    },

    /// Run anomaly detection over an account's recent transactions
    Analyze {
        /// Bank account UUID
        #[arg(value_name = "ACCOUNT_ID")]
        account_id: Uuid,

        /// Tenant whose rules apply
        #[arg(long)]
        tenant: String,

        /// How many days of history to analyze
        #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(i64).range(1..=3650))]
        days: i64,

        /// Store scores and flags and raise alerts
        #[arg(long)]
        persist: bool,
    },

    /// Anomaly rule tooling
    #[command(subcommand)]
    Rules(RulesCommands),

    /// Run the periodic sync scheduler until interrupted
    Schedule,

    /// Configuration validation
    Config,
}

#[derive(Subcommand)]
pub enum RulesCommands {
    /// Validate a JSON file of anomaly rules
    Check {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Evaluate rules against a JSON file of transactions without touching the database
    Preview {
        #[arg(value_name = "RULES_FILE")]
        rules_file: PathBuf,

        #[arg(value_name = "TRANSACTIONS_FILE")]
        transactions_file: PathBuf,
    },
}

pub async fn handle_sync(sync: &SyncService, connection_id: Uuid) -> anyhow::Result<()> {
    tracing::info!("Syncing connection {}", connection_id);
    let results = sync
        .sync_connection(connection_id)
        .await
        .map_err(AppError::from)?;

    println!("{:<38} {:>6} {:>8}  {}", "Account", "New", "Updated", "Status");
    println!("{}", "-".repeat(70));
    for result in &results {
        let status = if result.is_degraded() {
            format!("degraded ({} error(s))", result.errors.len())
        } else if result.is_up_to_date() {
            "up to date".to_string()
        } else {
            "ok".to_string()
        };
        println!(
            "{:<38} {:>6} {:>8}  {}",
            result.account_id, result.new_transactions, result.updated_transactions, status
        );
        for error in &result.errors {
            println!("    ✗ {}", error);
        }
    }

    println!("✓ Synced {} account(s)", results.len());
    Ok(())
}

pub async fn handle_analyze(
    store: Arc<PgBankingStore>,
    account_id: Uuid,
    tenant_id: &str,
    days: i64,
    persist: bool,
) -> anyhow::Result<()> {
    let rules = store.list_rules(tenant_id).await.map_err(AppError::from)?;
    // Without --persist, alerts land in a throwaway sink.
    let alerts: Arc<dyn AlertRepository> = if persist {
        store.clone()
    } else {
        Arc::new(InMemoryStore::new())
    };
    let engine = AnomalyEngine::new(store.clone(), alerts, rules);

    let transactions = store
        .get_transactions_by_account(account_id, days)
        .await
        .map_err(AppError::from)?;
    if transactions.is_empty() {
        println!("No transactions in the last {} day(s)", days);
        return Ok(());
    }

    let mut flagged = 0;
    for tx in &transactions {
        let result = if persist {
            engine
                .analyze_and_persist(tx, tenant_id)
                .await
                .map_err(AppError::from)?
        } else {
            engine.analyze_transaction(tx, tenant_id).await
        };
        if result.flags.is_empty() {
            continue;
        }
        flagged += 1;
        println!(
            "{} {} {} {} score={}",
            tx.booking_date.format("%Y-%m-%d"),
            tx.external_id,
            tx.amount,
            tx.currency,
            result.score
        );
        for flag in &result.flags {
            println!("    [{:?}] {}: {}", flag.severity, flag.flag_type.as_str(), flag.message);
        }
    }

    println!(
        "✓ Analyzed {} transaction(s), {} flagged{}",
        transactions.len(),
        flagged,
        if persist { " (persisted)" } else { "" }
    );
    Ok(())
}

pub fn handle_rules_check(file: &Path) -> anyhow::Result<()> {
    let rules = load_rules(file)?;

    let mut total = 0;
    for rule in &rules {
        let issues: Vec<RuleIssue> = rules::validate_rule(rule);
        if issues.is_empty() {
            continue;
        }
        total += issues.len();
        println!("{} ({}):", rule.id, rule.name);
        for issue in issues {
            println!("    ✗ {}", issue);
        }
    }

    if total > 0 {
        return Err(AppError::Validation(format!("{} issue(s) in {}", total, file.display())).into());
    }
    println!("✓ {} rule(s) are valid", rules.len());
    Ok(())
}

pub fn handle_rules_preview(rules_file: &Path, transactions_file: &Path) -> anyhow::Result<()> {
    let rules = load_rules(rules_file)?;
    let transactions = load_transactions(transactions_file)?;

    let matches = preview_rules(&rules, &transactions);
    for m in &matches {
        println!(
            "{} {} -> {} ({:?})",
            m.transaction_id, m.external_id, m.rule_id, m.severity
        );
    }

    println!(
        "✓ {} match(es) across {} transaction(s) and {} rule(s)",
        matches.len(),
        transactions.len(),
        rules.len()
    );
    Ok(())
}

pub fn handle_config_validate(config: &Config) -> anyhow::Result<()> {
    tracing::info!("Validating configuration...");

    println!("Configuration:");
    println!("  Database URL: {}", mask_password(&config.database_url));
    println!("  Provider URL: {}", config.provider_base_url);
    println!("  Provider Secret ID: {}", mask_secret(&config.provider_secret_id));
    println!("  Provider Secret Key: {}", mask_secret(&config.provider_secret_key));
    println!("  Provider Timeout: {}s", config.provider_timeout_secs);
    println!("  Provider Max Retries: {}", config.provider_max_retries);
    println!("  Require Stable IDs: {}", config.provider_require_stable_ids);
    println!("  Sync Concurrency: {}", config.sync_concurrency);
    println!("  Sync Lookback: {} days", config.sync_lookback_days);
    println!("  Account Timeout: {}s", config.sync_account_timeout_secs);
    println!("  Sync Interval: {}s", config.sync_interval_secs);
    println!("  Log Format: {:?}", config.log_format);

    tracing::info!("Configuration is valid");
    println!("✓ Configuration is valid");

    Ok(())
}

/// A rule that fired on a transaction during a preview run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleMatch {
    pub transaction_id: Uuid,
    pub external_id: String,
    pub rule_id: String,
    pub severity: Severity,
}

/// Evaluates enabled rules against each transaction. Tenant scoping is left to the caller.
pub fn preview_rules(rules: &[AnomalyRule], transactions: &[Transaction]) -> Vec<RuleMatch> {
    let mut matches = Vec::new();
    for tx in transactions {
        let doc = rules::transaction_document(tx);
        for rule in rules.iter().filter(|r| r.enabled) {
            if rules::evaluate_document(rule, &doc) {
                matches.push(RuleMatch {
                    transaction_id: tx.id,
                    external_id: tx.external_id.clone(),
                    rule_id: rule.id.clone(),
                    severity: rule.severity,
                });
            }
        }
    }
    matches
}

pub fn load_rules(path: &Path) -> Result<Vec<AnomalyRule>, AppError> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

pub fn load_transactions(path: &Path) -> Result<Vec<Transaction>, AppError> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn mask_password(url: &str) -> String {
    if let Some(at_pos) = url.rfind('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            if let Some(slash_pos) = url[..colon_pos].rfind("//") {
                let prefix = &url[..slash_pos + 2];
                let user_start = slash_pos + 2;
                let user = &url[user_start..colon_pos];
                let suffix = &url[at_pos..];
                return format!("{}{}:****{}", prefix, user, suffix);
            }
        }
    }
    url.to_string()
}

/// Secrets are never echoed, not even a prefix.
fn mask_secret(secret: &str) -> &'static str {
    if secret.is_empty() {
        "(unset)"
    } else {
        "****"
    }
}
