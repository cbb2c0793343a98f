use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info};

use crate::ports::{AlertRepository, RepositoryResult, RuleRepository, TransactionRepository};
use crate::services::anomaly::{AnomalyConfig, AnomalyEngine};
use crate::services::sync::SyncService;

/// Builds the anomaly engine used for one tenant's freshly synced transactions.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn engine_for(&self, tenant_id: &str) -> RepositoryResult<AnomalyEngine>;
}

/// Engine factory backed by a single store implementing every analysis port.
pub struct StoreEngineFactory<S> {
    store: Arc<S>,
    config: AnomalyConfig,
}

impl<S> StoreEngineFactory<S> {
    pub fn new(store: Arc<S>, config: AnomalyConfig) -> Self {
        Self { store, config }
    }
}

#[async_trait]
impl<S> EngineFactory for StoreEngineFactory<S>
where
    S: TransactionRepository + AlertRepository + RuleRepository + 'static,
{
    async fn engine_for(&self, tenant_id: &str) -> RepositoryResult<AnomalyEngine> {
        let engine = AnomalyEngine::for_tenant(
            self.store.clone(),
            self.store.clone(),
            self.store.as_ref(),
            tenant_id,
        )
        .await?;
        Ok(engine.with_config(self.config.clone()))
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct TickSummary {
    pub connections: usize,
    pub failed_connections: usize,
    pub accounts: usize,
    pub degraded_accounts: usize,
    pub analyzed_transactions: usize,
    /// Rows left unscored this tick; they are retried on the next one.
    pub failed_analyses: usize,
}

/// Runs sync and analysis for every linked connection every `interval`
/// until `shutdown` flips to true or its sender is dropped.
pub async fn run_sync_scheduler(
    sync: Arc<SyncService>,
    engines: Arc<dyn EngineFactory>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Sync scheduler started (interval {:?})", interval);

    loop {
        let stop = *shutdown.borrow();
        if stop {
            break;
        }

        let summary = run_tick(&sync, engines.as_ref(), shutdown.clone()).await;
        info!(
            connections = summary.connections,
            failed_connections = summary.failed_connections,
            accounts = summary.accounts,
            degraded_accounts = summary.degraded_accounts,
            analyzed = summary.analyzed_transactions,
            failed_analyses = summary.failed_analyses,
            "Sync tick finished"
        );

        tokio::select! {
            _ = sleep(interval) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    info!("Sync scheduler stopped");
}

/// One pass: sync each linked connection, then analyze what the pass wrote
/// along with anything an earlier pass left unscored.
pub async fn run_tick(
    sync: &SyncService,
    engines: &dyn EngineFactory,
    shutdown: watch::Receiver<bool>,
) -> TickSummary {
    let started = Utc::now();
    let mut summary = TickSummary::default();

    let connections = match sync.linked_connections().await {
        Ok(connections) => connections,
        Err(e) => {
            error!("Failed to list linked connections: {}", e);
            return summary;
        }
    };
    debug!("Syncing {} linked connection(s)", connections.len());

    for connection in connections {
        let stop = *shutdown.borrow();
        if stop {
            break;
        }
        summary.connections += 1;

        let results = match sync
            .sync_connection_with_cancel(connection.id, shutdown.clone())
            .await
        {
            Ok(results) => results,
            Err(e) => {
                error!(connection_id = %connection.id, "Connection sync failed: {}", e);
                summary.failed_connections += 1;
                continue;
            }
        };
        summary.accounts += results.len();
        summary.degraded_accounts += results.iter().filter(|r| r.is_degraded()).count();

        let engine = match engines.engine_for(&connection.tenant_id).await {
            Ok(engine) => engine,
            Err(e) => {
                error!(tenant_id = %connection.tenant_id, "Failed to load anomaly rules: {}", e);
                continue;
            }
        };

        for result in &results {
            match engine
                .analyze_pending(result.account_id, started, &connection.tenant_id)
                .await
            {
                Ok(batch) => {
                    summary.analyzed_transactions += batch.analyzed;
                    summary.failed_analyses += batch.failed.len();
                }
                Err(e) => error!(account_id = %result.account_id, "Analysis failed: {}", e),
            }
        }
    }

    summary
}
