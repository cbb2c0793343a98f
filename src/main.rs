use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use finguard_core::adapters::PgBankingStore;
use finguard_core::cli::{self, Cli, Commands, RulesCommands};
use finguard_core::config::{Config, LogFormat};
use finguard_core::error::AppError;
use finguard_core::provider::OpenBankingClient;
use finguard_core::services::anomaly::AnomalyConfig;
use finguard_core::services::scheduler::{run_sync_scheduler, StoreEngineFactory};
use finguard_core::services::sync::SyncService;
use finguard_core::db;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        let code = e.downcast_ref::<AppError>().map(AppError::exit_code).unwrap_or(1);
        tracing::error!("{:#}", e);
        eprintln!("✗ {:#}", e);
        std::process::exit(code);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    // Rule tooling works on files only and needs no configuration.
    if let Commands::Rules(command) = &cli.command {
        init_tracing(LogFormat::Text);
        return match command {
            RulesCommands::Check { file } => cli::handle_rules_check(file),
            RulesCommands::Preview {
                rules_file,
                transactions_file,
            } => cli::handle_rules_preview(rules_file, transactions_file),
        };
    }

    let config = Config::from_env().map_err(|e| AppError::Config(format!("{:#}", e)))?;
    init_tracing(config.log_format);

    match cli.command {
        Commands::Config => cli::handle_config_validate(&config),
        Commands::Sync { connection_id } => {
            let store = Arc::new(PgBankingStore::new(db::create_pool(&config).await?));
            let sync = build_sync_service(&config, store);
            cli::handle_sync(&sync, connection_id).await
        }
        Commands::Analyze {
            account_id,
            tenant,
            days,
            persist,
        } => {
            let store = Arc::new(PgBankingStore::new(db::create_pool(&config).await?));
            cli::handle_analyze(store, account_id, &tenant, days, persist).await
        }
        Commands::Schedule => {
            let store = Arc::new(PgBankingStore::new(db::create_pool(&config).await?));
            let sync = Arc::new(build_sync_service(&config, store.clone()));
            let engines = Arc::new(StoreEngineFactory::new(store, AnomalyConfig::default()));

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("Shutdown requested");
                    let _ = shutdown_tx.send(true);
                }
            });

            run_sync_scheduler(sync, engines, config.sync_interval(), shutdown_rx).await;
            Ok(())
        }
        Commands::Rules(_) => Ok(()),
    }
}

fn build_sync_service(config: &Config, store: Arc<PgBankingStore>) -> SyncService {
    let provider = Arc::new(OpenBankingClient::new(config.provider_settings()));
    tracing::info!("Open-banking client initialized with URL: {}", config.provider_base_url);

    SyncService::new(store, provider, config.sync_options()).with_mapper(config.mapper())
}

fn init_tracing(format: LogFormat) {
    let filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
    }
}
