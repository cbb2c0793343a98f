pub mod anomaly;
pub mod mapper;
pub mod rules;
pub mod scheduler;
pub mod sync;

pub use anomaly::{AnalysisResult, AnomalyConfig, AnomalyEngine, BatchAnalysis};
pub use mapper::{MappingError, TransactionMapper};
pub use scheduler::{run_sync_scheduler, EngineFactory, StoreEngineFactory};
pub use sync::{SyncError, SyncOptions, SyncResult, SyncService};
