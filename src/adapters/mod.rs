//! Storage adapters implementing the repository ports.

pub mod memory;
pub mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PgBankingStore;
