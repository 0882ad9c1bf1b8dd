// Declare modules within the adapters directory
pub mod clock;
pub mod in_memory_store;
pub mod postgres_store;

pub use clock::{ManualClock, SystemClock};
pub use in_memory_store::InMemoryLedgerStore;
pub use postgres_store::PostgresLedgerStore;
