//! Per-user storage clients: PostgreSQL, per-user SQLite, Valkey, Vault.

mod postgres;
mod userdata;
mod valkey;
mod vault;

pub use postgres::{PgContinuumStore, PoolRegistry, PostgresClient, SqlParam};
pub use userdata::{UserDataManager, UserDataRegistry};
pub use valkey::{TtlPersistence, ValkeyClient};
pub use vault::VaultClient;
