// SQLite storage layer with sqlx

pub mod encryption;
pub mod enforcer;
pub mod models;
pub mod repositories;
pub mod vault;

pub use encryption::{generate_encryption_key, EncryptionService};
pub use enforcer::Enforcer;
pub use models::*;
pub use repositories::Database;
pub use vault::{OpenBaoConfig, OpenBaoVault, SqliteVault};
