// Pluggable secret store backends
//
// Two implementations of spindle_core::Vault: the embedded secrets table
// (optionally encrypting values at rest) and a remote OpenBao KV v2 mount.

mod openbao;
mod sqlite;

pub use openbao::{OpenBaoConfig, OpenBaoVault};
pub use sqlite::SqliteVault;
