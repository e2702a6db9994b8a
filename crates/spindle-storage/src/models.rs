// Database models (internal, may differ from public DTOs)

use chrono::{DateTime, Utc};
use sqlx::FromRow;

/// Status event row from the events table
#[derive(Debug, Clone, FromRow)]
pub struct EventRow {
    pub id: i64,
    pub rkey: String,
    pub nsid: String,
    /// JSON document; shape depends on nsid
    pub event: String,
    /// Unix nanoseconds, strictly increasing per process
    pub created: i64,
}

/// Knot row
#[derive(Debug, Clone, FromRow)]
pub struct KnotRow {
    pub hostname: String,
    pub owner: String,
    pub registered: DateTime<Utc>,
}

/// Repository row
#[derive(Debug, Clone, FromRow)]
pub struct RepoRow {
    pub at_uri: String,
    pub did: String,
    pub name: String,
    pub knot: String,
}

/// Spindle member row
#[derive(Debug, Clone, FromRow)]
pub struct MemberRow {
    pub did: String,
    pub added_by: String,
    pub rkey: String,
    pub created_at: DateTime<Utc>,
}

/// Secret row from the embedded vault backend
#[derive(Debug, Clone, FromRow)]
pub struct SecretRow {
    pub repo: String,
    pub key: String,
    pub value: String,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
}
