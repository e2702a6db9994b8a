// Access-control policy queries
//
// A DID may manage settings (secrets) for a repo when it owns the spindle,
// is a spindle member, or owns the repo itself (the repo path leads with its
// DID).

use anyhow::Result;

use crate::repositories::Database;

#[derive(Clone)]
pub struct Enforcer {
    db: Database,
    owner: String,
}

impl Enforcer {
    pub fn new(db: Database, owner: impl Into<String>) -> Self {
        Self {
            db,
            owner: owner.into(),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// May `did` change settings for `repo_path` ("<did>/<repo>") on
    /// `domain`? The spindle only answers for itself; other domains are
    /// denied outright.
    pub async fn is_settings_allowed(
        &self,
        did: &str,
        domain: &str,
        repo_path: &str,
    ) -> Result<bool> {
        if domain != "thisserver" {
            return Ok(false);
        }
        if did == self.owner {
            return Ok(true);
        }
        if self.db.is_member(did).await? {
            return Ok(true);
        }
        Ok(repo_path
            .split_once('/')
            .is_some_and(|(repo_did, _)| repo_did == did))
    }

    pub async fn is_spindle_member(&self, did: &str) -> Result<bool> {
        Ok(did == self.owner || self.db.is_member(did).await?)
    }

    pub async fn is_knot_owner(&self, did: &str, knot: &str) -> Result<bool> {
        Ok(self.db.knot_owner(knot).await?.as_deref() == Some(did))
    }

    pub async fn is_knot_member(&self, did: &str, knot: &str) -> Result<bool> {
        if self.is_knot_owner(did, knot).await? {
            return Ok(true);
        }
        self.db.is_knot_member(knot, did).await
    }
}
