// Trigger metadata carried by pipeline records
//
// The shape is a tagged union: `kind` selects which of the optional payloads
// is populated. Unknown payload combinations are tolerated at parse time and
// rejected by the matcher.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// What caused the pipeline to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Push,
    PullRequest,
    Manual,
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TriggerKind::Push => "push",
            TriggerKind::PullRequest => "pull_request",
            TriggerKind::Manual => "manual",
        };
        f.write_str(s)
    }
}

/// Push payload: the updated ref and the shas on either side
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushTrigger {
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub old_sha: String,
    pub new_sha: String,
}

/// Pull-request payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestTrigger {
    pub source_branch: String,
    pub target_branch: String,
    pub source_sha: String,
    pub action: String,
}

/// Manual payload: free-form inputs supplied by the requester
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManualTrigger {
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
}

/// The repository the trigger fired on
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerRepo {
    /// Hostname of the knot serving the repository
    pub knot: String,
    /// DID of the repository owner
    pub did: String,
    /// Repository name
    pub repo: String,
}

impl TriggerRepo {
    /// `<did>/<repo>` form used as the vault key space
    pub fn did_slash_repo(&self) -> String {
        format!("{}/{}", self.did, self.repo)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerMetadata {
    pub kind: TriggerKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push: Option<PushTrigger>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_request: Option<PullRequestTrigger>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manual: Option<ManualTrigger>,
    pub repo: TriggerRepo,
}

impl TriggerMetadata {
    /// The commit the clone step should fetch, when the trigger names one.
    /// Manual triggers carry no sha; the clone falls back to the remote HEAD.
    pub fn sha(&self) -> Option<&str> {
        match self.kind {
            TriggerKind::Push => self.push.as_ref().map(|p| p.new_sha.as_str()),
            TriggerKind::PullRequest => self.pull_request.as_ref().map(|p| p.source_sha.as_str()),
            TriggerKind::Manual => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_roundtrip() {
        let json = serde_json::json!({
            "kind": "push",
            "push": {"ref": "refs/heads/main", "oldSha": "aaa", "newSha": "bbb"},
            "repo": {"knot": "knot.example.com", "did": "did:plc:abc", "repo": "widget"}
        });
        let t: TriggerMetadata = serde_json::from_value(json).unwrap();
        assert_eq!(t.kind, TriggerKind::Push);
        assert_eq!(t.sha(), Some("bbb"));
        assert_eq!(t.repo.did_slash_repo(), "did:plc:abc/widget");
    }

    #[test]
    fn test_pull_request_sha() {
        let json = serde_json::json!({
            "kind": "pull_request",
            "pullRequest": {
                "sourceBranch": "feature",
                "targetBranch": "main",
                "sourceSha": "ccc",
                "action": "opened"
            },
            "repo": {"knot": "knot.example.com", "did": "did:plc:abc", "repo": "widget"}
        });
        let t: TriggerMetadata = serde_json::from_value(json).unwrap();
        assert_eq!(t.sha(), Some("ccc"));
    }

    #[test]
    fn test_manual_has_no_sha() {
        let json = serde_json::json!({
            "kind": "manual",
            "manual": {"inputs": {"target": "staging"}},
            "repo": {"knot": "knot.example.com", "did": "did:plc:abc", "repo": "widget"}
        });
        let t: TriggerMetadata = serde_json::from_value(json).unwrap();
        assert_eq!(t.sha(), None);
        assert_eq!(t.manual.unwrap().inputs["target"], "staging");
    }
}
