//! Version history and branch bookkeeping.
//!
//! The server owns the real history; the client keeps a local timeline
//! mirror so the UI can render a history panel without a round trip per
//! frame. Branch and tag mutations are requested over the wire and the
//! mirror is updated from the server's replies, never speculatively.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::Operation;

/// One committed point in document history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentVersion {
    pub id: Uuid,
    pub message: String,
    pub author: String,
    /// Milliseconds since the Unix epoch, assigned by the server.
    pub timestamp: u64,
    pub operations: Vec<Operation>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A named line of history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub name: String,
    /// Latest version on the branch, `None` for a branch with no commits.
    pub head: Option<Uuid>,
    pub created_at: u64,
}

/// How to combine histories when merging a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStrategy {
    #[default]
    ThreeWay,
    Ours,
    Theirs,
}

/// Local mirror of the server's version history.
///
/// Versions are kept sorted by timestamp. Out-of-order arrival is normal
/// right after a reconnect, when live `version_update` traffic races the
/// history backfill.
#[derive(Debug, Clone, Default)]
pub struct VersionTimeline {
    versions: Vec<DocumentVersion>,
    branches: Vec<Branch>,
    current_branch: Option<String>,
}

impl VersionTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a version at its timestamp position. Re-announcing an id
    /// already present is a no-op, so replayed frames are harmless.
    pub fn record(&mut self, version: DocumentVersion) {
        if self.versions.iter().any(|v| v.id == version.id) {
            return;
        }
        let idx = self
            .versions
            .partition_point(|v| v.timestamp <= version.timestamp);
        self.versions.insert(idx, version);
    }

    /// Replace the whole timeline with a server snapshot, preserving the
    /// server's ordering verbatim.
    pub fn set_history(&mut self, versions: Vec<DocumentVersion>) {
        self.versions = versions;
    }

    /// Attach a tag to a version. Returns `false` if the version is not
    /// in the mirror yet.
    pub fn tag(&mut self, version_id: Uuid, tag: impl Into<String>) -> bool {
        match self.versions.iter_mut().find(|v| v.id == version_id) {
            Some(version) => {
                let tag = tag.into();
                if !version.tags.contains(&tag) {
                    version.tags.push(tag);
                }
                true
            }
            None => false,
        }
    }

    /// Add or refresh a branch by name.
    pub fn upsert_branch(&mut self, branch: Branch) {
        match self.branches.iter_mut().find(|b| b.name == branch.name) {
            Some(existing) => *existing = branch,
            None => self.branches.push(branch),
        }
    }

    pub fn switch_to(&mut self, branch: impl Into<String>) {
        self.current_branch = Some(branch.into());
    }

    /// The checked-out branch; "main" until the server says otherwise.
    pub fn current_branch(&self) -> &str {
        self.current_branch.as_deref().unwrap_or("main")
    }

    pub fn find(&self, version_id: Uuid) -> Option<&DocumentVersion> {
        self.versions.iter().find(|v| v.id == version_id)
    }

    pub fn latest(&self) -> Option<&DocumentVersion> {
        self.versions.last()
    }

    pub fn versions(&self) -> &[DocumentVersion] {
        &self.versions
    }

    pub fn branches(&self) -> &[Branch] {
        &self.branches
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    pub fn clear(&mut self) {
        self.versions.clear();
        self.branches.clear();
        self.current_branch = None;
    }
}

/// A history mutation the client wants the server to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum VersionRequest {
    CreateBranch { name: String },
    SwitchBranch { name: String },
    MergeBranch { source: String, strategy: MergeStrategy },
    CreateTag { name: String, version_id: Option<Uuid> },
    History,
}

impl VersionRequest {
    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            VersionRequest::CreateBranch { .. } => "create_branch",
            VersionRequest::SwitchBranch { .. } => "switch_branch",
            VersionRequest::MergeBranch { .. } => "merge_branch",
            VersionRequest::CreateTag { .. } => "create_tag",
            VersionRequest::History => "version_history",
        }
    }
}

/// The server's answer to a [`VersionRequest`].
#[derive(Debug, Clone, PartialEq)]
pub enum VersionReply {
    BranchCreated(Branch),
    BranchSwitched { branch: Branch, version: u64 },
    BranchMerged(DocumentVersion),
    TagCreated { version_id: Uuid, tag: String },
    History(Vec<DocumentVersion>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn version(ts: u64, message: &str) -> DocumentVersion {
        DocumentVersion {
            id: Uuid::new_v4(),
            message: message.into(),
            author: "alice".into(),
            timestamp: ts,
            operations: vec![json!({"op": "noop"})],
            tags: Vec::new(),
        }
    }

    #[test]
    fn test_record_keeps_timestamp_order() {
        let mut timeline = VersionTimeline::new();
        timeline.record(version(30, "third"));
        timeline.record(version(10, "first"));
        timeline.record(version(20, "second"));

        let messages: Vec<_> = timeline.versions().iter().map(|v| v.message.as_str()).collect();
        assert_eq!(messages, ["first", "second", "third"]);
        assert_eq!(timeline.latest().unwrap().message, "third");
    }

    #[test]
    fn test_record_equal_timestamps_preserve_arrival_order() {
        let mut timeline = VersionTimeline::new();
        timeline.record(version(10, "a"));
        timeline.record(version(10, "b"));

        let messages: Vec<_> = timeline.versions().iter().map(|v| v.message.as_str()).collect();
        assert_eq!(messages, ["a", "b"]);
    }

    #[test]
    fn test_record_is_idempotent_by_id() {
        let mut timeline = VersionTimeline::new();
        let v = version(10, "only");
        timeline.record(v.clone());
        timeline.record(v);
        assert_eq!(timeline.len(), 1);
    }

    #[test]
    fn test_set_history_replaces_verbatim() {
        let mut timeline = VersionTimeline::new();
        timeline.record(version(99, "stale"));

        // Server order wins even if it disagrees with timestamps.
        let snapshot = vec![version(20, "newer"), version(10, "older")];
        timeline.set_history(snapshot.clone());
        assert_eq!(timeline.versions(), snapshot.as_slice());
    }

    #[test]
    fn test_tag_known_and_unknown_versions() {
        let mut timeline = VersionTimeline::new();
        let v = version(10, "taggable");
        let id = v.id;
        timeline.record(v);

        assert!(timeline.tag(id, "v1.0"));
        assert!(timeline.tag(id, "v1.0"));
        assert_eq!(timeline.find(id).unwrap().tags, ["v1.0"]);
        assert!(!timeline.tag(Uuid::new_v4(), "ghost"));
    }

    #[test]
    fn test_branch_upsert_and_switch() {
        let mut timeline = VersionTimeline::new();
        assert_eq!(timeline.current_branch(), "main");

        timeline.upsert_branch(Branch {
            name: "experiment".into(),
            head: None,
            created_at: 5,
        });
        timeline.upsert_branch(Branch {
            name: "experiment".into(),
            head: Some(Uuid::new_v4()),
            created_at: 5,
        });
        assert_eq!(timeline.branches().len(), 1);
        assert!(timeline.branches()[0].head.is_some());

        timeline.switch_to("experiment");
        assert_eq!(timeline.current_branch(), "experiment");
    }

    #[test]
    fn test_clear_resets_branch_selection() {
        let mut timeline = VersionTimeline::new();
        timeline.record(version(1, "v"));
        timeline.switch_to("side");
        timeline.clear();

        assert!(timeline.is_empty());
        assert!(timeline.branches().is_empty());
        assert_eq!(timeline.current_branch(), "main");
    }

    #[test]
    fn test_merge_strategy_wire_names() {
        assert_eq!(
            serde_json::to_value(MergeStrategy::ThreeWay).unwrap(),
            "three-way"
        );
        assert_eq!(serde_json::to_value(MergeStrategy::Ours).unwrap(), "ours");
        assert_eq!(MergeStrategy::default(), MergeStrategy::ThreeWay);
    }

    #[test]
    fn test_request_kind_labels() {
        assert_eq!(
            VersionRequest::MergeBranch {
                source: "side".into(),
                strategy: MergeStrategy::Ours
            }
            .kind(),
            "merge_branch"
        );
        assert_eq!(VersionRequest::History.kind(), "version_history");
    }
}
