use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The two independent external sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
  /// Code-review requests (merge requests).
  MergeRequests,
  /// Tracked work items.
  WorkItems,
}

impl std::fmt::Display for Source {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Source::MergeRequests => write!(f, "merge_requests"),
      Source::WorkItems => write!(f, "work_items"),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeRequestState {
  Open,
  Merged,
  Closed,
}

/// A code-review request from the review source. Read-only once returned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeRequest {
  pub id: u64,
  pub title: String,
  #[serde(default)]
  pub description: String,
  pub source_branch: String,
  pub author: String,
  #[serde(default)]
  pub reviewers: Vec<String>,
  #[serde(default)]
  pub labels: Vec<String>,
  pub state: MergeRequestState,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  #[serde(default)]
  pub web_url: String,
}

impl MergeRequest {
  pub fn is_open(&self) -> bool {
    self.state == MergeRequestState::Open
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemState {
  Open,
  InProgress,
  Done,
  Cancelled,
}

/// A tracked work item from the tracker source. Read-only once returned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
  pub key: String,
  pub title: String,
  #[serde(default)]
  pub description: String,
  pub state: WorkItemState,
  pub item_type: String,
  pub priority: Option<String>,
  pub assignee: Option<String>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}
