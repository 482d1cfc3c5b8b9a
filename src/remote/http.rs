//! Default HTTP implementation of [`PageFetcher`].
//!
//! Speaks a GitLab-style REST API for merge requests and a Jira-style REST
//! API for work items. Serde types here match the wire responses and are
//! kept separate from the domain types in `types.rs`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::config::Config;
use crate::error::{FetchError, FetchResult};

use super::client::{Page, PageFetcher};
use super::types::{MergeRequest, MergeRequestState, WorkItem, WorkItemState};

/// HTTP-backed page fetcher for both sources.
#[derive(Clone)]
pub struct HttpFetcher {
  http: reqwest::Client,
  review_url: Url,
  review_token: String,
  tracker_url: Url,
  tracker_email: Option<String>,
  tracker_token: String,
}

impl HttpFetcher {
  pub fn new(config: &Config) -> Result<Self> {
    let review_url = Url::parse(&config.review_source.url)
      .map_err(|e| eyre!("Invalid review source url {}: {}", config.review_source.url, e))?;
    let tracker_url = Url::parse(&config.tracker_source.url)
      .map_err(|e| eyre!("Invalid tracker source url {}: {}", config.tracker_source.url, e))?;

    Ok(Self {
      http: reqwest::Client::new(),
      review_url,
      review_token: Config::review_token()?,
      tracker_url,
      tracker_email: config.tracker_source.email.clone(),
      tracker_token: Config::tracker_token()?,
    })
  }

  fn review_endpoint(&self, path: &str) -> FetchResult<Url> {
    self
      .review_url
      .join(path)
      .map_err(|e| FetchError::Client(format!("bad endpoint {}: {}", path, e)))
  }

  fn tracker_endpoint(&self, path: &str) -> FetchResult<Url> {
    self
      .tracker_url
      .join(path)
      .map_err(|e| FetchError::Client(format!("bad endpoint {}: {}", path, e)))
  }
}

/// Classify a response status: 429 and 5xx are transient, other failures are
/// client errors terminal for the call.
fn classify_status(status: StatusCode, url: &Url) -> FetchError {
  if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
    FetchError::Transient(format!("{} returned {}", url, status))
  } else {
    FetchError::Client(format!("{} returned {}", url, status))
  }
}

fn send_error(e: reqwest::Error) -> FetchError {
  // Connection, DNS and timeout failures never got a status line; all are
  // worth retrying.
  FetchError::Transient(e.to_string())
}

fn decode_error(e: reqwest::Error) -> FetchError {
  FetchError::Client(format!("undecodable response body: {}", e))
}

#[async_trait]
impl PageFetcher for HttpFetcher {
  async fn merge_requests_page(
    &self,
    group: &str,
    page: u32,
    per_page: u32,
  ) -> FetchResult<Page<MergeRequest>> {
    let mut url = self.review_endpoint(&format!("api/v4/groups/{}/merge_requests", group))?;
    url
      .query_pairs_mut()
      .append_pair("state", "all")
      .append_pair("page", &page.to_string())
      .append_pair("per_page", &per_page.to_string());

    debug!(%url, "fetching merge request page");
    let response = self
      .http
      .get(url.clone())
      .header("PRIVATE-TOKEN", &self.review_token)
      .send()
      .await
      .map_err(send_error)?;

    let status = response.status();
    if !status.is_success() {
      return Err(classify_status(status, &url));
    }

    let next_page = response
      .headers()
      .get("x-next-page")
      .and_then(|v| v.to_str().ok())
      .and_then(|v| v.parse::<u32>().ok());
    let total = response
      .headers()
      .get("x-total")
      .and_then(|v| v.to_str().ok())
      .and_then(|v| v.parse::<u64>().ok());

    let records: Vec<ApiMergeRequest> = response.json().await.map_err(decode_error)?;

    Ok(Page {
      records: records.into_iter().map(ApiMergeRequest::into_domain).collect(),
      next_page,
      total,
    })
  }

  async fn work_items_page(
    &self,
    projects: &[String],
    page: u32,
    per_page: u32,
  ) -> FetchResult<Page<WorkItem>> {
    let jql = format!("project in ({}) ORDER BY updated DESC", projects.join(", "));
    let start_at = (page.saturating_sub(1)) as u64 * per_page as u64;

    let mut url = self.tracker_endpoint("rest/api/2/search")?;
    url
      .query_pairs_mut()
      .append_pair("jql", &jql)
      .append_pair("startAt", &start_at.to_string())
      .append_pair("maxResults", &per_page.to_string());

    debug!(%url, "fetching work item page");
    let response = self
      .http
      .get(url.clone())
      .basic_auth(
        self.tracker_email.as_deref().unwrap_or_default(),
        Some(&self.tracker_token),
      )
      .send()
      .await
      .map_err(send_error)?;

    let status = response.status();
    if !status.is_success() {
      return Err(classify_status(status, &url));
    }

    let body: ApiSearchResponse = response.json().await.map_err(decode_error)?;

    let fetched = start_at + body.issues.len() as u64;
    let next_page = if fetched < body.total && !body.issues.is_empty() {
      Some(page + 1)
    } else {
      None
    };

    Ok(Page {
      records: body.issues.into_iter().map(ApiIssue::into_domain).collect(),
      next_page,
      total: Some(body.total),
    })
  }

  async fn work_item(&self, key: &str) -> FetchResult<Option<WorkItem>> {
    let url = self.tracker_endpoint(&format!("rest/api/2/issue/{}", key))?;

    let response = self
      .http
      .get(url.clone())
      .basic_auth(
        self.tracker_email.as_deref().unwrap_or_default(),
        Some(&self.tracker_token),
      )
      .send()
      .await
      .map_err(send_error)?;

    let status = response.status();
    if status == StatusCode::NOT_FOUND {
      return Ok(None);
    }
    if !status.is_success() {
      return Err(classify_status(status, &url));
    }

    let issue: ApiIssue = response.json().await.map_err(decode_error)?;
    Ok(Some(issue.into_domain()))
  }
}

// ============================================================================
// Review source (GitLab-style) wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct ApiMrAuthor {
  username: String,
}

#[derive(Debug, Deserialize)]
struct ApiMergeRequest {
  iid: u64,
  title: String,
  #[serde(default)]
  description: Option<String>,
  source_branch: String,
  author: ApiMrAuthor,
  #[serde(default)]
  reviewers: Vec<ApiMrAuthor>,
  #[serde(default)]
  labels: Vec<String>,
  state: String,
  created_at: DateTime<Utc>,
  updated_at: DateTime<Utc>,
  #[serde(default)]
  web_url: String,
}

impl ApiMergeRequest {
  fn into_domain(self) -> MergeRequest {
    let state = match self.state.as_str() {
      "opened" => MergeRequestState::Open,
      "merged" => MergeRequestState::Merged,
      _ => MergeRequestState::Closed,
    };

    MergeRequest {
      id: self.iid,
      title: self.title,
      description: self.description.unwrap_or_default(),
      source_branch: self.source_branch,
      author: self.author.username,
      reviewers: self.reviewers.into_iter().map(|r| r.username).collect(),
      labels: self.labels,
      state,
      created_at: self.created_at,
      updated_at: self.updated_at,
      web_url: self.web_url,
    }
  }
}

// ============================================================================
// Tracker source (Jira-style) wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct ApiSearchResponse {
  #[serde(default)]
  issues: Vec<ApiIssue>,
  #[serde(default)]
  total: u64,
}

#[derive(Debug, Deserialize)]
struct ApiIssue {
  key: String,
  #[serde(default)]
  fields: ApiIssueFields,
}

#[derive(Debug, Deserialize, Default)]
struct ApiIssueFields {
  #[serde(default)]
  summary: String,
  status: Option<ApiStatus>,
  #[serde(rename = "issuetype")]
  issue_type: Option<ApiIssueType>,
  assignee: Option<ApiUser>,
  priority: Option<ApiPriority>,
  // Description can be a plain string (API v2) or an ADF document (v3)
  description: Option<serde_json::Value>,
  #[serde(default)]
  created: String,
  #[serde(default)]
  updated: String,
}

#[derive(Debug, Deserialize)]
struct ApiStatus {
  name: String,
}

#[derive(Debug, Deserialize)]
struct ApiIssueType {
  name: String,
}

#[derive(Debug, Deserialize)]
struct ApiUser {
  name: Option<String>,
  #[serde(rename = "displayName")]
  display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiPriority {
  name: String,
}

impl ApiIssue {
  fn into_domain(self) -> WorkItem {
    let f = self.fields;
    let state = f
      .status
      .as_ref()
      .map(|s| map_status(&s.name))
      .unwrap_or(WorkItemState::Open);

    WorkItem {
      key: self.key,
      title: f.summary,
      description: f.description.as_ref().and_then(extract_description).unwrap_or_default(),
      state,
      item_type: f.issue_type.map(|t| t.name).unwrap_or_default(),
      priority: f.priority.map(|p| p.name),
      assignee: f.assignee.and_then(|u| u.name.or(u.display_name)),
      created_at: parse_tracker_timestamp(&f.created),
      updated_at: parse_tracker_timestamp(&f.updated),
    }
  }
}

fn map_status(name: &str) -> WorkItemState {
  let lower = name.to_lowercase();
  if lower.contains("cancel") {
    WorkItemState::Cancelled
  } else if lower.contains("done") || lower.contains("closed") || lower.contains("resolved") {
    WorkItemState::Done
  } else if lower.contains("progress") || lower.contains("review") {
    WorkItemState::InProgress
  } else {
    WorkItemState::Open
  }
}

/// Tracker timestamps arrive as "2024-01-15T09:30:00.000+0000" or RFC 3339.
/// An unparseable timestamp falls back to now, which keeps the record out of
/// the overdue/stalled buckets instead of pinning it to the epoch.
fn parse_tracker_timestamp(s: &str) -> DateTime<Utc> {
  DateTime::parse_from_rfc3339(s)
    .or_else(|_| DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.3f%z"))
    .map(|dt| dt.with_timezone(&Utc))
    .unwrap_or_else(|_| Utc::now())
}

/// Extract plain text from a string (API v2) or ADF document (API v3).
fn extract_description(value: &serde_json::Value) -> Option<String> {
  if let Some(s) = value.as_str() {
    return Some(s.to_string());
  }

  if let Some(content) = value.get("content").and_then(|v| v.as_array()) {
    let mut text = String::new();
    extract_adf_text(content, &mut text);
    if !text.is_empty() {
      return Some(text);
    }
  }

  None
}

/// Recursively extract text nodes from ADF content.
fn extract_adf_text(content: &[serde_json::Value], output: &mut String) {
  for node in content {
    match node.get("type").and_then(|v| v.as_str()) {
      Some("text") => {
        if let Some(text) = node.get("text").and_then(|v| v.as_str()) {
          output.push_str(text);
        }
      }
      Some("hardBreak") => output.push('\n'),
      Some("paragraph") | Some("heading") => {
        if let Some(children) = node.get("content").and_then(|v| v.as_array()) {
          extract_adf_text(children, output);
        }
        output.push('\n');
      }
      _ => {
        if let Some(children) = node.get("content").and_then(|v| v.as_array()) {
          extract_adf_text(children, output);
        }
      }
    }
  }
}
