//! The external page-fetch collaborator.
//!
//! The HTTP layer that performs authenticated requests is consumed through
//! this trait; the core never talks to the network directly. Tests substitute
//! scripted implementations.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::FetchResult;

use super::types::{MergeRequest, WorkItem};

/// One page of records from an external source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
  pub records: Vec<T>,
  /// Next page number, if more pages exist.
  pub next_page: Option<u32>,
  /// Total record count across all pages, when the source reports it.
  pub total: Option<u64>,
}

impl<T> Page<T> {
  /// A single page holding everything (no further pages).
  pub fn complete(records: Vec<T>) -> Self {
    let total = records.len() as u64;
    Self {
      records,
      next_page: None,
      total: Some(total),
    }
  }
}

/// Fetches single pages from the two external sources.
///
/// Errors are classified by the implementor: network/5xx conditions as
/// [`FetchError::Transient`](crate::error::FetchError::Transient), 4xx-style
/// conditions as [`FetchError::Client`](crate::error::FetchError::Client).
#[async_trait]
pub trait PageFetcher: Send + Sync {
  /// One page of merge requests for a group.
  async fn merge_requests_page(
    &self,
    group: &str,
    page: u32,
    per_page: u32,
  ) -> FetchResult<Page<MergeRequest>>;

  /// One page of work items across the given projects.
  async fn work_items_page(
    &self,
    projects: &[String],
    page: u32,
    per_page: u32,
  ) -> FetchResult<Page<WorkItem>>;

  /// Look up a single work item by reference key. `Ok(None)` means the key
  /// has no matching record (non-fatal for enrichment).
  async fn work_item(&self, key: &str) -> FetchResult<Option<WorkItem>>;
}
