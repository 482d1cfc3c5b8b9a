//! Paginated, retrying fetch client over a [`PageFetcher`].
//!
//! Each source is fetched page by page in increasing page order. Raw pages
//! are cached unfiltered (a later relevance-set change must not force a
//! refetch); the assembled, relevance-filtered dataset is cached under a key
//! built from the base parameters with the page excluded.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::{cache_key, Tier, TieredCache};
use crate::config::{Config, RetryConfig};
use crate::error::{FetchError, FetchResult};
use crate::identity::IdentityProvider;

use super::client::{Page, PageFetcher};
use super::types::{MergeRequest, Source, WorkItem};

const PER_PAGE: u32 = 50;

/// Fetch client for both external sources with caching and bounded retry.
pub struct FetchClient<F: PageFetcher> {
  fetcher: Arc<F>,
  cache: Arc<TieredCache>,
  identities: Arc<dyn IdentityProvider>,
  group: Option<String>,
  projects: Vec<String>,
  retry: RetryConfig,
}

impl<F: PageFetcher> FetchClient<F> {
  pub fn new(
    fetcher: Arc<F>,
    cache: Arc<TieredCache>,
    identities: Arc<dyn IdentityProvider>,
    config: &Config,
  ) -> Self {
    Self {
      fetcher,
      cache,
      identities,
      group: config.review_source.group.clone(),
      projects: config.tracker_source.projects.clone(),
      retry: config.retry,
    }
  }

  /// Fetch all relevant merge requests.
  ///
  /// Missing group configuration and an empty identity set both degrade to
  /// an empty result with a logged warning; neither is an error.
  pub async fn fetch_merge_requests(&self, bypass_cache: bool) -> FetchResult<Vec<MergeRequest>> {
    let Some(group) = self.group.clone() else {
      warn!("no review source group configured, returning no merge requests");
      return Ok(Vec::new());
    };

    let ids = self.identities.current_ids();
    if ids.is_empty() {
      warn!("identity set is empty, no merge requests are relevant");
      return Ok(Vec::new());
    }

    let base_key = cache_key("mrs", &json!({"group": group, "per_page": PER_PAGE}));

    if !bypass_cache {
      if let Some(cached) = self.cache.get::<Vec<MergeRequest>>(Tier::Derived, &base_key) {
        debug!(key = %base_key, "serving merge requests from dataset cache");
        return Ok(cached);
      }
    }

    let fetcher = Arc::clone(&self.fetcher);
    let all = self
      .fetch_all_pages(Source::MergeRequests, &base_key, bypass_cache, |page| {
        let fetcher = Arc::clone(&fetcher);
        let group = group.clone();
        async move { fetcher.merge_requests_page(&group, page, PER_PAGE).await }
      })
      .await?;

    // Relevance is applied after all pages so the per-page cache stays
    // unfiltered.
    let filtered: Vec<MergeRequest> = all
      .into_iter()
      .filter(|mr| mr_is_relevant(mr, &ids))
      .collect();

    self.cache.set(Tier::Derived, &base_key, &filtered, None);
    Ok(filtered)
  }

  /// Fetch all relevant work items across the configured projects.
  pub async fn fetch_work_items(&self, bypass_cache: bool) -> FetchResult<Vec<WorkItem>> {
    if self.projects.is_empty() {
      warn!("no tracker projects configured, returning no work items");
      return Ok(Vec::new());
    }

    let ids = self.identities.current_ids();
    if ids.is_empty() {
      warn!("identity set is empty, no work items are relevant");
      return Ok(Vec::new());
    }

    let base_key = cache_key(
      "work_items",
      &json!({"projects": self.projects, "per_page": PER_PAGE}),
    );

    if !bypass_cache {
      if let Some(cached) = self.cache.get::<Vec<WorkItem>>(Tier::Derived, &base_key) {
        debug!(key = %base_key, "serving work items from dataset cache");
        return Ok(cached);
      }
    }

    let fetcher = Arc::clone(&self.fetcher);
    let projects = self.projects.clone();
    let all = self
      .fetch_all_pages(Source::WorkItems, &base_key, bypass_cache, |page| {
        let fetcher = Arc::clone(&fetcher);
        let projects = projects.clone();
        async move { fetcher.work_items_page(&projects, page, PER_PAGE).await }
      })
      .await?;

    let filtered: Vec<WorkItem> = all
      .into_iter()
      .filter(|item| item_is_relevant(item, &ids))
      .collect();

    self.cache.set(Tier::Derived, &base_key, &filtered, None);
    Ok(filtered)
  }

  /// Resolve a single work item by reference key, through the raw cache.
  ///
  /// `Ok(None)` means the key has no matching record; enrichment treats that
  /// as a per-record miss, not a batch failure.
  pub async fn lookup_work_item(&self, key: &str) -> FetchResult<Option<WorkItem>> {
    let cache_key = format!("item:{}", key);

    if let Some(cached) = self
      .cache
      .get::<WorkItem>(Tier::RawSource(Source::WorkItems), &cache_key)
    {
      return Ok(Some(cached));
    }

    let fetcher = Arc::clone(&self.fetcher);
    let key_owned = key.to_string();
    let found = self
      .with_retry(&cache_key, || {
        let fetcher = Arc::clone(&fetcher);
        let key = key_owned.clone();
        async move { fetcher.work_item(&key).await }
      })
      .await?;

    if let Some(item) = &found {
      self
        .cache
        .set(Tier::RawSource(Source::WorkItems), &cache_key, item, None);
    }

    Ok(found)
  }

  /// Accumulate every page in increasing page order. Pages already present in
  /// the raw tier are served from cache unless bypassed; fetched pages are
  /// cached individually, including their pagination cursor.
  async fn fetch_all_pages<T, Fut, Op>(
    &self,
    source: Source,
    base_key: &str,
    bypass_cache: bool,
    mut fetch_page: Op,
  ) -> FetchResult<Vec<T>>
  where
    T: Clone + Serialize + DeserializeOwned,
    Fut: Future<Output = FetchResult<Page<T>>>,
    Op: FnMut(u32) -> Fut,
  {
    let mut all = Vec::new();
    let mut page = 1u32;

    loop {
      let page_key = format!("{}:page:{}", base_key, page);

      let cached: Option<Page<T>> = if bypass_cache {
        None
      } else {
        self.cache.get(Tier::RawSource(source), &page_key)
      };

      let fetched = match cached {
        Some(p) => p,
        None => {
          let p = self.with_retry(&page_key, || fetch_page(page)).await?;
          self.cache.set(Tier::RawSource(source), &page_key, &p, None);
          p
        }
      };

      all.extend(fetched.records);

      match fetched.next_page {
        Some(next) => page = next,
        None => break,
      }
    }

    Ok(all)
  }

  /// Run one page fetch with bounded exponential backoff.
  ///
  /// The attempt counter belongs to this call only, so a page that succeeds
  /// after retries does not shrink the budget of later pages. Exhausting the
  /// budget aborts the whole `fetch_all`; partial results are discarded.
  async fn with_retry<T, Fut, Op>(&self, what: &str, mut op: Op) -> FetchResult<T>
  where
    Fut: Future<Output = FetchResult<T>>,
    Op: FnMut() -> Fut,
  {
    let mut attempt = 0u32;

    loop {
      match op().await {
        Ok(value) => return Ok(value),
        Err(e) if e.is_retryable() && attempt < self.retry.max_retries => {
          let delay = self.retry.backoff_delay(attempt);
          warn!(what, attempt, ?delay, error = %e, "transient fetch failure, backing off");
          tokio::time::sleep(delay).await;
          attempt += 1;
        }
        Err(FetchError::Transient(last_error)) => {
          return Err(FetchError::RetriesExhausted {
            attempts: attempt + 1,
            last_error,
          });
        }
        Err(e) => return Err(e),
      }
    }
  }
}

fn mr_is_relevant(mr: &MergeRequest, ids: &BTreeSet<String>) -> bool {
  ids.contains(&mr.author.to_lowercase())
    || mr.reviewers.iter().any(|r| ids.contains(&r.to_lowercase()))
}

fn item_is_relevant(item: &WorkItem, ids: &BTreeSet<String>) -> bool {
  item
    .assignee
    .as_deref()
    .map(|a| ids.contains(&a.to_lowercase()))
    .unwrap_or(false)
}
