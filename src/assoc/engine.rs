//! Candidate ranking, resolution and batch enrichment.

use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::warn;

use crate::overrides::OverrideStore;
use crate::remote::{FetchClient, MergeRequest, PageFetcher, WorkItem};

use super::extract::{
  extract_candidates, AssociationCandidate, CandidateSource, CONFIDENCE_MANUAL,
};

/// A merge request plus its resolved cross-reference, rebuilt on every
/// enrichment pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichedMergeRequest {
  pub merge_request: MergeRequest,
  pub reference_key: Option<String>,
  pub work_item: Option<WorkItem>,
}

/// Associates merge requests with work items.
pub struct AssociationEngine<F: PageFetcher, S: OverrideStore> {
  fetch: Arc<FetchClient<F>>,
  overrides: Arc<S>,
  prefixes: BTreeSet<String>,
}

impl<F: PageFetcher, S: OverrideStore> AssociationEngine<F, S> {
  pub fn new(fetch: Arc<FetchClient<F>>, overrides: Arc<S>, prefixes: BTreeSet<String>) -> Self {
    Self {
      fetch,
      overrides,
      prefixes,
    }
  }

  /// Ranked candidates for one merge request, descending by confidence.
  ///
  /// A manual override is always first at confidence 1.0, and the same key
  /// never appears again as an automatic entry.
  pub fn candidates_for(&self, mr: &MergeRequest) -> Vec<AssociationCandidate> {
    let mut automatic = extract_candidates(
      &mr.title,
      &mr.description,
      Some(&mr.source_branch),
      &self.prefixes,
    );

    match self.overrides.get(mr.id) {
      Some(manual) => {
        automatic.retain(|c| c.key != manual.reference_key);
        let mut candidates = vec![AssociationCandidate {
          key: manual.reference_key,
          confidence: CONFIDENCE_MANUAL,
          source: CandidateSource::Manual,
        }];
        candidates.extend(automatic);
        candidates
      }
      None => automatic,
    }
  }

  /// The single most likely reference key: the override if present, else the
  /// best automatic candidate, else nothing.
  pub fn resolve(&self, mr: &MergeRequest) -> Option<String> {
    if let Some(manual) = self.overrides.get(mr.id) {
      return Some(manual.reference_key);
    }

    extract_candidates(
      &mr.title,
      &mr.description,
      Some(&mr.source_branch),
      &self.prefixes,
    )
    .into_iter()
    .next()
    .map(|c| c.key)
  }

  /// Resolve and enrich a batch of merge requests.
  ///
  /// Each distinct key is looked up exactly once per call through a
  /// call-scoped memo map. The map never outlives this invocation, so
  /// unrelated batches cannot observe each other's lookups. A failed or
  /// empty lookup leaves that record's enrichment empty; it never fails the
  /// batch.
  pub async fn enhance(&self, mrs: Vec<MergeRequest>) -> Vec<EnrichedMergeRequest> {
    let mut memo: HashMap<String, Option<WorkItem>> = HashMap::new();
    let mut enriched = Vec::with_capacity(mrs.len());

    for mr in mrs {
      let reference_key = self.resolve(&mr);

      let work_item = match &reference_key {
        Some(key) => match memo.entry(key.clone()) {
          Entry::Occupied(hit) => hit.get().clone(),
          Entry::Vacant(slot) => {
            let found = match self.fetch.lookup_work_item(key).await {
              Ok(found) => found,
              Err(e) => {
                warn!(key, error = %e, "work item lookup failed, leaving enrichment empty");
                None
              }
            };
            slot.insert(found.clone());
            found
          }
        },
        None => None,
      };

      enriched.push(EnrichedMergeRequest {
        merge_request: mr,
        reference_key,
        work_item,
      });
    }

    enriched
  }

  /// Persist a manual override. Takes effect on the record's next
  /// enrichment; triggering a broader refresh is the caller's job.
  pub fn set_override(&self, record_id: u64, reference_key: &str) {
    self.overrides.set(record_id, reference_key);
  }

  /// Remove a manual override, restoring automatic resolution.
  pub fn clear_override(&self, record_id: u64) {
    self.overrides.remove(record_id);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::TieredCache;
  use crate::config::{CacheConfig, Config};
  use crate::error::{FetchError, FetchResult};
  use crate::identity::TeamIdentities;
  use crate::overrides::MemoryOverrideStore;
  use crate::remote::{MergeRequestState, Page, WorkItemState};
  use async_trait::async_trait;
  use chrono::Utc;
  use std::sync::atomic::{AtomicU32, Ordering};

  fn mr(id: u64, title: &str, description: &str, branch: &str) -> MergeRequest {
    MergeRequest {
      id,
      title: title.into(),
      description: description.into(),
      source_branch: branch.into(),
      author: "alice".into(),
      reviewers: vec![],
      labels: vec![],
      state: MergeRequestState::Open,
      created_at: Utc::now(),
      updated_at: Utc::now(),
      web_url: String::new(),
    }
  }

  fn work_item(key: &str) -> WorkItem {
    WorkItem {
      key: key.into(),
      title: format!("Item {}", key),
      description: String::new(),
      state: WorkItemState::Open,
      item_type: "Task".into(),
      priority: None,
      assignee: Some("alice".into()),
      created_at: Utc::now(),
      updated_at: Utc::now(),
    }
  }

  struct LookupFetcher {
    items: Vec<WorkItem>,
    lookups: AtomicU32,
    fail_lookups: bool,
  }

  impl LookupFetcher {
    fn with_items(items: Vec<WorkItem>) -> Self {
      Self {
        items,
        lookups: AtomicU32::new(0),
        fail_lookups: false,
      }
    }
  }

  #[async_trait]
  impl PageFetcher for LookupFetcher {
    async fn merge_requests_page(
      &self,
      _group: &str,
      _page: u32,
      _per_page: u32,
    ) -> FetchResult<Page<MergeRequest>> {
      Ok(Page::complete(vec![]))
    }

    async fn work_items_page(
      &self,
      _projects: &[String],
      _page: u32,
      _per_page: u32,
    ) -> FetchResult<Page<WorkItem>> {
      Ok(Page::complete(self.items.clone()))
    }

    async fn work_item(&self, key: &str) -> FetchResult<Option<WorkItem>> {
      self.lookups.fetch_add(1, Ordering::SeqCst);
      if self.fail_lookups {
        return Err(FetchError::Client("lookup disabled".into()));
      }
      Ok(self.items.iter().find(|i| i.key == key).cloned())
    }
  }

  fn test_config() -> Config {
    serde_yaml::from_str(
      r#"
review_source:
  url: https://review.example.com
  group: platform
tracker_source:
  url: https://tracker.example.com
  projects: [ABC]
team:
  identities: [alice]
retry:
  max_retries: 0
  backoff_base_ms: 1
"#,
    )
    .unwrap()
  }

  fn engine(
    fetcher: LookupFetcher,
  ) -> (
    AssociationEngine<LookupFetcher, MemoryOverrideStore>,
    Arc<LookupFetcher>,
    Arc<MemoryOverrideStore>,
  ) {
    let config = test_config();
    let fetcher = Arc::new(fetcher);
    let cache = Arc::new(TieredCache::new(CacheConfig::default()));
    let identities = Arc::new(TeamIdentities::from_config(&config.team));
    let fetch = Arc::new(FetchClient::new(
      Arc::clone(&fetcher),
      cache,
      identities,
      &config,
    ));
    let overrides = Arc::new(MemoryOverrideStore::new());
    (
      AssociationEngine::new(fetch, Arc::clone(&overrides), BTreeSet::new()),
      fetcher,
      overrides,
    )
  }

  #[test]
  fn test_manual_override_ranks_first_without_duplicates() {
    let (engine, _fetcher, overrides) = engine(LookupFetcher::with_items(vec![]));
    overrides.set(1, "XYZ-9");

    let record = mr(1, "Fix ABC-42 crash", "see DEF-7", "main");
    let candidates = engine.candidates_for(&record);

    assert_eq!(candidates[0].key, "XYZ-9");
    assert_eq!(candidates[0].confidence, 1.0);
    assert_eq!(candidates[0].source, CandidateSource::Manual);
    assert_eq!(candidates[1].key, "ABC-42");
    assert_eq!(candidates[1].source, CandidateSource::Title);
    assert_eq!(candidates[2].key, "DEF-7");
    assert_eq!(candidates[2].source, CandidateSource::Description);
  }

  #[test]
  fn test_override_matching_automatic_key_appears_once() {
    let (engine, _fetcher, overrides) = engine(LookupFetcher::with_items(vec![]));
    overrides.set(1, "ABC-42");

    let record = mr(1, "Fix ABC-42 crash", "", "main");
    let candidates = engine.candidates_for(&record);

    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].source, CandidateSource::Manual);
  }

  #[test]
  fn test_resolve_prefers_override_then_best_automatic() {
    let (engine, _fetcher, overrides) = engine(LookupFetcher::with_items(vec![]));

    let record = mr(1, "no key here", "mentions ABC-7", "feature/XYZ-3");
    assert_eq!(engine.resolve(&record).as_deref(), Some("ABC-7"));

    overrides.set(1, "XYZ-1");
    assert_eq!(engine.resolve(&record).as_deref(), Some("XYZ-1"));

    let unkeyed = mr(2, "cleanup", "", "main");
    assert_eq!(engine.resolve(&unkeyed), None);
  }

  #[tokio::test]
  async fn test_enhance_memoizes_lookups_per_call() {
    let (engine, fetcher, _overrides) = engine(LookupFetcher::with_items(vec![]));

    // Three records referencing the same missing key: the raw cache cannot
    // help (misses are not cached), so a single lookup proves the memo.
    let batch = vec![
      mr(1, "ABC-42 part one", "", "main"),
      mr(2, "ABC-42 part two", "", "main"),
      mr(3, "ABC-42 part three", "", "main"),
    ];
    let enriched = engine.enhance(batch).await;

    assert_eq!(enriched.len(), 3);
    assert!(enriched.iter().all(|e| e.work_item.is_none()));
    assert!(enriched.iter().all(|e| e.reference_key.as_deref() == Some("ABC-42")));
    assert_eq!(fetcher.lookups.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_enhance_memo_does_not_leak_between_calls() {
    let (engine, fetcher, _overrides) = engine(LookupFetcher::with_items(vec![]));

    engine.enhance(vec![mr(1, "ABC-42", "", "main")]).await;
    engine.enhance(vec![mr(2, "ABC-42", "", "main")]).await;

    // A fresh call starts with an empty memo and looks up again
    assert_eq!(fetcher.lookups.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_enhance_attaches_found_work_items() {
    let (engine, _fetcher, _overrides) =
      engine(LookupFetcher::with_items(vec![work_item("ABC-42")]));

    let enriched = engine
      .enhance(vec![mr(1, "Fix ABC-42 crash", "", "main"), mr(2, "cleanup", "", "main")])
      .await;

    assert_eq!(enriched[0].work_item.as_ref().unwrap().key, "ABC-42");
    assert!(enriched[1].work_item.is_none());
    assert!(enriched[1].reference_key.is_none());
  }

  #[tokio::test]
  async fn test_enhance_tolerates_lookup_failures() {
    let mut fetcher = LookupFetcher::with_items(vec![work_item("ABC-42")]);
    fetcher.fail_lookups = true;
    let (engine, _fetcher, _overrides) = engine(fetcher);

    let enriched = engine.enhance(vec![mr(1, "Fix ABC-42", "", "main")]).await;

    assert_eq!(enriched.len(), 1);
    assert_eq!(enriched[0].reference_key.as_deref(), Some("ABC-42"));
    assert!(enriched[0].work_item.is_none());
  }

  #[test]
  fn test_set_and_clear_override_round_trip() {
    let (engine, _fetcher, overrides) = engine(LookupFetcher::with_items(vec![]));

    engine.set_override(5, "ABC-1");
    assert_eq!(overrides.get(5).unwrap().reference_key, "ABC-1");

    engine.clear_override(5);
    assert!(overrides.get(5).is_none());
  }
}
