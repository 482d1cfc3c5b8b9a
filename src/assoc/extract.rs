//! Pure reference-key extraction from free text.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::LazyLock;

/// An uppercase project prefix followed by `-` and digits, e.g. `ABC-42`.
static REFERENCE_KEY: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"\b([A-Z][A-Z0-9]*-\d+)\b").expect("Invalid reference key regex"));

/// Fixed per-field confidence tiers, reflecting how reliably each field
/// indicates the intended cross-reference.
pub const CONFIDENCE_MANUAL: f64 = 1.0;
pub const CONFIDENCE_TITLE: f64 = 0.9;
pub const CONFIDENCE_DESCRIPTION: f64 = 0.7;
pub const CONFIDENCE_BRANCH: f64 = 0.5;

/// Where a candidate reference key came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateSource {
  Manual,
  Title,
  Description,
  Branch,
}

impl CandidateSource {
  pub fn confidence(&self) -> f64 {
    match self {
      CandidateSource::Manual => CONFIDENCE_MANUAL,
      CandidateSource::Title => CONFIDENCE_TITLE,
      CandidateSource::Description => CONFIDENCE_DESCRIPTION,
      CandidateSource::Branch => CONFIDENCE_BRANCH,
    }
  }
}

/// A candidate cross-reference, produced fresh per extraction call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssociationCandidate {
  pub key: String,
  pub confidence: f64,
  pub source: CandidateSource,
}

/// Extract candidate reference keys from a record's free-text fields.
///
/// Fields are scanned in priority order (title, description, branch), so the
/// returned list is sorted descending by confidence with the most likely key
/// first. Keys are deduplicated: a key seen in the title is not repeated at
/// a lower tier. When `prefixes` is non-empty, only keys with a configured
/// project prefix are accepted.
pub fn extract_candidates(
  title: &str,
  description: &str,
  branch: Option<&str>,
  prefixes: &BTreeSet<String>,
) -> Vec<AssociationCandidate> {
  let mut seen: HashSet<String> = HashSet::new();
  let mut candidates = Vec::new();

  let fields = [
    (title, CandidateSource::Title),
    (description, CandidateSource::Description),
    (branch.unwrap_or_default(), CandidateSource::Branch),
  ];

  for (text, source) in fields {
    for m in REFERENCE_KEY.find_iter(text) {
      let key = m.as_str();
      if !prefix_allowed(key, prefixes) {
        continue;
      }
      if seen.insert(key.to_string()) {
        candidates.push(AssociationCandidate {
          key: key.to_string(),
          confidence: source.confidence(),
          source,
        });
      }
    }
  }

  candidates
}

fn prefix_allowed(key: &str, prefixes: &BTreeSet<String>) -> bool {
  if prefixes.is_empty() {
    return true;
  }
  key
    .split_once('-')
    .map(|(prefix, _)| prefixes.contains(prefix))
    .unwrap_or(false)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn no_prefixes() -> BTreeSet<String> {
    BTreeSet::new()
  }

  #[test]
  fn test_title_match_comes_first() {
    let candidates = extract_candidates(
      "Fix ABC-42 crash",
      "relates to XYZ-7",
      Some("abc-42-fix"),
      &no_prefixes(),
    );
    assert_eq!(candidates[0].key, "ABC-42");
    assert_eq!(candidates[0].source, CandidateSource::Title);
    assert_eq!(candidates[0].confidence, CONFIDENCE_TITLE);
    assert_eq!(candidates[1].key, "XYZ-7");
    assert_eq!(candidates[1].confidence, CONFIDENCE_DESCRIPTION);
  }

  #[test]
  fn test_dedup_keeps_highest_priority_field() {
    let candidates = extract_candidates(
      "ABC-42: fix crash",
      "see ABC-42 for details",
      Some("ABC-42-fix"),
      &no_prefixes(),
    );
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].source, CandidateSource::Title);
  }

  #[test]
  fn test_branch_only_match() {
    let candidates = extract_candidates("fix crash", "", Some("feature/ABC-42"), &no_prefixes());
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].source, CandidateSource::Branch);
    assert_eq!(candidates[0].confidence, CONFIDENCE_BRANCH);
  }

  #[test]
  fn test_multiple_keys_in_one_field_keep_order() {
    let candidates = extract_candidates("ABC-1 and ABC-2", "", None, &no_prefixes());
    assert_eq!(
      candidates.iter().map(|c| c.key.as_str()).collect::<Vec<_>>(),
      vec!["ABC-1", "ABC-2"]
    );
  }

  #[test]
  fn test_prefix_restriction() {
    let prefixes: BTreeSet<String> = ["ABC".to_string()].into();
    let candidates = extract_candidates("ABC-1 and XYZ-2", "", None, &prefixes);
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].key, "ABC-1");
  }

  #[test]
  fn test_lowercase_tokens_are_not_keys() {
    let candidates = extract_candidates("fix abc-42", "", None, &no_prefixes());
    assert!(candidates.is_empty());
  }

  #[test]
  fn test_no_match_is_empty() {
    let candidates = extract_candidates("refactor tests", "", Some("cleanup"), &no_prefixes());
    assert!(candidates.is_empty());
  }

  #[test]
  fn test_confidence_order_is_descending() {
    let candidates = extract_candidates(
      "ABC-1",
      "ABC-2",
      Some("ABC-3-branch"),
      &no_prefixes(),
    );
    let confidences: Vec<f64> = candidates.iter().map(|c| c.confidence).collect();
    let mut sorted = confidences.clone();
    sorted.sort_by(|a, b| b.partial_cmp(a).unwrap());
    assert_eq!(confidences, sorted);
  }
}
