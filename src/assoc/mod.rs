//! Heuristic association of merge requests with tracked work items.
//!
//! Candidate reference keys are extracted from free text by a pure function;
//! a durable manual override always wins over extraction. Enrichment resolves
//! each merge request's key and attaches the full work item.

mod engine;
mod extract;

pub use engine::{AssociationEngine, EnrichedMergeRequest};
pub use extract::{
  extract_candidates, AssociationCandidate, CandidateSource, CONFIDENCE_BRANCH,
  CONFIDENCE_DESCRIPTION, CONFIDENCE_MANUAL, CONFIDENCE_TITLE,
};
