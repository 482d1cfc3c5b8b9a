//! Identity set used by relevance filtering.
//!
//! A record is "relevant" when it touches one of the configured identities.
//! The set can change at runtime (team membership edits); changes do not
//! invalidate cached datasets by themselves, callers invalidate explicitly.

use std::collections::BTreeSet;
use std::sync::RwLock;

use crate::config::TeamConfig;

/// Provides the current set of team identities, lowercased.
pub trait IdentityProvider: Send + Sync {
  fn current_ids(&self) -> BTreeSet<String>;
}

/// Identity provider backed by a mutable in-process set, seeded from config.
pub struct TeamIdentities {
  ids: RwLock<BTreeSet<String>>,
}

impl TeamIdentities {
  pub fn new(ids: BTreeSet<String>) -> Self {
    Self {
      ids: RwLock::new(ids.into_iter().map(|s| s.to_lowercase()).collect()),
    }
  }

  pub fn from_config(team: &TeamConfig) -> Self {
    Self::new(team.identities.clone())
  }

  /// Replace the identity set. Does not touch any cache.
  pub fn replace(&self, ids: BTreeSet<String>) {
    let mut guard = self.ids.write().unwrap_or_else(|e| e.into_inner());
    *guard = ids.into_iter().map(|s| s.to_lowercase()).collect();
  }
}

impl IdentityProvider for TeamIdentities {
  fn current_ids(&self) -> BTreeSet<String> {
    self.ids.read().unwrap_or_else(|e| e.into_inner()).clone()
  }
}
