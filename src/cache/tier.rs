//! The tiered cache store: named tiers of TTL'd entries with cascade rules.

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::remote::Source;

/// A named cache tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
  /// Unmodified responses from one external source.
  RawSource(Source),
  /// Results computed from raw entries (enriched records, groups).
  Derived,
  /// Logical view queries issued by the presentation layer.
  Client,
}

/// A single cached value. Immutable once stored; replaced wholesale on `set`.
#[derive(Debug, Clone)]
struct CacheEntry {
  value: serde_json::Value,
  created_at: DateTime<Utc>,
  expires_at: DateTime<Utc>,
}

/// In-memory tiered TTL cache.
///
/// One instance is injected per service; there is no process-wide cache.
/// Access goes through the narrow get/set/invalidate surface only, so the
/// derived-never-outlives-raw invariant stays enforceable.
pub struct TieredCache {
  tiers: Mutex<HashMap<Tier, HashMap<String, CacheEntry>>>,
  ttls: CacheConfig,
}

impl TieredCache {
  pub fn new(ttls: CacheConfig) -> Self {
    Self {
      tiers: Mutex::new(HashMap::new()),
      ttls,
    }
  }

  /// Default TTL for a tier, from configuration.
  fn default_ttl(&self, tier: Tier) -> Duration {
    let secs = match tier {
      Tier::RawSource(_) => self.ttls.raw_ttl_secs,
      Tier::Derived => self.ttls.derived_ttl_secs,
      Tier::Client => self.ttls.client_ttl_secs,
    };
    Duration::seconds(secs as i64)
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Tier, HashMap<String, CacheEntry>>> {
    // Entries are immutable snapshots, so state behind a poisoned lock is
    // still coherent; recover rather than panic.
    self.tiers.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Look up a value. Misses on absence and on expiry; an expired or
  /// undeserializable entry is evicted as a side effect.
  pub fn get<T: DeserializeOwned>(&self, tier: Tier, key: &str) -> Option<T> {
    self.get_at(tier, key, Utc::now())
  }

  /// `get` with an explicit clock, for TTL tests.
  pub fn get_at<T: DeserializeOwned>(&self, tier: Tier, key: &str, now: DateTime<Utc>) -> Option<T> {
    let mut tiers = self.lock();
    let entries = tiers.get_mut(&tier)?;

    let entry = entries.get(key)?;
    if now >= entry.expires_at {
      debug!(key, "cache entry expired, evicting");
      entries.remove(key);
      return None;
    }

    match serde_json::from_value(entry.value.clone()) {
      Ok(value) => Some(value),
      Err(e) => {
        // Corrupt entries are a miss, never an error: evict and let the
        // caller refetch.
        warn!(key, error = %e, "evicting undeserializable cache entry");
        entries.remove(key);
        None
      }
    }
  }

  /// Store a value, overwriting any existing entry under the key.
  pub fn set<T: Serialize>(&self, tier: Tier, key: &str, value: &T, ttl: Option<Duration>) {
    self.set_at(tier, key, value, ttl, Utc::now());
  }

  /// `set` with an explicit clock, for TTL tests.
  pub fn set_at<T: Serialize>(
    &self,
    tier: Tier,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
    now: DateTime<Utc>,
  ) {
    let value = match serde_json::to_value(value) {
      Ok(v) => v,
      Err(e) => {
        warn!(key, error = %e, "refusing to cache unserializable value");
        return;
      }
    };

    let ttl = ttl.unwrap_or_else(|| self.default_ttl(tier));
    let entry = CacheEntry {
      value,
      created_at: now,
      expires_at: now + ttl,
    };

    self.lock().entry(tier).or_default().insert(key.to_string(), entry);
  }

  /// When the entry under `key` was stored, if present and unexpired.
  pub fn created_at(&self, tier: Tier, key: &str) -> Option<DateTime<Utc>> {
    let tiers = self.lock();
    let entry = tiers.get(&tier)?.get(key)?;
    if Utc::now() >= entry.expires_at {
      return None;
    }
    Some(entry.created_at)
  }

  /// Clear one tier, or only the keys starting with `prefix`.
  pub fn invalidate(&self, tier: Tier, prefix: Option<&str>) {
    let mut tiers = self.lock();
    let Some(entries) = tiers.get_mut(&tier) else {
      return;
    };

    match prefix {
      Some(p) => entries.retain(|k, _| !k.starts_with(p)),
      None => entries.clear(),
    }
  }

  /// Clear a raw-source tier and cascade into the derived and client tiers.
  ///
  /// The cascade is conservative: rather than tracking which derived entries
  /// were built from which raw entries, everything downstream is dropped.
  pub fn invalidate_cascade(&self, source: Source) {
    self.invalidate(Tier::RawSource(source), None);
    self.invalidate(Tier::Derived, None);
    self.invalidate(Tier::Client, None);
    debug!(?source, "raw tier cleared with cascade");
  }

  /// Clear every tier.
  pub fn invalidate_all(&self) {
    self.lock().clear();
  }

  /// Number of live (possibly expired, not yet evicted) entries in a tier.
  pub fn len(&self, tier: Tier) -> usize {
    self.lock().get(&tier).map_or(0, |m| m.len())
  }

  pub fn is_empty(&self, tier: Tier) -> bool {
    self.len(tier) == 0
  }
}

impl std::fmt::Display for Tier {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Tier::RawSource(s) => write!(f, "raw:{}", s),
      Tier::Derived => write!(f, "derived"),
      Tier::Client => write!(f, "client"),
    }
  }
}
