//! Durable manual overrides for reference association.
//!
//! An override is a user-asserted reference key for one merge request; it
//! always wins over automatic extraction. The store contract is
//! exception-free: "not found" is an empty result, and a failing backend
//! degrades to that same answer with a logged warning rather than surfacing
//! an error into association.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

/// A user-asserted reference key for one record. Exactly one per record id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManualOverride {
  pub record_id: u64,
  pub reference_key: String,
  pub set_at: DateTime<Utc>,
}

/// Durable key-value store for manual overrides.
pub trait OverrideStore: Send + Sync {
  /// Current override for a record, if any.
  fn get(&self, record_id: u64) -> Option<ManualOverride>;

  /// Create or replace the override for a record.
  fn set(&self, record_id: u64, reference_key: &str);

  /// Remove the override for a record, if present.
  fn remove(&self, record_id: u64);
}

/// SQLite-backed override store.
pub struct SqliteOverrideStore {
  conn: Mutex<Connection>,
}

/// Schema for the override table.
const OVERRIDE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS manual_overrides (
    record_id INTEGER PRIMARY KEY,
    reference_key TEXT NOT NULL,
    set_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl SqliteOverrideStore {
  /// Open or create the store at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open or create the store at an explicit path.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create override store directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open override store at {}: {}", path.display(), e))?;

    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;

    Ok(store)
  }

  /// In-memory store, used in tests.
  pub fn in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory override store: {}", e))?;

    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;

    Ok(store)
  }

  fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("mergelink").join("overrides.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(OVERRIDE_SCHEMA)
      .map_err(|e| eyre!("Failed to run override store migrations: {}", e))?;

    Ok(())
  }

  fn try_get(&self, record_id: u64) -> Result<Option<ManualOverride>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT reference_key, set_at FROM manual_overrides WHERE record_id = ?")
      .map_err(|e| eyre!("Failed to prepare override query: {}", e))?;

    let row: Option<(String, String)> = stmt
      .query_row(params![record_id as i64], |row| {
        Ok((row.get(0)?, row.get(1)?))
      })
      .ok();

    match row {
      Some((reference_key, set_at)) => Ok(Some(ManualOverride {
        record_id,
        reference_key,
        set_at: parse_datetime(&set_at)?,
      })),
      None => Ok(None),
    }
  }

  fn try_set(&self, record_id: u64, reference_key: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO manual_overrides (record_id, reference_key, set_at)
         VALUES (?, ?, datetime('now'))",
        params![record_id as i64, reference_key],
      )
      .map_err(|e| eyre!("Failed to store override: {}", e))?;

    Ok(())
  }

  fn try_remove(&self, record_id: u64) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "DELETE FROM manual_overrides WHERE record_id = ?",
        params![record_id as i64],
      )
      .map_err(|e| eyre!("Failed to remove override: {}", e))?;

    Ok(())
  }
}

impl OverrideStore for SqliteOverrideStore {
  fn get(&self, record_id: u64) -> Option<ManualOverride> {
    match self.try_get(record_id) {
      Ok(found) => found,
      Err(e) => {
        warn!(record_id, error = %e, "override read failed, treating as not found");
        None
      }
    }
  }

  fn set(&self, record_id: u64, reference_key: &str) {
    if let Err(e) = self.try_set(record_id, reference_key) {
      warn!(record_id, reference_key, error = %e, "override write failed");
    }
  }

  fn remove(&self, record_id: u64) {
    if let Err(e) = self.try_remove(record_id) {
      warn!(record_id, error = %e, "override removal failed");
    }
  }
}

/// In-memory override store for tests and ephemeral setups.
#[derive(Default)]
pub struct MemoryOverrideStore {
  map: Mutex<HashMap<u64, ManualOverride>>,
}

impl MemoryOverrideStore {
  pub fn new() -> Self {
    Self::default()
  }
}

impl OverrideStore for MemoryOverrideStore {
  fn get(&self, record_id: u64) -> Option<ManualOverride> {
    let map = self.map.lock().unwrap_or_else(|e| e.into_inner());
    map.get(&record_id).cloned()
  }

  fn set(&self, record_id: u64, reference_key: &str) {
    let mut map = self.map.lock().unwrap_or_else(|e| e.into_inner());
    map.insert(
      record_id,
      ManualOverride {
        record_id,
        reference_key: reference_key.to_string(),
        set_at: Utc::now(),
      },
    );
  }

  fn remove(&self, record_id: u64) {
    let mut map = self.map.lock().unwrap_or_else(|e| e.into_inner());
    map.remove(&record_id);
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
