//! Durable permission store — a human-editable TOML document.
//!
//! One `[[grants]]` entry per tool/scope.  Operators can hand-edit the file
//! between runs; hand-edited deny records are authoritative on load.  Unknown
//! fields are ignored and records with unrecognized decision strings are
//! skipped with a warning — a newer or hand-mangled file never takes the
//! process down.  A whole-file parse failure fails closed to an empty store.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::{DurableDecision, PermissionKey};

/// Default per-user location of the permission store.
pub fn default_store_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".warden")
        .join("permissions.toml")
}

/// A persisted authorization decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionRecord {
    pub key: PermissionKey,
    pub decision: DurableDecision,
    pub created_at: DateTime<Utc>,
}

// ── On-disk representation ───────────────────────────────────────────────────

/// Serde shape of the file.  Deliberately stringly-typed in places so that
/// hand edits and future fields degrade to per-record warnings instead of a
/// hard load failure.
#[derive(Debug, Serialize, Deserialize)]
struct StoredDocument {
    #[serde(default = "default_version")]
    version: u32,
    #[serde(default)]
    grants: Vec<StoredGrant>,
}

fn default_version() -> u32 {
    1
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredGrant {
    #[serde(default)]
    tool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    scope: Option<String>,
    #[serde(default)]
    decision: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    created_at: Option<String>,
}

fn decode_grant(grant: &StoredGrant, path: &Path) -> Option<PermissionRecord> {
    if grant.tool.is_empty() {
        tracing::warn!(path = %path.display(), "skipping grant with empty tool name");
        return None;
    }
    let decision = match grant.decision.as_str() {
        "allow_always" => DurableDecision::AllowAlways,
        "deny_always" => DurableDecision::DenyAlways,
        other => {
            tracing::warn!(
                tool = %grant.tool,
                decision = other,
                path = %path.display(),
                "skipping grant with unrecognized decision"
            );
            return None;
        }
    };
    let created_at = grant
        .created_at
        .as_deref()
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| {
            tracing::warn!(tool = %grant.tool, "grant has missing or unparseable created_at");
            Utc::now()
        });

    Some(PermissionRecord {
        key: PermissionKey {
            tool: grant.tool.clone(),
            scope: grant.scope.clone(),
        },
        decision,
        created_at,
    })
}

fn encode_record(record: &PermissionRecord) -> StoredGrant {
    StoredGrant {
        tool: record.key.tool.clone(),
        scope: record.key.scope.clone(),
        decision: match record.decision {
            DurableDecision::AllowAlways => "allow_always".to_string(),
            DurableDecision::DenyAlways => "deny_always".to_string(),
        },
        created_at: Some(record.created_at.to_rfc3339()),
    }
}

// ── Store ────────────────────────────────────────────────────────────────────

/// Process-wide durable decision map.  Exactly one running instance is the
/// supported scenario; an advisory lock on a `.lock` sidecar detects a second
/// instance and warns rather than silently corrupting the file.
///
/// Insertion order of records is preserved on serialization for human
/// readability; lookups go through an index.
#[derive(Debug)]
pub struct PermissionStore {
    path: PathBuf,
    records: Vec<PermissionRecord>,
    index: HashMap<PermissionKey, usize>,
    // Held for the lifetime of the store; releasing is dropping.
    _lock: Option<fs::File>,
}

impl PermissionStore {
    /// Open the store at `path`, acquiring the advisory lock and loading any
    /// existing document.  Never fails the process: an unreadable or corrupt
    /// file fails closed to an empty store with a surfaced warning, so every
    /// decision defaults back to asking the user.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock = acquire_lock(&path);

        let records = match load_records(&path) {
            Ok(records) => records,
            Err(err) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "permission store unreadable — failing closed to an empty store"
                );
                Vec::new()
            }
        };

        let index = build_index(&records);
        Self {
            path,
            records,
            index,
            _lock: lock,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lookup(&self, key: &PermissionKey) -> Option<DurableDecision> {
        self.index.get(key).map(|&i| self.records[i].decision)
    }

    pub fn records(&self) -> &[PermissionRecord] {
        &self.records
    }

    /// Insert or replace the record for its key.  Keys are unique; replacing
    /// keeps the record's position so the file stays stable under re-answers.
    pub fn upsert(&mut self, record: PermissionRecord) {
        match self.index.get(&record.key) {
            Some(&i) => self.records[i] = record,
            None => {
                self.index.insert(record.key.clone(), self.records.len());
                self.records.push(record);
            }
        }
    }

    /// Remove the record for `key`.  Returns whether one existed.
    pub fn reset(&mut self, key: &PermissionKey) -> bool {
        let Some(i) = self.index.remove(key) else {
            return false;
        };
        self.records.remove(i);
        self.index = build_index(&self.records);
        true
    }

    /// Remove every record.  Returns how many were dropped.
    pub fn reset_all(&mut self) -> usize {
        let n = self.records.len();
        self.records.clear();
        self.index.clear();
        n
    }

    /// Write the document to disk: temp sibling first, fsync, then an atomic
    /// rename over the original.  A crash before the rename leaves the old
    /// file untouched; after it, a consistent new file.
    pub fn flush(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create store directory {}", parent.display()))?;
        }

        let doc = StoredDocument {
            version: 1,
            grants: self.records.iter().map(encode_record).collect(),
        };
        let rendered = toml::to_string_pretty(&doc).context("serialize permission store")?;

        let tmp_path = {
            let filename = self
                .path
                .file_name()
                .map(|f| f.to_string_lossy().to_string())
                .unwrap_or_else(|| "permissions.toml".to_string());
            self.path.with_file_name(format!("{filename}.tmp"))
        };

        let write_result: Result<()> = (|| {
            fs::write(&tmp_path, rendered.as_bytes())
                .with_context(|| format!("write {}", tmp_path.display()))?;
            let file = fs::File::open(&tmp_path)?;
            file.sync_all()?;
            Ok(())
        })();

        if let Err(err) = write_result {
            let _ = fs::remove_file(&tmp_path);
            return Err(err);
        }

        if let Err(err) = fs::rename(&tmp_path, &self.path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(err).with_context(|| format!("rename into {}", self.path.display()));
        }

        Ok(())
    }
}

fn build_index(records: &[PermissionRecord]) -> HashMap<PermissionKey, usize> {
    records
        .iter()
        .enumerate()
        .map(|(i, r)| (r.key.clone(), i))
        .collect()
}

fn load_records(path: &Path) -> Result<Vec<PermissionRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let doc: StoredDocument =
        toml::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
    if doc.version > 1 {
        tracing::warn!(
            version = doc.version,
            "permission store written by a newer version — unknown fields ignored"
        );
    }

    let mut records = Vec::new();
    let mut seen = HashMap::new();
    for grant in &doc.grants {
        let Some(record) = decode_grant(grant, path) else {
            continue;
        };
        // Duplicate keys in a hand-edited file: last entry wins.
        match seen.get(&record.key) {
            Some(&i) => {
                records[i] = record;
            }
            None => {
                seen.insert(record.key.clone(), records.len());
                records.push(record);
            }
        }
    }
    Ok(records)
}

fn acquire_lock(path: &Path) -> Option<fs::File> {
    let lock_path = {
        let filename = path
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_else(|| "permissions.toml".to_string());
        path.with_file_name(format!("{filename}.lock"))
    };
    if let Some(parent) = lock_path.parent() {
        if fs::create_dir_all(parent).is_err() {
            return None;
        }
    }
    let file = match fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(&lock_path)
    {
        Ok(f) => f,
        Err(err) => {
            tracing::warn!(path = %lock_path.display(), error = %err, "cannot open store lock file");
            return None;
        }
    };
    if let Err(err) = file.try_lock_exclusive() {
        tracing::warn!(
            path = %lock_path.display(),
            error = %err,
            "another instance appears to hold the permission store — decisions made there may be overwritten"
        );
    }
    Some(file)
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn key(tool: &str, scope: Option<&str>) -> PermissionKey {
        PermissionKey {
            tool: tool.to_string(),
            scope: scope.map(str::to_string),
        }
    }

    fn record(tool: &str, scope: Option<&str>, decision: DurableDecision) -> PermissionRecord {
        PermissionRecord {
            key: key(tool, scope),
            decision,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn open_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = PermissionStore::open(dir.path().join("permissions.toml"));
        assert!(store.records().is_empty());
    }

    #[test]
    fn upsert_flush_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("permissions.toml");

        let mut store = PermissionStore::open(&path);
        store.upsert(record("list_files", Some("."), DurableDecision::AllowAlways));
        store.upsert(record("shell_execute", Some("git"), DurableDecision::DenyAlways));
        store.flush().unwrap();
        drop(store);

        let reloaded = PermissionStore::open(&path);
        assert_eq!(reloaded.records().len(), 2);
        assert_eq!(
            reloaded.lookup(&key("list_files", Some("."))),
            Some(DurableDecision::AllowAlways)
        );
        assert_eq!(
            reloaded.lookup(&key("shell_execute", Some("git"))),
            Some(DurableDecision::DenyAlways)
        );
    }

    #[test]
    fn upsert_preserves_unrelated_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("permissions.toml");

        let mut store = PermissionStore::open(&path);
        store.upsert(record("read_file", Some("a.txt"), DurableDecision::AllowAlways));
        store.flush().unwrap();
        drop(store);

        let mut store = PermissionStore::open(&path);
        store.upsert(record("write_file", Some("b.txt"), DurableDecision::AllowAlways));
        store.flush().unwrap();
        drop(store);

        let reloaded = PermissionStore::open(&path);
        assert_eq!(reloaded.records().len(), 2);
        assert!(reloaded.lookup(&key("read_file", Some("a.txt"))).is_some());
        assert!(reloaded.lookup(&key("write_file", Some("b.txt"))).is_some());
    }

    #[test]
    fn upsert_same_key_replaces_in_place() {
        let dir = TempDir::new().unwrap();
        let mut store = PermissionStore::open(dir.path().join("p.toml"));
        store.upsert(record("t", None, DurableDecision::AllowAlways));
        store.upsert(record("other", None, DurableDecision::AllowAlways));
        store.upsert(record("t", None, DurableDecision::DenyAlways));

        assert_eq!(store.records().len(), 2);
        assert_eq!(store.lookup(&key("t", None)), Some(DurableDecision::DenyAlways));
        // Replacement keeps position: "t" is still first.
        assert_eq!(store.records()[0].key, key("t", None));
    }

    #[test]
    fn serialization_preserves_insertion_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("p.toml");
        let mut store = PermissionStore::open(&path);
        for name in ["zeta", "alpha", "mid"] {
            store.upsert(record(name, None, DurableDecision::AllowAlways));
        }
        store.flush().unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        let zeta = raw.find("zeta").unwrap();
        let alpha = raw.find("alpha").unwrap();
        let mid = raw.find("mid").unwrap();
        assert!(zeta < alpha && alpha < mid, "file order must match insertion order");
    }

    #[test]
    fn corrupt_file_fails_closed_to_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("p.toml");
        fs::write(&path, "this is {{{ not toml").unwrap();

        let store = PermissionStore::open(&path);
        assert!(store.records().is_empty());
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("p.toml");
        fs::write(
            &path,
            r#"
version = 1
future_top_level = "ignored"

[[grants]]
tool = "read_file"
scope = "a.txt"
decision = "allow_always"
created_at = "2026-01-01T00:00:00Z"
future_field = 42
"#,
        )
        .unwrap();

        let store = PermissionStore::open(&path);
        assert_eq!(store.records().len(), 1);
        assert_eq!(
            store.lookup(&key("read_file", Some("a.txt"))),
            Some(DurableDecision::AllowAlways)
        );
    }

    #[test]
    fn unrecognized_decision_is_skipped_not_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("p.toml");
        fs::write(
            &path,
            r#"
[[grants]]
tool = "read_file"
decision = "allow_on_tuesdays"

[[grants]]
tool = "list_files"
decision = "deny_always"
"#,
        )
        .unwrap();

        let store = PermissionStore::open(&path);
        assert_eq!(store.records().len(), 1);
        assert_eq!(
            store.lookup(&key("list_files", None)),
            Some(DurableDecision::DenyAlways)
        );
    }

    #[test]
    fn hand_edited_duplicate_keys_last_wins() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("p.toml");
        fs::write(
            &path,
            r#"
[[grants]]
tool = "t"
decision = "allow_always"

[[grants]]
tool = "t"
decision = "deny_always"
"#,
        )
        .unwrap();

        let store = PermissionStore::open(&path);
        assert_eq!(store.records().len(), 1);
        assert_eq!(store.lookup(&key("t", None)), Some(DurableDecision::DenyAlways));
    }

    #[test]
    fn missing_created_at_is_tolerated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("p.toml");
        fs::write(
            &path,
            r#"
[[grants]]
tool = "t"
decision = "allow_always"
"#,
        )
        .unwrap();
        let store = PermissionStore::open(&path);
        assert_eq!(store.records().len(), 1);
    }

    #[test]
    fn reset_removes_only_named_key() {
        let dir = TempDir::new().unwrap();
        let mut store = PermissionStore::open(dir.path().join("p.toml"));
        store.upsert(record("a", None, DurableDecision::AllowAlways));
        store.upsert(record("b", None, DurableDecision::DenyAlways));

        assert!(store.reset(&key("a", None)));
        assert!(!store.reset(&key("a", None)), "second reset finds nothing");
        assert_eq!(store.records().len(), 1);
        assert!(store.lookup(&key("b", None)).is_some());
    }

    #[test]
    fn reset_all_clears_everything() {
        let dir = TempDir::new().unwrap();
        let mut store = PermissionStore::open(dir.path().join("p.toml"));
        store.upsert(record("a", None, DurableDecision::AllowAlways));
        store.upsert(record("b", None, DurableDecision::DenyAlways));
        assert_eq!(store.reset_all(), 2);
        assert!(store.records().is_empty());
    }

    #[test]
    fn flush_creates_parent_directories() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/deeper/p.toml");
        let mut store = PermissionStore::open(&path);
        store.upsert(record("t", None, DurableDecision::AllowAlways));
        store.flush().unwrap();
        assert!(path.exists());
    }

    #[test]
    fn flush_leaves_no_tmp_file_behind() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("p.toml");
        let mut store = PermissionStore::open(&path);
        store.upsert(record("t", None, DurableDecision::AllowAlways));
        store.flush().unwrap();
        assert!(!path.with_file_name("p.toml.tmp").exists());
    }
}
