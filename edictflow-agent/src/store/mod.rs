//! Durable agent state
//!
//! One SQLite file holds the credential, the cached rule set, the watched
//! projects and files, the outbound queue, the pending-change ledger and the
//! config key/value table. Multi-row mutations run in a transaction, so a
//! crash mid-mutation leaves the previous state in place.
//!
//! Calls block on disk I/O. The connection sits behind a mutex; callers never
//! hold it across network I/O because every method takes and releases it.

mod records;

pub use records::{AuthRecord, LocalChange, LocalChangeStatus, QueueEntry, WatchedFile};

use std::path::Path;

use chrono::{DateTime, Utc};
use edictflow_core::model::{Category, ProjectContext};
use edictflow_core::protocol::{ConfigUpdatePayload, RuleRecord};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{AgentError, Result};

const SCHEMA_SQL: &str = include_str!("schema.sql");

/// The agent's local store
pub struct AgentStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for AgentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentStore").finish_non_exhaustive()
    }
}

fn secs(t: DateTime<Utc>) -> i64 {
    t.timestamp()
}

fn from_secs(s: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(s, 0)
        .ok_or_else(|| AgentError::Store(format!("timestamp out of range: {}", s)))
}

fn from_json<T: serde::de::DeserializeOwned>(text: &str) -> Result<T> {
    serde_json::from_str(text).map_err(|e| AgentError::Store(format!("corrupt row: {}", e)))
}

impl AgentStore {
    /// Open (or create) the store at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Self::initialize(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Auth
    // ═══════════════════════════════════════════════════════════════════════

    pub fn save_auth(&self, auth: &AuthRecord, now: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO auth (id, token, expires_at, user_id, agent_id, saved_at)
             VALUES (1, ?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (id) DO UPDATE SET
                token = excluded.token, expires_at = excluded.expires_at,
                user_id = excluded.user_id, agent_id = excluded.agent_id,
                saved_at = excluded.saved_at",
            params![
                auth.token,
                auth.expires_at.map(secs),
                auth.user_id,
                auth.agent_id,
                secs(now)
            ],
        )?;
        Ok(())
    }

    pub fn load_auth(&self) -> Result<Option<AuthRecord>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT token, expires_at, user_id, agent_id FROM auth WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<i64>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;
        row.map(|(token, expires_at, user_id, agent_id)| {
            Ok(AuthRecord {
                token,
                expires_at: expires_at.map(from_secs).transpose()?,
                user_id,
                agent_id,
            })
        })
        .transpose()
    }

    pub fn clear_auth(&self) -> Result<()> {
        self.conn.lock().execute("DELETE FROM auth", [])?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Cached rule set
    // ═══════════════════════════════════════════════════════════════════════

    /// Replace the cached rules and categories with `config` in one transaction
    pub fn replace_rules(&self, config: &ConfigUpdatePayload, now: DateTime<Utc>) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM cached_rules", [])?;
        tx.execute("DELETE FROM cached_categories", [])?;
        {
            let mut insert_rule =
                tx.prepare("INSERT INTO cached_rules (id, data, version) VALUES (?1, ?2, ?3)")?;
            for rule in &config.rules {
                insert_rule.execute(params![
                    rule.id,
                    serde_json::to_string(rule)?,
                    config.version as i64
                ])?;
            }
            let mut insert_category =
                tx.prepare("INSERT INTO cached_categories (id, data) VALUES (?1, ?2)")?;
            for category in &config.categories {
                insert_category.execute(params![category.id, serde_json::to_string(category)?])?;
            }
        }
        tx.execute(
            "INSERT INTO cache_state (id, version, synced_at) VALUES (1, ?1, ?2)
             ON CONFLICT (id) DO UPDATE SET version = excluded.version, synced_at = excluded.synced_at",
            params![config.version as i64, secs(now)],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn cached_rules(&self) -> Result<Vec<RuleRecord>> {
        self.json_rows("SELECT data FROM cached_rules ORDER BY id")
    }

    pub fn cached_categories(&self) -> Result<Vec<Category>> {
        self.json_rows("SELECT data FROM cached_categories ORDER BY id")
    }

    /// Version of the cached set; 0 before the first sync
    pub fn cached_version(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let version: Option<i64> = conn
            .query_row("SELECT version FROM cache_state WHERE id = 1", [], |row| row.get(0))
            .optional()?;
        Ok(version.unwrap_or(0).max(0) as u64)
    }

    fn json_rows<T: serde::de::DeserializeOwned>(&self, sql: &str) -> Result<Vec<T>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.iter().map(|r| from_json(r)).collect()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Projects and watched files
    // ═══════════════════════════════════════════════════════════════════════

    pub fn upsert_project(&self, project: &ProjectContext, now: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO projects (path, context_types, tags, added_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (path) DO UPDATE SET context_types = excluded.context_types, tags = excluded.tags",
            params![
                project.path,
                serde_json::to_string(&project.context_types)?,
                serde_json::to_string(&project.tags)?,
                secs(now)
            ],
        )?;
        Ok(())
    }

    /// Remove a project and its watched files; false if it was not registered
    pub fn remove_project(&self, path: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let removed = conn.execute("DELETE FROM projects WHERE path = ?1", params![path])?;
        Ok(removed > 0)
    }

    pub fn projects(&self) -> Result<Vec<ProjectContext>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT path, context_types, tags FROM projects ORDER BY path")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(path, context_types, tags)| {
                Ok(ProjectContext {
                    path,
                    context_types: from_json(&context_types)?,
                    tags: from_json(&tags)?,
                })
            })
            .collect()
    }

    pub fn project(&self, path: &str) -> Result<Option<ProjectContext>> {
        Ok(self.projects()?.into_iter().find(|p| p.path == path))
    }

    pub fn set_watched(&self, file: &WatchedFile, now: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO watched_files (path, project_path, rule_id, baseline_hash, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (path) DO UPDATE SET project_path = excluded.project_path,
                rule_id = excluded.rule_id, baseline_hash = excluded.baseline_hash,
                updated_at = excluded.updated_at",
            params![file.path, file.project_path, file.rule_id, file.baseline_hash, secs(now)],
        )?;
        Ok(())
    }

    pub fn watched(&self, path: &str) -> Result<Option<WatchedFile>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT path, project_path, rule_id, baseline_hash FROM watched_files WHERE path = ?1",
                params![path],
                watched_from_row,
            )
            .optional()?)
    }

    pub fn watched_files(&self) -> Result<Vec<WatchedFile>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT path, project_path, rule_id, baseline_hash FROM watched_files ORDER BY path",
        )?;
        let rows = stmt
            .query_map([], watched_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Outbound queue
    // ═══════════════════════════════════════════════════════════════════════

    pub fn enqueue(
        &self,
        ref_id: &str,
        message_type: &str,
        payload: &str,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO outbound_queue (ref_id, message_type, payload, attempts, created_at)
             VALUES (?1, ?2, ?3, 0, ?4)",
            params![ref_id, message_type, payload, secs(now)],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Entries after `after_seq` with fewer than `max_attempts` sends, oldest first
    pub fn queued_after(&self, after_seq: i64, max_attempts: u32, limit: usize) -> Result<Vec<QueueEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT seq, ref_id, message_type, payload, attempts, created_at FROM outbound_queue
             WHERE seq > ?1 AND attempts < ?2 ORDER BY seq LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![after_seq, max_attempts, limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(seq, ref_id, message_type, payload, attempts, created_at)| {
                Ok(QueueEntry {
                    seq,
                    ref_id,
                    message_type,
                    payload,
                    attempts: attempts.max(0) as u32,
                    created_at: from_secs(created_at)?,
                })
            })
            .collect()
    }

    pub fn record_attempt(&self, seq: i64) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE outbound_queue SET attempts = attempts + 1 WHERE seq = ?1",
            params![seq],
        )?;
        Ok(())
    }

    /// Delete the entry acknowledged under `ref_id`; false if none matched
    pub fn ack(&self, ref_id: &str) -> Result<bool> {
        let removed = self
            .conn
            .lock()
            .execute("DELETE FROM outbound_queue WHERE ref_id = ?1", params![ref_id])?;
        Ok(removed > 0)
    }

    /// Retire exhausted entries and entries created before `older_than`
    pub fn retire(&self, max_attempts: u32, older_than: DateTime<Utc>) -> Result<Vec<QueueEntry>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let retired = {
            let mut stmt = tx.prepare(
                "SELECT seq, ref_id, message_type, attempts, created_at FROM outbound_queue
                 WHERE attempts >= ?1 OR created_at < ?2 ORDER BY seq",
            )?;
            let rows = stmt
                .query_map(params![max_attempts, secs(older_than)], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.into_iter()
                .map(|(seq, ref_id, message_type, attempts, created_at)| {
                    Ok(QueueEntry {
                        seq,
                        ref_id,
                        message_type,
                        payload: String::new(),
                        attempts: attempts.max(0) as u32,
                        created_at: from_secs(created_at)?,
                    })
                })
                .collect::<Result<Vec<_>>>()?
        };
        tx.execute(
            "DELETE FROM outbound_queue WHERE attempts >= ?1 OR created_at < ?2",
            params![max_attempts, secs(older_than)],
        )?;
        tx.commit()?;
        Ok(retired)
    }

    pub fn queue_len(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM outbound_queue", [], |row| row.get(0))?;
        Ok(n.max(0) as usize)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Pending-change ledger
    // ═══════════════════════════════════════════════════════════════════════

    pub fn insert_change(&self, change: &LocalChange) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO pending_changes (ref_id, change_id, rule_id, file_path, enforcement_mode,
                original_hash, modified_hash, modified_content, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                change.ref_id,
                change.change_id,
                change.rule_id,
                change.file_path,
                change.enforcement_mode.as_str(),
                change.original_hash,
                change.modified_hash,
                change.modified_content,
                change.status.as_str(),
                secs(change.created_at),
                secs(change.updated_at)
            ],
        )?;
        Ok(())
    }

    /// Record the controller's id for the change reported under `ref_id`
    pub fn link_change(&self, ref_id: &str, change_id: &str) -> Result<bool> {
        let updated = self.conn.lock().execute(
            "UPDATE pending_changes SET change_id = ?2 WHERE ref_id = ?1",
            params![ref_id, change_id],
        )?;
        Ok(updated > 0)
    }

    /// Store a further edit on an open row
    pub fn update_change_content(
        &self,
        ref_id: &str,
        modified_hash: &str,
        modified_content: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE pending_changes SET modified_hash = ?2, modified_content = ?3, updated_at = ?4
             WHERE ref_id = ?1",
            params![ref_id, modified_hash, modified_content, secs(now)],
        )?;
        Ok(())
    }

    pub fn set_change_status(&self, ref_id: &str, status: LocalChangeStatus, now: DateTime<Utc>) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE pending_changes SET status = ?2, updated_at = ?3 WHERE ref_id = ?1",
            params![ref_id, status.as_str(), secs(now)],
        )?;
        Ok(())
    }

    pub fn change_by_id(&self, change_id: &str) -> Result<Option<LocalChange>> {
        self.one_change("SELECT * FROM pending_changes WHERE change_id = ?1", change_id)
    }

    /// The open (pending) row for `file_path`, if any
    pub fn open_change_for_file(&self, file_path: &str) -> Result<Option<LocalChange>> {
        self.one_change(
            "SELECT * FROM pending_changes WHERE file_path = ?1 AND status = 'pending'
             ORDER BY created_at DESC LIMIT 1",
            file_path,
        )
    }

    pub fn changes(&self) -> Result<Vec<LocalChange>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT * FROM pending_changes ORDER BY created_at, ref_id")?;
        let rows = stmt
            .query_map([], change_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().collect()
    }

    fn one_change(&self, sql: &str, key: &str) -> Result<Option<LocalChange>> {
        let conn = self.conn.lock();
        conn.query_row(sql, params![key], change_from_row)
            .optional()?
            .transpose()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Config key/value
    // ═══════════════════════════════════════════════════════════════════════

    pub fn set_config(&self, key: &str, value: &str) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO config (key, value) VALUES (?1, ?2)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn get_config(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row("SELECT value FROM config WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?)
    }

    pub fn config_entries(&self) -> Result<Vec<(String, String)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT key, value FROM config ORDER BY key")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn watched_from_row(row: &Row<'_>) -> rusqlite::Result<WatchedFile> {
    Ok(WatchedFile {
        path: row.get("path")?,
        project_path: row.get("project_path")?,
        rule_id: row.get("rule_id")?,
        baseline_hash: row.get("baseline_hash")?,
    })
}

/// Decoding errors in the enum columns surface as `Err` in the inner result
fn change_from_row(row: &Row<'_>) -> rusqlite::Result<Result<LocalChange>> {
    let mode: String = row.get("enforcement_mode")?;
    let status: String = row.get("status")?;
    let created_at: i64 = row.get("created_at")?;
    let updated_at: i64 = row.get("updated_at")?;
    let ref_id: String = row.get("ref_id")?;
    let change_id: Option<String> = row.get("change_id")?;
    let rule_id: String = row.get("rule_id")?;
    let file_path: String = row.get("file_path")?;
    let original_hash: String = row.get("original_hash")?;
    let modified_hash: String = row.get("modified_hash")?;
    let modified_content: String = row.get("modified_content")?;

    let build = || -> Result<LocalChange> {
        Ok(LocalChange {
            ref_id,
            change_id,
            rule_id,
            file_path,
            enforcement_mode: mode.parse()?,
            original_hash,
            modified_hash,
            modified_content,
            status: LocalChangeStatus::parse(&status)
                .ok_or_else(|| AgentError::Store(format!("unknown change status '{}'", status)))?,
            created_at: from_secs(created_at)?,
            updated_at: from_secs(updated_at)?,
        })
    };
    Ok(build())
}
