//! SQLite-backed controller store
//!
//! One database file holds every table in `schema.sql`. Entities are stored
//! as JSON documents beside the columns used for filtering, and uniqueness
//! invariants are enforced by the schema, so two controller processes
//! sharing a file still cannot create a second pending change request for
//! the same (agent, file).

use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};

use super::ControllerStore;
use crate::audit::AuditEvent;
use crate::error::{EdictError, Result};
use crate::model::{
    AgentRecord, ApprovalConfig, ApprovalRecord, AttachmentStatus, Category, ChangeRequest,
    ChangeStatus, ExceptionRequest, Rule, RuleAttachment,
};

/// Schema SQL embedded at compile time
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Controller store persisted in a single SQLite file
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Open (or create) the database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Self::initialize(conn)
    }

    /// Throwaway database, used by tests
    pub fn open_in_memory() -> Result<Self> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn from_json<T: DeserializeOwned>(text: &str) -> Result<T> {
    serde_json::from_str(text).map_err(|e| EdictError::storage(format!("corrupt row: {}", e)))
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| EdictError::storage(format!("timestamp out of range: {}", ms)))
}

fn decode_all<T: DeserializeOwned>(rows: Vec<String>) -> Result<Vec<T>> {
    rows.iter().map(|r| from_json(r)).collect()
}

impl SqliteStore {
    fn query_json<T: DeserializeOwned>(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<T>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        decode_all(rows)
    }

    fn query_one_json<T: DeserializeOwned>(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Option<T>> {
        let conn = self.conn.lock();
        let data: Option<String> = conn
            .query_row(sql, params, |row| row.get(0))
            .optional()?;
        data.map(|d| from_json(&d)).transpose()
    }
}

impl ControllerStore for SqliteStore {
    fn insert_rule(&self, rule: &Rule) -> Result<()> {
        let data = to_json(rule)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO rules (id, status, target_layer, data) VALUES (?1, ?2, ?3, ?4)",
            params![rule.id, rule.status.as_str(), rule.target_layer.as_str(), data],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                EdictError::AlreadyExists {
                    entity: "rule",
                    id: rule.id.clone(),
                }
            } else {
                e.into()
            }
        })?;
        Ok(())
    }

    fn update_rule(&self, rule: &Rule) -> Result<()> {
        let data = to_json(rule)?;
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE rules SET status = ?2, target_layer = ?3, data = ?4 WHERE id = ?1",
            params![rule.id, rule.status.as_str(), rule.target_layer.as_str(), data],
        )?;
        if changed == 0 {
            return Err(EdictError::RuleNotFound {
                rule_id: rule.id.clone(),
            });
        }
        Ok(())
    }

    fn delete_rule(&self, rule_id: &str) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM approvals WHERE rule_id = ?1", params![rule_id])?;
        tx.execute("DELETE FROM attachments WHERE rule_id = ?1", params![rule_id])?;
        tx.execute("DELETE FROM rules WHERE id = ?1", params![rule_id])?;
        tx.commit()?;
        Ok(())
    }

    fn get_rule(&self, rule_id: &str) -> Result<Option<Rule>> {
        self.query_one_json("SELECT data FROM rules WHERE id = ?1", params![rule_id])
    }

    fn list_rules(&self) -> Result<Vec<Rule>> {
        self.query_json("SELECT data FROM rules ORDER BY seq", [])
    }

    fn insert_approval(&self, record: &ApprovalRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO approvals (rule_id, voter_id, decision, comment, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.rule_id,
                record.voter_id,
                record.decision.as_str(),
                record.comment,
                record.created_at.timestamp_millis()
            ],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                EdictError::DuplicateVote {
                    rule_id: record.rule_id.clone(),
                    voter_id: record.voter_id.clone(),
                }
            } else {
                e.into()
            }
        })?;
        Ok(())
    }

    fn list_approvals(&self, rule_id: &str) -> Result<Vec<ApprovalRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT voter_id, decision, comment, created_at FROM approvals
             WHERE rule_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt
            .query_map(params![rule_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(voter_id, decision, comment, created_at)| {
                Ok(ApprovalRecord {
                    rule_id: rule_id.to_string(),
                    voter_id,
                    decision: decision.parse()?,
                    comment,
                    created_at: from_millis(created_at)?,
                })
            })
            .collect()
    }

    fn clear_approvals(&self, rule_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM approvals WHERE rule_id = ?1", params![rule_id])?;
        Ok(())
    }

    fn upsert_approval_config(&self, config: &ApprovalConfig) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO approval_configs (scope, team_id, permission, required_count)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (scope, team_id)
             DO UPDATE SET permission = excluded.permission,
                           required_count = excluded.required_count",
            params![
                config.scope.as_str(),
                config.team_id.as_deref().unwrap_or(""),
                config.permission,
                config.required_count
            ],
        )?;
        Ok(())
    }

    fn list_approval_configs(&self) -> Result<Vec<ApprovalConfig>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT scope, team_id, permission, required_count FROM approval_configs
             ORDER BY scope, team_id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, u32>(3)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(scope, team_id, permission, required_count)| {
                Ok(ApprovalConfig {
                    scope: scope.parse()?,
                    permission,
                    required_count,
                    team_id: (!team_id.is_empty()).then_some(team_id),
                })
            })
            .collect()
    }

    fn insert_attachment(&self, attachment: &RuleAttachment) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO attachments (rule_id, team_id, status, requested_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                attachment.rule_id,
                attachment.team_id,
                attachment.status.as_str(),
                attachment.requested_by,
                attachment.created_at.timestamp_millis()
            ],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                EdictError::DuplicateAttachment {
                    rule_id: attachment.rule_id.clone(),
                    team_id: attachment.team_id.clone(),
                }
            } else {
                e.into()
            }
        })?;
        Ok(())
    }

    fn set_attachment_status(
        &self,
        rule_id: &str,
        team_id: &str,
        status: AttachmentStatus,
    ) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE attachments SET status = ?3 WHERE rule_id = ?1 AND team_id = ?2",
            params![rule_id, team_id, status.as_str()],
        )?;
        if changed == 0 {
            return Err(EdictError::TeamNotFound {
                team_id: team_id.to_string(),
            });
        }
        Ok(())
    }

    fn list_attachments(&self, rule_id: &str) -> Result<Vec<RuleAttachment>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT team_id, status, requested_by, created_at FROM attachments
             WHERE rule_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt
            .query_map(params![rule_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(team_id, status, requested_by, created_at)| {
                Ok(RuleAttachment {
                    rule_id: rule_id.to_string(),
                    team_id,
                    status: status.parse()?,
                    requested_by,
                    created_at: from_millis(created_at)?,
                })
            })
            .collect()
    }

    fn upsert_category(&self, category: &Category) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO categories (id, name, display_order) VALUES (?1, ?2, ?3)
             ON CONFLICT (id) DO UPDATE SET name = excluded.name,
                                            display_order = excluded.display_order",
            params![category.id, category.name, category.display_order],
        )?;
        Ok(())
    }

    fn list_categories(&self) -> Result<Vec<Category>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT id, name, display_order FROM categories ORDER BY rowid")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Category {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    display_order: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn upsert_agent(&self, agent: &AgentRecord) -> Result<()> {
        let mut record = agent.clone();
        if let Some(existing) = self.get_agent(&agent.agent_id)? {
            record.registered_at = existing.registered_at;
        }
        let data = to_json(&record)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO agents (agent_id, data) VALUES (?1, ?2)
             ON CONFLICT (agent_id) DO UPDATE SET data = excluded.data",
            params![record.agent_id, data],
        )?;
        Ok(())
    }

    fn get_agent(&self, agent_id: &str) -> Result<Option<AgentRecord>> {
        self.query_one_json("SELECT data FROM agents WHERE agent_id = ?1", params![agent_id])
    }

    fn list_agents(&self) -> Result<Vec<AgentRecord>> {
        self.query_json("SELECT data FROM agents ORDER BY rowid", [])
    }

    fn insert_change(&self, change: &ChangeRequest) -> Result<()> {
        let data = to_json(change)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO change_requests (id, agent_id, file_path, status, data)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                change.id,
                change.agent_id,
                change.file_path,
                change.status.as_str(),
                data
            ],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                EdictError::AlreadyExists {
                    entity: "pending change request",
                    id: format!("{}:{}", change.agent_id, change.file_path),
                }
            } else {
                e.into()
            }
        })?;
        Ok(())
    }

    fn update_change(&self, change: &ChangeRequest) -> Result<()> {
        let data = to_json(change)?;
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE change_requests SET status = ?2, data = ?3 WHERE id = ?1",
            params![change.id, change.status.as_str(), data],
        )?;
        if changed == 0 {
            return Err(EdictError::ChangeNotFound {
                change_id: change.id.clone(),
            });
        }
        Ok(())
    }

    fn get_change(&self, change_id: &str) -> Result<Option<ChangeRequest>> {
        self.query_one_json(
            "SELECT data FROM change_requests WHERE id = ?1",
            params![change_id],
        )
    }

    fn find_pending_change(
        &self,
        agent_id: &str,
        file_path: &str,
    ) -> Result<Option<ChangeRequest>> {
        self.query_one_json(
            "SELECT data FROM change_requests
             WHERE agent_id = ?1 AND file_path = ?2 AND status = 'pending'",
            params![agent_id, file_path],
        )
    }

    fn list_changes(&self, status: Option<ChangeStatus>) -> Result<Vec<ChangeRequest>> {
        match status {
            Some(status) => self.query_json(
                "SELECT data FROM change_requests WHERE status = ?1 ORDER BY seq",
                params![status.as_str()],
            ),
            None => self.query_json("SELECT data FROM change_requests ORDER BY seq", []),
        }
    }

    fn insert_exception(&self, exception: &ExceptionRequest) -> Result<()> {
        let data = to_json(exception)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO exception_requests (id, change_request_id, data) VALUES (?1, ?2, ?3)",
            params![exception.id, exception.change_request_id, data],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                EdictError::AlreadyExists {
                    entity: "exception request",
                    id: exception.id.clone(),
                }
            } else {
                e.into()
            }
        })?;
        Ok(())
    }

    fn update_exception(&self, exception: &ExceptionRequest) -> Result<()> {
        let data = to_json(exception)?;
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE exception_requests SET data = ?2 WHERE id = ?1",
            params![exception.id, data],
        )?;
        if changed == 0 {
            return Err(EdictError::ExceptionNotFound {
                exception_id: exception.id.clone(),
            });
        }
        Ok(())
    }

    fn get_exception(&self, exception_id: &str) -> Result<Option<ExceptionRequest>> {
        self.query_one_json(
            "SELECT data FROM exception_requests WHERE id = ?1",
            params![exception_id],
        )
    }

    fn list_exceptions(&self) -> Result<Vec<ExceptionRequest>> {
        self.query_json("SELECT data FROM exception_requests ORDER BY seq", [])
    }

    fn append_audit(&self, event: &AuditEvent) -> Result<()> {
        let data = to_json(event)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO audit_events (id, entity_id, data) VALUES (?1, ?2, ?3)",
            params![event.id, event.entity_id, data],
        )?;
        Ok(())
    }

    fn audit_trail(&self, entity_id: &str) -> Result<Vec<AuditEvent>> {
        self.query_json(
            "SELECT data FROM audit_events WHERE entity_id = ?1 ORDER BY seq",
            params![entity_id],
        )
    }

    fn latest_version(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let value: Option<i64> = conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'config_version'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.map_or(0, |v| v.max(0) as u64))
    }

    fn record_version(&self, version: u64) -> Result<()> {
        let version = i64::try_from(version)
            .map_err(|_| EdictError::storage(format!("version out of range: {}", version)))?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO meta (key, value) VALUES ('config_version', ?1)
             ON CONFLICT (key) DO UPDATE SET value = MAX(value, excluded.value)",
            params![version],
        )?;
        Ok(())
    }

    fn health_check(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}
