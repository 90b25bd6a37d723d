//! Render, merge and enforce managed files
//!
//! The reconciler owns every write the agent makes to a managed file. It
//! renders each project's section from the cached rules that match the
//! project, merges it into the file without touching hand-written content,
//! and turns tampering into change reports according to the enforcement
//! mode of the rule that was touched:
//!
//! | Mode      | On drift                               | On reject          |
//! |-----------|----------------------------------------|--------------------|
//! | advisory  | report, keep the edit as the baseline  | restore            |
//! | block     | report, restore now, keep the edit     | restore            |
//! | temporary | report, keep the edit until resolved   | restore            |
//!
//! Approval of a blocked change (or an exception for one) writes the kept
//! edit back. The baseline hash is updated before every write, so the
//! watcher event the write causes hashes equal and is ignored.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use edictflow_core::hash::{content_hash, empty_hash};
use edictflow_core::model::{EnforcementMode, ProjectContext};
use edictflow_core::protocol::{
    ChangeApprovedPayload, ChangeDetectedPayload, ChangeRejectedPayload, ConfigUpdatePayload,
    DriftEntry, DriftReportPayload, ExceptionDeniedPayload, ExceptionGrantedPayload,
    ExceptionRequestPayload, Message, RevertCompletePayload, RuleRecord, SyncCompletePayload,
};
use edictflow_core::render::{
    is_tampered, managed_section, merge_with_existing, render_managed_section, render_rule_block,
};
use edictflow_core::Clock;
use uuid::Uuid;

use crate::diff;
use crate::error::{AgentError, Result};
use crate::notifier::{notify_quietly, NotificationKind, Notifier};
use crate::queue::OutboundQueue;
use crate::store::{AgentStore, LocalChange, LocalChangeStatus, WatchedFile};

/// What handling a watcher event did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriftOutcome {
    /// Content hashes equal the baseline; nothing to do
    Unchanged,
    /// Edit outside the managed section; baseline moved silently
    BaselineMoved,
    /// Managed section tampered; reported under `ref_id`
    Reported {
        ref_id: String,
        rule_id: String,
        mode: EnforcementMode,
        updated: bool,
    },
}

/// Renders and enforces managed files for every registered project
pub struct Reconciler {
    store: Arc<AgentStore>,
    queue: Arc<OutboundQueue>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    managed_filename: String,
}

impl Reconciler {
    pub fn new(
        store: Arc<AgentStore>,
        queue: Arc<OutboundQueue>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        managed_filename: impl Into<String>,
    ) -> Self {
        Self {
            store,
            queue,
            notifier,
            clock,
            managed_filename: managed_filename.into(),
        }
    }

    pub fn managed_filename(&self) -> &str {
        &self.managed_filename
    }

    pub fn managed_path(&self, project_path: &str) -> PathBuf {
        Path::new(project_path).join(&self.managed_filename)
    }

    /// Cached rules whose triggers match `project`
    fn rules_for(&self, project: &ProjectContext) -> Result<Vec<RuleRecord>> {
        Ok(self
            .store
            .cached_rules()?
            .into_iter()
            .filter(|r| r.matches_project(project))
            .collect())
    }

    /// The section `project` should carry right now
    pub fn expected_section(&self, project: &ProjectContext) -> Result<String> {
        let rules = self.rules_for(project)?;
        let categories = self.store.cached_categories()?;
        Ok(render_managed_section(&rules, &categories, self.clock.now()))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Config sync
    // ═══════════════════════════════════════════════════════════════════════

    /// Replace the cache with `config`, re-render every project and queue
    /// `sync_complete`; returns the number of files written
    pub fn apply_config(&self, config: &ConfigUpdatePayload) -> Result<u32> {
        let previous = self.store.cached_version()?;
        self.store.replace_rules(config, self.clock.now())?;
        let written = self.reconcile_all()?;
        tracing::info!(
            version = config.version,
            previous,
            rules = config.rules.len(),
            files = written,
            "rule set applied"
        );
        if config.version != previous {
            notify_quietly(
                self.notifier.as_ref(),
                NotificationKind::RulesUpdated,
                "Rules updated",
                &format!("Now enforcing version {} ({} rules)", config.version, config.rules.len()),
            );
        }
        self.queue.enqueue(Message::SyncComplete(SyncCompletePayload {
            version: config.version,
            files_written: written,
        }))?;
        Ok(written)
    }

    /// Re-render every registered project
    pub fn reconcile_all(&self) -> Result<u32> {
        let mut written = 0;
        for project in self.store.projects()? {
            match self.reconcile_project(&project) {
                Ok(true) => written += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(project = %project.path, error = %e, "reconcile failed"),
            }
        }
        Ok(written)
    }

    /// Bring one project's managed file in line; true if it was written
    ///
    /// A file holding an unresolved temporary edit is left as is until the
    /// controller decides. Advisory edits are only recorded, so a new render
    /// goes over them.
    pub fn reconcile_project(&self, project: &ProjectContext) -> Result<bool> {
        let path = self.managed_path(&project.path);
        let path_str = path.to_string_lossy().into_owned();

        if let Some(open) = self.store.open_change_for_file(&path_str)? {
            if open.enforcement_mode == EnforcementMode::Temporary {
                tracing::debug!(file = %path_str, "pending change in place; skipping render");
                return Ok(false);
            }
        }

        let expected = self.expected_section(project)?;
        let existing = read_or_empty(&path)?;
        if existing.is_none() && expected.is_empty() {
            self.set_baseline(&path_str, &project.path, None, &empty_hash())?;
            return Ok(false);
        }
        let existing = existing.unwrap_or_default();
        let merged = merge_with_existing(&existing, &expected);
        let rule_id = self.store.watched(&path_str)?.and_then(|w| w.rule_id);
        self.set_baseline(&path_str, &project.path, rule_id, &content_hash(merged.as_bytes()))?;
        if merged == existing {
            return Ok(false);
        }
        std::fs::write(&path, merged)?;
        tracing::debug!(file = %path_str, "managed section written");
        Ok(true)
    }

    fn set_baseline(&self, path: &str, project_path: &str, rule_id: Option<String>, hash: &str) -> Result<()> {
        self.store.set_watched(
            &WatchedFile {
                path: path.to_string(),
                project_path: project_path.to_string(),
                rule_id,
                baseline_hash: hash.to_string(),
            },
            self.clock.now(),
        )
    }

    /// Write `content` after moving the baseline to its hash
    fn write_managed(&self, watched: &WatchedFile, content: &str) -> Result<String> {
        let hash = content_hash(content.as_bytes());
        self.set_baseline(&watched.path, &watched.project_path, watched.rule_id.clone(), &hash)?;
        std::fs::write(&watched.path, content)?;
        Ok(hash)
    }

    /// Re-merge the expected section into the file at `watched`
    fn restore(&self, watched: &WatchedFile) -> Result<String> {
        let project = self
            .store
            .project(&watched.project_path)?
            .ok_or_else(|| AgentError::ProjectNotFound(watched.project_path.clone()))?;
        let expected = self.expected_section(&project)?;
        let existing = read_or_empty(Path::new(&watched.path))?.unwrap_or_default();
        let restored = merge_with_existing(&existing, &expected);
        let hash = self.write_managed(watched, &restored)?;
        notify_quietly(
            self.notifier.as_ref(),
            NotificationKind::SectionRestored,
            "Managed section restored",
            &watched.path,
        );
        Ok(hash)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Drift
    // ═══════════════════════════════════════════════════════════════════════

    /// Project owning `path`, if `path` is a managed file of a registered project
    fn locate(&self, path: &Path) -> Result<Option<(ProjectContext, WatchedFile)>> {
        if path.file_name().and_then(|n| n.to_str()) != Some(self.managed_filename.as_str()) {
            return Ok(None);
        }
        let path_str = path.to_string_lossy().into_owned();
        let Some(dir) = path.parent().map(|d| d.to_string_lossy().into_owned()) else {
            return Ok(None);
        };
        let Some(project) = self.store.project(&dir)? else {
            return Ok(None);
        };
        let watched = self.store.watched(&path_str)?.unwrap_or(WatchedFile {
            path: path_str,
            project_path: project.path.clone(),
            rule_id: None,
            baseline_hash: empty_hash(),
        });
        Ok(Some((project, watched)))
    }

    /// Handle a significant watcher event for `path`
    pub fn on_file_event(&self, path: &Path) -> Result<DriftOutcome> {
        let Some((project, watched)) = self.locate(path)? else {
            return Ok(DriftOutcome::Unchanged);
        };
        // Deletion is not drift; the next render recreates the file
        let Some(content) = read_or_empty(path)? else {
            return Ok(DriftOutcome::Unchanged);
        };
        let hash = content_hash(content.as_bytes());
        if hash == watched.baseline_hash {
            return Ok(DriftOutcome::Unchanged);
        }

        let expected = self.expected_section(&project)?;
        if !is_tampered(&content, &expected) {
            self.set_baseline(&watched.path, &watched.project_path, watched.rule_id.clone(), &hash)?;
            tracing::debug!(file = %watched.path, "edit outside the managed section");
            return Ok(DriftOutcome::BaselineMoved);
        }

        let rules = self.rules_for(&project)?;
        let actual = managed_section(&content).unwrap_or_default();
        let Some(rule) = touched_rule(actual, &rules) else {
            // Nothing renders for this project yet the section is malformed
            self.set_baseline(&watched.path, &watched.project_path, None, &hash)?;
            return Ok(DriftOutcome::BaselineMoved);
        };
        let diff = diff::unified(expected.trim_end_matches('\n'), if actual.is_empty() { content.as_str() } else { actual });
        let now = self.clock.now();

        let open = self.store.open_change_for_file(&watched.path)?;
        let (ref_id, mode, updated) = match &open {
            Some(row) => {
                let ref_id = Uuid::new_v4().to_string();
                self.store
                    .update_change_content(&row.ref_id, &hash, &content, now)?;
                self.queue.enqueue_as(
                    &ref_id,
                    Message::ChangeUpdated(ChangeDetectedPayload {
                        rule_id: row.rule_id.clone(),
                        file_path: watched.path.clone(),
                        original_hash: row.original_hash.clone(),
                        modified_hash: hash.clone(),
                        diff,
                        enforcement_mode: row.enforcement_mode,
                    }),
                )?;
                (ref_id, row.enforcement_mode, true)
            }
            None => {
                let ref_id = Uuid::new_v4().to_string();
                // The ledger row exists before the report can be acknowledged
                self.store.insert_change(&LocalChange {
                    ref_id: ref_id.clone(),
                    change_id: None,
                    rule_id: rule.id.clone(),
                    file_path: watched.path.clone(),
                    enforcement_mode: rule.enforcement_mode,
                    original_hash: watched.baseline_hash.clone(),
                    modified_hash: hash.clone(),
                    modified_content: content.clone(),
                    status: LocalChangeStatus::Pending,
                    created_at: now,
                    updated_at: now,
                })?;
                self.queue.enqueue_as(
                    &ref_id,
                    Message::ChangeDetected(ChangeDetectedPayload {
                        rule_id: rule.id.clone(),
                        file_path: watched.path.clone(),
                        original_hash: watched.baseline_hash.clone(),
                        modified_hash: hash.clone(),
                        diff,
                        enforcement_mode: rule.enforcement_mode,
                    }),
                )?;
                (ref_id, rule.enforcement_mode, false)
            }
        };
        let rule_id = open.as_ref().map(|r| r.rule_id.clone()).unwrap_or_else(|| rule.id.clone());

        let tracked = WatchedFile {
            rule_id: Some(rule_id.clone()),
            ..watched
        };
        match mode {
            EnforcementMode::Advisory | EnforcementMode::Temporary => {
                self.set_baseline(&tracked.path, &tracked.project_path, tracked.rule_id.clone(), &hash)?;
            }
            EnforcementMode::Block => {
                let restored = merge_with_existing(&content, &expected);
                self.write_managed(&tracked, &restored)?;
                notify_quietly(
                    self.notifier.as_ref(),
                    NotificationKind::ChangeBlocked,
                    "Change blocked pending approval",
                    &format!("Your edit to {} was held for review and the managed section restored", tracked.path),
                );
            }
        }
        tracing::info!(
            file = %tracked.path,
            rule_id = %rule_id,
            mode = %mode,
            updated,
            "managed section drift reported"
        );
        Ok(DriftOutcome::Reported {
            ref_id,
            rule_id,
            mode,
            updated,
        })
    }

    /// Check every watched file against its expected render
    pub fn drift_report(&self) -> Result<DriftReportPayload> {
        let mut checked = 0;
        let mut drifted = Vec::new();
        for watched in self.store.watched_files()? {
            let Some(project) = self.store.project(&watched.project_path)? else {
                continue;
            };
            checked += 1;
            let expected = self.expected_section(&project)?;
            let content = read_or_empty(Path::new(&watched.path))?.unwrap_or_default();
            if is_tampered(&content, &expected) {
                drifted.push(DriftEntry {
                    file_path: watched.path.clone(),
                    expected_hash: content_hash(expected.as_bytes()),
                    actual_hash: content_hash(managed_section(&content).unwrap_or_default().as_bytes()),
                });
            }
        }
        Ok(DriftReportPayload {
            version: self.store.cached_version()?,
            checked,
            drifted,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Resolutions
    // ═══════════════════════════════════════════════════════════════════════

    /// Ledger row for a controller change id, falling back to the open row for the file
    fn find_row(&self, change_id: &str, file_path: Option<&str>) -> Result<Option<LocalChange>> {
        if let Some(row) = self.store.change_by_id(change_id)? {
            return Ok(Some(row));
        }
        match file_path {
            Some(path) => {
                let row = self.store.open_change_for_file(path)?;
                if let Some(row) = &row {
                    self.store.link_change(&row.ref_id, change_id)?;
                }
                Ok(row)
            }
            None => Ok(None),
        }
    }

    fn watched_for(&self, file_path: &str) -> Result<WatchedFile> {
        let path = Path::new(file_path);
        match self.store.watched(file_path)? {
            Some(w) => Ok(w),
            None => self
                .locate(path)?
                .map(|(_, w)| w)
                .ok_or_else(|| AgentError::ProjectNotFound(file_path.to_string())),
        }
    }

    pub fn on_change_approved(&self, payload: &ChangeApprovedPayload) -> Result<()> {
        let Some(row) = self.find_row(&payload.change_id, payload.file_path.as_deref())? else {
            tracing::warn!(change_id = %payload.change_id, "approval for an unknown change");
            return Ok(());
        };
        let now = self.clock.now();
        self.store
            .set_change_status(&row.ref_id, LocalChangeStatus::Approved, now)?;
        if row.enforcement_mode == EnforcementMode::Block {
            let watched = self.watched_for(&row.file_path)?;
            self.write_managed(&watched, &row.modified_content)?;
        }
        notify_quietly(
            self.notifier.as_ref(),
            NotificationKind::ChangeApproved,
            "Change approved",
            &format!("Your edit to {} was approved", row.file_path),
        );
        Ok(())
    }

    /// Restore the managed section and queue `revert_complete`
    pub fn on_change_rejected(&self, payload: &ChangeRejectedPayload) -> Result<()> {
        let row = self.find_row(&payload.change_id, payload.file_path.as_deref())?;
        let file_path = match (&row, &payload.file_path) {
            (Some(row), _) => row.file_path.clone(),
            (None, Some(path)) => path.clone(),
            (None, None) => {
                tracing::warn!(change_id = %payload.change_id, "rejection for an unknown change");
                return Ok(());
            }
        };
        let now = self.clock.now();
        if let Some(row) = &row {
            self.store
                .set_change_status(&row.ref_id, LocalChangeStatus::Rejected, now)?;
        }

        let watched = self.watched_for(&file_path)?;
        let new_hash = self.restore(&watched)?;
        if new_hash != payload.revert_to_hash {
            tracing::debug!(
                file = %file_path,
                "restored file differs from the revert target outside the managed section"
            );
        }
        self.queue.enqueue(Message::RevertComplete(RevertCompletePayload {
            change_id: Some(payload.change_id.clone()),
            file_path: file_path.clone(),
            new_hash,
        }))?;

        let (kind, title) = if payload.auto_reverted {
            (NotificationKind::ChangeAutoReverted, "Change auto-reverted")
        } else {
            (NotificationKind::ChangeRejected, "Change rejected")
        };
        notify_quietly(
            self.notifier.as_ref(),
            kind,
            title,
            &format!("The managed section of {} was restored", file_path),
        );
        Ok(())
    }

    pub fn on_exception_granted(&self, payload: &ExceptionGrantedPayload) -> Result<()> {
        let Some(row) = self.find_row(&payload.change_id, payload.file_path.as_deref())? else {
            tracing::warn!(change_id = %payload.change_id, "exception for an unknown change");
            return Ok(());
        };
        self.store
            .set_change_status(&row.ref_id, LocalChangeStatus::ExceptionGranted, self.clock.now())?;
        if row.enforcement_mode == EnforcementMode::Block {
            let watched = self.watched_for(&row.file_path)?;
            self.write_managed(&watched, &row.modified_content)?;
        }
        let until = payload
            .expires_at
            .map(|t| format!(" until {}", t.to_rfc3339()))
            .unwrap_or_default();
        notify_quietly(
            self.notifier.as_ref(),
            NotificationKind::ExceptionGranted,
            "Exception granted",
            &format!("Your edit to {} is allowed{}", row.file_path, until),
        );
        Ok(())
    }

    pub fn on_exception_denied(&self, payload: &ExceptionDeniedPayload) -> Result<()> {
        if let Some(row) = self.find_row(&payload.change_id, payload.file_path.as_deref())? {
            self.store
                .set_change_status(&row.ref_id, LocalChangeStatus::ExceptionDenied, self.clock.now())?;
        }
        notify_quietly(
            self.notifier.as_ref(),
            NotificationKind::ExceptionDenied,
            "Exception denied",
            &format!("Exception for change {} was denied", payload.change_id),
        );
        Ok(())
    }

    /// Queue an exception request for a change this agent reported
    pub fn request_exception(&self, request: ExceptionRequestPayload) -> Result<String> {
        if self.store.change_by_id(&request.change_id)?.is_none() {
            return Err(AgentError::ChangeNotFound(request.change_id));
        }
        self.queue.enqueue(Message::ExceptionRequest(request))
    }
}

/// Contents of `path`, or `None` when it does not exist
fn read_or_empty(path: &Path) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// The rule an edit most plausibly touched
///
/// Rules whose rendered block no longer appears in `actual` are candidates;
/// when every block survived (text was only added) all rules are. The
/// strictest enforcement mode wins, then the lowest id.
pub fn touched_rule<'a>(actual: &str, rules: &'a [RuleRecord]) -> Option<&'a RuleRecord> {
    let missing: Vec<&RuleRecord> = rules
        .iter()
        .filter(|r| !actual.contains(&render_rule_block(r)))
        .collect();
    let candidates: Vec<&RuleRecord> = if missing.is_empty() {
        rules.iter().collect()
    } else {
        missing
    };
    candidates.into_iter().min_by(|a, b| {
        b.enforcement_mode
            .strictness()
            .cmp(&a.enforcement_mode.strictness())
            .then_with(|| a.id.cmp(&b.id))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use edictflow_core::model::TargetLayer;

    fn rule(id: &str, mode: EnforcementMode) -> RuleRecord {
        RuleRecord {
            id: id.into(),
            name: format!("Rule {}", id),
            body: format!("Body {}", id),
            target_layer: TargetLayer::Project,
            triggers: vec![],
            enforcement_mode: mode,
            temporary_timeout_hours: 1,
            priority_weight: 0,
            overridable: false,
            force: false,
            category_id: None,
            effective_start: None,
            effective_end: None,
        }
    }

    use crate::config::QueueConfig;
    use crate::notifier::RecordingNotifier;
    use chrono::Utc;
    use edictflow_core::ManualClock;

    struct Fixture {
        dir: tempfile::TempDir,
        store: Arc<AgentStore>,
        queue: Arc<OutboundQueue>,
        notifier: Arc<RecordingNotifier>,
        reconciler: Reconciler,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
            let store = Arc::new(AgentStore::open_in_memory().unwrap());
            let queue = Arc::new(OutboundQueue::new(store.clone(), QueueConfig::default(), clock.clone()));
            let notifier = Arc::new(RecordingNotifier::new());
            let reconciler = Reconciler::new(store.clone(), queue.clone(), notifier.clone(), clock, "CLAUDE.md");
            let project = ProjectContext {
                path: dir.path().to_string_lossy().into_owned(),
                context_types: vec![],
                tags: vec![],
            };
            store.upsert_project(&project, Utc::now()).unwrap();
            Self {
                dir,
                store,
                queue,
                notifier,
                reconciler,
            }
        }

        fn file(&self) -> PathBuf {
            self.dir.path().join("CLAUDE.md")
        }

        fn apply(&self, rules: Vec<RuleRecord>, version: u64) -> u32 {
            self.reconciler
                .apply_config(&ConfigUpdatePayload {
                    rules,
                    categories: vec![],
                    version,
                })
                .unwrap()
        }
    }

    #[test]
    fn test_apply_config_writes_and_preserves_manual_content() {
        let fx = Fixture::new();
        std::fs::write(fx.file(), "# My notes\n").unwrap();
        assert_eq!(fx.apply(vec![rule("a", EnforcementMode::Advisory)], 1), 1);

        let text = std::fs::read_to_string(fx.file()).unwrap();
        assert!(text.starts_with("# My notes\n\n"));
        assert!(text.contains("[Project] **Rule a**\nBody a"));
        // sync_complete queued
        assert_eq!(fx.queue.len().unwrap(), 1);
        assert_eq!(fx.notifier.kinds(), vec![NotificationKind::RulesUpdated]);

        // Same version again rewrites nothing
        assert_eq!(fx.apply(vec![rule("a", EnforcementMode::Advisory)], 1), 0);
        assert_eq!(fx.reconciler.on_file_event(&fx.file()).unwrap(), DriftOutcome::Unchanged);
    }

    #[test]
    fn test_edit_outside_section_moves_baseline() {
        let fx = Fixture::new();
        fx.apply(vec![rule("a", EnforcementMode::Block)], 1);
        let text = std::fs::read_to_string(fx.file()).unwrap();
        std::fs::write(fx.file(), format!("{}\nlocal footer\n", text)).unwrap();

        assert_eq!(fx.reconciler.on_file_event(&fx.file()).unwrap(), DriftOutcome::BaselineMoved);
        assert!(fx.store.changes().unwrap().is_empty());
    }

    #[test]
    fn test_block_edit_is_restored_then_rejected() {
        let fx = Fixture::new();
        fx.apply(vec![rule("a", EnforcementMode::Block)], 1);
        let path = fx.file();
        let original = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, original.replace("Body a", "Body hacked")).unwrap();

        let outcome = fx.reconciler.on_file_event(&path).unwrap();
        assert!(matches!(
            outcome,
            DriftOutcome::Reported { ref mode, updated: false, .. } if *mode == EnforcementMode::Block
        ));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), original);
        // The restore write is not drift
        assert_eq!(fx.reconciler.on_file_event(&path).unwrap(), DriftOutcome::Unchanged);

        let rows = fx.store.changes().unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].modified_content.contains("Body hacked"));

        fx.reconciler
            .on_change_rejected(&ChangeRejectedPayload {
                change_id: "chg-1".into(),
                rule_id: "a".into(),
                revert_to_hash: content_hash(original.as_bytes()),
                file_path: Some(path.to_string_lossy().into_owned()),
                auto_reverted: false,
            })
            .unwrap();
        let row = fx.store.change_by_id("chg-1").unwrap().unwrap();
        assert_eq!(row.status, LocalChangeStatus::Rejected);
        assert!(fx.notifier.kinds().contains(&NotificationKind::ChangeBlocked));
        assert!(fx.notifier.kinds().contains(&NotificationKind::ChangeRejected));
    }

    #[test]
    fn test_approved_block_change_is_written_back() {
        let fx = Fixture::new();
        fx.apply(vec![rule("a", EnforcementMode::Block)], 1);
        let path = fx.file();
        let edited = std::fs::read_to_string(&path).unwrap().replace("Body a", "Body approved");
        std::fs::write(&path, &edited).unwrap();
        fx.reconciler.on_file_event(&path).unwrap();

        let row = &fx.store.changes().unwrap()[0];
        fx.store.link_change(&row.ref_id, "chg-9").unwrap();
        fx.reconciler
            .on_change_approved(&ChangeApprovedPayload {
                change_id: "chg-9".into(),
                rule_id: "a".into(),
                file_path: None,
            })
            .unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), edited);
        assert_eq!(fx.reconciler.on_file_event(&path).unwrap(), DriftOutcome::Unchanged);
    }

    #[test]
    fn test_temporary_edit_stays_and_second_edit_updates() {
        let fx = Fixture::new();
        fx.apply(vec![rule("a", EnforcementMode::Temporary)], 1);
        let path = fx.file();
        let original = std::fs::read_to_string(&path).unwrap();
        let first = original.replace("Body a", "Body one");
        std::fs::write(&path, &first).unwrap();
        fx.reconciler.on_file_event(&path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), first);

        std::fs::write(&path, original.replace("Body a", "Body two")).unwrap();
        let outcome = fx.reconciler.on_file_event(&path).unwrap();
        assert!(matches!(outcome, DriftOutcome::Reported { updated: true, .. }));
        assert_eq!(fx.store.changes().unwrap().len(), 1);

        // Pending temporary edit survives a re-render
        assert_eq!(fx.apply(vec![rule("a", EnforcementMode::Temporary)], 2), 0);
        assert!(std::fs::read_to_string(&path).unwrap().contains("Body two"));

        let report = fx.reconciler.drift_report().unwrap();
        assert_eq!(report.checked, 1);
        assert_eq!(report.drifted.len(), 1);
    }

    #[test]
    fn test_advisory_edit_does_not_hold_back_new_rules() {
        let fx = Fixture::new();
        fx.apply(vec![rule("a", EnforcementMode::Advisory)], 1);
        let path = fx.file();
        let original = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, original.replace("Body a", "Body mine")).unwrap();
        let outcome = fx.reconciler.on_file_event(&path).unwrap();
        assert!(matches!(
            outcome,
            DriftOutcome::Reported { ref mode, .. } if *mode == EnforcementMode::Advisory
        ));

        let written = fx.apply(
            vec![rule("a", EnforcementMode::Advisory), rule("b", EnforcementMode::Block)],
            2,
        );
        assert_eq!(written, 1);
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("**Rule b**\nBody b"));
        assert!(text.contains("Body a"));
        assert_eq!(fx.reconciler.on_file_event(&path).unwrap(), DriftOutcome::Unchanged);
    }

    #[test]
    fn test_exception_request_needs_known_change() {
        let fx = Fixture::new();
        let err = fx
            .reconciler
            .request_exception(ExceptionRequestPayload {
                change_id: "nope".into(),
                justification: "hotfix".into(),
                exception_type: edictflow_core::model::ExceptionType::TimeLimited,
                duration_hours: Some(4),
            })
            .unwrap_err();
        assert!(matches!(err, AgentError::ChangeNotFound(_)));
    }

    #[test]
    fn test_touched_rule_prefers_rule_whose_block_is_missing() {
        let rules = vec![rule("a", EnforcementMode::Block), rule("b", EnforcementMode::Advisory)];
        let actual = format!("{}\n\n[Project] **Rule a**\nBody a", "header");
        assert_eq!(touched_rule(&actual, &rules).unwrap().id, "b");
    }

    #[test]
    fn test_touched_rule_falls_back_to_strictest() {
        let rules = vec![
            rule("a", EnforcementMode::Advisory),
            rule("c", EnforcementMode::Temporary),
            rule("b", EnforcementMode::Temporary),
        ];
        let all: String = rules.iter().map(|r| render_rule_block(r) + "\n\n").collect();
        assert_eq!(touched_rule(&(all + "extra"), &rules).unwrap().id, "b");
        assert!(touched_rule("", &[]).is_none());
    }
}
