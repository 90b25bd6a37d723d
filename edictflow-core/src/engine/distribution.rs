//! Config distribution: effective set, version, and fan-out to live agents

use std::sync::Arc;

use crate::clock::Clock;
use crate::directory::Directory;
use crate::error::{EdictError, Result};
use crate::hash::content_hash;
use crate::model::Caller;
use crate::protocol::{ConfigUpdatePayload, Message, RuleRecord};
use crate::render::render_managed_section;
use crate::storage::ControllerStore;

use super::resolver::resolve_all;
use super::version::VersionTracker;
use super::Dispatcher;

/// Builds `config_update` payloads and pushes them to connected agents
pub struct Distributor {
    store: Arc<dyn ControllerStore>,
    directory: Arc<dyn Directory>,
    clock: Arc<dyn Clock>,
    dispatcher: Arc<dyn Dispatcher>,
    versions: VersionTracker,
}

impl Distributor {
    pub fn new(
        store: Arc<dyn ControllerStore>,
        directory: Arc<dyn Directory>,
        clock: Arc<dyn Clock>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        Self {
            store,
            directory,
            clock,
            dispatcher,
            versions: VersionTracker::new(),
        }
    }

    pub fn versions(&self) -> &VersionTracker {
        &self.versions
    }

    /// Resolve the caller identity for a registered agent
    pub fn caller_for_agent(&self, agent_id: &str) -> Result<Caller> {
        let agent = self
            .store
            .get_agent(agent_id)?
            .ok_or_else(|| EdictError::AgentNotFound {
                agent_id: agent_id.to_string(),
            })?;
        Ok(self.directory.caller_for(&agent.user_id))
    }

    /// The full `config_update` for `caller` with its cohort version
    pub fn config_for(&self, caller: &Caller) -> Result<ConfigUpdatePayload> {
        let rules = self.store.list_rules()?;
        let categories = self.store.list_categories()?;
        let records: Vec<RuleRecord> = resolve_all(&rules, caller)
            .iter()
            .map(RuleRecord::from)
            .collect();

        // The fingerprint covers what renders now and what agents match on
        let rendered = render_managed_section(&records, &categories, self.clock.now());
        let mut fingerprint_input = rendered.into_bytes();
        fingerprint_input.extend(serde_json::to_vec(&records)?);
        fingerprint_input.extend(serde_json::to_vec(&categories)?);
        let fingerprint = content_hash(&fingerprint_input);

        let version = self
            .versions
            .version_for(self.store.as_ref(), &caller.cohort_key(), &fingerprint)?;
        Ok(ConfigUpdatePayload {
            rules: records,
            categories,
            version,
        })
    }

    pub fn config_for_agent(&self, agent_id: &str) -> Result<ConfigUpdatePayload> {
        let caller = self.caller_for_agent(agent_id)?;
        self.config_for(&caller)
    }

    /// Push `config_update` to one agent; false when it is not connected
    pub fn push_to(&self, agent_id: &str) -> Result<bool> {
        let config = self.config_for_agent(agent_id)?;
        Ok(self
            .dispatcher
            .dispatch(agent_id, Message::ConfigUpdate(config)))
    }

    /// Push a fresh `config_update` to every connected agent
    ///
    /// Failures for one agent are logged and do not stop the rest.
    pub fn broadcast(&self) -> usize {
        let mut delivered = 0;
        for agent_id in self.dispatcher.connected_agents() {
            match self.push_to(&agent_id) {
                Ok(true) => delivered += 1,
                Ok(false) => tracing::debug!(agent_id = %agent_id, "agent left before broadcast"),
                Err(e) => tracing::warn!(agent_id = %agent_id, error = %e, "config broadcast failed"),
            }
        }
        tracing::info!(delivered, "broadcast config update");
        delivered
    }
}
