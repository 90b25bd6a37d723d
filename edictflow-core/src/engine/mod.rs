//! Controller engine
//!
//! [`Controller`] wires the rule lifecycle, the change and exception state
//! machines and config distribution over one store, one directory and one
//! clock. Controller-originated frames leave through a [`Dispatcher`], which
//! the server implements with its session registry.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use edictflow_core::directory::{StaticDirectory, Team};
//! use edictflow_core::engine::Controller;
//! use edictflow_core::model::{ApprovalDecision, NewRule, RuleStatus, TargetLayer};
//!
//! let directory = StaticDirectory::new()
//!     .with_team(Team::new("web"))
//!     .with_permission("lead", "rules.approve");
//! let controller = Controller::builder().directory(Arc::new(directory)).build();
//!
//! let rules = controller.rules();
//! let rule = rules
//!     .create(NewRule::new("No secrets", "Never commit credentials.", TargetLayer::Enterprise), "admin")
//!     .unwrap();
//! rules.submit(&rule.id, "admin").unwrap();
//! let outcome = rules.vote(&rule.id, "lead", ApprovalDecision::Approved, None).unwrap();
//!
//! assert_eq!(outcome.rule.status, RuleStatus::Approved);
//! assert_eq!(outcome.attached_teams, vec!["web".to_string()]);
//! ```

mod changes;
mod distribution;
mod exceptions;
mod lifecycle;
pub mod resolver;
mod version;

pub use changes::{ChangeEngine, ReportOutcome, DEFAULT_TEMPORARY_TIMEOUT_HOURS, SYSTEM_ACTOR};
pub use distribution::Distributor;
pub use exceptions::{ExceptionEngine, NewException};
pub use lifecycle::{RuleEngine, RuleFilter, Transition, VoteOutcome};
pub use version::VersionTracker;

use std::sync::Arc;

use parking_lot::Mutex;

use crate::audit::AuditEvent;
use crate::clock::{Clock, SystemClock};
use crate::directory::{Directory, PermissionOracle, StaticDirectory};
use crate::error::Result;
use crate::model::AgentRecord;
use crate::protocol::Message;
use crate::storage::{ControllerStore, InMemoryStore};

/// Routes controller-originated messages to agent sessions
///
/// Delivery is best effort: `dispatch` returns false when the agent has no
/// live session or its buffer is full, and the message is dropped.
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, agent_id: &str, message: Message) -> bool;

    /// Agent ids with a live session
    fn connected_agents(&self) -> Vec<String>;
}

/// Drops everything; for controllers without sessions
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDispatcher;

impl Dispatcher for NullDispatcher {
    fn dispatch(&self, _agent_id: &str, _message: Message) -> bool {
        false
    }

    fn connected_agents(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Records every dispatched message; agents listed as connected accept them
#[derive(Debug, Default)]
pub struct RecordingDispatcher {
    connected: Mutex<Vec<String>>,
    sent: Mutex<Vec<(String, Message)>>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, agent_id: &str) {
        let mut connected = self.connected.lock();
        if !connected.iter().any(|a| a == agent_id) {
            connected.push(agent_id.to_string());
        }
    }

    pub fn disconnect(&self, agent_id: &str) {
        self.connected.lock().retain(|a| a != agent_id);
    }

    /// Messages delivered so far, oldest first
    pub fn sent(&self) -> Vec<(String, Message)> {
        self.sent.lock().clone()
    }

    /// Messages delivered to `agent_id`, oldest first
    pub fn sent_to(&self, agent_id: &str) -> Vec<Message> {
        self.sent
            .lock()
            .iter()
            .filter(|(a, _)| a == agent_id)
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }
}

impl Dispatcher for RecordingDispatcher {
    fn dispatch(&self, agent_id: &str, message: Message) -> bool {
        if !self.connected.lock().iter().any(|a| a == agent_id) {
            return false;
        }
        self.sent.lock().push((agent_id.to_string(), message));
        true
    }

    fn connected_agents(&self) -> Vec<String> {
        self.connected.lock().clone()
    }
}

/// Builder for [`Controller`]
#[derive(Default)]
pub struct ControllerBuilder {
    store: Option<Arc<dyn ControllerStore>>,
    membership: Option<Membership>,
    clock: Option<Arc<dyn Clock>>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
}

struct Membership {
    directory: Arc<dyn Directory>,
    oracle: Arc<dyn PermissionOracle>,
}

impl ControllerBuilder {
    pub fn store(mut self, store: Arc<dyn ControllerStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// A directory that is also the permission oracle
    pub fn directory<D>(mut self, directory: Arc<D>) -> Self
    where
        D: Directory + PermissionOracle + 'static,
    {
        self.membership = Some(Membership {
            directory: directory.clone(),
            oracle: directory,
        });
        self
    }

    /// Separate directory and permission oracle
    pub fn directory_with_oracle(
        mut self,
        directory: Arc<dyn Directory>,
        oracle: Arc<dyn PermissionOracle>,
    ) -> Self {
        self.membership = Some(Membership { directory, oracle });
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn build(self) -> Controller {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryStore::new()));
        let (directory, oracle) = match self.membership {
            Some(m) => (m.directory, m.oracle),
            None => {
                let d = Arc::new(StaticDirectory::new());
                (d.clone() as Arc<dyn Directory>, d as Arc<dyn PermissionOracle>)
            }
        };
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let dispatcher = self
            .dispatcher
            .unwrap_or_else(|| Arc::new(NullDispatcher));

        let distributor = Arc::new(Distributor::new(
            store.clone(),
            directory.clone(),
            clock.clone(),
            dispatcher.clone(),
        ));
        let rules = Arc::new(RuleEngine::new(
            store.clone(),
            directory.clone(),
            oracle.clone(),
            clock.clone(),
            distributor.clone(),
        ));
        let changes = Arc::new(ChangeEngine::new(
            store.clone(),
            oracle.clone(),
            clock.clone(),
            dispatcher.clone(),
        ));
        let exceptions = Arc::new(ExceptionEngine::new(
            store.clone(),
            oracle,
            clock.clone(),
            dispatcher,
            changes.clone(),
        ));

        Controller {
            store,
            directory,
            clock,
            distributor,
            rules,
            changes,
            exceptions,
        }
    }
}

/// All controller-side state machines over one store
#[derive(Clone)]
pub struct Controller {
    store: Arc<dyn ControllerStore>,
    directory: Arc<dyn Directory>,
    clock: Arc<dyn Clock>,
    distributor: Arc<Distributor>,
    rules: Arc<RuleEngine>,
    changes: Arc<ChangeEngine>,
    exceptions: Arc<ExceptionEngine>,
}

impl Controller {
    pub fn builder() -> ControllerBuilder {
        ControllerBuilder::default()
    }

    pub fn rules(&self) -> &RuleEngine {
        &self.rules
    }

    pub fn changes(&self) -> &ChangeEngine {
        &self.changes
    }

    pub fn exceptions(&self) -> &ExceptionEngine {
        &self.exceptions
    }

    pub fn distribution(&self) -> &Distributor {
        &self.distributor
    }

    pub fn directory(&self) -> &dyn Directory {
        self.directory.as_ref()
    }

    pub fn store(&self) -> &dyn ControllerStore {
        self.store.as_ref()
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Create or refresh the registry record of an authenticated agent
    pub fn register_agent(
        &self,
        agent_id: &str,
        user_id: &str,
        hostname: Option<String>,
    ) -> Result<AgentRecord> {
        let now = self.clock.now();
        let mut record = AgentRecord::new(agent_id, user_id, now);
        record.team_id = self.directory.user_teams(user_id).into_iter().next();
        record.hostname = hostname;
        self.store.upsert_agent(&record)?;
        self.store
            .get_agent(agent_id)
            .map(|stored| stored.unwrap_or(record))
    }

    /// Refresh an agent's last-seen time
    pub fn touch_agent(&self, agent_id: &str, hostname: Option<String>) -> Result<()> {
        if let Some(mut agent) = self.store.get_agent(agent_id)? {
            agent.last_seen_at = self.clock.now();
            if hostname.is_some() {
                agent.hostname = hostname;
            }
            self.store.upsert_agent(&agent)?;
        }
        Ok(())
    }

    pub fn agents(&self) -> Result<Vec<AgentRecord>> {
        self.store.list_agents()
    }

    pub fn audit_trail(&self, entity_id: &str) -> Result<Vec<AuditEvent>> {
        self.store.audit_trail(entity_id)
    }
}
