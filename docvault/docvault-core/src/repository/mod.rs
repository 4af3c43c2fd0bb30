//! Ticket-first public API.
//!
//! Every call resolves its ticket first; an unknown or evicted ticket is
//! [`VaultError::SessionExpired`]. Mutating calls flush the engine at the end
//! when the session was opened with autocommit.

mod admin;
mod documents;
mod nodes;

use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::access::AccessResolver;
use crate::category::CategoryStore;
use crate::config::VaultConfig;
use crate::engine::{ContentEngine, EngineSession, QueryFilter};
use crate::error::{Result, VaultError};
use crate::events::{Event, EventBus};
use crate::lock::LockCoordinator;
use crate::model::{Node, NodeId};
use crate::principal::{PrincipalStore, GROUP_ADMINS, GROUP_USERS};
use crate::session::{Credentials, Session, SessionRegistry, Ticket};
use crate::tree::TreeMutator;
use crate::version::VersionTrigger;

/// One search result the caller may read.
#[derive(Clone, Debug, Serialize)]
pub struct SearchHit {
    pub node: Node,
    pub score: f32,
    pub excerpt: String,
}

/// Listing entry for an open session.
#[derive(Clone, Debug, Serialize)]
pub struct SessionInfo {
    pub user: String,
    pub repository: String,
    pub autocommit: bool,
    pub created: chrono::DateTime<chrono::Utc>,
    pub idle_secs: u64,
}

pub struct Repository {
    config: VaultConfig,
    engine: Arc<dyn ContentEngine>,
    locks: Arc<LockCoordinator>,
    principals: Arc<PrincipalStore>,
    categories: Arc<CategoryStore>,
    access: Arc<AccessResolver>,
    registry: Arc<SessionRegistry>,
    tree: TreeMutator,
    versions: VersionTrigger,
    events: EventBus,
    system: EngineSession,
}

impl Repository {
    /// Set up principals and the root directory on top of `engine`.
    pub fn open(config: VaultConfig, engine: Arc<dyn ContentEngine>) -> Result<Self> {
        config
            .validate()
            .map_err(|e| VaultError::invalid(e.to_string()))?;

        let principals = Arc::new(PrincipalStore::new(
            config.password_memory_kib,
            config.password_iterations,
        )?);
        if principals.get_user(&config.admin_user).is_none() {
            principals.create_user(&config.admin_user, &config.admin_password, true)?;
            principals.add_member(GROUP_ADMINS, &config.admin_user)?;
        }

        let events = EventBus::new();
        let locks = Arc::new(LockCoordinator::new());
        let categories = Arc::new(CategoryStore::new());
        let access = Arc::new(AccessResolver::new(principals.clone()));
        let registry = Arc::new(SessionRegistry::new(
            engine.clone(),
            principals.clone(),
            events.clone(),
            config.repository_name.clone(),
            config.system_user.clone(),
            config.session_idle_timeout(),
        ));
        let tree = TreeMutator::new(
            engine.clone(),
            locks.clone(),
            access.clone(),
            principals.clone(),
            categories.clone(),
            events.clone(),
            &config,
        );
        let versions = VersionTrigger::new(engine.clone());

        let system = engine.open_session(&config.system_user)?;
        let root = tree.ensure_root(
            &system,
            BTreeSet::from([GROUP_USERS.to_string(), GROUP_ADMINS.to_string()]),
        )?;
        tracing::info!(
            repository = %config.repository_name,
            root = %root.id(),
            delete_policy = ?config.delete_policy,
            "repository opened"
        );

        Ok(Self {
            config,
            engine,
            locks,
            principals,
            categories,
            access,
            registry,
            tree,
            versions,
            events,
            system,
        })
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn session_registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Start idle-session eviction on the current tokio runtime.
    pub fn start_eviction(&self) {
        self.registry.start(self.config.eviction_period());
    }

    /// Stop eviction, close every session and flush.
    pub fn shutdown(&self) -> Result<()> {
        self.registry.shutdown();
        self.engine.flush(&self.system)?;
        if let Err(e) = self.engine.close_session(&self.system) {
            tracing::warn!("failed to close system session: {}", e);
        }
        Ok(())
    }

    pub(crate) fn session(&self, ticket: &Ticket) -> Result<Session> {
        self.registry.resolve(ticket).ok_or(VaultError::SessionExpired)
    }

    /// Flush when the session asked for it.
    pub(crate) fn commit(&self, session: &Session) -> Result<()> {
        if session.autocommit {
            self.engine.flush(&session.user_session)?;
        }
        Ok(())
    }

    pub(crate) fn require_admin(&self, session: &Session) -> Result<()> {
        self.tree.require_admin(&session.user_session)
    }

    pub fn login(&self, credentials: &Credentials, target: &str, autocommit: bool) -> Result<Ticket> {
        self.registry.login(credentials, target, autocommit)
    }

    /// End the session. Unknown tickets are ignored.
    pub fn logout(&self, ticket: &Ticket) {
        self.registry.logout(ticket);
    }

    pub fn flush(&self, ticket: &Ticket) -> Result<()> {
        let session = self.session(ticket)?;
        self.engine.flush(&session.user_session)?;
        Ok(())
    }

    /// Open sessions. Administrators only.
    pub fn sessions(&self, ticket: &Ticket) -> Result<Vec<SessionInfo>> {
        let session = self.session(ticket)?;
        self.require_admin(&session)?;
        Ok(self
            .registry
            .sessions()
            .into_iter()
            .map(|s| SessionInfo {
                idle_secs: s.last_used.elapsed().as_secs(),
                user: s.user,
                repository: s.repository,
                autocommit: s.autocommit,
                created: s.created,
            })
            .collect())
    }

    pub fn can_read(&self, ticket: &Ticket, id: NodeId) -> Result<bool> {
        let session = self.session(ticket)?;
        let node = self.tree.load(&session.user_session, id)?;
        Ok(self.access.can_read(&node, &session.user))
    }

    pub fn can_write(&self, ticket: &Ticket, id: NodeId) -> Result<bool> {
        let session = self.session(ticket)?;
        let node = self.tree.load(&session.user_session, id)?;
        Ok(self.access.can_write(&node, &session.user))
    }

    /// Whether the caller administers this repository.
    pub fn can_admin(&self, ticket: &Ticket) -> Result<bool> {
        let session = self.session(ticket)?;
        let root = self.tree.root(&session.user_session)?;
        Ok(self.access.can_admin(&root, &session.user))
    }

    pub fn grant_restriction(
        &self,
        ticket: &Ticket,
        id: NodeId,
        principal: &str,
        recursive: bool,
    ) -> Result<usize> {
        let session = self.session(ticket)?;
        let changed = self
            .tree
            .grant(&session.user_session, id, principal, recursive)?;
        self.commit(&session)?;
        Ok(changed)
    }

    pub fn revoke_restriction(
        &self,
        ticket: &Ticket,
        id: NodeId,
        principal: &str,
        recursive: bool,
    ) -> Result<usize> {
        let session = self.session(ticket)?;
        let changed = self
            .tree
            .revoke(&session.user_session, id, principal, recursive)?;
        self.commit(&session)?;
        Ok(changed)
    }

    /// Query the subtree at logical path `scope`. Only active nodes the
    /// caller can read are returned; administrators may ask for deleted ones.
    pub fn search(&self, ticket: &Ticket, scope: &str, filter: &QueryFilter) -> Result<Vec<SearchHit>> {
        let session = self.session(ticket)?;
        let mut filter = filter.clone();
        if filter.include_inactive {
            filter.include_inactive = self
                .tree
                .root(&session.user_session)
                .map(|root| self.access.can_admin(&root, &session.user))
                .unwrap_or(false);
        }
        let limit = filter.limit.take();
        let rows = self.engine.query(&session.user_session, scope, &filter)?;

        let mut hits = Vec::new();
        for row in rows {
            let Some(node) = self.engine.get_node(&session.user_session, row.id)? else {
                continue;
            };
            if (!node.is_active() && !filter.include_inactive)
                || !self.access.can_read(&node, &session.user)
            {
                continue;
            }
            hits.push(SearchHit {
                node,
                score: row.score,
                excerpt: row.excerpt,
            });
            if limit.map_or(false, |l| hits.len() >= l) {
                break;
            }
        }
        tracing::debug!(user = %session.user, scope, hits = hits.len(), "search");
        Ok(hits)
    }

    fn notify(&self, event: Event) {
        self.events.send(event);
    }
}
