//! Ticket to engine session mapping with idle eviction.
//!
//! Login, logout and the eviction sweep all go through the one table lock,
//! so a sweep in progress delays new logins until it is done.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::RngCore;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use crate::engine::{ContentEngine, EngineSession};
use crate::error::{Result, VaultError};
use crate::events::{Event, EventBus};

const TICKET_BYTES: usize = 32;

/// Opaque session handle presented on every call.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Ticket(String);

impl Ticket {
    fn generate() -> Self {
        let mut bytes = [0u8; TICKET_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        Ticket(URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Ticket {
    fn from(value: String) -> Self {
        Ticket(value)
    }
}

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

/// Checks credentials and returns the authenticated user id.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, credentials: &Credentials) -> Result<String>;
}

#[derive(Clone, Debug)]
pub struct Session {
    pub ticket: Ticket,
    pub user: String,
    pub repository: String,
    /// Flush after every mutating call.
    pub autocommit: bool,
    /// Engine session acting as the user.
    pub user_session: EngineSession,
    /// Privileged engine session for housekeeping done on the user's behalf.
    pub system_session: EngineSession,
    pub created: DateTime<Utc>,
    pub last_used: Instant,
}

pub struct SessionRegistry {
    engine: Arc<dyn ContentEngine>,
    authenticator: Arc<dyn Authenticator>,
    events: EventBus,
    repository: String,
    system_user: String,
    idle_timeout: Duration,
    table: Mutex<HashMap<Ticket, Session>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl SessionRegistry {
    pub fn new(
        engine: Arc<dyn ContentEngine>,
        authenticator: Arc<dyn Authenticator>,
        events: EventBus,
        repository: impl Into<String>,
        system_user: impl Into<String>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            engine,
            authenticator,
            events,
            repository: repository.into(),
            system_user: system_user.into(),
            idle_timeout,
            table: Mutex::new(HashMap::new()),
            sweeper: Mutex::new(None),
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn login(&self, credentials: &Credentials, target: &str, autocommit: bool) -> Result<Ticket> {
        if target != self.repository {
            return Err(VaultError::not_found("repository", target));
        }
        let user = self.authenticator.authenticate(credentials)?;
        let user_session = self.engine.open_session(&user)?;
        let system_session = match self.engine.open_session(&self.system_user) {
            Ok(s) => s,
            Err(e) => {
                if let Err(close) = self.engine.close_session(&user_session) {
                    tracing::warn!("failed to close engine session after login error: {}", close);
                }
                return Err(e.into());
            }
        };

        let now = Utc::now();
        let mut table = self.table.lock();
        let ticket = loop {
            let candidate = Ticket::generate();
            if !table.contains_key(&candidate) {
                break candidate;
            }
        };
        table.insert(
            ticket.clone(),
            Session {
                ticket: ticket.clone(),
                user: user.clone(),
                repository: self.repository.clone(),
                autocommit,
                user_session,
                system_session,
                created: now,
                last_used: Instant::now(),
            },
        );
        drop(table);

        tracing::info!(user = %user, repository = %self.repository, "session opened");
        self.events.send(Event::SessionOpened { user });
        Ok(ticket)
    }

    /// Look up a ticket and mark it used. `None` means log in again.
    pub fn resolve(&self, ticket: &Ticket) -> Option<Session> {
        let mut table = self.table.lock();
        let session = table.get_mut(ticket)?;
        session.last_used = Instant::now();
        Some(session.clone())
    }

    /// End a session. Unknown tickets are ignored.
    pub fn logout(&self, ticket: &Ticket) {
        let removed = self.table.lock().remove(ticket);
        if let Some(session) = removed {
            self.close(&session);
            tracing::info!(user = %session.user, "session closed");
            self.events.send(Event::SessionClosed { user: session.user });
        }
    }

    fn close(&self, session: &Session) {
        for engine_session in [&session.user_session, &session.system_session] {
            if let Err(e) = self.engine.close_session(engine_session) {
                tracing::warn!(user = %session.user, "failed to close engine session: {}", e);
            }
        }
    }

    /// Evict every session idle for longer than the timeout as of `now`.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let evicted: Vec<Session> = {
            let mut table = self.table.lock();
            let expired: Vec<Ticket> = table
                .iter()
                .filter(|(_, s)| {
                    now.checked_duration_since(s.last_used)
                        .map_or(false, |idle| idle > self.idle_timeout)
                })
                .map(|(t, _)| t.clone())
                .collect();
            let evicted: Vec<Session> = expired.iter().filter_map(|t| table.remove(t)).collect();
            for session in &evicted {
                self.close(session);
            }
            evicted
        };

        for session in &evicted {
            tracing::info!(user = %session.user, "evicted idle session");
            self.events.send(Event::SessionEvicted {
                user: session.user.clone(),
            });
        }
        evicted.len()
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sessions(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.table.lock().values().cloned().collect();
        sessions.sort_by_key(|s| s.created);
        sessions
    }

    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every session held by `user`.
    pub fn revoke_user(&self, user: &str) -> usize {
        let revoked: Vec<Session> = {
            let mut table = self.table.lock();
            let tickets: Vec<Ticket> = table
                .iter()
                .filter(|(_, s)| s.user == user)
                .map(|(t, _)| t.clone())
                .collect();
            tickets.iter().filter_map(|t| table.remove(t)).collect()
        };
        for session in &revoked {
            self.close(session);
            self.events.send(Event::SessionClosed {
                user: session.user.clone(),
            });
        }
        revoked.len()
    }

    /// Start the periodic eviction task. Calling it again replaces the
    /// previous task.
    pub fn start(self: &Arc<Self>, period: Duration) {
        let registry: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                let evicted = registry.sweep();
                if evicted > 0 {
                    tracing::debug!(evicted, "eviction sweep finished");
                }
            }
        });
        if let Some(previous) = self.sweeper.lock().replace(handle) {
            previous.abort();
        }
        tracing::info!(?period, idle_timeout = ?self.idle_timeout, "session eviction started");
    }

    pub fn is_running(&self) -> bool {
        self.sweeper
            .lock()
            .as_ref()
            .map_or(false, |h| !h.is_finished())
    }

    /// Stop the eviction task and close every session.
    pub fn shutdown(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
        let sessions: Vec<Session> = self.table.lock().drain().map(|(_, s)| s).collect();
        for session in &sessions {
            self.close(session);
        }
        tracing::info!(closed = sessions.len(), "session registry shut down");
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryEngine;

    struct FixedPasswords;

    impl Authenticator for FixedPasswords {
        fn authenticate(&self, credentials: &Credentials) -> Result<String> {
            match (credentials.user.as_str(), credentials.password.as_str()) {
                ("alice", "pw") | ("bob", "pw") => Ok(credentials.user.clone()),
                _ => Err(VaultError::denied("invalid credentials")),
            }
        }
    }

    fn registry(idle: Duration) -> (Arc<MemoryEngine>, Arc<SessionRegistry>, EventBus) {
        let engine = Arc::new(MemoryEngine::new());
        let events = EventBus::new();
        let registry = Arc::new(SessionRegistry::new(
            engine.clone(),
            Arc::new(FixedPasswords),
            events.clone(),
            "default",
            "system",
            idle,
        ));
        (engine, registry, events)
    }

    #[test]
    fn login_opens_two_engine_sessions() {
        let (engine, registry, _) = registry(Duration::from_secs(60));
        let ticket = registry
            .login(&Credentials::new("alice", "pw"), "default", true)
            .unwrap();
        assert_eq!(engine.open_sessions(), 2);
        let session = registry.resolve(&ticket).unwrap();
        assert_eq!(session.user, "alice");
        assert_eq!(session.user_session.user, "alice");
        assert_eq!(session.system_session.user, "system");
        assert!(session.autocommit);

        registry.logout(&ticket);
        assert_eq!(engine.open_sessions(), 0);
        assert!(registry.resolve(&ticket).is_none());
    }

    #[test]
    fn login_rejects_bad_target_and_credentials() {
        let (engine, registry, _) = registry(Duration::from_secs(60));
        assert!(matches!(
            registry.login(&Credentials::new("alice", "pw"), "other", false),
            Err(VaultError::NotFound { .. })
        ));
        assert!(matches!(
            registry.login(&Credentials::new("alice", "nope"), "default", false),
            Err(VaultError::PermissionDenied(_))
        ));
        assert_eq!(engine.open_sessions(), 0);
    }

    #[test]
    fn tickets_are_distinct() {
        let (_, registry, _) = registry(Duration::from_secs(60));
        let creds = Credentials::new("alice", "pw");
        let a = registry.login(&creds, "default", false).unwrap();
        let b = registry.login(&creds, "default", false).unwrap();
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.revoke_user("alice"), 2);
        assert!(registry.is_empty());
    }

    #[test]
    fn sweep_evicts_only_idle_sessions() {
        let (engine, registry, events) = registry(Duration::from_secs(30));
        let mut rx = events.subscribe();
        let ticket = registry
            .login(&Credentials::new("bob", "pw"), "default", false)
            .unwrap();

        assert_eq!(registry.sweep_at(Instant::now() + Duration::from_secs(10)), 0);
        assert!(registry.resolve(&ticket).is_some());

        assert_eq!(registry.sweep_at(Instant::now() + Duration::from_secs(31)), 1);
        assert!(registry.resolve(&ticket).is_none());
        assert_eq!(engine.open_sessions(), 0);

        // logout after eviction is a no-op
        registry.logout(&ticket);

        assert_eq!(rx.try_recv().unwrap(), Event::SessionOpened { user: "bob".into() });
        assert_eq!(rx.try_recv().unwrap(), Event::SessionEvicted { user: "bob".into() });
    }

    #[tokio::test]
    async fn background_task_evicts_and_stops() {
        let (_, registry, _) = registry(Duration::from_millis(20));
        let ticket = registry
            .login(&Credentials::new("alice", "pw"), "default", false)
            .unwrap();
        registry.start(Duration::from_millis(10));
        assert!(registry.is_running());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(registry.resolve(&ticket).is_none());

        registry.shutdown();
        assert!(!registry.is_running());
    }

    #[test]
    fn shutdown_closes_everything() {
        let (engine, registry, _) = registry(Duration::from_secs(60));
        registry
            .login(&Credentials::new("alice", "pw"), "default", false)
            .unwrap();
        registry
            .login(&Credentials::new("bob", "pw"), "default", false)
            .unwrap();
        registry.shutdown();
        assert!(registry.sessions().is_empty());
        assert_eq!(engine.open_sessions(), 0);
    }
}
