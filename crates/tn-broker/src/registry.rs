//! Session registry
//!
//! The only broker-wide mutable state: identity -> current session. Every
//! mutation goes through `register`, `remove` or `close_all`.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use tn_core::{ClientIdentity, TunnelError};

use crate::session::{DrainReason, Session};

/// Maps each identity to its single live session
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<ClientIdentity, Arc<Session>>,
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Activate `session` and install it as the one for its identity.
    ///
    /// A previous session for the identity is drained with
    /// [`DrainReason::Replaced`] before the shard lock is released, so it is
    /// unroutable by the time the new one becomes visible. Returns the
    /// replaced session, if any.
    pub fn register(&self, session: Arc<Session>) -> Result<Option<Arc<Session>>, TunnelError> {
        session.activate()?;

        let previous = match self.sessions.entry(session.identity().clone()) {
            Entry::Occupied(mut entry) => {
                let previous = entry.insert(Arc::clone(&session));
                if !Arc::ptr_eq(&previous, &session) {
                    previous.drain(DrainReason::Replaced);
                }
                Some(previous)
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&session));
                None
            }
        };

        match &previous {
            Some(old) => tracing::info!(
                "{} replaced {} for {}",
                session.id(),
                old.id(),
                session.identity()
            ),
            None => tracing::debug!("{} registered for {}", session.id(), session.identity()),
        }
        Ok(previous)
    }

    /// The active session for `identity`.
    ///
    /// A session whose connection already failed is skipped even before its
    /// handler gets around to draining it.
    pub fn lookup(&self, identity: &ClientIdentity) -> Result<Arc<Session>, TunnelError> {
        self.sessions
            .get(identity)
            .map(|entry| Arc::clone(entry.value()))
            .filter(|session| session.is_active() && !session.mux().is_closed())
            .ok_or_else(|| TunnelError::NoActiveTunnel(identity.clone()))
    }

    /// The registered session for `identity` in any state
    pub fn get(&self, identity: &ClientIdentity) -> Option<Arc<Session>> {
        self.sessions.get(identity).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, identity: &ClientIdentity) -> bool {
        self.sessions.contains_key(identity)
    }

    /// Remove `session` only if it is still the registered one.
    ///
    /// Returns whether anything was removed.
    pub fn remove(&self, identity: &ClientIdentity, session: &Arc<Session>) -> bool {
        self.sessions
            .remove_if(identity, |_, current| Arc::ptr_eq(current, session))
            .is_some()
    }

    /// All registered sessions
    pub fn list(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Number of registered sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drain every session. Their handlers remove them as they finish.
    pub fn close_all(&self, reason: DrainReason) -> usize {
        let sessions = self.list();
        let mut drained = 0;
        for session in &sessions {
            if session.drain(reason) {
                drained += 1;
            }
        }
        tracing::info!("Drained {} of {} sessions ({})", drained, sessions.len(), reason);
        drained
    }
}
