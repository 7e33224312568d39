//! Connection registry: which live connections belong to which user.

use crate::connection::{teardown, CloseReason, Connection};
use carelink_types::UserIdentity;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

/// What happens when a user who is already connected opens another socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPolicy {
    /// Every device keeps its own connection.
    #[default]
    MultiSession,
    /// The newest connection wins; older ones are torn down.
    ReplaceExisting,
}

impl std::str::FromStr for SessionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "multi_session" => Ok(Self::MultiSession),
            "replace_existing" => Ok(Self::ReplaceExisting),
            other => Err(format!("unknown session policy: {}", other)),
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    /// Never holds an empty vector; the entry is removed with its last connection.
    sessions: DashMap<UserIdentity, Vec<Arc<Connection>>>,
    policy: SessionPolicy,
}

/// Maps each online identity to its live connections.
///
/// Cheap to clone; all clones share the same map. Mutations for one
/// identity are serialized under that identity's shard lock and never
/// await, so registering or removing a connection cannot stall on socket
/// I/O.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new(policy: SessionPolicy) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: DashMap::new(),
                policy,
            }),
        }
    }

    pub fn policy(&self) -> SessionPolicy {
        self.inner.policy
    }

    /// Adds a connection under its identity.
    ///
    /// Registering the same connection twice is a no-op. Returns the
    /// connections displaced by [`SessionPolicy::ReplaceExisting`]; the
    /// caller is responsible for tearing them down.
    pub fn register(&self, conn: Arc<Connection>) -> Vec<Arc<Connection>> {
        let mut entry = self
            .inner
            .sessions
            .entry(conn.identity().clone())
            .or_default();

        if entry.iter().any(|existing| existing.id() == conn.id()) {
            return Vec::new();
        }

        let displaced = match self.inner.policy {
            SessionPolicy::MultiSession => Vec::new(),
            SessionPolicy::ReplaceExisting => std::mem::take(&mut *entry),
        };
        entry.push(conn);
        displaced
    }

    /// Removes one connection. Returns `false` if it was not registered.
    pub fn unregister(&self, identity: &UserIdentity, connection_id: Uuid) -> bool {
        match self.inner.sessions.entry(identity.clone()) {
            Entry::Occupied(mut entry) => {
                let before = entry.get().len();
                entry.get_mut().retain(|c| c.id() != connection_id);
                let removed = entry.get().len() != before;
                if entry.get().is_empty() {
                    entry.remove();
                }
                removed
            }
            Entry::Vacant(_) => false,
        }
    }

    /// Snapshot of the identity's connections. Any of them may close
    /// right after this returns.
    pub fn connections_for(&self, identity: &UserIdentity) -> Vec<Arc<Connection>> {
        self.inner
            .sessions
            .get(identity)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    pub fn is_online(&self, identity: &UserIdentity) -> bool {
        !self.connections_for(identity).is_empty()
    }

    pub fn online_identities(&self) -> Vec<UserIdentity> {
        let mut identities: Vec<UserIdentity> = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        identities.sort();
        identities
    }

    pub fn identity_count(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.sessions.iter().map(|entry| entry.value().len()).sum()
    }

    /// Tears down every live connection. Used on server shutdown.
    pub fn close_all(&self) -> usize {
        let all: Vec<Arc<Connection>> = self
            .inner
            .sessions
            .iter()
            .flat_map(|entry| entry.value().clone())
            .collect();

        all.iter()
            .filter(|conn| teardown(self, conn, CloseReason::Shutdown))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(identity: &str) -> Arc<Connection> {
        Connection::new(UserIdentity::from(identity), 4).0
    }

    #[test]
    fn unknown_identity_is_offline() {
        let registry = ConnectionRegistry::default();
        let who = UserIdentity::from("pat-9");
        assert!(!registry.is_online(&who));
        assert!(registry.connections_for(&who).is_empty());
    }

    #[test]
    fn register_then_unregister_leaves_no_entry() {
        let registry = ConnectionRegistry::default();
        let c = conn("doc-42");

        assert!(registry.register(c.clone()).is_empty());
        assert!(registry.is_online(c.identity()));
        assert_eq!(registry.identity_count(), 1);

        assert!(registry.unregister(c.identity(), c.id()));
        assert!(!registry.is_online(c.identity()));
        assert_eq!(registry.identity_count(), 0);
        assert_eq!(registry.connection_count(), 0);

        // Repeating is harmless.
        assert!(!registry.unregister(c.identity(), c.id()));
    }

    #[test]
    fn register_is_idempotent_per_connection() {
        let registry = ConnectionRegistry::default();
        let c = conn("doc-42");
        registry.register(c.clone());
        registry.register(c.clone());
        assert_eq!(registry.connections_for(c.identity()).len(), 1);
    }

    #[test]
    fn multi_session_keeps_every_device() {
        let registry = ConnectionRegistry::new(SessionPolicy::MultiSession);
        let phone = conn("doc-42");
        let laptop = conn("doc-42");

        assert!(registry.register(phone.clone()).is_empty());
        assert!(registry.register(laptop.clone()).is_empty());
        assert_eq!(registry.connections_for(phone.identity()).len(), 2);

        registry.unregister(phone.identity(), phone.id());
        let left = registry.connections_for(phone.identity());
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id(), laptop.id());
    }

    #[test]
    fn replace_existing_returns_displaced_connections() {
        let registry = ConnectionRegistry::new(SessionPolicy::ReplaceExisting);
        let old = conn("pat-7");
        let new = conn("pat-7");

        assert!(registry.register(old.clone()).is_empty());
        let displaced = registry.register(new.clone());
        assert_eq!(displaced.len(), 1);
        assert_eq!(displaced[0].id(), old.id());

        let current = registry.connections_for(new.identity());
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].id(), new.id());

        // A late unregister of the displaced connection must not evict the new one.
        assert!(!registry.unregister(old.identity(), old.id()));
        assert!(registry.is_online(new.identity()));
    }

    #[test]
    fn close_all_empties_the_registry() {
        let registry = ConnectionRegistry::default();
        let a = conn("doc-42");
        let b = conn("pat-7");
        registry.register(a.clone());
        registry.register(b.clone());

        assert_eq!(registry.close_all(), 2);
        assert_eq!(registry.identity_count(), 0);
        assert!(a.is_closed());
        assert!(b.is_closed());
    }

    #[test]
    fn online_identities_are_sorted() {
        let registry = ConnectionRegistry::default();
        registry.register(conn("pat-7"));
        registry.register(conn("doc-42"));
        assert_eq!(
            registry.online_identities(),
            vec![UserIdentity::from("doc-42"), UserIdentity::from("pat-7")]
        );
    }

    #[test]
    fn session_policy_parses_config_names() {
        assert_eq!(
            "replace_existing".parse::<SessionPolicy>(),
            Ok(SessionPolicy::ReplaceExisting)
        );
        assert_eq!(
            "multi_session".parse::<SessionPolicy>(),
            Ok(SessionPolicy::MultiSession)
        );
        assert!("single".parse::<SessionPolicy>().is_err());
    }
}
