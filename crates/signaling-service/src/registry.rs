//! Identity registry: display name and connection id to live session.
//!
//! Both indexes live behind one lock so that registration is a single atomic
//! check-and-insert and every registered session is present in both maps.

use crate::actors::ConnectionHandle;
use crate::errors::RegisterError;
use crate::observability::metrics;
use crate::session::{ConnectionId, Session, SessionRef};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Debug, Default)]
struct RegistryMaps {
    by_name: HashMap<String, SessionRef>,
    by_connection: HashMap<ConnectionId, SessionRef>,
}

/// Process-wide registry of live sessions.
#[derive(Debug, Default)]
pub struct IdentityRegistry {
    maps: RwLock<RegistryMaps>,
    next_seq: AtomicU64,
}

impl IdentityRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name` for the connection behind `connection`.
    ///
    /// An empty `room` is treated as no room.
    ///
    /// # Errors
    ///
    /// - `EmptyName` if the name is blank
    /// - `NameTaken` if another live session holds the name
    /// - `AlreadyRegistered` if the connection already owns a session
    pub async fn register(
        &self,
        name: &str,
        room: Option<&str>,
        connection: ConnectionHandle,
    ) -> Result<SessionRef, RegisterError> {
        if name.trim().is_empty() {
            return Err(RegisterError::EmptyName);
        }

        let connection_id = connection.connection_id().to_string();
        let room = room.filter(|r| !r.trim().is_empty()).map(str::to_string);

        let mut maps = self.maps.write().await;
        if maps.by_connection.contains_key(&connection_id) {
            return Err(RegisterError::AlreadyRegistered);
        }
        if maps.by_name.contains_key(name) {
            return Err(RegisterError::NameTaken(name.to_string()));
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(Session::new(name.to_string(), room, seq, connection));
        maps.by_name.insert(name.to_string(), Arc::clone(&session));
        maps.by_connection
            .insert(connection_id.clone(), Arc::clone(&session));
        metrics::set_sessions_registered(maps.by_name.len());

        info!(
            target: "signaling.registry",
            name = %name,
            connection_id = %connection_id,
            room = ?session.room(),
            "Session registered"
        );

        Ok(session)
    }

    pub async fn lookup_by_name(&self, name: &str) -> Option<SessionRef> {
        self.maps.read().await.by_name.get(name).cloned()
    }

    pub async fn lookup_by_connection(&self, connection_id: &str) -> Option<SessionRef> {
        self.maps
            .read()
            .await
            .by_connection
            .get(connection_id)
            .cloned()
    }

    /// Remove the session owned by `connection_id`. Idempotent.
    pub async fn unregister(&self, connection_id: &str) -> Option<SessionRef> {
        let mut maps = self.maps.write().await;
        let session = maps.by_connection.remove(connection_id)?;

        // Only drop the name entry if it still points at this session.
        if maps
            .by_name
            .get(session.name())
            .is_some_and(|s| Arc::ptr_eq(s, &session))
        {
            maps.by_name.remove(session.name());
        }
        metrics::set_sessions_registered(maps.by_name.len());

        debug!(
            target: "signaling.registry",
            name = %session.name(),
            connection_id = %connection_id,
            "Session unregistered"
        );

        Some(session)
    }

    /// Snapshot of the sessions in `room`, earliest registered first.
    ///
    /// Room names compare case-insensitively.
    pub async fn sessions_in_room(&self, room: &str) -> Vec<SessionRef> {
        let wanted = room.to_lowercase();
        let mut sessions: Vec<SessionRef> = self
            .maps
            .read()
            .await
            .by_name
            .values()
            .filter(|s| s.room().is_some_and(|r| r.to_lowercase() == wanted))
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.seq());
        sessions
    }

    pub async fn len(&self) -> usize {
        self.maps.read().await.by_name.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
