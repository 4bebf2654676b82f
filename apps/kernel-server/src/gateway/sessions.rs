// [[AXON]]/apps/kernel-server/src/gateway/sessions.rs
// Purpose: Live-session table with per-tenant caps and TTL sweeping.
// Architecture: Gateway Layer
// Dependencies: dashmap, tokio

use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::KernelError;
use crate::models::Session;
use crate::protocol::Frame;

/// What the writer pump consumes.
#[derive(Debug)]
pub enum OutFrame {
    Frame(Frame),
    Close { code: u16, reason: String },
}

pub struct SessionEntry {
    pub session: Mutex<Session>,
    /// Bounded: a slow client applies backpressure to whoever notifies it.
    pub sender: mpsc::Sender<OutFrame>,
    /// Cancelling this cancels every in-flight handler of the session.
    pub cancel: CancellationToken,
    pub subscriptions: Mutex<HashSet<String>>,
}

impl SessionEntry {
    pub fn tenant_id(&self) -> Uuid {
        self.session.lock().unwrap_or_else(|e| e.into_inner()).tenant_id
    }

    pub fn touch(&self) {
        let mut session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        session.last_activity = Utc::now();
    }

    pub fn subscribed_to(&self, topic: &str) -> bool {
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(topic)
    }

    pub fn set_subscriptions(&self, topics: HashSet<String>) {
        *self
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = topics;
    }
}

/// Concurrent map of live connections keyed by session id, plus per-tenant
/// counters enforcing the session cap.
pub struct SessionTable {
    sessions: DashMap<Uuid, std::sync::Arc<SessionEntry>>,
    per_tenant: DashMap<Uuid, usize>,
    max_connections: usize,
    max_per_tenant: usize,
}

impl SessionTable {
    pub fn new(max_connections: usize, max_per_tenant: usize) -> Self {
        SessionTable {
            sessions: DashMap::new(),
            per_tenant: DashMap::new(),
            max_connections,
            max_per_tenant,
        }
    }

    /// Register a new live session. The global and per-tenant caps are
    /// checked under the tenant counter entry so two racing handshakes
    /// cannot both slip past the limit.
    pub fn try_register(
        &self,
        session: Session,
        sender: mpsc::Sender<OutFrame>,
        cancel: CancellationToken,
    ) -> Result<std::sync::Arc<SessionEntry>, KernelError> {
        if self.sessions.len() >= self.max_connections {
            return Err(KernelError::Busy("gateway at max_connections".into()));
        }
        let tenant_id = session.tenant_id;
        {
            let mut count = self.per_tenant.entry(tenant_id).or_insert(0);
            if *count >= self.max_per_tenant {
                return Err(KernelError::Busy(format!(
                    "tenant at max sessions ({})",
                    self.max_per_tenant
                )));
            }
            *count += 1;
        }
        let entry = std::sync::Arc::new(SessionEntry {
            subscriptions: Mutex::new(session.subscriptions.clone()),
            session: Mutex::new(session.clone()),
            sender,
            cancel,
        });
        self.sessions.insert(session.id, entry.clone());
        crate::observability::record_connections(self.sessions.len());
        Ok(entry)
    }

    pub fn remove(&self, session_id: Uuid) -> Option<std::sync::Arc<SessionEntry>> {
        let (_, entry) = self.sessions.remove(&session_id)?;
        let tenant_id = entry.tenant_id();
        if let Some(mut count) = self.per_tenant.get_mut(&tenant_id) {
            *count = count.saturating_sub(1);
        }
        entry.cancel.cancel();
        crate::observability::record_connections(self.sessions.len());
        Some(entry)
    }

    pub fn get(&self, session_id: Uuid) -> Option<std::sync::Arc<SessionEntry>> {
        self.sessions.get(&session_id).map(|e| e.value().clone())
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn count_for_tenant(&self, tenant_id: Uuid) -> usize {
        self.per_tenant.get(&tenant_id).map(|c| *c).unwrap_or(0)
    }

    /// All live entries; used by the drain broadcast.
    pub fn entries(&self) -> Vec<std::sync::Arc<SessionEntry>> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    /// Drop sessions whose TTL lapsed; the reaper task calls this on an
    /// interval. Returns the ids that were removed.
    pub fn sweep_expired(&self) -> Vec<Uuid> {
        let now = Utc::now();
        let expired: Vec<Uuid> = self
            .sessions
            .iter()
            .filter(|e| {
                e.value()
                    .session
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .expired_at(now)
            })
            .map(|e| *e.key())
            .collect();
        for id in &expired {
            self.remove(*id);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SessionMode;

    fn session(tenant: Uuid) -> Session {
        Session {
            id: Uuid::new_v4(),
            agent_id: "a1".to_string(),
            tenant_id: tenant,
            mode: SessionMode::Agent,
            created_at: Utc::now(),
            last_activity: Utc::now(),
            ttl_secs: 3600,
            refresh_token_hash: None,
            subscriptions: HashSet::new(),
        }
    }

    fn register(table: &SessionTable, tenant: Uuid) -> Result<Uuid, KernelError> {
        let (tx, _rx) = mpsc::channel(4);
        let s = session(tenant);
        let id = s.id;
        table
            .try_register(s, tx, CancellationToken::new())
            .map(|_| id)
    }

    #[test]
    fn per_tenant_cap_is_exact() {
        let table = SessionTable::new(100, 3);
        let tenant = Uuid::new_v4();
        for _ in 0..3 {
            assert!(register(&table, tenant).is_ok());
        }
        // The (N+1)th session for the tenant is refused.
        assert!(register(&table, tenant).is_err());
        // Another tenant is unaffected.
        assert!(register(&table, Uuid::new_v4()).is_ok());
    }

    #[test]
    fn global_cap_is_exact() {
        let table = SessionTable::new(2, 10);
        let t = Uuid::new_v4();
        assert!(register(&table, t).is_ok());
        assert!(register(&table, t).is_ok());
        assert!(register(&table, Uuid::new_v4()).is_err());
    }

    #[test]
    fn remove_releases_the_tenant_slot() {
        let table = SessionTable::new(10, 1);
        let tenant = Uuid::new_v4();
        let id = register(&table, tenant).unwrap();
        assert!(register(&table, tenant).is_err());
        table.remove(id);
        assert!(register(&table, tenant).is_ok());
    }

    #[test]
    fn remove_cancels_the_session_token() {
        let table = SessionTable::new(10, 10);
        let (tx, _rx) = mpsc::channel(4);
        let token = CancellationToken::new();
        let s = session(Uuid::new_v4());
        let id = s.id;
        table.try_register(s, tx, token.clone()).unwrap();
        assert!(!token.is_cancelled());
        table.remove(id);
        assert!(token.is_cancelled());
    }

    #[test]
    fn ttl_sweep_removes_idle_sessions() {
        let table = SessionTable::new(10, 10);
        let (tx, _rx) = mpsc::channel(4);
        let mut s = session(Uuid::new_v4());
        s.ttl_secs = 1;
        s.last_activity = Utc::now() - chrono::Duration::seconds(120);
        let id = s.id;
        table
            .try_register(s, tx, CancellationToken::new())
            .unwrap();
        let swept = table.sweep_expired();
        assert_eq!(swept, vec![id]);
        assert_eq!(table.count(), 0);
    }
}
