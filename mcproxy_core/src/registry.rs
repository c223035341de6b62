//! Session registry (C8): live client sessions keyed by address, with
//! idle-timeout GC and identity-based lookups.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// One live client<->proxy<->remote pipe.
pub struct Session {
    pub id: String,
    pub client_addr: SocketAddr,
    pub server_id: String,
    pub start_time: u64,

    pub display_name: RwLock<Option<String>>,
    pub uuid: RwLock<Option<String>>,
    pub xuid: RwLock<Option<String>>,

    pub bytes_up: AtomicU64,
    pub bytes_down: AtomicU64,
    last_seen_unix_ms: AtomicU64,
}

/// Immutable copy of a session's state at the moment it was removed.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub id: String,
    pub client_addr: SocketAddr,
    pub server_id: String,
    pub display_name: Option<String>,
    pub uuid: Option<String>,
    pub xuid: Option<String>,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub start_time: u64,
    pub last_seen: u64,
}

impl Session {
    fn new(id: String, client_addr: SocketAddr, server_id: String) -> Self {
        let now = now_ms();
        Self {
            id,
            client_addr,
            server_id,
            start_time: now,
            display_name: RwLock::new(None),
            uuid: RwLock::new(None),
            xuid: RwLock::new(None),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
            last_seen_unix_ms: AtomicU64::new(now),
        }
    }

    pub fn touch(&self) {
        let now = now_ms();
        let prev = self.last_seen_unix_ms.load(Ordering::Relaxed);
        if now > prev {
            self.last_seen_unix_ms.store(now, Ordering::Relaxed);
        }
    }

    pub fn last_seen(&self) -> u64 {
        self.last_seen_unix_ms.load(Ordering::Relaxed)
    }

    pub async fn set_identity(&self, display_name: String, uuid: String, xuid: Option<String>) {
        let mut dn = self.display_name.write().await;
        if dn.is_none() {
            *dn = Some(display_name);
        }
        drop(dn);
        let mut u = self.uuid.write().await;
        if u.is_none() {
            *u = Some(uuid);
        }
        drop(u);
        let mut x = self.xuid.write().await;
        if x.is_none() {
            *x = xuid;
        }
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            client_addr: self.client_addr,
            server_id: self.server_id.clone(),
            display_name: self.display_name.read().await.clone(),
            uuid: self.uuid.read().await.clone(),
            xuid: self.xuid.read().await.clone(),
            bytes_up: self.bytes_up.load(Ordering::Relaxed),
            bytes_down: self.bytes_down.load(Ordering::Relaxed),
            start_time: self.start_time,
            last_seen: self.last_seen(),
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

type EndCallback = Box<dyn Fn(SessionSnapshot) + Send + Sync>;

pub struct SessionRegistry {
    sessions: RwLock<HashMap<SocketAddr, Arc<Session>>>,
    /// Per-session cancellation, so `kick`/idle-GC can unblock the
    /// forwarding loop without the registry owning the socket itself.
    cancellations: RwLock<HashMap<SocketAddr, CancellationToken>>,
    on_session_end: RwLock<Vec<EndCallback>>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            cancellations: RwLock::new(HashMap::new()),
            on_session_end: RwLock::new(Vec::new()),
        })
    }

    pub async fn on_session_end<F>(&self, hook: F)
    where
        F: Fn(SessionSnapshot) + Send + Sync + 'static,
    {
        self.on_session_end.write().await.push(Box::new(hook));
    }

    /// Idempotent: returns the existing session for `addr` if present.
    pub async fn get_or_create(
        &self,
        addr: SocketAddr,
        server_id: &str,
        cancellation: CancellationToken,
    ) -> Arc<Session> {
        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(&addr) {
            return existing.clone();
        }
        let id = uuid::Uuid::new_v4().to_string();
        let session = Arc::new(Session::new(id, addr, server_id.to_owned()));
        sessions.insert(addr, session.clone());
        self.cancellations.write().await.insert(addr, cancellation);
        session
    }

    pub async fn get(&self, addr: &SocketAddr) -> Option<Arc<Session>> {
        self.sessions.read().await.get(addr).cloned()
    }

    pub async fn remove(&self, addr: &SocketAddr) {
        let session = self.sessions.write().await.remove(addr);
        self.cancellations.write().await.remove(addr);
        if let Some(session) = session {
            let snapshot = session.snapshot().await;
            for hook in self.on_session_end.read().await.iter() {
                hook(snapshot.clone());
            }
        }
    }

    /// Cancels and removes every session whose display name matches
    /// case-insensitively; returns the number removed.
    pub async fn remove_by_player_name(&self, name: &str) -> usize {
        let matches = self.addrs_matching(|s| async move { s.display_name.read().await.as_deref().map(|n| n.eq_ignore_ascii_case(name)).unwrap_or(false) }).await;
        for addr in &matches {
            self.cancel(addr).await;
            self.remove(addr).await;
        }
        matches.len()
    }

    pub async fn remove_by_xuid(&self, xuid: &str) -> usize {
        let matches = self.addrs_matching(|s| async move { s.xuid.read().await.as_deref() == Some(xuid) }).await;
        for addr in &matches {
            self.cancel(addr).await;
            self.remove(addr).await;
        }
        matches.len()
    }

    async fn addrs_matching<F, Fut>(&self, predicate: F) -> Vec<SocketAddr>
    where
        F: Fn(Arc<Session>) -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let sessions: Vec<(SocketAddr, Arc<Session>)> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(addr, s)| (*addr, s.clone()))
            .collect();
        let mut out = Vec::new();
        for (addr, session) in sessions {
            if predicate(session).await {
                out.push(addr);
            }
        }
        out
    }

    async fn cancel(&self, addr: &SocketAddr) {
        if let Some(token) = self.cancellations.read().await.get(addr) {
            token.cancel();
        }
    }

    pub async fn get_all_sessions(&self) -> Vec<SessionSnapshot> {
        let sessions: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(sessions.len());
        for session in sessions {
            out.push(session.snapshot().await);
        }
        out
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Background idle-GC tick: evicts sessions whose idle time
    /// exceeds `effective_idle_timeout(session)`.
    pub async fn gc_idle<F>(&self, effective_idle_timeout: F)
    where
        F: Fn(&Session) -> Duration,
    {
        let now = now_ms();
        let expired: Vec<SocketAddr> = {
            let sessions = self.sessions.read().await;
            sessions
                .values()
                .filter(|s| {
                    let timeout_ms = effective_idle_timeout(s).as_millis() as u64;
                    now.saturating_sub(s.last_seen()) > timeout_ms
                })
                .map(|s| s.client_addr)
                .collect()
        };
        for addr in expired {
            self.cancel(&addr).await;
            self.remove(&addr).await;
        }
    }
}
