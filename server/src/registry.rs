//! In-memory table of live session servers.
//!
//! The registry is the single source of truth for which sessions exist. It is
//! owned by the broker behind one `tokio::sync::Mutex`; session servers never
//! touch it and report their activity through a shared [`SessionStats`].

use log::{debug, info, warn};
use shared::protocol::SessionInfo;
use shared::SessionKind;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Counters a session server updates while it runs.
#[derive(Debug)]
pub struct SessionStats {
    clients: AtomicUsize,
    created_at: Instant,
    /// Milliseconds after `created_at` of the last join, leave or message
    last_activity_ms: AtomicU64,
}

impl SessionStats {
    pub fn new() -> Self {
        Self {
            clients: AtomicUsize::new(0),
            created_at: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
        }
    }

    pub fn clients(&self) -> usize {
        self.clients.load(Ordering::SeqCst)
    }

    pub fn set_clients(&self, count: usize) {
        self.clients.store(count, Ordering::SeqCst);
    }

    pub fn touch(&self) {
        let elapsed = self.created_at.elapsed().as_millis() as u64;
        self.last_activity_ms.fetch_max(elapsed, Ordering::SeqCst);
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Time since the last recorded activity.
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::SeqCst));
        self.created_at.elapsed().saturating_sub(last)
    }
}

impl Default for SessionStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Broker-side view of one running session server.
pub struct SessionHandle {
    pub id: u64,
    pub kind: SessionKind,
    pub port: u16,
    pub address: String,
    pub stats: Arc<SessionStats>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn new(
        id: u64,
        kind: SessionKind,
        port: u16,
        address: String,
        stats: Arc<SessionStats>,
        shutdown: watch::Sender<bool>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            id,
            kind,
            port,
            address,
            stats,
            shutdown,
            task,
        }
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            address: self.address.clone(),
            clients: self.stats.clients(),
            kind: self.kind,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signals the server to stop and waits until it has released its port.
    ///
    /// A server that ignores the signal for longer than `grace` is aborted.
    pub async fn stop(self, grace: Duration) {
        let SessionHandle {
            id, shutdown, task, ..
        } = self;

        let _ = shutdown.send(true);

        let mut task = task;
        match timeout(grace, &mut task).await {
            Ok(Ok(())) => debug!("Session {} stopped", id),
            Ok(Err(e)) => warn!("Session {} task failed: {}", id, e),
            Err(_) => {
                warn!("Session {} did not stop within {:?}, aborting", id, grace);
                task.abort();
                let _ = task.await;
            }
        }
    }
}

/// Live sessions keyed by id, plus the id allocator.
pub struct SessionRegistry {
    sessions: BTreeMap<u64, SessionHandle>,
    next_id: u64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Hands out the next session id. Ids are never reused.
    pub fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn insert(&mut self, handle: SessionHandle) {
        info!(
            "Registered {} session {} at {}",
            handle.kind, handle.id, handle.address
        );
        self.sessions.insert(handle.id, handle);
    }

    pub fn get(&self, id: u64) -> Option<&SessionHandle> {
        self.sessions.get(&id)
    }

    pub fn remove(&mut self, id: u64) -> Option<SessionHandle> {
        self.sessions.remove(&id)
    }

    /// Consistent view of every session, ordered by id.
    pub fn snapshot(&self) -> Vec<SessionInfo> {
        self.sessions.values().map(SessionHandle::info).collect()
    }

    /// Empties the registry, returning the handles so they can be stopped.
    pub fn drain(&mut self) -> Vec<SessionHandle> {
        std::mem::take(&mut self.sessions).into_values().collect()
    }

    /// Ids of empty sessions with no activity for at least `idle_timeout`,
    /// plus any whose server task has already exited.
    pub fn idle_sessions(&self, idle_timeout: Duration) -> Vec<u64> {
        self.sessions
            .values()
            .filter(|handle| {
                handle.is_finished()
                    || (handle.stats.clients() == 0 && handle.stats.idle_for() >= idle_timeout)
            })
            .map(|handle| handle.id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
