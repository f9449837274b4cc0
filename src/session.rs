//! Sessions, ambient context, and connections.
//!
//! A [`Connection`] binds one [`Session`], one [`AmbientSession`], and one
//! [`QueryExecutionContext`]. The ambient session is the value query
//! execution reads implicitly: it travels with the async call chain
//! through a tokio task-local scope, never a plain thread-local, because
//! the scheduler is free to resume a suspended operation on a different
//! worker. Scopes restore the previous value on every exit path,
//! including failures.

use crate::device::DatabaseDevice;
use crate::storage::error::{StorageError, StorageResult};
use dashmap::DashMap;
use log::warn;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Identifier for one logical connection's session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hands out session ids and tracks the live set.
pub struct SessionManager {
    next_session_id: AtomicU64,
    active: DashMap<SessionId, ()>,
}

impl SessionManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_session_id: AtomicU64::new(1),
            active: DashMap::new(),
        })
    }

    pub fn create_session(self: &Arc<Self>) -> Session {
        let session_id = SessionId(self.next_session_id.fetch_add(1, Ordering::SeqCst));
        self.active.insert(session_id, ());
        Session {
            session_id,
            manager: Arc::clone(self),
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn is_active(&self, session_id: SessionId) -> bool {
        self.active.contains_key(&session_id)
    }

    fn on_session_disposed(&self, session_id: SessionId) {
        self.active.remove(&session_id);
    }
}

/// One registered session. Unregisters itself from its manager on drop.
pub struct Session {
    session_id: SessionId,
    manager: Arc<SessionManager>,
}

impl Session {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.manager.on_session_disposed(self.session_id);
    }
}

tokio::task_local! {
    static AMBIENT_SESSION: AmbientSession;
}

/// The session value implicitly propagated through a unit of work:
/// a session id plus the lock-timeout policy applied on its behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmbientSession {
    session_id: SessionId,
    lock_timeout: Duration,
}

impl AmbientSession {
    pub fn new(session_id: SessionId, lock_timeout: Duration) -> Self {
        Self {
            session_id,
            lock_timeout,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// The ambient session of the current call chain, if one is in scope.
    pub fn current() -> Option<AmbientSession> {
        AMBIENT_SESSION.try_with(|session| session.clone()).ok()
    }

    /// Runs `fut` with this value as the ambient session. The previous
    /// ambient value (possibly none) is restored on every exit path; the
    /// value follows the task across worker threads.
    pub async fn scope<F: Future>(&self, fut: F) -> F::Output {
        AMBIENT_SESSION.scope(self.clone(), fut).await
    }
}

/// Binds the active database for a unit of work.
///
/// Only one database is active at a time; switching locks the new device
/// before unlocking the previous one, so a failed switch leaves the
/// binding unchanged.
pub struct QueryExecutionContext {
    master: Arc<DatabaseDevice>,
    active: parking_lot::Mutex<Option<Arc<DatabaseDevice>>>,
    default_lock_timeout: Duration,
}

impl QueryExecutionContext {
    pub fn new(master: Arc<DatabaseDevice>, default_lock_timeout: Duration) -> Self {
        Self {
            master,
            active: parking_lot::Mutex::new(None),
            default_lock_timeout,
        }
    }

    /// The master (root) database device.
    pub fn master_database(&self) -> Arc<DatabaseDevice> {
        Arc::clone(&self.master)
    }

    /// The currently active database, if one has been set.
    pub fn active_database(&self) -> Option<Arc<DatabaseDevice>> {
        self.active.lock().clone()
    }

    /// Switches the active database. The new device's shared usage lock
    /// is acquired first (under the ambient session's lock timeout when
    /// one is in scope) and only then is the previous device unlocked.
    /// On [`StorageError::LockTimeout`] the active database is unchanged.
    pub async fn set_active_database(&self, device: Arc<DatabaseDevice>) -> StorageResult<()> {
        let previous = self.active.lock().clone();
        if let Some(prev) = &previous {
            if Arc::ptr_eq(prev, &device) {
                return Ok(());
            }
        }

        let lock_timeout = AmbientSession::current()
            .map(|session| session.lock_timeout())
            .unwrap_or(self.default_lock_timeout);
        device.use_database(lock_timeout).await?;

        *self.active.lock() = Some(device);
        if let Some(prev) = previous {
            prev.unuse_database()?;
        }
        Ok(())
    }

    /// Drops the active-database binding, releasing its usage lock.
    /// Synchronous by design: connection teardown must unlock the device
    /// without awaiting.
    pub fn clear_active_database(&self) -> StorageResult<()> {
        if let Some(prev) = self.active.lock().take() {
            prev.unuse_database()?;
        }
        Ok(())
    }
}

/// One client connection: a session, its ambient value, and an execution
/// context.
pub struct Connection {
    session: Option<Session>,
    ambient: AmbientSession,
    context: Arc<QueryExecutionContext>,
    closed: bool,
}

impl Connection {
    pub fn new(session: Session, master: Arc<DatabaseDevice>, lock_timeout: Duration) -> Self {
        let ambient = AmbientSession::new(session.session_id(), lock_timeout);
        let context = Arc::new(QueryExecutionContext::new(master, lock_timeout));
        Self {
            session: Some(session),
            ambient,
            context,
            closed: false,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.ambient.session_id()
    }

    pub fn execution_context(&self) -> Arc<QueryExecutionContext> {
        Arc::clone(&self.context)
    }

    /// Executes `action` under this connection's ambient session.
    ///
    /// An active database is established first, defaulting to the master
    /// database when none is set. The ambient session is scoped around the
    /// action and the previous ambient value is restored on every exit
    /// path, including when the action fails.
    pub async fn execute_under_session<F, Fut, T>(&self, action: F) -> StorageResult<T>
    where
        F: FnOnce(Arc<QueryExecutionContext>) -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        self.ensure_active_database().await?;
        self.ambient.scope(action(Arc::clone(&self.context))).await
    }

    /// Tears the connection down: the active database is cleared first,
    /// synchronously unlocking the device, and only then is the session
    /// disposed. A second close fails with `AlreadyDisposed`.
    pub fn close(&mut self) -> StorageResult<()> {
        if self.closed {
            return Err(StorageError::AlreadyDisposed {
                target: "connection",
            });
        }
        self.closed = true;
        self.context.clear_active_database()?;
        self.session.take();
        Ok(())
    }

    async fn ensure_active_database(&self) -> StorageResult<()> {
        if self.context.active_database().is_none() {
            let master = self.context.master_database();
            self.context.set_active_database(master).await?;
        }
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            if self.context.clear_active_database().is_err() {
                warn!(
                    "session {}: failed to release active database during teardown",
                    self.ambient.session_id()
                );
            }
            self.session.take();
        }
    }
}
