// ABOUTME: Fixed-capacity session pool shared by dump and restore workers
// ABOUTME: Eagerly opens every session; checkout blocks until one is free

use crate::session::{Connector, Session};
use crate::utils::quote_ident;
use anyhow::{anyhow, bail, Context, Result};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

struct Slot<S> {
    id: usize,
    session: S,
}

struct Shared<S> {
    label: String,
    size: usize,
    idle: Mutex<Vec<Slot<S>>>,
    permits: Arc<Semaphore>,
    in_use: AtomicUsize,
    closed: AtomicBool,
}

impl<S> Shared<S> {
    fn lock_idle(&self) -> MutexGuard<'_, Vec<Slot<S>>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A fixed set of live sessions
///
/// The pool is the only backpressure mechanism of a run: at most `size`
/// sessions are ever checked out, and [`Pool::get`] waits for a free one.
/// Cloning a pool yields another handle to the same sessions.
pub struct Pool<S: Session> {
    shared: Arc<Shared<S>>,
}

impl<S: Session> Clone for Pool<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: Session> Pool<S> {
    /// Open `size` sessions through `connector`
    ///
    /// Each session runs every `;`-separated statement of `session_vars` and,
    /// when `database` is non-empty, `USE database`. Any failure fails the whole
    /// pool; sessions opened so far are dropped.
    pub async fn new<C>(size: usize, connector: &C, session_vars: &str, database: &str) -> Result<Self>
    where
        C: Connector<Session = S>,
    {
        if size == 0 {
            bail!("Connection pool size must be at least 1");
        }

        let label = if database.is_empty() {
            "server".to_string()
        } else {
            database.to_string()
        };
        let init = session_init_statements(session_vars, database);

        let connects = (0..size).map(|id| {
            let init = &init;
            async move {
                let mut session = connector
                    .connect()
                    .await
                    .with_context(|| format!("Failed to open connection #{}", id))?;
                for stmt in init {
                    session.execute(stmt).await.with_context(|| {
                        format!("Failed to run '{}' on connection #{}", stmt, id)
                    })?;
                }
                Ok::<_, anyhow::Error>(Slot { id, session })
            }
        });

        let slots = futures::future::try_join_all(connects)
            .await
            .with_context(|| format!("Failed to create connection pool for '{}'", label))?;

        tracing::debug!("Opened {} connection(s) for pool '{}'", size, label);

        Ok(Self {
            shared: Arc::new(Shared {
                label,
                size,
                idle: Mutex::new(slots),
                permits: Arc::new(Semaphore::new(size)),
                in_use: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Check out a session, waiting until one is available
    pub async fn get(&self) -> Result<PooledSession<S>> {
        let permit = Arc::clone(&self.shared.permits)
            .acquire_owned()
            .await
            .map_err(|_| anyhow!("Connection pool '{}' is closed", self.shared.label))?;

        let slot = self
            .shared
            .lock_idle()
            .pop()
            .ok_or_else(|| anyhow!("Connection pool '{}' is closed", self.shared.label))?;

        self.shared.in_use.fetch_add(1, Ordering::SeqCst);
        tracing::trace!("Checked out connection #{} from '{}'", slot.id, self.shared.label);

        Ok(PooledSession {
            slot: Some(slot),
            shared: Arc::clone(&self.shared),
            _permit: permit,
        })
    }

    /// Return a session to the pool
    ///
    /// Equivalent to dropping the guard.
    pub fn put(&self, session: PooledSession<S>) {
        drop(session);
    }

    /// Disconnect every idle session and refuse further checkouts
    ///
    /// Sessions still checked out are discarded when their guard is dropped.
    pub async fn close(&self) {
        let drained: Vec<Slot<S>> = {
            let mut idle = self.shared.lock_idle();
            self.shared.closed.store(true, Ordering::SeqCst);
            idle.drain(..).collect()
        };
        self.shared.permits.close();

        for slot in drained {
            if let Err(e) = slot.session.disconnect().await {
                tracing::warn!(
                    "Failed to disconnect connection #{} of pool '{}': {:#}",
                    slot.id,
                    self.shared.label,
                    e
                );
            }
        }
        tracing::debug!("Closed connection pool '{}'", self.shared.label);
    }

    pub fn size(&self) -> usize {
        self.shared.size
    }

    /// Number of sessions currently checked out
    pub fn in_use(&self) -> usize {
        self.shared.in_use.load(Ordering::SeqCst)
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }
}

/// A checked-out session; returned to its pool on drop
pub struct PooledSession<S: Session> {
    slot: Option<Slot<S>>,
    shared: Arc<Shared<S>>,
    _permit: OwnedSemaphorePermit,
}

impl<S: Session> PooledSession<S> {
    /// Identifier of the physical connection, for logging only
    pub fn id(&self) -> usize {
        self.slot.as_ref().map(|slot| slot.id).unwrap_or_default()
    }
}

impl<S: Session> Deref for PooledSession<S> {
    type Target = S;

    fn deref(&self) -> &S {
        match self.slot.as_ref() {
            Some(slot) => &slot.session,
            None => unreachable!("pooled session used after release"),
        }
    }
}

impl<S: Session> DerefMut for PooledSession<S> {
    fn deref_mut(&mut self) -> &mut S {
        match self.slot.as_mut() {
            Some(slot) => &mut slot.session,
            None => unreachable!("pooled session used after release"),
        }
    }
}

impl<S: Session> Drop for PooledSession<S> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.shared.in_use.fetch_sub(1, Ordering::SeqCst);
            let mut idle = self.shared.lock_idle();
            if self.shared.closed.load(Ordering::SeqCst) {
                tracing::debug!(
                    "Discarding connection #{} returned to closed pool '{}'",
                    slot.id,
                    self.shared.label
                );
                return;
            }
            idle.push(slot);
        }
    }
}

fn session_init_statements(session_vars: &str, database: &str) -> Vec<String> {
    let mut statements: Vec<String> = session_vars
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if !database.is_empty() {
        statements.push(format!("USE {}", quote_ident(database)));
    }
    statements
}
