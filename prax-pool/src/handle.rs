//! The owner handle and its lifecycle state machine.
//!
//! ```text
//! NeverOpened ──open──▶ Connecting ──▶ Open ──close──▶ BusyClosing ──▶ PreviouslyOpened
//!                           │                                              │
//!                           └── failure restores the previous state        └──open──▶ Connecting …
//! ```
//!
//! Every transition is a swap under the handle's lock, and each one is
//! broadcast on a watch channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::error::{PoolError, PoolResult};
use crate::factory::{ConnectionFactory, OpenRequest};
use crate::internal::{InternalConnection, OwnerLease};
use crate::options::{ConnectionOptions, PoolKey};

/// Lifecycle state of a [`DbConnection`].
#[derive(Debug)]
pub enum ConnectionState {
    /// Created, never opened.
    NeverOpened,
    /// An open is in progress.
    Connecting,
    /// Holding a connection.
    Open(InternalConnection),
    /// A close is in progress.
    BusyClosing,
    /// Opened and closed at least once.
    PreviouslyOpened,
}

/// Payload-free view of [`ConnectionState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateKind {
    /// See [`ConnectionState::NeverOpened`].
    NeverOpened,
    /// See [`ConnectionState::Connecting`].
    Connecting,
    /// See [`ConnectionState::Open`].
    Open,
    /// See [`ConnectionState::BusyClosing`].
    BusyClosing,
    /// See [`ConnectionState::PreviouslyOpened`].
    PreviouslyOpened,
}

impl StateKind {
    /// Whether the handle holds no connection and is not mid-transition.
    pub fn is_closed(self) -> bool {
        matches!(self, Self::NeverOpened | Self::PreviouslyOpened)
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::NeverOpened => "never opened",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::BusyClosing => "closing",
            Self::PreviouslyOpened => "closed",
        }
    }

    fn closed_state(self) -> ConnectionState {
        match self {
            Self::NeverOpened => ConnectionState::NeverOpened,
            _ => ConnectionState::PreviouslyOpened,
        }
    }
}

impl std::fmt::Display for StateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ConnectionState {
    /// The state's tag.
    pub fn kind(&self) -> StateKind {
        match self {
            Self::NeverOpened => StateKind::NeverOpened,
            Self::Connecting => StateKind::Connecting,
            Self::Open(_) => StateKind::Open,
            Self::BusyClosing => StateKind::BusyClosing,
            Self::PreviouslyOpened => StateKind::PreviouslyOpened,
        }
    }
}

/// A logical connection. Opening borrows a connection from the pool (or
/// creates a non-pooled one); closing hands it back.
///
/// Dropping an open handle closes it.
pub struct DbConnection {
    id: u64,
    factory: Arc<ConnectionFactory>,
    key: PoolKey,
    options: Arc<ConnectionOptions>,
    state: Mutex<ConnectionState>,
    epoch: Arc<AtomicU64>,
    notify: watch::Sender<StateKind>,
}

impl DbConnection {
    pub(crate) fn new(
        factory: Arc<ConnectionFactory>,
        id: u64,
        key: PoolKey,
        options: Arc<ConnectionOptions>,
    ) -> Self {
        let (notify, _) = watch::channel(StateKind::NeverOpened);
        Self {
            id,
            factory,
            key,
            options,
            state: Mutex::new(ConnectionState::NeverOpened),
            epoch: Arc::new(AtomicU64::new(0)),
            notify,
        }
    }

    /// Handle id, unique within its factory.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Key of the pool group this handle draws from.
    pub fn pool_key(&self) -> &PoolKey {
        &self.key
    }

    /// Parsed options of this handle's connection string.
    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    /// Current state.
    pub fn state(&self) -> StateKind {
        self.state.lock().kind()
    }

    /// Receive every state change.
    pub fn subscribe(&self) -> watch::Receiver<StateKind> {
        self.notify.subscribe()
    }

    fn lease(&self) -> OwnerLease {
        OwnerLease::new(self.id, Arc::clone(&self.epoch))
    }

    fn request(&self) -> OpenRequest {
        OpenRequest {
            lease: self.lease(),
            key: self.key.clone(),
            options: Arc::clone(&self.options),
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let kind = next.kind();
        *self.state.lock() = next;
        self.publish(kind);
    }

    fn publish(&self, kind: StateKind) {
        trace!(handle = self.id, state = %kind, "connection state changed");
        self.notify.send_replace(kind);
    }

    /// `NeverOpened`/`PreviouslyOpened` → `Connecting`, returning the state
    /// left behind.
    fn begin_open(&self) -> PoolResult<StateKind> {
        let previous = {
            let mut state = self.state.lock();
            let kind = state.kind();
            if !kind.is_closed() {
                return Err(PoolError::busy(kind.as_str()));
            }
            *state = ConnectionState::Connecting;
            kind
        };
        self.publish(StateKind::Connecting);
        Ok(previous)
    }

    fn finish_open(&self, outcome: PoolResult<InternalConnection>, previous: StateKind) -> PoolResult<()> {
        match outcome {
            Ok(conn) => {
                debug!(handle = self.id, connection_id = conn.id(), "connection opened");
                self.set_state(ConnectionState::Open(conn));
                Ok(())
            }
            Err(e) => {
                debug!(handle = self.id, error = %e, "open failed");
                self.set_state(previous.closed_state());
                Err(e)
            }
        }
    }

    /// Open the connection, blocking until one is available or the creation
    /// timeout elapses.
    pub fn open(&self) -> PoolResult<()> {
        let previous = self.begin_open()?;
        let outcome = self.factory.open_connection(&self.request());
        self.finish_open(outcome, previous)
    }

    /// Open the connection without blocking the runtime.
    ///
    /// Dropping the future before it completes puts the handle back in its
    /// previous state; a connection produced afterwards is returned to its
    /// pool or disposed.
    pub async fn open_async(&self) -> PoolResult<()> {
        let previous = self.begin_open()?;
        let mut guard = RestoreOnDrop {
            handle: self,
            previous: Some(previous),
        };
        let outcome = self.factory.open_connection_async(&self.request()).await;
        guard.previous = None;
        self.finish_open(outcome, previous)
    }

    /// Swap the open connection for a freshly created one, keeping its pool
    /// slot. Meant for a session the caller found broken.
    ///
    /// On failure the old connection is gone and the handle is closed.
    pub fn replace(&self) -> PoolResult<()> {
        let old = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, ConnectionState::Connecting) {
                ConnectionState::Open(conn) => conn,
                other => {
                    let kind = other.kind();
                    *state = other;
                    return Err(if kind.is_closed() {
                        PoolError::closed("replace the connection")
                    } else {
                        PoolError::busy(kind.as_str())
                    });
                }
            }
        };
        self.publish(StateKind::Connecting);
        debug!(handle = self.id, connection_id = old.id(), "replacing connection");

        let outcome = self.factory.replace_connection(&self.request(), old);
        if outcome.is_err() {
            self.epoch.fetch_add(1, Ordering::AcqRel);
        }
        self.finish_open(outcome, StateKind::PreviouslyOpened)
    }

    /// Close the connection. A no-op on a closed handle.
    pub fn close(&self) -> PoolResult<()> {
        let conn = {
            let mut state = self.state.lock();
            match state.kind() {
                StateKind::NeverOpened | StateKind::PreviouslyOpened | StateKind::BusyClosing => {
                    return Ok(());
                }
                StateKind::Connecting => return Err(PoolError::busy("connecting")),
                StateKind::Open => {}
            }
            match std::mem::replace(&mut *state, ConnectionState::BusyClosing) {
                ConnectionState::Open(conn) => conn,
                other => {
                    *state = other;
                    return Ok(());
                }
            }
        };
        self.publish(StateKind::BusyClosing);

        let connection_id = conn.id();
        self.factory.close_connection(conn, &self.lease());
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.set_state(ConnectionState::PreviouslyOpened);
        debug!(handle = self.id, connection_id, "connection closed");
        Ok(())
    }

    /// Run `f` against the open connection.
    ///
    /// The handle's lock is held while `f` runs; `f` must not call back into
    /// this handle.
    pub fn with_connection<R>(&self, f: impl FnOnce(&mut InternalConnection) -> R) -> PoolResult<R> {
        let mut state = self.state.lock();
        match &mut *state {
            ConnectionState::Open(conn) => Ok(f(conn)),
            _ => Err(PoolError::closed("use the connection")),
        }
    }

    /// Mark the open connection as never to be reused.
    pub fn doom(&self) -> PoolResult<()> {
        self.with_connection(InternalConnection::doom)
    }
}

impl Drop for DbConnection {
    fn drop(&mut self) {
        let conn = match std::mem::replace(self.state.get_mut(), ConnectionState::PreviouslyOpened) {
            ConnectionState::Open(conn) => Some(conn),
            _ => None,
        };
        if let Some(conn) = conn {
            trace!(handle = self.id, "closing connection of dropped handle");
            self.factory.close_connection(conn, &self.lease());
        }
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for DbConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbConnection")
            .field("id", &self.id)
            .field("key", &self.key.to_string())
            .field("state", &self.state())
            .finish()
    }
}

/// Puts a handle back in its pre-open state if an async open is abandoned.
struct RestoreOnDrop<'a> {
    handle: &'a DbConnection,
    previous: Option<StateKind>,
}

impl Drop for RestoreOnDrop<'_> {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            debug!(handle = self.handle.id, "async open abandoned");
            // A connection delivered later must find its lease dead.
            self.handle.epoch.fetch_add(1, Ordering::AcqRel);
            self.handle.set_state(previous.closed_state());
        }
    }
}
