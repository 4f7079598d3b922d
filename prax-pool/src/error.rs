//! Error types for connection pooling.
//!
//! Errors fall into four groups, each with a stable code in the Prax
//! `P{category}{number}` scheme:
//!
//! - usage errors (`P1xxx`): an operation on a closed or busy handle;
//! - exhaustion (`P3xxx`): a pooled or non-pooled open ran out of time;
//! - connect failures (`P3001`): whatever the driver reported, passed through;
//! - internal consistency (`P9xxx`): bookkeeping violations, never retried.
//!
//! ```rust
//! use prax_pool::PoolError;
//!
//! let err = PoolError::pooled_open_timeout(200);
//! assert!(err.is_timeout());
//! assert!(err.is_retryable());
//! assert_eq!(err.code(), "P3002");
//! ```

use thiserror::Error;

/// Result type for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Boxed error produced by a connection provider.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Bookkeeping violations detected while moving connections between owners
/// and pools.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternalError {
    /// A connection was pushed into a pool it already sits in.
    #[error("connection pushed into the pool twice")]
    PushingObjectSecondTime,
    /// A connection popped from a pool still had an owner.
    #[error("pooled connection still has an owner")]
    PooledObjectHasOwner,
    /// A pooled connection was popped while its pooled count was not zero.
    #[error("pooled connection present in the pool more than once")]
    PooledObjectInPoolMoreThanOnce,
    /// A non-pooled connection was handed out twice.
    #[error("non-pooled connection handed out more than once")]
    NonPooledObjectUsedMoreThanOnce,
    /// A connection was returned by something other than its owner.
    #[error("connection returned by a handle that does not own it")]
    UnpooledObjectHasWrongOwner,
    /// A creation task vanished without reporting a result.
    #[error("connection creation task ended without a result")]
    CreationTaskLost,
}

/// Errors that can occur while obtaining, returning or administering pooled
/// connections.
#[derive(Error, Debug)]
pub enum PoolError {
    /// The handle is closed and the operation needs an open connection.
    #[error("connection is closed: cannot {operation}")]
    ConnectionClosed {
        /// The rejected operation.
        operation: &'static str,
    },

    /// The handle is already open, or busy opening or closing.
    #[error("connection is already {state}")]
    ConnectionBusy {
        /// Name of the state that rejected the operation.
        state: &'static str,
    },

    /// Every slot of the pool stayed in use for the whole wait.
    #[error("timed out after {timeout_ms}ms waiting for a pooled connection; all pooled connections were in use and the max pool size was reached")]
    PooledOpenTimeout {
        /// How long the caller waited.
        timeout_ms: u64,
    },

    /// A throttled non-pooled open did not finish within the connect timeout.
    #[error("timed out after {timeout_ms}ms opening a non-pooled connection")]
    NonPooledOpenTimeout {
        /// The connect timeout that elapsed.
        timeout_ms: u64,
    },

    /// The driver failed to establish a connection.
    #[error(transparent)]
    Connect(BoxError),

    /// The pre-connect permission hook refused the open.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Invalid connection string or pool options.
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal bookkeeping violation.
    #[error("internal pool error: {0}")]
    Internal(#[from] InternalError),
}

impl PoolError {
    /// Create a closed-connection usage error.
    pub fn closed(operation: &'static str) -> Self {
        Self::ConnectionClosed { operation }
    }

    /// Create a busy-connection usage error.
    pub fn busy(state: &'static str) -> Self {
        Self::ConnectionBusy { state }
    }

    /// Create a pooled open timeout error.
    pub fn pooled_open_timeout(timeout_ms: u64) -> Self {
        Self::PooledOpenTimeout { timeout_ms }
    }

    /// Create a non-pooled open timeout error.
    pub fn non_pooled_open_timeout(timeout_ms: u64) -> Self {
        Self::NonPooledOpenTimeout { timeout_ms }
    }

    /// Wrap a driver error.
    pub fn connect(source: impl Into<BoxError>) -> Self {
        Self::Connect(source.into())
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create an internal error.
    pub fn internal(kind: InternalError) -> Self {
        Self::Internal(kind)
    }

    /// Get the error code string (e.g., "P3002").
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConnectionClosed { .. } => "P1101",
            Self::ConnectionBusy { .. } => "P1102",
            Self::Connect(_) => "P3001",
            Self::PooledOpenTimeout { .. } => "P3002",
            Self::NonPooledOpenTimeout { .. } => "P3003",
            Self::PermissionDenied(_) => "P3004",
            Self::Config(_) => "P7003",
            Self::Internal(_) => "P9001",
        }
    }

    /// Check if this is an operation on a closed or busy handle.
    pub fn is_usage(&self) -> bool {
        matches!(self, Self::ConnectionClosed { .. } | Self::ConnectionBusy { .. })
    }

    /// Check if this is a timeout error.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::PooledOpenTimeout { .. } | Self::NonPooledOpenTimeout { .. }
        )
    }

    /// Check if the caller may retry the operation.
    pub fn is_retryable(&self) -> bool {
        self.is_timeout()
    }

    /// Check if this is an internal consistency violation.
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Internal(_))
    }

    /// Borrow the driver error, if this is a connect failure.
    pub fn connect_source(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match self {
            Self::Connect(source) => Some(source.as_ref()),
            _ => None,
        }
    }
}
