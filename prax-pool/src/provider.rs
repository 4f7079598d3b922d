//! Seams to the driver layer.
//!
//! The pool never speaks a wire protocol. Drivers implement
//! [`ConnectionProvider`] to perform the handshake and hand back a
//! [`PhysicalConnection`]; the pool decides when to call it, how many calls may
//! run at once and what happens to the result.
//!
//! ```rust
//! use prax_pool::{BoxError, ConnectionOptions, ConnectionProvider, PhysicalConnection, PoolKey};
//!
//! struct Loopback;
//!
//! impl PhysicalConnection for Loopback {}
//!
//! struct LoopbackProvider;
//!
//! impl ConnectionProvider for LoopbackProvider {
//!     fn connect(
//!         &self,
//!         _options: &ConnectionOptions,
//!         _key: &PoolKey,
//!     ) -> Result<Box<dyn PhysicalConnection>, BoxError> {
//!         Ok(Box::new(Loopback))
//!     }
//! }
//! ```

use crate::error::{BoxError, PoolResult};
use crate::options::{ConnectionOptions, PoolKey};

/// A live, authenticated session owned by the driver.
pub trait PhysicalConnection: Send + 'static {
    /// Bring the session back to a clean state before it is pooled again:
    /// abort pending reads, roll back an open transaction, reset session
    /// settings. An error dooms the connection.
    fn reset(&mut self) -> Result<(), BoxError> {
        Ok(())
    }

    /// Whether the driver knows the session is unusable.
    fn is_broken(&self) -> bool {
        false
    }

    /// Tear the session down. Called exactly once.
    fn close(&mut self) {}
}

/// Opens physical connections for the factory.
pub trait ConnectionProvider: Send + Sync + 'static {
    /// Perform the handshake and authentication. May block.
    fn connect(
        &self,
        options: &ConnectionOptions,
        key: &PoolKey,
    ) -> Result<Box<dyn PhysicalConnection>, BoxError>;

    /// Pre-connect permission hook, run before every open.
    fn demand_permission(&self, _options: &ConnectionOptions) -> PoolResult<()> {
        Ok(())
    }
}
