//! Connection pooling engine for Prax ORM drivers.
//!
//! `prax-pool` keeps expensive, authenticated database connections alive and
//! hands them out behind a logical connection handle. Drivers supply the
//! handshake through [`ConnectionProvider`]; the pool decides when to call it.
//!
//! # Features
//!
//! - One pool per normalized connection string, optionally split per caller
//!   identity
//! - Bounded pools with LIFO reuse and a timed wait when exhausted
//! - Load-balance eviction of connections past a maximum lifetime
//! - Background pruning of idle connections, pools and pool groups
//! - Throttled async creation for non-pooled connections
//! - Blocking and async opens on the same handle
//!
//! # Example
//!
//! ```rust
//! use prax_pool::{BoxError, ConnectionFactory, ConnectionOptions, ConnectionProvider, PhysicalConnection, PoolKey};
//!
//! struct Session;
//! impl PhysicalConnection for Session {}
//!
//! struct Driver;
//! impl ConnectionProvider for Driver {
//!     fn connect(&self, _: &ConnectionOptions, _: &PoolKey) -> Result<Box<dyn PhysicalConnection>, BoxError> {
//!         Ok(Box::new(Session))
//!     }
//! }
//!
//! let factory = ConnectionFactory::new(Driver);
//! let conn = factory.connection("postgres://app@localhost/orders?max_pool_size=10").unwrap();
//! conn.open().unwrap();
//! conn.close().unwrap();
//!
//! // The physical connection stays pooled for the next open.
//! let conn = factory.connection("postgres://app@localhost/orders?max_pool_size=10").unwrap();
//! conn.open().unwrap();
//! ```

pub mod config;
pub mod error;
pub mod factory;
pub mod group;
pub mod handle;
pub mod internal;
pub mod logging;
pub mod options;
pub mod pool;
pub mod provider;
pub mod throttle;

mod retry;

#[cfg(test)]
mod testing;

pub use config::FactoryConfig;
pub use error::{BoxError, InternalError, PoolError, PoolResult};
pub use factory::ConnectionFactory;
pub use group::{GroupState, PoolGroup};
pub use handle::{ConnectionState, DbConnection, StateKind};
pub use internal::InternalConnection;
pub use options::{ConnectionOptions, Identity, PoolGroupOptions, PoolKey};
pub use pool::{Pool, PoolStats};
pub use provider::{ConnectionProvider, PhysicalConnection};
pub use throttle::NonPooledThrottle;
