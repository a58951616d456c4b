//! PostgreSQL adapter for the audit engine.
//!
//! Implements the audit_core port traits with sqlx against the `audit`
//! schema (see `migrations/`). Wire the adapters into the services at
//! startup:
//!
//! ```ignore
//! let ledger = Arc::new(PgChangeLogStore::new(pool.clone()));
//! let directory = EntityDirectory::new()
//!     .register(Arc::new(PgUtilityServiceRepo::new(pool.clone())))
//!     .register(Arc::new(PgServiceConfigurationRepo::new(pool.clone())));
//! let rollbacks = Arc::new(PgRollbackStore::new(pool));
//! ```

pub mod sqlx_types;
pub mod store;

pub use store::{
    PgChangeLogStore, PgRollbackStore, PgServiceConfigurationRepo, PgUtilityServiceRepo,
};
