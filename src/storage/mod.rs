pub mod db;
pub mod models;

use async_trait::async_trait;

use db::Database;
use models::tenant::{ self, state::{ StoreError, TenantAccount } };

/// Account store seam. The gateway owns a handle to one implementation and
/// threads it into the components that need it; tests substitute an
/// in-memory double.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Runs the authorization query for a credential pair. `Ok(None)` means
    /// no active account matched. A returned account may carry an empty
    /// domain set; the resolver turns that into its own failure.
    async fn lookup_tenant(
        &self,
        username: &str,
        password: &str
    ) -> Result<Option<TenantAccount>, StoreError>;

    /// Atomically increments all three usage counters by `recipients`,
    /// but only while every tier keeps headroom. Returns `false` when the
    /// conditional update matched no row, i.e. the headroom is gone.
    async fn commit_usage(&self, plan_id: i64, recipients: i64) -> Result<bool, StoreError>;
}

pub struct MySqlStore {
    db: Database,
}

impl MySqlStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

#[async_trait]
impl AccountStore for MySqlStore {
    async fn lookup_tenant(
        &self,
        username: &str,
        password: &str
    ) -> Result<Option<TenantAccount>, StoreError> {
        tenant::lookup(self.db.pool(), username, password).await
    }

    async fn commit_usage(&self, plan_id: i64, recipients: i64) -> Result<bool, StoreError> {
        tenant::commit_usage(self.db.pool(), plan_id, recipients).await
    }
}
