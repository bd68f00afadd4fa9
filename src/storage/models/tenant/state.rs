use sqlx::FromRow;
use thiserror::Error;

/// Upstream SMTP server a tenant relays through, with the credentials the
/// gateway uses to authenticate on the tenant's behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

/// Immutable snapshot of a tenant account, captured at authentication time
/// and valid for the rest of the session. Usage counters in the store move
/// independently of this snapshot; the ledger's conditional commit is what
/// keeps them below the limits.
#[derive(Debug, Clone)]
pub struct TenantAccount {
    pub plan_id: i64,
    pub status: i32,
    pub hour_limit: i64,
    pub day_limit: i64,
    pub total_limit: i64,
    pub used_hour: i64,
    pub used_day: i64,
    pub used_total: i64,
    pub domains: Vec<String>,
    pub upstream: Upstream,
}

/// One row of the authorization query. The domain column comes from a LEFT
/// JOIN so a credential match with zero active domain associations is still
/// observable as rows with a NULL domain.
#[derive(Debug, FromRow)]
pub struct TenantRow {
    pub id: i64,
    pub status: i32,
    pub hour_limit: i64,
    pub day_limit: i64,
    pub total_limit: i64,
    pub used_hour: i64,
    pub used_day: i64,
    pub used_total: i64,
    pub domain: Option<String>,
    pub relay_host: String,
    pub relay_port: u16,
    pub relay_username: String,
    pub relay_password: String,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("account store unavailable: {0}")]
    ConnectionUnavailable(#[source] sqlx::Error),

    #[error("account store query failed: {0}")]
    QueryFailed(#[source] sqlx::Error),
}

impl StoreError {
    pub fn from_sqlx(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed =>
                StoreError::ConnectionUnavailable(e),
            _ => StoreError::QueryFailed(e),
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid username or password")]
    InvalidCredentials,

    #[error("account has no authorized sending domains")]
    NoAuthorizedDomains,

    #[error(transparent)] Store(#[from] StoreError),
}
