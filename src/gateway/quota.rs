use thiserror::Error;

use crate::storage::AccountStore;
use crate::storage::models::tenant::state::{ StoreError, TenantAccount };

#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("total send limit exceeded")]
    TotalExceeded,

    #[error("daily send limit exceeded")]
    DailyExceeded,

    #[error("hourly send limit exceeded")]
    HourlyExceeded,

    #[error("send limit was reached by a concurrent session")]
    RaceLost,

    #[error(transparent)] Store(#[from] StoreError),
}

/// Pre-send gate on the snapshot captured at authentication time. Tiers are
/// checked coarsest first; the first exceeded tier is reported and checking
/// stops.
pub fn check(account: &TenantAccount) -> Result<(), QuotaError> {
    if account.used_total >= account.total_limit {
        return Err(QuotaError::TotalExceeded);
    }
    if account.used_day >= account.day_limit {
        return Err(QuotaError::DailyExceeded);
    }
    if account.used_hour >= account.hour_limit {
        return Err(QuotaError::HourlyExceeded);
    }
    Ok(())
}

/// Charges a relayed message against the tenant's counters. The store-side
/// update is conditional on remaining headroom in every tier, so two
/// sessions racing past `check` cannot push usage over a limit; the loser
/// surfaces as `RaceLost`.
pub async fn commit(
    store: &dyn AccountStore,
    plan_id: i64,
    recipients: i64
) -> Result<(), QuotaError> {
    if store.commit_usage(plan_id, recipients).await? {
        Ok(())
    } else {
        Err(QuotaError::RaceLost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::models::tenant::state::Upstream;

    fn account(used: (i64, i64, i64), limits: (i64, i64, i64)) -> TenantAccount {
        TenantAccount {
            plan_id: 1,
            status: 1,
            hour_limit: limits.0,
            day_limit: limits.1,
            total_limit: limits.2,
            used_hour: used.0,
            used_day: used.1,
            used_total: used.2,
            domains: vec!["example.com".to_string()],
            upstream: Upstream {
                host: "smtp.example.net".to_string(),
                port: 587,
                username: "relay".to_string(),
                password: "relay".to_string(),
            },
        }
    }

    #[test]
    fn test_headroom_passes() {
        assert!(check(&account((0, 0, 99), (10, 50, 100))).is_ok());
    }

    #[test]
    fn test_total_checked_first() {
        // every tier exhausted; the coarsest one wins
        let acc = account((10, 50, 100), (10, 50, 100));
        assert!(matches!(check(&acc), Err(QuotaError::TotalExceeded)));
    }

    #[test]
    fn test_daily_before_hourly() {
        let acc = account((10, 50, 0), (10, 50, 100));
        assert!(matches!(check(&acc), Err(QuotaError::DailyExceeded)));
    }

    #[test]
    fn test_hourly_last() {
        let acc = account((10, 0, 0), (10, 50, 100));
        assert!(matches!(check(&acc), Err(QuotaError::HourlyExceeded)));
    }
}
