pub mod state;

use sqlx::MySqlPool;
use state::{ StoreError, TenantAccount, TenantRow, Upstream };

// Single authorization query: account row, active domain associations and
// the assigned upstream server, one row per domain. The domain join is a
// LEFT JOIN so "credentials match but no active domains" is distinguishable
// from "no such account".
const LOOKUP_QUERY: &str = "\
SELECT p.id, p.status, p.hour_limit, p.day_limit, p.total_limit, \
       p.used_hour, p.used_day, p.used_total, \
       d.domain, \
       s.host AS relay_host, s.port AS relay_port, \
       s.username AS relay_username, s.password AS relay_password \
FROM tenant_plans p \
JOIN server_plans sp ON sp.plan_id = p.server_plan_id \
JOIN servers s ON s.id = sp.server_id \
LEFT JOIN tenant_domains d ON d.tenant_plan_id = p.id AND d.status = 1 \
WHERE p.username = ? AND p.password = ? AND p.status = 1 \
ORDER BY d.domain";

// Conditional increment: all three usage counters move together, and only
// if every tier still has headroom for the full recipient count. Concurrent
// sessions for the same tenant serialize on this row; a zero-row match means
// another session consumed the remaining headroom first.
const COMMIT_QUERY: &str = "\
UPDATE tenant_plans \
SET used_total = used_total + ?, used_day = used_day + ?, used_hour = used_hour + ? \
WHERE id = ? \
  AND used_total + ? <= total_limit \
  AND used_day + ? <= day_limit \
  AND used_hour + ? <= hour_limit";

pub async fn lookup(
    pool: &MySqlPool,
    username: &str,
    password: &str
) -> Result<Option<TenantAccount>, StoreError> {
    let rows: Vec<TenantRow> = sqlx
        ::query_as(LOOKUP_QUERY)
        .bind(username)
        .bind(password)
        .fetch_all(pool).await
        .map_err(StoreError::from_sqlx)?;

    let first = match rows.first() {
        Some(row) => row,
        None => {
            return Ok(None);
        }
    };

    let mut account = TenantAccount {
        plan_id: first.id,
        status: first.status,
        hour_limit: first.hour_limit,
        day_limit: first.day_limit,
        total_limit: first.total_limit,
        used_hour: first.used_hour,
        used_day: first.used_day,
        used_total: first.used_total,
        domains: Vec::new(),
        upstream: Upstream {
            host: first.relay_host.clone(),
            port: first.relay_port,
            username: first.relay_username.clone(),
            password: first.relay_password.clone(),
        },
    };

    for row in &rows {
        if let Some(domain) = &row.domain {
            if !account.domains.iter().any(|d| d == domain) {
                account.domains.push(domain.clone());
            }
        }
    }

    Ok(Some(account))
}

pub async fn commit_usage(
    pool: &MySqlPool,
    plan_id: i64,
    recipients: i64
) -> Result<bool, StoreError> {
    let result = sqlx
        ::query(COMMIT_QUERY)
        .bind(recipients)
        .bind(recipients)
        .bind(recipients)
        .bind(plan_id)
        .bind(recipients)
        .bind(recipients)
        .bind(recipients)
        .execute(pool).await
        .map_err(StoreError::from_sqlx)?;

    Ok(result.rows_affected() > 0)
}
