use crate::storage::AccountStore;
use crate::storage::models::tenant::state::{ AuthError, TenantAccount };

/// Turns a credential pair into a validated account snapshot.
///
/// An account whose active domain set resolves empty is rejected here, at
/// authentication time, so the client learns the account is unusable for
/// sending before it ever offers a sender address.
pub async fn resolve(
    store: &dyn AccountStore,
    username: &str,
    password: &str
) -> Result<TenantAccount, AuthError> {
    let account = store
        .lookup_tenant(username, password).await?
        .ok_or(AuthError::InvalidCredentials)?;

    if account.domains.is_empty() {
        return Err(AuthError::NoAuthorizedDomains);
    }

    Ok(account)
}
