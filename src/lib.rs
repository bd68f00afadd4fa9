//! Multi-tenant inbound SMTP gateway.
//!
//! Tenants authenticate with per-account credentials, the gateway checks the
//! envelope sender against the tenant's authorized domains and the tenant's
//! send quotas, then relays the accepted message through the tenant's
//! configured upstream SMTP server. Messages are never persisted locally and
//! there is no queueing or retry: a relay failure is reported synchronously
//! to the submitting client.

pub mod gateway;
pub mod net;
pub mod protocol;
pub mod relay;
pub mod storage;
pub mod utils;
