//! Capability contract between the wire engine and the gateway core.
//!
//! The engine owns the socket and the SMTP command syntax; everything it
//! learns from the client is delivered to a [`Session`] through the methods
//! below, and every policy decision comes back as a [`SessionError`] that
//! maps onto an SMTP reply line.

pub mod engine;

use async_trait::async_trait;
use thiserror::Error;

use crate::gateway::domain::DomainError;
use crate::gateway::quota::QuotaError;
use crate::relay::RelayError;
use crate::storage::models::tenant::state::{ AuthError, StoreError };

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    Login,
    Plain,
}

impl Mechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mechanism::Login => "LOGIN",
            Mechanism::Plain => "PLAIN",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Accepts inbound connections on behalf of the gateway.
pub trait Backend: Send + Sync {
    type Session: Session;

    /// Session for a client that did not authenticate. The gateway always
    /// refuses these; the method exists so the engine can ask rather than
    /// assume.
    fn anonymous_session(&self) -> Result<Self::Session, SessionError>;

    fn new_session(&self) -> Self::Session;
}

/// One inbound connection's view of the gateway. Methods are called in
/// client command order; the implementation is the state machine and rejects
/// out-of-sequence calls without side effects.
#[async_trait]
pub trait Session: Send {
    /// Authentication mechanisms to advertise, in preference order.
    fn mechanisms(&self) -> &'static [Mechanism];

    async fn authenticate(
        &mut self,
        mechanism: Mechanism,
        credentials: Credentials
    ) -> Result<(), SessionError>;

    async fn set_sender(&mut self, from: &str) -> Result<(), SessionError>;

    /// Repeatable; recipients accumulate until reset or delivery.
    async fn add_recipient(&mut self, to: &str) -> Result<(), SessionError>;

    /// Full message byte stream as submitted by the client.
    async fn deliver(&mut self, data: &[u8]) -> Result<(), SessionError>;

    /// Clears the in-flight transaction; authentication survives.
    async fn reset(&mut self);

    async fn close(&mut self);
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("anonymous login is not allowed")]
    AnonymousDenied,

    #[error(transparent)] Auth(#[from] AuthError),

    #[error(transparent)] Domain(#[from] DomainError),

    #[error(transparent)] Quota(#[from] QuotaError),

    #[error(transparent)] Relay(#[from] RelayError),

    #[error(transparent)] Store(#[from] StoreError),

    #[error("{0}")] BadSequence(&'static str),

    #[error("submitted message could not be parsed")]
    MalformedMessage,
}

impl SessionError {
    /// SMTP reply line for this rejection. Policy rejections get permanent
    /// codes; store and relay trouble is reported as temporary.
    pub fn reply(&self) -> String {
        match self {
            SessionError::AnonymousDenied =>
                "530 5.7.0 Authentication required".to_string(),
            SessionError::Auth(AuthError::InvalidCredentials) =>
                "535 5.7.8 Authentication credentials invalid".to_string(),
            SessionError::Auth(AuthError::NoAuthorizedDomains) =>
                "535 5.7.8 Account has no authorized sending domains".to_string(),
            SessionError::Auth(AuthError::Store(_)) | SessionError::Store(_) =>
                "451 4.3.0 Temporary account store failure".to_string(),
            SessionError::Domain(DomainError::Malformed) =>
                "501 5.1.7 Malformed sender address".to_string(),
            SessionError::Domain(DomainError::Unauthorized) =>
                "550 5.7.1 Sender domain not authorized".to_string(),
            SessionError::Quota(QuotaError::TotalExceeded) =>
                "452 4.2.2 Total send limit exceeded".to_string(),
            SessionError::Quota(QuotaError::DailyExceeded) =>
                "452 4.2.2 Daily send limit exceeded".to_string(),
            SessionError::Quota(QuotaError::HourlyExceeded) =>
                "452 4.2.2 Hourly send limit exceeded".to_string(),
            SessionError::Quota(QuotaError::RaceLost) =>
                "452 4.2.2 Send limit reached".to_string(),
            SessionError::Quota(QuotaError::Store(_)) =>
                "451 4.3.0 Temporary account store failure".to_string(),
            SessionError::Relay(_) =>
                "451 4.4.1 Upstream delivery failed".to_string(),
            SessionError::BadSequence(detail) => format!("503 5.5.1 {}", detail),
            SessionError::MalformedMessage =>
                "554 5.6.0 Message parsing failed".to_string(),
        }
    }
}
