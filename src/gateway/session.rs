use std::sync::Arc;

use async_trait::async_trait;
use mail_parser::MessageParser;
use tracing::{ info, warn };

use crate::protocol::{ Credentials, Mechanism, Session, SessionError };
use crate::relay::{ Dispatcher, OutboundMessage };
use crate::storage::AccountStore;
use crate::storage::models::tenant::state::TenantAccount;

use super::{ domain, quota, resolver };

const MECHANISMS: &[Mechanism] = &[Mechanism::Login, Mechanism::Plain];

/// Per-connection state machine. Owned exclusively by the connection's
/// task; progresses authenticated → sender set → recipients set and is
/// pushed back by reset. The account snapshot taken at authentication time
/// serves the whole session.
pub struct GatewaySession {
    store: Arc<dyn AccountStore>,
    dispatcher: Dispatcher,
    account: Option<TenantAccount>,
    sender: Option<String>,
    recipients: Vec<String>,
}

impl GatewaySession {
    pub fn new(store: Arc<dyn AccountStore>, dispatcher: Dispatcher) -> Self {
        Self {
            store,
            dispatcher,
            account: None,
            sender: None,
            recipients: Vec::new(),
        }
    }
}

#[async_trait]
impl Session for GatewaySession {
    fn mechanisms(&self) -> &'static [Mechanism] {
        MECHANISMS
    }

    async fn authenticate(
        &mut self,
        mechanism: Mechanism,
        credentials: Credentials
    ) -> Result<(), SessionError> {
        if self.account.is_some() {
            return Err(SessionError::BadSequence("Already authenticated"));
        }

        let account = resolver::resolve(
            self.store.as_ref(),
            &credentials.username,
            &credentials.password
        ).await?;

        info!("Tenant plan {} authenticated via {}", account.plan_id, mechanism.as_str());
        self.account = Some(account);
        Ok(())
    }

    async fn set_sender(&mut self, from: &str) -> Result<(), SessionError> {
        let account = self.account
            .as_ref()
            .ok_or(SessionError::BadSequence("Authentication required"))?;

        let address = domain::authorize(from, &account.domains)?;

        // a new MAIL command opens a fresh transaction
        self.recipients.clear();
        self.sender = Some(address);
        Ok(())
    }

    async fn add_recipient(&mut self, to: &str) -> Result<(), SessionError> {
        if self.sender.is_none() {
            return Err(SessionError::BadSequence("Sender required before recipients"));
        }
        self.recipients.push(to.to_string());
        Ok(())
    }

    async fn deliver(&mut self, data: &[u8]) -> Result<(), SessionError> {
        let account = self.account
            .as_ref()
            .ok_or(SessionError::BadSequence("Authentication required"))?;
        let sender = self.sender
            .clone()
            .ok_or(SessionError::BadSequence("Sender required before delivery"))?;
        if self.recipients.is_empty() {
            return Err(SessionError::BadSequence("Recipients required before delivery"));
        }

        quota::check(account)?;

        let (subject, from_header, body) = interpret(data)?;
        let message = OutboundMessage {
            envelope_from: sender.clone(),
            from: from_header.unwrap_or(sender),
            to: self.recipients.clone(),
            subject,
            body,
        };

        // a relay failure skips the commit: the tenant is not charged for
        // a message that never left
        self.dispatcher.send(message, &account.upstream).await?;

        let plan_id = account.plan_id;
        let count = self.recipients.len() as i64;
        match quota::commit(self.store.as_ref(), plan_id, count).await {
            Ok(()) => {
                info!("Relayed message for plan {} ({} recipient(s))", plan_id, count);
                Ok(())
            }
            Err(e) => {
                // the upstream already accepted the message at this point
                warn!(
                    "Usage accounting drift for plan {}: message relayed but commit failed: {}",
                    plan_id,
                    e
                );
                Err(e.into())
            }
        }
    }

    async fn reset(&mut self) {
        self.sender = None;
        self.recipients.clear();
    }

    async fn close(&mut self) {
        self.sender = None;
        self.recipients.clear();
        self.account = None;
    }
}

/// Pulls Subject and From out of the submitted message. The From header,
/// when present, supersedes the envelope sender in the outbound headers;
/// the body is everything after the header block.
fn interpret(data: &[u8]) -> Result<(String, Option<String>, String), SessionError> {
    let parsed = MessageParser::default().parse(data).ok_or(SessionError::MalformedMessage)?;

    let subject = parsed
        .subject()
        .map(|s| s.to_string())
        .unwrap_or_default();

    let from_header = parsed
        .from()
        .and_then(|from| from.iter().next())
        .map(|addr| {
            match (addr.name(), addr.address()) {
                (Some(name), Some(email)) => format!("{} <{}>", name, email),
                (None, Some(email)) => email.to_string(),
                (Some(name), None) => name.to_string(),
                (None, None) => String::new(),
            }
        })
        .filter(|s| !s.is_empty());

    let body = body_after_headers(data);
    Ok((subject, from_header, body))
}

fn body_after_headers(data: &[u8]) -> String {
    let text = String::from_utf8_lossy(data);
    if let Some(pos) = text.find("\r\n\r\n") {
        return text[pos + 4..].to_string();
    }
    if let Some(pos) = text.find("\n\n") {
        return text[pos + 2..].to_string();
    }
    String::new()
}
