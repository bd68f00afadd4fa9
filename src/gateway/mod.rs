pub mod domain;
pub mod quota;
pub mod resolver;
pub mod session;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{ anyhow, Result };

use crate::protocol::engine::WireConfig;
use crate::protocol::{ Backend, SessionError };
use crate::relay::Dispatcher;
use crate::storage::AccountStore;
use crate::utils::config::Config;
use session::GatewaySession;

/// Immutable gateway settings, resolved from the config file at startup.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub hostname: String,
    pub addr: String,
    pub tls_addr: String,
    pub tls_cert: String,
    pub tls_key: String,
    pub max_connections: usize,
    pub max_message_bytes: usize,
    pub max_recipients: usize,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub single_recipient_only: bool,
}

impl GatewaySettings {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let tls_cert = cfg
            .get_value("server", "tls_cert")
            .ok_or_else(|| anyhow!("server.tls_cert missing"))?
            .to_string();
        let tls_key = cfg
            .get_value("server", "tls_key")
            .ok_or_else(|| anyhow!("server.tls_key missing"))?
            .to_string();

        Ok(Self {
            hostname: cfg.get_value("server", "domain").unwrap_or("localhost").to_string(),
            addr: cfg.get_value("server", "addr").unwrap_or("0.0.0.0:587").to_string(),
            tls_addr: cfg.get_value("server", "tls_addr").unwrap_or("0.0.0.0:465").to_string(),
            tls_cert,
            tls_key,
            max_connections: cfg.get_int("server", "max_connections", 200) as usize,
            max_message_bytes: cfg.get_u64("server", "max_message_bytes", 10 * 1024 * 1024) as usize,
            max_recipients: cfg.get_int("server", "max_recipients", 50) as usize,
            read_timeout: Duration::from_secs(cfg.get_u64("server", "read_timeout", 60)),
            write_timeout: Duration::from_secs(cfg.get_u64("server", "write_timeout", 60)),
            single_recipient_only: cfg.get_bool("relay", "single_recipient_only", false),
        })
    }

    pub fn wire_config(&self) -> WireConfig {
        WireConfig {
            hostname: self.hostname.clone(),
            max_message_bytes: self.max_message_bytes,
            max_recipients: self.max_recipients,
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
        }
    }
}

/// The gateway proper: settings, the account store handle and the relay
/// dispatcher, all owned explicitly and handed to each new session.
pub struct Gateway {
    settings: GatewaySettings,
    store: Arc<dyn AccountStore>,
    dispatcher: Dispatcher,
}

impl Gateway {
    pub fn new(settings: GatewaySettings, store: Arc<dyn AccountStore>) -> Self {
        let dispatcher = Dispatcher::new(
            settings.hostname.clone(),
            settings.single_recipient_only
        );
        Self { settings, store, dispatcher }
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }
}

impl Backend for Gateway {
    type Session = GatewaySession;

    fn anonymous_session(&self) -> Result<GatewaySession, SessionError> {
        Err(SessionError::AnonymousDenied)
    }

    fn new_session(&self) -> GatewaySession {
        GatewaySession::new(self.store.clone(), self.dispatcher.clone())
    }
}
