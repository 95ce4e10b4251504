//! Policy-action implementations. Deliberately out of scope for deep
//! engineering per `SPEC_FULL.md` §1 — the interface is specified only where
//! the core (the Policy Engine) touches it: given the client socket, decide
//! whether the session continues.

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{error, info};

use crate::stream::Stream;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionOutcome {
    /// The action closed (or is about to close) the client socket.
    Blocked,
    /// The action let the session continue (e.g. alert-only).
    Allowed,
}

impl From<ActionOutcome> for crate::policy::Decision {
    fn from(outcome: ActionOutcome) -> Self {
        match outcome {
            ActionOutcome::Blocked => crate::policy::Decision::Block,
            ActionOutcome::Allowed => crate::policy::Decision::Allow,
        }
    }
}

/// Invoked by the Policy Engine when a query in protection mode has no
/// matching fingerprint. May close the socket, send a deceptive response, or
/// simply alert and let the session continue.
#[async_trait]
pub trait Action: Send + Sync {
    async fn invoke(&self, client: &mut (dyn Stream + '_)) -> std::io::Result<ActionOutcome>;
}

/// Closes the client connection immediately.
pub struct DropAction;

#[async_trait]
impl Action for DropAction {
    async fn invoke(&self, client: &mut (dyn Stream + '_)) -> std::io::Result<ActionOutcome> {
        info!("action=drop closing client connection");
        client.shutdown().await?;
        Ok(ActionOutcome::Blocked)
    }
}

/// Alerts (logs) but lets the query through. Named `pass` in config per §6.
pub struct PassAction;

#[async_trait]
impl Action for PassAction {
    async fn invoke(&self, _client: &mut (dyn Stream + '_)) -> std::io::Result<ActionOutcome> {
        info!("action=pass allowing unrecognised query through");
        Ok(ActionOutcome::Allowed)
    }
}

/// Sends an operator alert and drops the connection. Composing an actual
/// email is an external collaborator (SMTP client, templating, delivery
/// retries) outside this core; this stub logs at `error` level in its place.
pub struct EmailAction {
    pub recipient: String,
}

#[async_trait]
impl Action for EmailAction {
    async fn invoke(&self, client: &mut (dyn Stream + '_)) -> std::io::Result<ActionOutcome> {
        error!(recipient = %self.recipient, "action=email alerting operator (delivery not implemented)");
        client.shutdown().await?;
        Ok(ActionOutcome::Blocked)
    }
}

/// Construct the configured action, if any (`action = "pass"` explicitly
/// disables blocking; there is always *an* action once protection mode is
/// selected — §6 lists `drop`, `pass`, `email` as the three choices).
pub fn from_config_name(name: &str, email_recipient: Option<String>) -> Result<Box<dyn Action>, crate::error::ConfigError> {
    match name {
        "drop" => Ok(Box::new(DropAction)),
        "pass" => Ok(Box::new(PassAction)),
        "email" => Ok(Box::new(EmailAction {
            recipient: email_recipient.unwrap_or_default(),
        })),
        other => Err(crate::error::ConfigError::UnknownAction(other.to_string())),
    }
}
