//! Acknowledge, dispatch, report
//!
//! Every routed command runs the same correlation protocol: acknowledge it
//! (unless synthetic), run its named handler, then always send one completion
//! report, whatever the handler returned.

use super::arguments::{self, BrokerUrlArgs, FlagArgs, PasswordArgs, PublishArgs, TopicsArgs, UsernameArgs};
use super::command::{CommandEnvelope, ControlCommand};
use crate::backend::{BackendApi, CompletionReport};
use crate::error::{BridgeError, BridgeResult};
use crate::subscription::PayloadHandler;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error, info, warn, Instrument};

/// Commands the bridge understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandName {
    SendDownlink,
    Reload,
    TestModule,
    SetTopics,
    SetBrokerUrl,
    SetUsername,
    SetPassword,
    SetAutoProvision,
}

impl CommandName {
    pub const ALL: [CommandName; 8] = [
        CommandName::SendDownlink,
        CommandName::Reload,
        CommandName::TestModule,
        CommandName::SetTopics,
        CommandName::SetBrokerUrl,
        CommandName::SetUsername,
        CommandName::SetPassword,
        CommandName::SetAutoProvision,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CommandName::SendDownlink => "SendDownlink",
            CommandName::Reload => "Reload",
            CommandName::TestModule => "TestModule",
            CommandName::SetTopics => "SetTopics",
            CommandName::SetBrokerUrl => "SetBrokerURL",
            CommandName::SetUsername => "SetUsername",
            CommandName::SetPassword => "SetPassword",
            CommandName::SetAutoProvision => "SetAutoProvision",
        }
    }
}

impl fmt::Display for CommandName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandName {
    type Err = BridgeError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        CommandName::ALL
            .into_iter()
            .find(|candidate| candidate.as_str() == name)
            .ok_or_else(|| BridgeError::unknown_command(name))
    }
}

/// Side effects behind the named commands
#[async_trait]
pub trait CommandHandlers: Send + Sync {
    /// Publish a downlink to the broker
    async fn publish(&self, args: PublishArgs) -> BridgeResult<()>;

    /// Full application restart
    async fn reload(&self) -> BridgeResult<()>;

    /// Log the command; no side effect
    async fn test_module(&self, command: &ControlCommand) -> BridgeResult<()>;

    async fn set_topics(&self, args: TopicsArgs) -> BridgeResult<()>;

    async fn set_broker_url(&self, args: BrokerUrlArgs) -> BridgeResult<()>;

    async fn set_username(&self, args: UsernameArgs) -> BridgeResult<()>;

    async fn set_password(&self, args: PasswordArgs) -> BridgeResult<()>;

    async fn set_auto_provision(&self, args: FlagArgs) -> BridgeResult<()>;
}

/// Report sent after every dispatched command
pub fn completion_report(command: &ControlCommand, _outcome: &BridgeResult<()>) -> CompletionReport {
    // Handler failures are logged only; the report never carries them.
    CompletionReport {
        control_id: command.id,
        error: false,
        done: true,
        report: String::new(),
    }
}

/// Routes decoded commands through the ack/dispatch/report protocol
pub struct ControlRouter {
    backend: Arc<dyn BackendApi>,
    handlers: Arc<dyn CommandHandlers>,
}

impl ControlRouter {
    pub fn new(backend: Arc<dyn BackendApi>, handlers: Arc<dyn CommandHandlers>) -> Self {
        Self { backend, handlers }
    }

    /// Acknowledge, dispatch and report one command
    ///
    /// A failed acknowledgment drops the command. Once acknowledged, the
    /// command is always reported exactly once.
    pub async fn route(&self, command: ControlCommand) -> BridgeResult<()> {
        let span = crate::control_span!(id = command.id, name = %command.name);
        async {
            if command.is_synthetic() {
                debug!("Synthetic command, acknowledgment skipped");
            } else if let Err(e) = self.backend.ack_control(command.id).await {
                error!(error = %e, "Control acknowledgment failed, command dropped");
                return Err(e.into());
            }

            let outcome = self.dispatch(&command).await;
            match &outcome {
                Ok(()) => info!("Control command executed"),
                Err(e) => warn!(error = %e, "Control command failed"),
            }

            let report = completion_report(&command, &outcome);
            self.backend.report_control(&report).await.map_err(|e| {
                error!(error = %e, "Control completion report failed");
                BridgeError::from(e)
            })
        }
        .instrument(span)
        .await
    }

    async fn dispatch(&self, command: &ControlCommand) -> BridgeResult<()> {
        let name: CommandName = command.name.parse()?;
        let params = &command.params;
        let handlers = &self.handlers;

        match name {
            CommandName::SendDownlink => handlers.publish(arguments::decode(name.as_str(), params)?).await,
            CommandName::Reload => handlers.reload().await,
            CommandName::TestModule => handlers.test_module(command).await,
            CommandName::SetTopics => handlers.set_topics(arguments::decode(name.as_str(), params)?).await,
            CommandName::SetBrokerUrl => {
                handlers.set_broker_url(arguments::decode(name.as_str(), params)?).await
            }
            CommandName::SetUsername => {
                handlers.set_username(arguments::decode(name.as_str(), params)?).await
            }
            CommandName::SetPassword => {
                handlers.set_password(arguments::decode(name.as_str(), params)?).await
            }
            CommandName::SetAutoProvision => {
                handlers.set_auto_provision(arguments::decode(name.as_str(), params)?).await
            }
        }
    }
}

/// Subscription handler of the control channel
pub struct ControlChannel {
    router: Arc<ControlRouter>,
}

impl ControlChannel {
    pub fn new(router: Arc<ControlRouter>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl PayloadHandler for ControlChannel {
    async fn handle(&self, payload: Value) -> BridgeResult<()> {
        let command = CommandEnvelope::decode(&payload)?.normalize();
        self.router.route(command).await
    }
}
