//! Side effects of the remote control commands

use super::{property, Bridge};
use crate::control::{
    BrokerUrlArgs, CommandHandlers, ControlCommand, FlagArgs, PasswordArgs, PublishArgs,
    TopicsArgs, UsernameArgs,
};
use crate::error::BridgeResult;
use crate::state::TopicSet;
use async_trait::async_trait;
use tracing::info;

impl Bridge {
    /// Persist one broker parameter, then rebuild the broker session from it
    async fn set_broker_param(&self, name: &str, value: &str) -> BridgeResult<()> {
        self.set_own_property(name, value).await?;
        info!(property = name, "Broker parameter changed, restarting transport");
        self.transport_restart().await
    }
}

#[async_trait]
impl CommandHandlers for Bridge {
    async fn publish(&self, args: PublishArgs) -> BridgeResult<()> {
        self.broker.publish(&args.topic_name, args.payload).await?;
        info!(topic = %args.topic_name, "Downlink published");
        Ok(())
    }

    async fn reload(&self) -> BridgeResult<()> {
        self.restart().await
    }

    async fn test_module(&self, command: &ControlCommand) -> BridgeResult<()> {
        info!(
            id = command.id,
            caller_id = %command.caller_id,
            params = %command.params,
            "Test command received"
        );
        Ok(())
    }

    async fn set_topics(&self, args: TopicsArgs) -> BridgeResult<()> {
        let topics = TopicSet::parse(&args.topics);
        self.set_broker_param(property::TOPICS, &topics.to_property_value())
            .await
    }

    async fn set_broker_url(&self, args: BrokerUrlArgs) -> BridgeResult<()> {
        self.set_broker_param(property::BROKER_URL, &args.hostname).await
    }

    async fn set_username(&self, args: UsernameArgs) -> BridgeResult<()> {
        self.set_broker_param(property::USERNAME, &args.username).await
    }

    async fn set_password(&self, args: PasswordArgs) -> BridgeResult<()> {
        self.set_broker_param(property::PASSWORD, &args.password).await
    }

    async fn set_auto_provision(&self, args: FlagArgs) -> BridgeResult<()> {
        self.auto_provision.set(args.enable);
        info!(enabled = args.enable, "Auto-provisioning switched");
        self.set_own_property(property::AUTO_PROVISION, if args.enable { "true" } else { "false" })
            .await
    }
}
