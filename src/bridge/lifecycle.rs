//! Start, restart, shutdown and the main supervision loop

use super::properties::{property_subscription, PropertyChannel};
use super::{property, schema, Bridge, Generation};
use crate::backend::BackendError;
use crate::control::arguments::parse_bool;
use crate::control::{control_subscription, ControlChannel, ControlRouter};
use crate::error::{BridgeError, BridgeResult};
use crate::supervisor::SubscriptionSupervisor;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn, Instrument};

impl Bridge {
    /// Bring the bridge up
    ///
    /// Core bind is retried until it works or the bridge is cancelled. Broker
    /// failures are logged and left to the main loop; failing to start the
    /// control subscription is an error.
    pub async fn start(&self) -> BridgeResult<()> {
        let span = crate::bridge_span!(phase = "start");
        async {
            info!("Starting bridge");
            self.bind_core_until_success().await?;
            self.prepare_session().await?;

            if let Err(e) = self.bind_transport().await {
                warn!(error = %e, "Broker bind failed, main loop will retry");
            } else if self.broker.is_connected() {
                if let Err(e) = self.subscribe_to_topics().await {
                    warn!(error = %e, "Broker topic subscription failed");
                }
            }

            let mut generation = self.generation.lock().await;
            if let Some(previous) = generation.take() {
                previous.stop().await;
            }
            *generation = Some(self.start_channels().await?);
            info!("Bridge started");
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Tear everything down and come back up with fresh backend state
    ///
    /// The broker is only unbound here; the main loop notices and reconnects
    /// it on its next tick.
    pub async fn restart(&self) -> BridgeResult<()> {
        let span = crate::bridge_span!(phase = "restart");
        async {
            let mut generation = self.generation.lock().await;
            info!("Restarting bridge");

            self.unbind_transport().await;
            if let Some(previous) = generation.take() {
                previous.stop().await;
            }

            self.bind_core().await?;
            self.prepare_session().await?;
            *generation = Some(self.start_channels().await?);
            info!("Bridge restarted");
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Cancel every loop, wait for the watchers and leave the broker
    pub async fn shutdown(&self) {
        info!("Shutting down bridge");
        self.root.cancel();
        if let Some(generation) = self.generation.lock().await.take() {
            generation.stop().await;
        }
        self.unbind_transport().await;
        info!("Bridge stopped");
    }

    /// Main supervision loop; returns once the bridge is cancelled
    pub async fn run(&self) {
        let span = crate::bridge_span!(phase = "run");
        async {
            let mut ticker = tokio::time::interval(self.config.tick_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            let mut last_alive = Instant::now();
            let mut need_restart = false;
            info!(tick = ?self.config.tick_interval(), "Main loop started");

            loop {
                tokio::select! {
                    biased;
                    _ = self.root.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                if need_restart {
                    match self.restart().await {
                        Ok(()) => need_restart = false,
                        Err(e) => {
                            error!(error = %e, "Restart failed, retrying next tick");
                            continue;
                        }
                    }
                }
                need_restart = self.tick(&mut last_alive).await;
            }
            info!("Main loop stopped");
        }
        .instrument(span)
        .await
    }

    /// One main loop iteration; true when the bridge must restart
    async fn tick(&self, last_alive: &mut Instant) -> bool {
        if !self.broker.is_connected() {
            debug!("Broker not connected, reconnecting");
            if let Err(e) = self.transport_reconnect().await {
                warn!(error = %e, "Broker reconnect failed");
            }
        }

        let mut need_restart = false;
        if last_alive.elapsed() >= self.config.alive_interval() {
            *last_alive = Instant::now();
            if let Err(e) = self.set_own_property(property::MESSAGE, "Alive").await {
                error!(error = %e, "Alive update failed");
                need_restart = true;
            }
        }

        let now = Utc::now().timestamp();
        if self.tokens.needs_refresh(now, self.config.token_refresh_threshold()) {
            if let Err(e) = self.refresh_token().await {
                error!(error = %e, "Access token refresh failed");
                need_restart = true;
            }
        }
        need_restart
    }

    /// Swap the access token for a fresh one
    pub async fn refresh_token(&self) -> BridgeResult<()> {
        let current = self.tokens.snapshot().ok_or(BackendError::Unbound)?;
        let next = self.backend.refresh_access_token(&current).await?;
        info!(expires_at = next.expires_at, "Access token refreshed");
        self.tokens.replace(next);
        Ok(())
    }

    async fn bind_core(&self) -> BridgeResult<()> {
        let credential = self.backend.bind().await?;
        debug!(expires_at = credential.expires_at, "Bound to core");
        self.tokens.replace(credential);
        Ok(())
    }

    async fn bind_core_until_success(&self) -> BridgeResult<()> {
        let retry = self.config.bind_retry_interval();
        loop {
            match self.bind_core().await {
                Ok(()) => return Ok(()),
                Err(e) => warn!(error = %e, retry_in = ?retry, "Core bind failed, waiting for core"),
            }

            tokio::select! {
                biased;
                _ = self.root.cancelled() => {
                    return Err(BridgeError::internal("cancelled while binding to core"));
                }
                _ = tokio::time::sleep(retry) => {}
            }
        }
    }

    /// Identity, schema and bridge properties, in the order the backend needs
    async fn prepare_session(&self) -> BridgeResult<()> {
        let user_id = self.backend.user_id().await?;
        debug!(%user_id, "User id fetched");
        self.identity.update(|identity| identity.user_id = user_id);

        let schema = self.load_schema().await?;
        let schema_id = self.backend.import_schema(&schema).await?;
        info!(%schema_id, "Application schema imported");
        // New token so that it carries the profile created by the import
        self.bind_core().await?;

        let object_id = self.backend.profile_object_id().await?;
        info!(%object_id, "Bridge object resolved");
        self.identity.update(|identity| identity.object_id = object_id);

        self.load_auto_provision().await;
        let params = self.load_broker_params().await?;
        info!(broker = %params.url, topics = params.topics.len(), "Broker parameters loaded");
        Ok(())
    }

    /// The configured schema file, or the built-in schema
    async fn load_schema(&self) -> BridgeResult<Value> {
        let Some(path) = &self.config.bridge.schema_file else {
            return schema::default_schema();
        };
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| BridgeError::internal(format!("schema file {}: {e}", path.display())))?;
        let schema = serde_json::from_str(&text)
            .map_err(|e| BridgeError::internal(format!("schema file {}: {e}", path.display())))?;
        Ok(schema)
    }

    /// Unset or unreadable values leave auto-provisioning off
    async fn load_auto_provision(&self) {
        let object_id = self.identity.load().object_id;
        let enabled = match self
            .backend
            .get_property_value(&object_id, property::AUTO_PROVISION)
            .await
        {
            Ok(value) => parse_bool(&value).unwrap_or_else(|| {
                warn!(%value, "AUTO_PROVISION is not a boolean, treating as false");
                false
            }),
            Err(e) => {
                warn!(error = %e, "AUTO_PROVISION unavailable, treating as false");
                false
            }
        };
        self.auto_provision.set(enabled);
    }

    /// Start the control subscription and, if enabled, the property one
    async fn start_channels(&self) -> BridgeResult<Generation> {
        let bridge = self.strong()?;
        let token_id = self.tokens.token_id().ok_or(BackendError::Unbound)?;
        let cancel = self.root.child_token();
        let backoff = self.config.subscription_backoff();

        let router = Arc::new(ControlRouter::new(self.backend.clone(), bridge.clone()));
        let controls = SubscriptionSupervisor::new(
            "controls",
            backoff,
            cancel.clone(),
            self.subscriptions.factory(
                control_subscription(&token_id),
                Arc::new(ControlChannel::new(router)),
            ),
        );
        let initial = match controls.start().await {
            Ok(session) => session,
            Err(e) => {
                cancel.cancel();
                return Err(e.into());
            }
        };
        info!("Control subscription started");
        let mut supervisors = vec![controls.spawn(initial)];

        if self.config.bridge.watch_properties {
            let properties = SubscriptionSupervisor::new(
                "properties",
                backoff,
                cancel.clone(),
                self.subscriptions.factory(
                    property_subscription(&token_id),
                    Arc::new(PropertyChannel::new(Arc::downgrade(&bridge))),
                ),
            );
            match properties.start().await {
                Ok(initial) => {
                    info!("Property subscription started");
                    supervisors.push(properties.spawn(initial));
                }
                Err(e) => warn!(error = %e, "Property subscription failed to start"),
            }
        }

        Ok(Generation {
            cancel,
            supervisors,
        })
    }
}
