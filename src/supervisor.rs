//! Subscription watchdogs
//!
//! A supervisor waits for its session to end, then starts a fresh one after a
//! fixed back-off, until its cancellation token fires. Every restart replays
//! the same request through the same factory.

use crate::backend::GraphQlRequest;
use crate::subscription::{
    PayloadHandler, SessionEnd, SubscriptionClient, SubscriptionError, SubscriptionSession,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Instrument};

/// Starts one subscription session under `parent`
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn start(&self, parent: &CancellationToken) -> Result<SubscriptionSession, SubscriptionError>;
}

/// Builds session factories for subscription requests
pub trait SubscriptionSource: Send + Sync {
    fn factory(
        &self,
        request: GraphQlRequest,
        handler: Arc<dyn PayloadHandler>,
    ) -> Arc<dyn SessionFactory>;
}

impl SubscriptionSource for SubscriptionClient {
    fn factory(
        &self,
        request: GraphQlRequest,
        handler: Arc<dyn PayloadHandler>,
    ) -> Arc<dyn SessionFactory> {
        Arc::new(SubscriptionFactory::new(self.clone(), request, handler))
    }
}

/// Factory replaying a fixed request against the subscription endpoint
pub struct SubscriptionFactory {
    client: SubscriptionClient,
    request: GraphQlRequest,
    handler: Arc<dyn PayloadHandler>,
}

impl SubscriptionFactory {
    pub fn new(
        client: SubscriptionClient,
        request: GraphQlRequest,
        handler: Arc<dyn PayloadHandler>,
    ) -> Self {
        Self {
            client,
            request,
            handler,
        }
    }
}

#[async_trait]
impl SessionFactory for SubscriptionFactory {
    async fn start(&self, parent: &CancellationToken) -> Result<SubscriptionSession, SubscriptionError> {
        let (run_loop, _cancel) = self
            .client
            .subscribe(parent, self.request.clone(), self.handler.clone())
            .await?;
        Ok(run_loop.spawn())
    }
}

/// Watchdog of one logical subscription
pub struct SubscriptionSupervisor {
    name: String,
    backoff: Duration,
    cancel: CancellationToken,
    factory: Arc<dyn SessionFactory>,
}

impl SubscriptionSupervisor {
    pub fn new(
        name: impl Into<String>,
        backoff: Duration,
        cancel: CancellationToken,
        factory: Arc<dyn SessionFactory>,
    ) -> Self {
        Self {
            name: name.into(),
            backoff,
            cancel,
            factory,
        }
    }

    /// Start the first session, failing if that is impossible
    pub async fn start(&self) -> Result<SubscriptionSession, SubscriptionError> {
        self.factory.start(&self.cancel).await
    }

    pub fn spawn(self, initial: SubscriptionSession) -> JoinHandle<u64> {
        let span = crate::subscription_span!(channel = %self.name);
        tokio::spawn(self.run(initial).instrument(span))
    }

    /// Watch `initial` and its successors; returns the number of restarts
    pub async fn run(self, initial: SubscriptionSession) -> u64 {
        let mut session = initial;
        let mut restarts = 0u64;

        loop {
            let end = match session.handle.await {
                Ok(end) => end,
                Err(e) => {
                    error!(error = %e, "Subscription loop task failed");
                    SessionEnd::ConnectionError(e.to_string())
                }
            };

            if self.cancel.is_cancelled() {
                info!(reason = ?end, "Subscription watcher stopped");
                return restarts;
            }
            warn!(reason = ?end, backoff = ?self.backoff, "Subscription ended, restarting");

            session = match self.restart().await {
                Some(next) => next,
                None => {
                    info!("Subscription watcher stopped");
                    return restarts;
                }
            };
            restarts += 1;
            info!(restarts, "Subscription restarted");
        }
    }

    /// Sleep the back-off, then start; retried until it works or cancellation
    async fn restart(&self) -> Option<SubscriptionSession> {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep(self.backoff) => {}
            }

            match self.factory.start(&self.cancel).await {
                Ok(session) => return Some(session),
                Err(_) if self.cancel.is_cancelled() => return None,
                Err(e) => warn!(error = %e, "Subscription restart failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// Sessions end on their own after `lifetime`; start times are recorded
    struct TimedFactory {
        lifetime: Duration,
        failures_left: AtomicUsize,
        starts: Mutex<Vec<Instant>>,
    }

    impl TimedFactory {
        fn new(lifetime: Duration, failures: usize) -> Arc<Self> {
            Arc::new(Self {
                lifetime,
                failures_left: AtomicUsize::new(failures),
                starts: Mutex::new(Vec::new()),
            })
        }

        fn starts(&self) -> Vec<Instant> {
            self.starts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SessionFactory for TimedFactory {
        async fn start(
            &self,
            parent: &CancellationToken,
        ) -> Result<SubscriptionSession, SubscriptionError> {
            self.starts.lock().unwrap().push(Instant::now());
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(SubscriptionError::HandshakeTimeout);
            }

            let cancel = parent.child_token();
            let lifetime = self.lifetime;
            let task_cancel = cancel.clone();
            let handle = tokio::spawn(async move {
                tokio::select! {
                    _ = task_cancel.cancelled() => SessionEnd::Cancelled,
                    _ = tokio::time::sleep(lifetime) => SessionEnd::Timeout,
                }
            });
            Ok(SubscriptionSession { cancel, handle })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_after_backoff() {
        // Arrange
        let factory = TimedFactory::new(Duration::from_secs(10), 0);
        let cancel = CancellationToken::new();
        let supervisor = SubscriptionSupervisor::new(
            "controls",
            Duration::from_secs(5),
            cancel.clone(),
            factory.clone(),
        );

        // Act
        let initial = supervisor.start().await.unwrap();
        let handle = supervisor.spawn(initial);
        tokio::time::sleep(Duration::from_secs(31)).await;
        cancel.cancel();
        let restarts = handle.await.unwrap();

        // Assert: sessions at t=0, 15, 30
        let starts = factory.starts();
        assert_eq!(restarts, 2);
        assert_eq!(starts.len(), 3);
        for pair in starts.windows(2) {
            let gap = pair[1] - pair[0];
            assert!(gap >= Duration::from_secs(15), "restarted after {gap:?}");
            assert!(gap < Duration::from_millis(15_100), "restarted after {gap:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_stops_without_restart() {
        let factory = TimedFactory::new(Duration::from_secs(1), 0);
        let cancel = CancellationToken::new();
        let supervisor =
            SubscriptionSupervisor::new("controls", Duration::from_secs(5), cancel.clone(), factory.clone());

        let initial = supervisor.start().await.unwrap();
        let handle = supervisor.spawn(initial);
        tokio::time::sleep(Duration::from_secs(3)).await;
        cancel.cancel();

        assert_eq!(handle.await.unwrap(), 0);
        assert_eq!(factory.starts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_ends_running_session() {
        let factory = TimedFactory::new(Duration::from_secs(3600), 0);
        let cancel = CancellationToken::new();
        let supervisor =
            SubscriptionSupervisor::new("controls", Duration::from_secs(5), cancel.clone(), factory.clone());

        let initial = supervisor.start().await.unwrap();
        let session_cancel = initial.cancel.clone();
        let handle = supervisor.spawn(initial);
        cancel.cancel();

        assert_eq!(handle.await.unwrap(), 0);
        assert!(session_cancel.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_restart_is_retried_each_backoff() {
        let factory = TimedFactory::new(Duration::from_secs(1), 0);
        let cancel = CancellationToken::new();
        let supervisor =
            SubscriptionSupervisor::new("controls", Duration::from_secs(5), cancel.clone(), factory.clone());
        let initial = supervisor.start().await.unwrap();
        factory.failures_left.store(2, Ordering::SeqCst);

        let handle = supervisor.spawn(initial);
        // ends at 1, fails at 6 and 11, succeeds at 16
        tokio::time::sleep(Duration::from_secs(16) + Duration::from_millis(500)).await;
        cancel.cancel();
        handle.await.unwrap();

        let starts = factory.starts();
        let offsets: Vec<u64> = starts.iter().map(|s| (*s - starts[0]).as_secs()).collect();
        assert_eq!(offsets, vec![0, 6, 11, 16]);
    }
}
