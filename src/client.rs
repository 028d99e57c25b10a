//! Channel lifecycle manager.
//!
//! The [`Client`] owns at most one live [`Channel`]. It builds the channel lazily on
//! first use, shares it with every caller while it stays established, rebuilds it
//! with backoff after failures and finishes the session on [`Client::close`].
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Deserializer};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelBuilder, ChannelError};
use crate::context::{Context, ContextError};
use crate::envelope::{Command, Message, Notification};

/// Errors returned by [`Client`] operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The caller's context ended while waiting for a channel.
    #[error("could not acquire a channel after {attempts} attempt(s): {source}")]
    AcquisitionCancelled {
        attempts: u32,
        #[source]
        source: ContextError,
    },
    /// The session finish handshake failed or timed out during `close`.
    #[error("graceful session finish failed: {0}")]
    GracefulCloseFailed(#[source] ChannelError),
    /// Failure reported by the channel itself, surfaced as is.
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Tuning knobs for the lifecycle manager.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base of the quadratic backoff between failed builds.
    #[serde(rename = "backoff_unit_ms", deserialize_with = "millis")]
    pub backoff_unit: Duration,
    /// Bound for the graceful session finish run by `close`.
    #[serde(rename = "close_timeout_ms", deserialize_with = "millis")]
    pub close_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            backoff_unit: Duration::from_millis(100),
            close_timeout: Duration::from_secs(5),
        }
    }
}

impl ClientConfig {
    pub fn backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }
}

fn millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
}

/// Delay slept after the failed build `attempt` (counted from zero): `attempt² × unit`.
///
/// The first retry therefore follows immediately.
pub fn backoff_delay(unit: Duration, attempt: u32) -> Duration {
    unit.saturating_mul(attempt.saturating_mul(attempt))
}

/// Lazily connected client sharing a single channel between concurrent callers.
///
/// Builds are strictly serialized: one lock covers the channel slot and the whole
/// build-and-retry loop, so at most one build attempt is in flight and other callers
/// queue behind it. Queued callers also wait out the lock holder's backoff; each one
/// still leaves the queue as soon as its own context ends.
///
/// An established channel is published behind a separate read lock, so sends on a
/// healthy channel never wait for the build lock.
pub struct Client {
    builder: Arc<dyn ChannelBuilder>,
    config: ClientConfig,
    slot: Mutex<Option<Arc<dyn Channel>>>,
    published: RwLock<Option<Arc<dyn Channel>>>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.config)
            .field("established", &self.established())
            .finish_non_exhaustive()
    }
}

impl Client {
    pub fn new(builder: impl ChannelBuilder + 'static) -> Self {
        Self::with_config(builder, ClientConfig::default())
    }

    pub fn with_config(builder: impl ChannelBuilder + 'static, config: ClientConfig) -> Self {
        Self {
            builder: Arc::new(builder),
            config,
            slot: Mutex::new(None),
            published: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Whether a channel is currently established.
    pub fn established(&self) -> bool {
        self.published_channel().is_some()
    }

    pub async fn send_message(&self, ctx: &Context, msg: Message) -> Result<(), ClientError> {
        let channel = self.get_or_build_channel(ctx).await?;
        Ok(channel.send_message(ctx, msg).await?)
    }

    pub async fn send_notification(
        &self,
        ctx: &Context,
        not: Notification,
    ) -> Result<(), ClientError> {
        let channel = self.get_or_build_channel(ctx).await?;
        Ok(channel.send_notification(ctx, not).await?)
    }

    pub async fn send_command(&self, ctx: &Context, cmd: Command) -> Result<(), ClientError> {
        let channel = self.get_or_build_channel(ctx).await?;
        Ok(channel.send_command(ctx, cmd).await?)
    }

    /// Sends `cmd` and waits for the response carrying the same id.
    pub async fn process_command(&self, ctx: &Context, cmd: Command) -> Result<Command, ClientError> {
        let channel = self.get_or_build_channel(ctx).await?;
        Ok(channel.process_command(ctx, cmd).await?)
    }

    /// Returns the established channel, building one if needed.
    ///
    /// Failed builds are retried with [`backoff_delay`] until `ctx` ends.
    ///
    /// # Errors
    /// `AcquisitionCancelled` once `ctx` is cancelled or past its deadline, including
    /// while waiting for the build lock or during a backoff wait.
    pub async fn get_or_build_channel(&self, ctx: &Context) -> Result<Arc<dyn Channel>, ClientError> {
        if let Some(channel) = self.published_channel() {
            return Ok(channel);
        }

        let mut slot = ctx
            .run(self.slot.lock())
            .await
            .map_err(|source| ClientError::AcquisitionCancelled {
                attempts: 0,
                source,
            })?;
        if let Some(channel) = slot.as_ref().filter(|c| c.established()) {
            return Ok(channel.clone());
        }

        let mut attempt: u32 = 0;
        while !ctx.is_done() {
            let built = match ctx.run(self.builder.build(ctx)).await {
                Ok(built) => built,
                Err(_) => {
                    attempt += 1;
                    break;
                }
            };
            match built {
                Ok(channel) => {
                    *slot = Some(channel.clone());
                    *self.published.write() = Some(channel.clone());
                    debug!(attempts = attempt + 1, "channel established");
                    return Ok(channel);
                }
                Err(err) => {
                    let delay = backoff_delay(self.config.backoff_unit, attempt);
                    warn!(attempt, ?delay, error = %err, "build channel failed");
                    attempt += 1;
                    if ctx.sleep(delay).await.is_err() {
                        break;
                    }
                }
            }
        }

        Err(ClientError::AcquisitionCancelled {
            attempts: attempt,
            source: ctx.err().unwrap_or(ContextError::Cancelled),
        })
    }

    /// Ends the current session, if any.
    ///
    /// An established channel is finished gracefully within
    /// [`ClientConfig::close_timeout`]; when that fails the transport is closed
    /// forcefully and the finish error is returned. A channel that is not established
    /// only has its transport closed. Each forceful close is bounded by the same
    /// timeout. Either way the client holds no channel afterwards, and closing a
    /// client without a channel is a no-op.
    pub async fn close(&self) -> Result<(), ClientError> {
        let mut slot = self.slot.lock().await;
        self.published.write().take();
        let Some(channel) = slot.take() else {
            return Ok(());
        };

        if !channel.established() {
            debug!("closing transport of a channel that is not established");
            return Ok(self.force_close(channel.as_ref()).await?);
        }

        let ctx = Context::background().with_timeout(self.config.close_timeout);
        let finished = match ctx.run(channel.finish_session(&ctx)).await {
            Ok(finished) => finished,
            Err(err) => Err(err.into()),
        };
        match finished {
            Ok(session) => {
                info!(session_id = %session.base.id, "session finished");
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "graceful session finish failed, closing transport");
                if let Err(close_err) = self.force_close(channel.as_ref()).await {
                    debug!(error = %close_err, "closing transport after failed finish");
                }
                Err(ClientError::GracefulCloseFailed(err))
            }
        }
    }

    async fn force_close(&self, channel: &dyn Channel) -> Result<(), ChannelError> {
        let ctx = Context::background().with_timeout(self.config.close_timeout);
        ctx.run(channel.close_transport()).await?
    }

    fn published_channel(&self) -> Option<Arc<dyn Channel>> {
        self.published
            .read()
            .as_ref()
            .filter(|channel| channel.established())
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_quadratic_from_zero() {
        let unit = Duration::from_millis(100);
        let delays: Vec<u64> = (0..5)
            .map(|attempt| backoff_delay(unit, attempt).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![0, 100, 400, 900, 1600]);
        assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[test]
    fn backoff_saturates() {
        assert_eq!(
            backoff_delay(Duration::from_secs(u64::MAX / 2), u32::MAX),
            Duration::MAX
        );
    }

    #[test]
    fn config_reads_milliseconds() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"backoff_unit_ms": 25, "close_timeout_ms": 1500}"#).unwrap();
        assert_eq!(config.backoff_unit, Duration::from_millis(25));
        assert_eq!(config.close_timeout, Duration::from_millis(1500));

        let defaults: ClientConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(defaults, ClientConfig::default());
    }
}
