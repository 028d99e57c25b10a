use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{json, Value};
use tracing::debug;

use super::client::ClientChannel;
use super::{Channel, ChannelBuilder, ChannelError};
use crate::context::Context;
use crate::envelope::AuthenticationScheme;
use crate::mux::EnvelopeMux;
use crate::node::Node;
use crate::transport::Dialer;

/// Credentials presented while the session is authenticating.
#[derive(Clone, PartialEq, Eq)]
pub enum Authentication {
    Guest,
    Plain { password: String },
    Key { key: String },
    Transport,
    External { token: String, issuer: String },
}

// secrets stay out of logs
impl fmt::Debug for Authentication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Authentication::External { issuer, .. } => f
                .debug_struct("External")
                .field("issuer", issuer)
                .finish_non_exhaustive(),
            other => write!(f, "{:?}", other.scheme()),
        }
    }
}

impl Authentication {
    pub fn scheme(&self) -> AuthenticationScheme {
        match self {
            Authentication::Guest => AuthenticationScheme::Guest,
            Authentication::Plain { .. } => AuthenticationScheme::Plain,
            Authentication::Key { .. } => AuthenticationScheme::Key,
            Authentication::Transport => AuthenticationScheme::Transport,
            Authentication::External { .. } => AuthenticationScheme::External,
        }
    }

    /// Wire form of the credentials. Passwords and keys travel base64 encoded.
    pub fn to_value(&self) -> Value {
        match self {
            Authentication::Guest | Authentication::Transport => json!({}),
            Authentication::Plain { password } => json!({ "password": STANDARD.encode(password) }),
            Authentication::Key { key } => json!({ "key": STANDARD.encode(key) }),
            Authentication::External { token, issuer } => {
                json!({ "token": token, "issuer": issuer })
            }
        }
    }
}

/// Identity and credentials used by [`ClientChannelBuilder`].
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub identity: Node,
    pub instance: String,
    pub authentication: Authentication,
    /// Upper bound for dial plus handshake of a single build attempt.
    pub handshake_timeout: Duration,
}

impl SessionOptions {
    pub fn new(identity: Node) -> Self {
        Self {
            identity,
            instance: "default".to_string(),
            authentication: Authentication::Guest,
            handshake_timeout: Duration::from_secs(30),
        }
    }

    pub fn instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = instance.into();
        self
    }

    pub fn authentication(mut self, authentication: Authentication) -> Self {
        self.authentication = authentication;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

/// Builds [`ClientChannel`]s by dialing a transport and running the session handshake.
pub struct ClientChannelBuilder<D> {
    dialer: D,
    options: SessionOptions,
    mux: Arc<EnvelopeMux>,
}

impl<D> fmt::Debug for ClientChannelBuilder<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientChannelBuilder")
            .field("options", &self.options)
            .field("mux", &self.mux)
            .finish_non_exhaustive()
    }
}

impl<D: Dialer> ClientChannelBuilder<D> {
    pub fn new(dialer: D, options: SessionOptions) -> Self {
        Self {
            dialer,
            options,
            mux: Arc::new(EnvelopeMux::new()),
        }
    }

    /// Routes inbound envelopes of every channel built from now on through `mux`.
    pub fn with_mux(mut self, mux: EnvelopeMux) -> Self {
        self.mux = Arc::new(mux);
        self
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Same as [`ChannelBuilder::build`], keeping the concrete channel type.
    pub async fn build_client_channel(&self, ctx: &Context) -> Result<ClientChannel, ChannelError> {
        let ctx = ctx.with_timeout(self.options.handshake_timeout);
        let transport = ctx.run(self.dialer.dial(&ctx)).await??;
        let channel =
            ClientChannel::establish(&ctx, transport, &self.options, self.mux.clone()).await?;
        debug!(session_id = channel.session_id(), "channel built");
        Ok(channel)
    }
}

#[async_trait]
impl<D: Dialer> ChannelBuilder for ClientChannelBuilder<D> {
    async fn build(&self, ctx: &Context) -> Result<Arc<dyn Channel>, ChannelError> {
        let channel = self.build_client_channel(ctx).await?;
        Ok(Arc::new(channel))
    }
}
