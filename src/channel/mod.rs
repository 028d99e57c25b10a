//! Established sessions able to exchange envelopes, and the builders that open them.
//!
//! [`Channel`] and [`ChannelBuilder`] are the seams the [`Client`](crate::client::Client)
//! depends on. [`ClientChannel`] and [`ClientChannelBuilder`] are the implementations
//! running the client side of the session handshake over any
//! [`Transport`](crate::transport::Transport).
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::context::{Context, ContextError};
use crate::envelope::{Command, Message, Notification, Reason, Session, SessionState};
use crate::transport::TransportError;

pub mod builder;
pub mod client;

pub use builder::{Authentication, ClientChannelBuilder, SessionOptions};
pub use client::ClientChannel;

/// Errors raised by a channel or while building one.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel not established (session is {0:?})")]
    NotEstablished(SessionState),
    #[error("session failed: {}", describe(.0))]
    SessionFailed(Option<Reason>),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("channel closed")]
    Closed,
    #[error(transparent)]
    Cancelled(#[from] ContextError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

fn describe(reason: &Option<Reason>) -> String {
    match reason {
        Some(reason) => reason.to_string(),
        None => "no reason given".to_string(),
    }
}

/// A session bound to a transport, able to send every envelope kind.
///
/// A send whose context ends before the envelope reaches the transport is dropped.
/// Once the transport has taken the envelope it may still be delivered even though
/// the caller already saw a cancellation error.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Whether the session is established. Never blocks.
    fn established(&self) -> bool;

    async fn send_message(&self, ctx: &Context, msg: Message) -> Result<(), ChannelError>;

    async fn send_notification(&self, ctx: &Context, not: Notification)
        -> Result<(), ChannelError>;

    async fn send_command(&self, ctx: &Context, cmd: Command) -> Result<(), ChannelError>;

    /// Sends a request command and waits for the response sharing its id.
    async fn process_command(&self, ctx: &Context, cmd: Command) -> Result<Command, ChannelError>;

    /// Runs the graceful finish handshake and returns the remote's final session.
    async fn finish_session(&self, ctx: &Context) -> Result<Session, ChannelError>;

    /// Closes the underlying transport without finishing the session.
    async fn close_transport(&self) -> Result<(), ChannelError>;
}

/// Opens new established channels (dial + session handshake).
#[async_trait]
pub trait ChannelBuilder: Send + Sync {
    async fn build(&self, ctx: &Context) -> Result<Arc<dyn Channel>, ChannelError>;
}
