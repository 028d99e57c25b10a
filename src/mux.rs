//! Routes inbound envelopes to registered handlers by kind.
//!
//! Handlers are tried in registration order and the first one whose `matches`
//! predicate accepts the envelope receives it. Session envelopes belong to the
//! channel and are never routed here.
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::context::Context;
use crate::envelope::{Command, Envelope, Message, Notification};

#[derive(Debug, Error)]
#[error("handler failed: {0}")]
pub struct HandlerError(pub String);

#[async_trait]
pub trait MessageHandler: Send + Sync {
    fn matches(&self, _msg: &Message) -> bool {
        true
    }

    async fn handle(&self, ctx: &Context, msg: Message) -> Result<(), HandlerError>;
}

#[async_trait]
pub trait NotificationHandler: Send + Sync {
    fn matches(&self, _not: &Notification) -> bool {
        true
    }

    async fn handle(&self, ctx: &Context, not: Notification) -> Result<(), HandlerError>;
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
    fn matches(&self, _cmd: &Command) -> bool {
        true
    }

    async fn handle(&self, ctx: &Context, cmd: Command) -> Result<(), HandlerError>;
}

#[derive(Default)]
pub struct EnvelopeMux {
    message_handlers: Vec<Arc<dyn MessageHandler>>,
    notification_handlers: Vec<Arc<dyn NotificationHandler>>,
    command_handlers: Vec<Arc<dyn CommandHandler>>,
}

impl fmt::Debug for EnvelopeMux {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvelopeMux")
            .field("message_handlers", &self.message_handlers.len())
            .field("notification_handlers", &self.notification_handlers.len())
            .field("command_handlers", &self.command_handlers.len())
            .finish()
    }
}

impl EnvelopeMux {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message_handler(mut self, handler: impl MessageHandler + 'static) -> Self {
        self.message_handlers.push(Arc::new(handler));
        self
    }

    pub fn notification_handler(mut self, handler: impl NotificationHandler + 'static) -> Self {
        self.notification_handlers.push(Arc::new(handler));
        self
    }

    pub fn command_handler(mut self, handler: impl CommandHandler + 'static) -> Self {
        self.command_handlers.push(Arc::new(handler));
        self
    }

    /// Hands `envelope` to the first matching handler of its kind.
    ///
    /// Returns `Ok(false)` when no handler accepted the envelope.
    pub async fn dispatch(&self, ctx: &Context, envelope: Envelope) -> Result<bool, HandlerError> {
        match envelope {
            Envelope::Message(msg) => {
                match self.message_handlers.iter().find(|h| h.matches(&msg)) {
                    Some(handler) => handler.handle(ctx, msg).await.map(|_| true),
                    None => Ok(false),
                }
            }
            Envelope::Notification(not) => {
                match self.notification_handlers.iter().find(|h| h.matches(&not)) {
                    Some(handler) => handler.handle(ctx, not).await.map(|_| true),
                    None => Ok(false),
                }
            }
            Envelope::Command(cmd) => {
                match self.command_handlers.iter().find(|h| h.matches(&cmd)) {
                    Some(handler) => handler.handle(ctx, cmd).await.map(|_| true),
                    None => Ok(false),
                }
            }
            Envelope::Session(_) => Ok(false),
        }
    }
}
