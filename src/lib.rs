//! LIME protocol client.
//!
//! Provides the envelope model exchanged between nodes (messages, notifications,
//! commands and sessions) and a [`Client`] that keeps a single session channel alive:
//! it builds the channel on first use, retries failed builds with backoff and finishes
//! the session gracefully on close.

pub mod channel;
pub mod client;
pub mod context;
pub mod envelope;
pub mod mux;
pub mod node;
pub mod transport;

pub use channel::{
    Authentication, Channel, ChannelBuilder, ChannelError, ClientChannel, ClientChannelBuilder,
    SessionOptions,
};
pub use client::{backoff_delay, Client, ClientConfig, ClientError};
pub use context::{Context, ContextError};
pub use envelope::{
    new_envelope_id, Command, CommandMethod, CommandStatus, Envelope, EnvelopeBase,
    EnvelopeError, EnvelopeFields, EnvelopeKind, MediaType, Message, Notification,
    NotificationEvent, Reason, Session, SessionState,
};
pub use mux::{CommandHandler, EnvelopeMux, HandlerError, MessageHandler, NotificationHandler};
pub use node::Node;
pub use transport::{Dialer, PipeTransport, TimeoutTransport, Transport, TransportError};
