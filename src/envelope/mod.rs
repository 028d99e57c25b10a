//! Envelope data model shared by every frame exchanged on a channel.
//!
//! All four kinds embed an [`EnvelopeBase`] and are carried by the closed
//! [`Envelope`] sum type. Inbound JSON objects carry no explicit tag; the kind is
//! recovered from which discriminating key is present, see [`EnvelopeKind`].
use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::node::Node;

pub mod command;
pub mod message;
pub mod notification;
pub mod session;

pub use command::{Command, CommandMethod, CommandStatus};
pub use message::{MediaType, MediaTypeError, Message};
pub use notification::{Notification, NotificationEvent};
pub use session::{
    AuthenticationScheme, Session, SessionCompression, SessionEncryption, SessionState,
};

/// Errors produced while decoding or encoding envelopes.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("could not determine the envelope kind")]
    UnknownEnvelopeKind,
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(#[from] serde_json::Error),
}

/// Generates a new unique envelope id.
pub fn new_envelope_id() -> String {
    Uuid::new_v4().to_string()
}

/// Fields common to every envelope kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeBase {
    /// Envelope identifier. Requests and their responses share it.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,

    /// Sender. Absent on receipt means the remote party originated the envelope.
    #[serde(
        default,
        with = "crate::node::optional",
        skip_serializing_if = "crate::node::optional::is_absent"
    )]
    pub from: Option<Node>,

    /// Delegate that sent the envelope on behalf of `from` (per procurationem).
    #[serde(
        default,
        with = "crate::node::optional",
        skip_serializing_if = "crate::node::optional::is_absent"
    )]
    pub pp: Option<Node>,

    /// Destination. Absent on receipt means the envelope is addressed to the receiver.
    #[serde(
        default,
        with = "crate::node::optional",
        skip_serializing_if = "crate::node::optional::is_absent"
    )]
    pub to: Option<Node>,

    #[serde(default, skip_serializing_if = "metadata_is_empty")]
    pub metadata: Option<HashMap<String, String>>,
}

fn metadata_is_empty(metadata: &Option<HashMap<String, String>>) -> bool {
    metadata.as_ref().map_or(true, HashMap::is_empty)
}

impl EnvelopeBase {
    /// Base with a freshly generated id and no addressing.
    pub fn with_new_id() -> Self {
        Self {
            id: new_envelope_id(),
            ..Self::default()
        }
    }
}

/// Known reason for a failure or negative outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reason {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub code: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

fn is_zero(code: &i32) -> bool {
    *code == 0
}

impl Reason {
    pub fn new(code: i32, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.description, self.code)
    }
}

/// Builder-style access to the shared fields, implemented by every kind.
pub trait EnvelopeFields: Sized {
    fn base(&self) -> &EnvelopeBase;
    fn base_mut(&mut self) -> &mut EnvelopeBase;

    fn id(&self) -> &str {
        &self.base().id
    }

    fn with_id(mut self, id: impl Into<String>) -> Self {
        self.base_mut().id = id.into();
        self
    }

    fn with_from(mut self, node: Node) -> Self {
        self.base_mut().from = Some(node);
        self
    }

    fn with_pp(mut self, node: Node) -> Self {
        self.base_mut().pp = Some(node);
        self
    }

    fn with_to(mut self, node: Node) -> Self {
        self.base_mut().to = Some(node);
        self
    }

    fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.base_mut()
            .metadata
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }
}

macro_rules! envelope_kind {
    ($($kind:ident),+ $(,)?) => {
        $(
            impl EnvelopeFields for $kind {
                fn base(&self) -> &EnvelopeBase {
                    &self.base
                }

                fn base_mut(&mut self) -> &mut EnvelopeBase {
                    &mut self.base
                }
            }

            impl From<$kind> for Envelope {
                fn from(envelope: $kind) -> Self {
                    Envelope::$kind(envelope)
                }
            }
        )+
    };
}

envelope_kind!(Message, Notification, Command, Session);

/// Tag of a concrete envelope kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    Message,
    Notification,
    Command,
    Session,
}

impl EnvelopeKind {
    /// Discriminating keys in priority order. The first key present in a payload
    /// decides its kind, whatever other discriminators it also carries.
    pub const PRIORITY: [EnvelopeKind; 4] = [
        EnvelopeKind::Command,
        EnvelopeKind::Notification,
        EnvelopeKind::Message,
        EnvelopeKind::Session,
    ];

    pub fn discriminator(self) -> &'static str {
        match self {
            EnvelopeKind::Command => "method",
            EnvelopeKind::Notification => "event",
            EnvelopeKind::Message => "content",
            EnvelopeKind::Session => "state",
        }
    }

    /// Determines the kind of an untyped payload from its top-level keys.
    pub fn detect(map: &Map<String, Value>) -> Option<EnvelopeKind> {
        Self::PRIORITY
            .into_iter()
            .find(|kind| map.contains_key(kind.discriminator()))
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EnvelopeKind::Message => "message",
            EnvelopeKind::Notification => "notification",
            EnvelopeKind::Command => "command",
            EnvelopeKind::Session => "session",
        };
        f.write_str(name)
    }
}

/// Any envelope that can travel on a channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Envelope {
    Message(Message),
    Notification(Notification),
    Command(Command),
    Session(Session),
}

impl Envelope {
    /// Decodes an untyped JSON object into its concrete kind.
    ///
    /// # Errors
    /// `UnknownEnvelopeKind` when no discriminating key is present, and
    /// `MalformedEnvelope` when the payload does not fit the detected kind.
    pub fn from_json_map(map: Map<String, Value>) -> Result<Envelope, EnvelopeError> {
        let kind = EnvelopeKind::detect(&map).ok_or(EnvelopeError::UnknownEnvelopeKind)?;
        let value = Value::Object(map);
        let envelope = match kind {
            EnvelopeKind::Command => Envelope::Command(serde_json::from_value(value)?),
            EnvelopeKind::Notification => Envelope::Notification(serde_json::from_value(value)?),
            EnvelopeKind::Message => Envelope::Message(serde_json::from_value(value)?),
            EnvelopeKind::Session => Envelope::Session(serde_json::from_value(value)?),
        };
        Ok(envelope)
    }

    /// Decodes an envelope from JSON bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Envelope, EnvelopeError> {
        let map: Map<String, Value> = serde_json::from_slice(bytes)?;
        Self::from_json_map(map)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, EnvelopeError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Envelope::Message(_) => EnvelopeKind::Message,
            Envelope::Notification(_) => EnvelopeKind::Notification,
            Envelope::Command(_) => EnvelopeKind::Command,
            Envelope::Session(_) => EnvelopeKind::Session,
        }
    }

    pub fn base(&self) -> &EnvelopeBase {
        match self {
            Envelope::Message(e) => &e.base,
            Envelope::Notification(e) => &e.base,
            Envelope::Command(e) => &e.base,
            Envelope::Session(e) => &e.base,
        }
    }

    pub fn id(&self) -> &str {
        &self.base().id
    }
}

impl<'de> Deserialize<'de> for Envelope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let map = Map::<String, Value>::deserialize(deserializer)?;
        Envelope::from_json_map(map).map_err(serde::de::Error::custom)
    }
}
