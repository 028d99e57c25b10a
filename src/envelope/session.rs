use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{EnvelopeBase, Reason};

/// Protocol-level state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    New,
    Negotiating,
    Authenticating,
    Established,
    Finishing,
    Finished,
    Failed,
}

impl SessionState {
    /// `true` for the states a session never leaves.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Finished | SessionState::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionEncryption {
    None,
    Tls,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionCompression {
    None,
    Gzip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthenticationScheme {
    Guest,
    Plain,
    Key,
    Transport,
    External,
}

/// Session control frame used to negotiate, authenticate and finish a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    #[serde(flatten)]
    pub base: EnvelopeBase,
    pub state: SessionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_options: Option<Vec<SessionEncryption>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption: Option<SessionEncryption>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression_options: Option<Vec<SessionCompression>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<SessionCompression>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme_options: Option<Vec<AuthenticationScheme>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<AuthenticationScheme>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,
}

impl Session {
    pub fn new(state: SessionState) -> Self {
        Self {
            base: EnvelopeBase::default(),
            state,
            encryption_options: None,
            encryption: None,
            compression_options: None,
            compression: None,
            scheme_options: None,
            scheme: None,
            authentication: None,
            reason: None,
        }
    }

    pub fn failed(reason: Reason) -> Self {
        Self {
            reason: Some(reason),
            ..Self::new(SessionState::Failed)
        }
    }

    /// `true` when the remote party offered options the client has to choose from.
    pub fn has_negotiation_options(&self) -> bool {
        self.encryption_options.is_some() || self.compression_options.is_some()
    }
}
