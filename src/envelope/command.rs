use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{EnvelopeBase, MediaType, Reason};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandMethod {
    Get,
    Set,
    Delete,
    Observe,
    Subscribe,
    Unsubscribe,
    Merge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Success,
    Failure,
}

/// Request or response that manipulates a resource on the remote node.
///
/// A command carrying a `status` is a response; it shares the request's `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    #[serde(flatten)]
    pub base: EnvelopeBase,
    pub method: CommandMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<MediaType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<CommandStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,
}

impl Command {
    /// New request with a generated id.
    pub fn new(method: CommandMethod, uri: impl Into<String>) -> Self {
        Self {
            base: EnvelopeBase::with_new_id(),
            method,
            uri: Some(uri.into()),
            resource_type: None,
            resource: None,
            status: None,
            reason: None,
        }
    }

    pub fn with_resource(mut self, resource_type: MediaType, resource: Value) -> Self {
        self.resource_type = Some(resource_type);
        self.resource = Some(resource);
        self
    }

    pub fn is_response(&self) -> bool {
        self.status.is_some()
    }

    /// Successful response to this request, optionally returning a resource.
    pub fn success_response(&self, resource: Option<(MediaType, Value)>) -> Command {
        let (resource_type, resource) = match resource {
            Some((media, value)) => (Some(media), Some(value)),
            None => (None, None),
        };
        Command {
            base: self.response_base(),
            method: self.method,
            uri: None,
            resource_type,
            resource,
            status: Some(CommandStatus::Success),
            reason: None,
        }
    }

    pub fn failure_response(&self, reason: Reason) -> Command {
        Command {
            base: self.response_base(),
            method: self.method,
            uri: None,
            resource_type: None,
            resource: None,
            status: Some(CommandStatus::Failure),
            reason: Some(reason),
        }
    }

    fn response_base(&self) -> EnvelopeBase {
        EnvelopeBase {
            id: self.base.id.clone(),
            from: self.base.to.clone(),
            pp: None,
            to: self.base.from.clone(),
            metadata: None,
        }
    }
}
