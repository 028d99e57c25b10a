use serde::{Deserialize, Serialize};

use super::{EnvelopeBase, Reason};

/// Stage of a message's processing reported back to its sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationEvent {
    Accepted,
    Validated,
    Authorized,
    Dispatched,
    Received,
    Consumed,
    Failed,
}

/// Information about events associated with a previously sent message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(flatten)]
    pub base: EnvelopeBase,
    pub event: NotificationEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,
}

impl Notification {
    /// Notification about the envelope identified by `id`.
    pub fn new(id: impl Into<String>, event: NotificationEvent) -> Self {
        Self {
            base: EnvelopeBase {
                id: id.into(),
                ..EnvelopeBase::default()
            },
            event,
            reason: None,
        }
    }

    pub fn failed(id: impl Into<String>, reason: Reason) -> Self {
        Self {
            reason: Some(reason),
            ..Self::new(id, NotificationEvent::Failed)
        }
    }
}
