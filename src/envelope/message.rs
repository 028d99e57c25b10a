use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;

use super::EnvelopeBase;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid media type: {0:?}")]
pub struct MediaTypeError(pub String);

/// MIME media type of a message content or command resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MediaType {
    pub r#type: String,
    pub subtype: String,
    pub suffix: Option<String>,
}

impl MediaType {
    pub fn new(r#type: impl Into<String>, subtype: impl Into<String>) -> Self {
        Self {
            r#type: r#type.into(),
            subtype: subtype.into(),
            suffix: None,
        }
    }

    pub fn text_plain() -> Self {
        Self::new("text", "plain")
    }

    pub fn application_json() -> Self {
        Self::new("application", "json")
    }

    /// Returns `true` when the content is JSON, either directly or through a `+json` suffix.
    pub fn is_json(&self) -> bool {
        self.subtype == "json" || self.suffix.as_deref() == Some("json")
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.r#type, self.subtype)?;
        if let Some(suffix) = &self.suffix {
            write!(f, "+{}", suffix)?;
        }
        Ok(())
    }
}

impl FromStr for MediaType {
    type Err = MediaTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (r#type, rest) = s
            .split_once('/')
            .ok_or_else(|| MediaTypeError(s.to_string()))?;
        // parameters such as "; charset=utf-8" are not carried
        let rest = rest.split(';').next().unwrap_or_default().trim();
        let (subtype, suffix) = match rest.split_once('+') {
            Some((subtype, suffix)) => (subtype, Some(suffix.to_string())),
            None => (rest, None),
        };
        if r#type.is_empty() || subtype.is_empty() {
            return Err(MediaTypeError(s.to_string()));
        }
        Ok(Self {
            r#type: r#type.to_string(),
            subtype: subtype.to_string(),
            suffix,
        })
    }
}

impl Serialize for MediaType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MediaType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Content exchanged between nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(flatten)]
    pub base: EnvelopeBase,
    #[serde(rename = "type")]
    pub content_type: MediaType,
    pub content: Value,
}

impl Message {
    /// New message with a generated id.
    pub fn new(content_type: MediaType, content: Value) -> Self {
        Self {
            base: EnvelopeBase::with_new_id(),
            content_type,
            content,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(MediaType::text_plain(), Value::String(text.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EnvelopeFields;
    use crate::node::Node;
    use serde_json::json;

    #[test]
    fn media_type_parses_suffix() {
        let media: MediaType = "application/vnd.lime.account+json".parse().unwrap();
        assert_eq!(media.subtype, "vnd.lime.account");
        assert_eq!(media.suffix.as_deref(), Some("json"));
        assert!(media.is_json());
        assert_eq!(media.to_string(), "application/vnd.lime.account+json");
    }

    #[test]
    fn media_type_rejects_missing_subtype() {
        assert!("text".parse::<MediaType>().is_err());
        assert!("text/".parse::<MediaType>().is_err());
    }

    #[test]
    fn message_wire_shape() {
        let message = Message::text("hello")
            .with_id("m1")
            .with_to(Node::from("alice@limeprotocol.org/home"));
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(
            value,
            json!({
                "id": "m1",
                "to": "alice@limeprotocol.org/home",
                "type": "text/plain",
                "content": "hello"
            })
        );
    }
}
