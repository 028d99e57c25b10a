use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Address of a protocol participant, written as `name@domain/instance`.
///
/// A node with every fragment empty is the zero node. Envelope addressing treats it
/// the same as an absent node, because the wire form has no way to carry an
/// explicitly empty address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Node {
    pub name: String,
    pub domain: String,
    pub instance: String,
}

impl Node {
    pub fn new(
        name: impl Into<String>,
        domain: impl Into<String>,
        instance: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            domain: domain.into(),
            instance: instance.into(),
        }
    }

    /// Returns `true` when name, domain and instance are all empty.
    pub fn is_zero(&self) -> bool {
        self.name.is_empty() && self.domain.is_empty() && self.instance.is_empty()
    }

    /// Same node without the instance fragment (`name@domain`).
    pub fn to_identity(&self) -> Node {
        Node {
            name: self.name.clone(),
            domain: self.domain.clone(),
            instance: String::new(),
        }
    }

    /// Copy of this node bound to another instance.
    pub fn with_instance(&self, instance: impl Into<String>) -> Node {
        Node {
            name: self.name.clone(),
            domain: self.domain.clone(),
            instance: instance.into(),
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if !self.domain.is_empty() {
            write!(f, "@{}", self.domain)?;
        }
        if !self.instance.is_empty() {
            write!(f, "/{}", self.instance)?;
        }
        Ok(())
    }
}

impl FromStr for Node {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (identity, instance) = match s.split_once('/') {
            Some((identity, instance)) => (identity, instance),
            None => (s, ""),
        };
        let (name, domain) = match identity.split_once('@') {
            Some((name, domain)) => (name, domain),
            None => (identity, ""),
        };
        Ok(Node::new(name, domain, instance))
    }
}

impl From<&str> for Node {
    fn from(s: &str) -> Self {
        match s.parse() {
            Ok(node) => node,
            Err(never) => match never {},
        }
    }
}

impl Serialize for Node {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Node {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Ok(Node::from(text.as_str()))
    }
}

/// Serde helpers for optional addressing fields.
///
/// `None` and the zero node are both written as a missing key; an empty string on
/// the wire reads back as `None`.
pub(crate) mod optional {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::Node;

    pub(crate) fn is_absent(node: &Option<Node>) -> bool {
        node.as_ref().map_or(true, Node::is_zero)
    }

    pub(crate) fn serialize<S: Serializer>(
        node: &Option<Node>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match node {
            Some(node) if !node.is_zero() => serializer.collect_str(node),
            _ => serializer.serialize_none(),
        }
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Node>, D::Error> {
        let text = Option::<String>::deserialize(deserializer)?;
        Ok(text
            .map(|t| Node::from(t.as_str()))
            .filter(|node| !node.is_zero()))
    }
}
