//! The unit of exchange between the hub, its controllers and edge nodes.
//!
//! A [`Message`] travels as one CBOR document per transport frame.

use std::fmt::{self, Display};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use edgehub_attestation::NodeId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

/// Source label of messages generated by the hub itself.
pub const HUB_SOURCE: &str = "edgehub";

/// What a message asks the receiver to do.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Create a resource.
    Insert,
    /// Update a resource.
    Update,
    /// Delete a resource.
    Delete,
    /// Ask the receiver for something.
    Request,
    /// Answer a message; `parent_id` names it.
    Response,
    /// Liveness signal from a node.
    Keepalive,
    /// A node connected to the hub.
    Connect,
    /// A node disconnected from the hub.
    Disconnect,
}

impl Operation {
    /// Wire name of the operation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Request => "request",
            Self::Response => "response",
            Self::Keepalive => "keepalive",
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
        }
    }
}

impl Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque payload with its declared content type.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Content {
    /// Media type of `data`.
    pub content_type: String,

    /// Payload bytes.
    pub data: Bytes,
}

/// A control-plane message.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Message {
    /// Unique id, assigned by the hub on dispatch when empty.
    pub id: String,

    /// Id of the message being answered; empty for originals.
    pub parent_id: String,

    /// Milliseconds since the Unix epoch at the origin.
    pub timestamp: i64,

    /// Module that produced the message.
    pub source: String,

    /// Logical group channel.
    pub group: String,

    /// Target path, `node/<node id>/<type>/<name>`.
    pub resource: String,

    /// Requested operation.
    pub operation: Operation,

    /// Payload.
    pub content: Content,
}

impl Message {
    /// Create an original message with an empty id and the current timestamp.
    pub fn new(
        source: impl Into<String>,
        group: impl Into<String>,
        resource: impl Into<String>,
        operation: Operation,
    ) -> Self {
        Self {
            id: String::new(),
            parent_id: String::new(),
            timestamp: now_millis(),
            source: source.into(),
            group: group.into(),
            resource: resource.into(),
            operation,
            content: Content::default(),
        }
    }

    /// Attach a payload.
    #[must_use]
    pub fn with_content(mut self, content_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        self.content = Content {
            content_type: content_type.into(),
            data: data.into(),
        };
        self
    }

    /// Build the response to `original`, which acknowledges it.
    pub fn response_to(original: &Self, source: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            parent_id: original.id.clone(),
            timestamp: now_millis(),
            source: source.into(),
            group: original.group.clone(),
            resource: original.resource.clone(),
            operation: Operation::Response,
            content: Content::default(),
        }
    }

    /// A keepalive message.
    pub fn keepalive(source: impl Into<String>) -> Self {
        Self::new(source, "", "", Operation::Keepalive)
    }

    /// Whether this message acknowledges an earlier one.
    #[must_use]
    pub fn is_ack(&self) -> bool {
        self.operation == Operation::Response && !self.parent_id.is_empty()
    }

    /// Whether the receiver must acknowledge this message. Responses and
    /// keepalives are delivered once and never retransmitted.
    #[must_use]
    pub fn requires_ack(&self) -> bool {
        !matches!(self.operation, Operation::Response | Operation::Keepalive)
    }

    /// Node addressed by the resource, if any.
    #[must_use]
    pub fn node_id(&self) -> Option<NodeId> {
        node_from_resource(&self.resource).map(NodeId::from)
    }

    /// Resource type segment following the node id, if any.
    #[must_use]
    pub fn resource_type(&self) -> Option<&str> {
        resource_type(&self.resource)
    }

    /// Serialize into one frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Codec`] if serialization fails.
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = Vec::with_capacity(128 + self.content.data.len());
        ciborium::into_writer(self, &mut buf).map_err(|e| Error::Codec(e.to_string()))?;
        Ok(Bytes::from(buf))
    }

    /// Parse one frame and check its required fields.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Codec`] if the frame is not a valid message.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let message: Self =
            ciborium::from_reader(frame).map_err(|e| Error::Codec(e.to_string()))?;

        if message.resource.is_empty()
            && message.parent_id.is_empty()
            && message.operation != Operation::Keepalive
        {
            return Err(Error::Codec(format!(
                "{} message {:?} has no resource",
                message.operation, message.id
            )));
        }

        Ok(message)
    }
}

/// The node named by a resource path: the first non-empty segment after a
/// `node` segment.
#[must_use]
pub fn node_from_resource(resource: &str) -> Option<&str> {
    let mut segments = resource.split('/');
    segments.find(|segment| *segment == "node")?;
    segments.find(|segment| !segment.is_empty())
}

/// The resource type: the first non-empty segment after the node id.
#[must_use]
pub fn resource_type(resource: &str) -> Option<&str> {
    let mut segments = resource.split('/');
    segments.find(|segment| *segment == "node")?;
    segments.find(|segment| !segment.is_empty())?;
    segments.find(|segment| !segment.is_empty())
}

/// Current wall-clock time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| {
            i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_preserves_every_field() {
        let mut message = Message::new("controller", "edged", "node/node-a/pod/p1", Operation::Update)
            .with_content("application/json", Bytes::from_static(b"{\"x\":\"\\u0000\xff\"}"));
        message.id = "m1".to_string();
        message.parent_id = "p0".to_string();

        let decoded = Message::decode(&message.encode().unwrap()).unwrap();

        assert_eq!(decoded, message);
    }

    #[test]
    fn test_malformed_frames_are_rejected() {
        assert!(matches!(
            Message::decode(b"\xff\x00garbage"),
            Err(Error::Codec(_))
        ));

        let orphan = Message::new("edged", "twin", "", Operation::Update);
        assert!(matches!(
            Message::decode(&orphan.encode().unwrap()),
            Err(Error::Codec(_))
        ));

        let keepalive = Message::keepalive("edged");
        assert_eq!(
            Message::decode(&keepalive.encode().unwrap())
                .unwrap()
                .operation,
            Operation::Keepalive
        );
    }

    #[test]
    fn test_node_and_type_come_from_resource() {
        assert_eq!(node_from_resource("node/node-a/pod/p1"), Some("node-a"));
        assert_eq!(resource_type("node/node-a/pod/p1"), Some("pod"));
        assert_eq!(node_from_resource("default/node//node-b/twin"), Some("node-b"));
        assert_eq!(resource_type("default/node//node-b/twin"), Some("twin"));
        assert_eq!(node_from_resource("node/node-c"), Some("node-c"));
        assert_eq!(resource_type("node/node-c"), None);
        assert_eq!(node_from_resource("pod/p1"), None);
        assert_eq!(node_from_resource("node/"), None);
    }

    #[test]
    fn test_response_acknowledges_original() {
        let mut original = Message::new("controller", "edged", "node/node-a/pod/p1", Operation::Insert);
        original.id = "m1".to_string();

        let response = Message::response_to(&original, "edged");

        assert!(response.is_ack());
        assert!(!response.requires_ack());
        assert_eq!(response.parent_id, "m1");
        assert_ne!(response.id, original.id);
        assert!(original.requires_ack());
        assert!(!original.is_ack());
    }
}
