//! Domain event catalog and payload encoding.
//!
//! Every event category the social backend emits has its own topic and its own
//! statically-known Rust type. There is no schema registry: the contract between
//! producer and consumer is the topic name plus the bincode encoding of the type
//! registered for that topic.
//!
//! # Design
//!
//! Payloads are encoded with `bincode`. Outbox rows store the encoded bytes as an
//! opaque blob and the relay never looks inside them; only the consumer-side
//! topic worker decodes them, using the type bound to the topic it consumes.
//!
//! # Example
//!
//! ```
//! use outbox_relay_core::event::{Topic, TopicEvent, ViewEvent};
//! use chrono::Utc;
//!
//! let event = ViewEvent {
//!     post_id: 7,
//!     viewer_id: 42,
//!     author_id: 3,
//!     viewed_at: Utc::now(),
//! };
//!
//! let bytes = event.encode().unwrap();
//! assert_eq!(ViewEvent::TOPIC, Topic::View);
//! assert_eq!(ViewEvent::decode(&bytes).unwrap(), event);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt;
use thiserror::Error;

/// Error types for payload encoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    /// Failed to encode an event to bytes.
    #[error("Failed to encode {topic} event: {reason}")]
    Encode {
        /// Topic of the event being encoded
        topic: Topic,
        /// Underlying codec error
        reason: String,
    },

    /// Failed to decode bytes into the event type bound to a topic.
    #[error("Failed to decode {topic} event: {reason}")]
    Decode {
        /// Topic the payload was consumed from
        topic: Topic,
        /// Underlying codec error
        reason: String,
    },

    /// Topic name does not belong to the catalog.
    #[error("Unknown topic: {0}")]
    UnknownTopic(String),
}

/// The closed set of event topics.
///
/// One topic exists per domain event category. The string form is both the
/// outbox row's `event_type` and the broker topic name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Topic {
    /// A new profile was registered (accounts service)
    Registration,
    /// A post was viewed (posts service)
    View,
    /// A post was liked (posts service)
    Like,
    /// A comment was left on a post (posts service)
    Comment,
}

impl Topic {
    /// Every topic in the catalog, in declaration order.
    pub const ALL: [Self; 4] = [Self::Registration, Self::View, Self::Like, Self::Comment];

    /// Topic name as used in the outbox table and on the broker.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Registration => "registration",
            Self::View => "view",
            Self::Like => "like",
            Self::Comment => "comment",
        }
    }

    /// Parse a topic name.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::UnknownTopic`] if the name is not in the catalog.
    pub fn parse(s: &str) -> Result<Self, EventError> {
        match s {
            "registration" => Ok(Self::Registration),
            "view" => Ok(Self::View),
            "like" => Ok(Self::Like),
            "comment" => Ok(Self::Comment),
            other => Err(EventError::UnknownTopic(other.to_string())),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event type bound to exactly one topic.
///
/// Topic workers are generic over this trait, so dispatch from topic to
/// decoder is resolved at compile time rather than by matching on strings.
///
/// # Thread Safety
///
/// Events cross the fetch/flush task boundary, so they must be `Send + Sync + 'static`.
pub trait TopicEvent: Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static {
    /// The topic this event type is published to.
    const TOPIC: Topic;

    /// Encode this event to bincode bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Encode`] if the event cannot be serialized.
    fn encode(&self) -> Result<Vec<u8>, EventError> {
        bincode::serialize(self).map_err(|e| EventError::Encode {
            topic: Self::TOPIC,
            reason: e.to_string(),
        })
    }

    /// Decode an event from bincode bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Decode`] if the bytes are corrupted or were encoded
    /// from a different type.
    fn decode(bytes: &[u8]) -> Result<Self, EventError> {
        bincode::deserialize(bytes).map_err(|e| EventError::Decode {
            topic: Self::TOPIC,
            reason: e.to_string(),
        })
    }
}

/// A profile was registered.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationEvent {
    /// The new profile
    pub profile_id: i64,
    /// When the registration committed
    pub registered_at: DateTime<Utc>,
}

impl TopicEvent for RegistrationEvent {
    const TOPIC: Topic = Topic::Registration;
}

/// A post was viewed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewEvent {
    /// The viewed post
    pub post_id: i64,
    /// Who viewed it
    pub viewer_id: i64,
    /// Author of the post
    pub author_id: i64,
    /// When the view was recorded
    pub viewed_at: DateTime<Utc>,
}

impl TopicEvent for ViewEvent {
    const TOPIC: Topic = Topic::View;
}

/// A post was liked.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LikeEvent {
    /// The liked post
    pub post_id: i64,
    /// Who liked it
    pub liker_id: i64,
    /// Author of the post
    pub author_id: i64,
    /// When the like was recorded
    pub liked_at: DateTime<Utc>,
}

impl TopicEvent for LikeEvent {
    const TOPIC: Topic = Topic::Like;
}

/// A comment was left on a post.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentEvent {
    /// The new comment
    pub comment_id: i64,
    /// The post it belongs to
    pub post_id: i64,
    /// Who wrote it
    pub commenter_id: i64,
    /// Author of the post
    pub author_id: i64,
    /// When the comment was created
    pub commented_at: DateTime<Utc>,
}

impl TopicEvent for CommentEvent {
    const TOPIC: Topic = Topic::Comment;
}

#[cfg(test)]
#[allow(clippy::expect_used)] // Panics: Test will fail if encoding fails
mod tests {
    use super::*;

    fn like() -> LikeEvent {
        LikeEvent {
            post_id: 10,
            liker_id: 20,
            author_id: 30,
            liked_at: DateTime::from_timestamp(1_700_000_000, 0).expect("valid timestamp"),
        }
    }

    #[test]
    fn topic_names_round_trip_through_parse() {
        for topic in Topic::ALL {
            assert_eq!(Topic::parse(topic.as_str()), Ok(topic));
        }
    }

    #[test]
    fn unknown_topic_is_rejected() {
        assert_eq!(
            Topic::parse("follow"),
            Err(EventError::UnknownTopic("follow".to_string()))
        );
    }

    #[test]
    fn each_event_type_is_bound_to_its_own_topic() {
        assert_eq!(RegistrationEvent::TOPIC.as_str(), "registration");
        assert_eq!(ViewEvent::TOPIC.as_str(), "view");
        assert_eq!(LikeEvent::TOPIC.as_str(), "like");
        assert_eq!(CommentEvent::TOPIC.as_str(), "comment");
    }

    #[test]
    fn decode_recovers_encoded_event() {
        let event = like();
        let bytes = event.encode().expect("encoding should succeed");
        assert_eq!(LikeEvent::decode(&bytes).expect("decoding should succeed"), event);
    }

    #[test]
    fn truncated_payload_fails_with_topic_context() {
        let bytes = like().encode().expect("encoding should succeed");
        let err = LikeEvent::decode(&bytes[..3]).expect_err("truncated payload must not decode");
        assert!(matches!(err, EventError::Decode { topic: Topic::Like, .. }));
        assert!(err.to_string().contains("like"));
    }
}
