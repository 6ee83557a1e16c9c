//! Flattening catalog events into stats rows.

use chrono::{DateTime, Utc};
use outbox_relay_core::event::{CommentEvent, LikeEvent, RegistrationEvent, TopicEvent, ViewEvent};

/// The columns of a `stats_events` row an event contributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsFact {
    /// Profile that acted (registered, viewed, liked, commented)
    pub actor_id: i64,
    /// Post acted on, if any
    pub post_id: Option<i64>,
    /// Author of that post, if any
    pub author_id: Option<i64>,
    /// When the action happened
    pub occurred_at: DateTime<Utc>,
}

/// A catalog event the stats sink can store.
pub trait StatsEvent: TopicEvent {
    /// Flatten into a stats row.
    fn fact(&self) -> StatsFact;
}

impl StatsEvent for RegistrationEvent {
    fn fact(&self) -> StatsFact {
        StatsFact {
            actor_id: self.profile_id,
            post_id: None,
            author_id: None,
            occurred_at: self.registered_at,
        }
    }
}

impl StatsEvent for ViewEvent {
    fn fact(&self) -> StatsFact {
        StatsFact {
            actor_id: self.viewer_id,
            post_id: Some(self.post_id),
            author_id: Some(self.author_id),
            occurred_at: self.viewed_at,
        }
    }
}

impl StatsEvent for LikeEvent {
    fn fact(&self) -> StatsFact {
        StatsFact {
            actor_id: self.liker_id,
            post_id: Some(self.post_id),
            author_id: Some(self.author_id),
            occurred_at: self.liked_at,
        }
    }
}

impl StatsEvent for CommentEvent {
    fn fact(&self) -> StatsFact {
        StatsFact {
            actor_id: self.commenter_id,
            post_id: Some(self.post_id),
            author_id: Some(self.author_id),
            occurred_at: self.commented_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_has_no_post() {
        let now = Utc::now();
        let fact = RegistrationEvent {
            profile_id: 12,
            registered_at: now,
        }
        .fact();
        assert_eq!(fact.actor_id, 12);
        assert_eq!(fact.post_id, None);
        assert_eq!(fact.author_id, None);
        assert_eq!(fact.occurred_at, now);
    }

    #[test]
    fn comment_actor_is_the_commenter() {
        let fact = CommentEvent {
            comment_id: 1,
            post_id: 2,
            commenter_id: 3,
            author_id: 4,
            commented_at: Utc::now(),
        }
        .fact();
        assert_eq!((fact.actor_id, fact.post_id, fact.author_id), (3, Some(2), Some(4)));
    }
}
