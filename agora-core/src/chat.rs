//! Chat entity kinds — the payloads the generic engine is instantiated with.
//!
//! One payload type per collection kind:
//!
//! | Collection          | Payload        |
//! |---------------------|----------------|
//! | Channel messages    | [`MessageBody`] |
//! | DM thread messages  | [`MessageBody`] |
//! | Server roster       | [`MemberBody`]  |
//! | Online members      | [`PresenceBody`]|
//!
//! Channel and DM messages share a shape; they differ only in which
//! collection id they live under.

use crate::Reactable;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Reaction key → set of users who reacted.
///
/// The count of a reaction is the size of its user set; storing only the
/// set makes the count-equals-set-size invariant hold by construction,
/// including under redundant toggles by the same user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReactionMap {
    entries: BTreeMap<String, BTreeSet<Uuid>>,
}

impl ReactionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `user` to the reaction `key`. Returns false if already present.
    pub fn add(&mut self, key: &str, user: Uuid) -> bool {
        self.entries.entry(key.to_string()).or_default().insert(user)
    }

    /// Remove `user` from the reaction `key`; drops the key once empty.
    /// Returns false if the user had not reacted.
    pub fn remove(&mut self, key: &str, user: Uuid) -> bool {
        match self.entries.get_mut(key) {
            Some(users) => {
                let removed = users.remove(&user);
                if users.is_empty() {
                    self.entries.remove(key);
                }
                removed
            }
            None => false,
        }
    }

    /// Number of users behind a reaction key.
    pub fn count(&self, key: &str) -> usize {
        self.entries.get(key).map_or(0, BTreeSet::len)
    }

    /// Whether `user` has reacted with `key`.
    pub fn has_reacted(&self, key: &str, user: Uuid) -> bool {
        self.entries.get(key).is_some_and(|users| users.contains(&user))
    }

    /// The users behind a reaction key.
    pub fn users(&self, key: &str) -> Option<&BTreeSet<Uuid>> {
        self.entries.get(key)
    }

    /// All reaction keys, sorted.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Total reactions across all keys.
    pub fn total(&self) -> usize {
        self.entries.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A channel or DM message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageBody {
    /// Author identity.
    pub author_id: Uuid,
    /// Author display name at send time.
    pub author_name: String,
    /// Message text.
    pub content: String,
    /// Set once the message has been edited.
    pub edited: bool,
    /// Reactions on this message.
    pub reactions: ReactionMap,
    /// Open-ended attachment/embed descriptors, shape owned by the server.
    pub attachments: Vec<Value>,
}

impl MessageBody {
    pub fn new(author_id: Uuid, author_name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            author_id,
            author_name: author_name.into(),
            content: content.into(),
            edited: false,
            reactions: ReactionMap::new(),
            attachments: Vec::new(),
        }
    }

    /// Copy of this body with new content and the edited flag set.
    pub fn edited_with(&self, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            edited: true,
            ..self.clone()
        }
    }
}

impl Reactable for MessageBody {
    fn toggle_reaction(&mut self, key: &str, user: Uuid, add: bool) {
        if add {
            self.reactions.add(key, user);
        } else {
            self.reactions.remove(key, user);
        }
    }
}

/// Role of a member within a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberRole {
    Owner,
    Moderator,
    Member,
}

/// A server roster row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberBody {
    pub user_id: Uuid,
    pub display_name: String,
    pub role: MemberRole,
}

impl MemberBody {
    pub fn new(user_id: Uuid, display_name: impl Into<String>, role: MemberRole) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
            role,
        }
    }
}

/// Presence status of an online member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresenceStatus {
    Online,
    Idle,
    DoNotDisturb,
}

/// An online-member record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceBody {
    pub user_id: Uuid,
    pub display_name: String,
    pub status: PresenceStatus,
    /// When the member came online, in milliseconds.
    pub since_ms: u64,
}

impl PresenceBody {
    pub fn new(user_id: Uuid, display_name: impl Into<String>, status: PresenceStatus) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
            status,
            since_ms: 0,
        }
    }
}
