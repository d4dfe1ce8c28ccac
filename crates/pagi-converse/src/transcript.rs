//! Turns and the ordered transcript they are appended to.
//!
//! The transcript is append-only from the coordinator's side: optimistic user
//! turns are appended before the backend answers and removed again (by id) when
//! the submission fails. An external refresh may replace the whole sequence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

/// Identifier of a turn. Optimistic turns carry a `temp-` prefix until the
/// server copy replaces them on the next refresh.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TurnId(pub String);

impl TurnId {
    pub fn optimistic() -> Self {
        Self(format!("temp-{}", uuid::Uuid::new_v4()))
    }

    pub fn is_optimistic(&self) -> bool {
        self.0.starts_with("temp-")
    }
}

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadState {
    Pending,
    Ready,
}

/// An uploaded image waiting to ride along with the next outgoing turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachedMedia {
    pub id: String,
    pub artifact_id: String,
    pub url: String,
    pub upload_state: UploadState,
}

/// One user or assistant message. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Turn {
    pub id: TurnId,
    pub role: Role,
    #[serde(rename = "content")]
    pub text: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub originated_from_voice: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attached_media: Option<AttachedMedia>,
    #[serde(default, rename = "audioPath", skip_serializing_if = "Option::is_none")]
    pub spoken_reply_ref: Option<String>,
}

impl Turn {
    /// Optimistic user turn, appended before the backend has confirmed it.
    pub fn user(text: impl Into<String>, originated_from_voice: bool, media: Option<AttachedMedia>) -> Self {
        Self {
            id: TurnId::optimistic(),
            role: Role::User,
            text: text.into(),
            created_at: Utc::now(),
            originated_from_voice,
            attached_media: media,
            spoken_reply_ref: None,
        }
    }

    pub fn assistant(text: impl Into<String>, spoken_reply_ref: Option<String>) -> Self {
        Self {
            id: TurnId::optimistic(),
            role: Role::Assistant,
            text: text.into(),
            created_at: Utc::now(),
            originated_from_voice: false,
            attached_media: None,
            spoken_reply_ref,
        }
    }
}

/// Ordered, append-only sequence of turns. Creation order is non-decreasing.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    turns: Vec<Turn>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a turn. A timestamp earlier than the last turn (wall clock stepped
    /// back) is raised to the last timestamp so ordering holds.
    pub fn append(&mut self, mut turn: Turn) {
        if let Some(last) = self.turns.last() {
            if turn.created_at < last.created_at {
                turn.created_at = last.created_at;
            }
        }
        self.turns.push(turn);
    }

    /// Remove a turn by id (optimistic rollback). Returns the removed turn.
    pub fn remove(&mut self, id: &TurnId) -> Option<Turn> {
        let pos = self.turns.iter().position(|t| &t.id == id)?;
        Some(self.turns.remove(pos))
    }

    /// Replace the whole transcript (external refresh). The server's order is
    /// kept as given; an out-of-order list is only reported.
    pub fn replace(&mut self, turns: Vec<Turn>) {
        if let Some(pair) = turns.windows(2).find(|pair| pair[1].created_at < pair[0].created_at) {
            warn!(
                "Server transcript out of creation order at turn {} ({} after {})",
                pair[1].id, pair[1].created_at, pair[0].created_at
            );
        }
        self.turns = turns;
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    pub fn contains(&self, id: &TurnId) -> bool {
        self.turns.iter().any(|t| &t.id == id)
    }
}
