use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::media::MediaType;
use crate::payload::ContentBlock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// Which image a user turn was asked about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub name: String,
    pub media_type: MediaType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TurnContent {
    User {
        question: String,
        image: ImageRef,
        blocks: Vec<ContentBlock>,
    },
    Assistant {
        text: String,
    },
}

/// One message of the conversation. Fields are private so a turn cannot be
/// edited after it has been built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationTurn {
    content: TurnContent,
    created_at: String,
}

impl ConversationTurn {
    /// `blocks` is the exact content that goes upstream for this turn.
    pub fn user(question: impl Into<String>, image: ImageRef, blocks: Vec<ContentBlock>) -> Self {
        Self {
            content: TurnContent::User {
                question: question.into(),
                image,
                blocks,
            },
            created_at: now_utc_iso(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            content: TurnContent::Assistant { text: text.into() },
            created_at: now_utc_iso(),
        }
    }

    pub fn role(&self) -> Role {
        match self.content {
            TurnContent::User { .. } => Role::User,
            TurnContent::Assistant { .. } => Role::Assistant,
        }
    }

    pub fn text(&self) -> &str {
        match &self.content {
            TurnContent::User { question, .. } => question,
            TurnContent::Assistant { text } => text,
        }
    }

    pub fn image(&self) -> Option<&ImageRef> {
        match &self.content {
            TurnContent::User { image, .. } => Some(image),
            TurnContent::Assistant { .. } => None,
        }
    }

    pub fn content_blocks(&self) -> Vec<ContentBlock> {
        match &self.content {
            TurnContent::User { blocks, .. } => blocks.clone(),
            TurnContent::Assistant { text } => vec![ContentBlock::text(text.clone())],
        }
    }

    pub fn created_at(&self) -> &str {
        &self.created_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveImage {
    name: String,
    bytes: Vec<u8>,
    media_type: MediaType,
}

impl ActiveImage {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    pub fn image_ref(&self) -> ImageRef {
        ImageRef {
            name: self.name.clone(),
            media_type: self.media_type,
        }
    }
}

/// Ordered turn history bound to at most one active image.
///
/// Changing the active image clears the history inside the same call, so a
/// reader never sees turns that belong to a previous image.
#[derive(Debug, Clone)]
pub struct Session {
    session_id: String,
    turns: Vec<ConversationTurn>,
    active_image: Option<ActiveImage>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            turns: Vec::new(),
            active_image: None,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn active_image(&self) -> Option<&ActiveImage> {
        self.active_image.as_ref()
    }

    pub fn append_turn(&mut self, turn: ConversationTurn) {
        self.turns.push(turn);
    }

    pub fn reset(&mut self) {
        self.turns.clear();
    }

    /// Returns `true` when the image changed and the history was cleared.
    pub fn set_active_image(
        &mut self,
        name: impl Into<String>,
        bytes: Vec<u8>,
        media_type: MediaType,
    ) -> bool {
        let name = name.into();
        let unchanged = self
            .active_image
            .as_ref()
            .map(|current| current.name == name)
            .unwrap_or(false);
        if unchanged {
            return false;
        }
        self.reset();
        self.active_image = Some(ActiveImage {
            name,
            bytes,
            media_type,
        });
        true
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_turn(question: &str, image: &str) -> ConversationTurn {
        ConversationTurn::user(
            question,
            ImageRef {
                name: image.to_string(),
                media_type: MediaType::Png,
            },
            vec![ContentBlock::text(question)],
        )
    }

    #[test]
    fn new_session_is_empty_without_image() {
        let session = Session::new();
        assert!(session.is_empty());
        assert!(session.active_image().is_none());
        assert!(!session.session_id().is_empty());
    }

    #[test]
    fn new_image_clears_history() {
        let mut session = Session::new();
        assert!(session.set_active_image("a.png", vec![1, 2, 3], MediaType::Png));
        session.append_turn(user_turn("What is this?", "a.png"));
        session.append_turn(ConversationTurn::assistant("A cat."));
        assert_eq!(session.len(), 2);

        assert!(session.set_active_image("b.jpg", vec![9], MediaType::Jpeg));
        assert!(session.is_empty());
        let active = session.active_image().unwrap();
        assert_eq!(active.name(), "b.jpg");
        assert_eq!(active.bytes(), &[9]);
        assert_eq!(active.media_type(), MediaType::Jpeg);
    }

    #[test]
    fn same_image_keeps_history_and_original_bytes() {
        let mut session = Session::new();
        session.set_active_image("a.png", vec![1], MediaType::Png);
        session.append_turn(user_turn("What is this?", "a.png"));

        assert!(!session.set_active_image("a.png", vec![2], MediaType::Jpeg));
        assert_eq!(session.len(), 1);
        assert_eq!(session.active_image().unwrap().bytes(), &[1]);
        assert_eq!(session.active_image().unwrap().media_type(), MediaType::Png);
    }

    #[test]
    fn reset_clears_turns_but_keeps_image() {
        let mut session = Session::new();
        session.set_active_image("a.png", vec![1], MediaType::Png);
        session.append_turn(user_turn("Q", "a.png"));
        session.reset();
        assert!(session.is_empty());
        assert_eq!(session.active_image().unwrap().name(), "a.png");
    }

    #[test]
    fn turn_accessors() {
        let user = user_turn("Colors?", "b.png");
        assert_eq!(user.role(), Role::User);
        assert_eq!(user.text(), "Colors?");
        assert_eq!(user.image().map(|image| image.name.as_str()), Some("b.png"));
        assert!(!user.created_at().is_empty());

        let reply = ConversationTurn::assistant("Red and blue.");
        assert_eq!(reply.role(), Role::Assistant);
        assert!(reply.image().is_none());
        assert_eq!(
            reply.content_blocks(),
            vec![ContentBlock::text("Red and blue.")]
        );
    }
}
