//! Prompt assembly: instruction + content (+ page image) → ordered messages.
//!
//! Every model call in the refinement and translation engines goes through
//! [`build_messages`] or [`build_messages_with_role`], so the request shape is
//! the same everywhere:
//!
//! ```text
//! [0] instruction   (User, or System when the caller asks for it)
//! [1] content       (User)
//! [2] page image    (User, only when an image is given)
//! ```
//!
//! The image always goes last so the model reads the instruction and the text
//! before looking at the raster. Building is pure; nothing here touches the
//! network.

use crate::pipeline::encode::PageImage;
use serde::{Deserialize, Serialize};

/// Speaker of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
}

/// Payload of a message: either text or one inline image attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageContent {
    Text(String),
    Image(PageImage),
}

/// One entry of a completion request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn image(image: PageImage) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Image(image),
        }
    }

    /// The text payload, if this is a text message.
    pub fn text(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Text(t) => Some(t),
            MessageContent::Image(_) => None,
        }
    }

    pub fn is_image(&self) -> bool {
        matches!(self.content, MessageContent::Image(_))
    }
}

/// Build `[instruction, content, image?]` with a user-role instruction.
pub fn build_messages(instruction: &str, content: &str, image: Option<&PageImage>) -> Vec<Message> {
    build_messages_with_role(Role::User, instruction, content, image)
}

/// Build `[instruction, content, image?]` with the instruction sent as `role`.
pub fn build_messages_with_role(
    role: Role,
    instruction: &str,
    content: &str,
    image: Option<&PageImage>,
) -> Vec<Message> {
    let mut messages = Vec::with_capacity(3);
    messages.push(Message {
        role,
        content: MessageContent::Text(instruction.to_string()),
    });
    messages.push(Message::user(content));
    if let Some(img) = image {
        messages.push(Message::image(img.clone()));
    }
    messages
}
