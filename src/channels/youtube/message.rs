//! Canonical chat message form.
//!
//! Both acquisition transports convert their raw records into this shape at
//! the boundary, so the filter/select/dispatch pipeline is transport-blind.

/// Message class, as far as the pipeline cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatMessageKind {
    Text,
    SuperChat,
}

#[derive(Debug, Clone, Default)]
pub struct ChatAuthor {
    pub id: String,
    pub name: String,
    pub is_owner: bool,
    pub is_moderator: bool,
    pub is_sponsor: bool,
}

#[derive(Debug, Clone)]
pub struct SuperChatInfo {
    pub amount_display: String,
    pub currency: String,
    pub user_comment: String,
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub id: String,
    pub kind: ChatMessageKind,
    pub published_at: String,
    pub display_text: String,
    pub author: ChatAuthor,
    pub super_chat: Option<SuperChatInfo>,
}

impl ChatMessage {
    /// A prioritized message is a super-chat or authored by the channel
    /// owner or a moderator.
    pub fn is_priority(&self) -> bool {
        self.super_chat.is_some() || self.author.is_owner || self.author.is_moderator
    }
}

#[cfg(test)]
pub(crate) fn text_message(id: &str, author: &str, text: &str) -> ChatMessage {
    ChatMessage {
        id: id.to_string(),
        kind: ChatMessageKind::Text,
        published_at: String::new(),
        display_text: text.to_string(),
        author: ChatAuthor {
            id: format!("UC-{author}"),
            name: author.to_string(),
            ..Default::default()
        },
        super_chat: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_classification() {
        let mut m = text_message("1", "viewer", "hi");
        assert!(!m.is_priority());

        m.author.is_moderator = true;
        assert!(m.is_priority());

        let mut m = text_message("2", "boss", "hi");
        m.author.is_owner = true;
        assert!(m.is_priority());

        let mut m = text_message("3", "fan", "take my money");
        m.super_chat = Some(SuperChatInfo {
            amount_display: "¥500".to_string(),
            currency: "JPY".to_string(),
            user_comment: "take my money".to_string(),
        });
        assert!(m.is_priority());
    }
}
