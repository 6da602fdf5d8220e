//! Message and event model at the transport boundary.
//!
//! Payloads are a tagged variant union: the engine's transform pipeline
//! only ever touches the text or caption of whichever variant is present,
//! and non-text content rides through untouched.

/// What a message carries.
#[derive(Debug, Clone, PartialEq)]
pub enum MessagePayload {
    /// Plain text message.
    Text { text: String },
    /// A photo with an optional caption.
    Photo { caption: Option<String> },
    /// A video with an optional caption.
    Video { caption: Option<String> },
    /// A generic document; `sticker` marks sticker/animated-emoji documents,
    /// which are delivered without caption processing.
    Document {
        caption: Option<String>,
        sticker: bool,
    },
}

impl MessagePayload {
    /// The text or caption of this payload, if any.
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            Self::Photo { caption } | Self::Video { caption } => caption.as_deref(),
            Self::Document { caption, .. } => caption.as_deref(),
        }
    }

    /// The same payload with its text/caption replaced.
    ///
    /// A caption-less media payload stays caption-less when handed an empty
    /// replacement, and a `Text` payload always keeps its (possibly empty)
    /// body.
    pub fn with_text(self, new_text: String) -> Self {
        let caption = if new_text.is_empty() {
            None
        } else {
            Some(new_text.clone())
        };
        match self {
            Self::Text { .. } => Self::Text { text: new_text },
            Self::Photo { .. } => Self::Photo { caption },
            Self::Video { .. } => Self::Video { caption },
            Self::Document { sticker, .. } => Self::Document { caption, sticker },
        }
    }
}

/// One message as read from a source feed.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Feed-local message id; strictly increasing within a feed.
    pub id: i64,
    /// Album id shared by messages that form one logical post.
    pub grouped_id: Option<i64>,
    pub payload: MessagePayload,
}

impl Message {
    /// Convenience constructor for a plain text message.
    pub fn text(id: i64, text: impl Into<String>) -> Self {
        Self {
            id,
            grouped_id: None,
            payload: MessagePayload::Text { text: text.into() },
        }
    }

    /// The message's text or caption, if any.
    pub fn text_content(&self) -> Option<&str> {
        self.payload.text()
    }
}

/// What gets handed to [`Transport::send_message`](crate::Transport::send_message).
///
/// Albums are delivered as one unit so the target renders them as a single
/// logical post; the transport assigns consecutive ids and reports the first.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Single(MessagePayload),
    Album(Vec<MessagePayload>),
}

impl Outbound {
    /// Number of payload items carried.
    pub fn len(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::Album(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Album(items) if items.is_empty())
    }
}

/// Live event pushed by the transport's subscription stream.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// A new message appeared in `feed`. The engine treats this as a wake
    /// signal for that feed; the actual read goes through the checkpoint.
    NewMessage { feed: i64, message_id: i64 },
    /// One or more messages were deleted from `feed`.
    Deleted { feed: i64, message_ids: Vec<i64> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_text_across_variants() {
        assert_eq!(
            MessagePayload::Text { text: "hi".into() }.text(),
            Some("hi")
        );
        assert_eq!(
            MessagePayload::Photo {
                caption: Some("cap".into())
            }
            .text(),
            Some("cap")
        );
        assert_eq!(MessagePayload::Video { caption: None }.text(), None);
        assert_eq!(
            MessagePayload::Document {
                caption: None,
                sticker: true
            }
            .text(),
            None
        );
    }

    #[test]
    fn with_text_preserves_variant() {
        let p = MessagePayload::Photo {
            caption: Some("old".into()),
        }
        .with_text("new".into());
        assert_eq!(
            p,
            MessagePayload::Photo {
                caption: Some("new".into())
            }
        );

        let p = MessagePayload::Document {
            caption: Some("old".into()),
            sticker: false,
        }
        .with_text(String::new());
        assert_eq!(
            p,
            MessagePayload::Document {
                caption: None,
                sticker: false
            }
        );
    }

    #[test]
    fn with_text_keeps_empty_text_body() {
        let p = MessagePayload::Text { text: "x".into() }.with_text(String::new());
        assert_eq!(p, MessagePayload::Text {
            text: String::new()
        });
    }

    #[test]
    fn outbound_len() {
        assert_eq!(Outbound::Single(MessagePayload::Video { caption: None }).len(), 1);
        let album = Outbound::Album(vec![
            MessagePayload::Photo { caption: None },
            MessagePayload::Photo { caption: None },
        ]);
        assert_eq!(album.len(), 2);
        assert!(!album.is_empty());
    }
}
