use chrono::{DateTime, Utc};
use teloxide::types::{Message, Update, UpdateKind};
use thiserror::Error;

/// The body of a webhook request could not be read as a Telegram update.
#[derive(Debug, Error)]
#[error("malformed update envelope: {0}")]
pub struct EnvelopeError(#[from] serde_json::Error);

/// What a message carries, reduced to the shapes the router dispatches on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// `/name@bot args`. The name is lowercased; `addressee` keeps the
    /// `@bot` suffix, if any, without the `@`.
    Command {
        name: String,
        addressee: Option<String>,
        args: String,
    },
    Text(String),
    /// Largest available size of the photo.
    Photo {
        file_id: String,
        caption: Option<String>,
    },
    /// Data sent back by the Web App via `Telegram.WebApp.sendData`.
    WebAppData { data: String, button_text: String },
    Unsupported,
}

impl Payload {
    /// Classify a text message as a command or plain text.
    pub fn from_text(text: &str) -> Self {
        let Some(rest) = text.strip_prefix('/') else {
            return Payload::Text(text.to_string());
        };
        let (head, args) = match rest.split_once(char::is_whitespace) {
            Some((head, args)) => (head, args.trim()),
            None => (rest, ""),
        };
        let (name, addressee) = match head.split_once('@') {
            Some((name, bot)) => (name, Some(bot.to_string()).filter(|b| !b.is_empty())),
            None => (head, None),
        };
        if name.is_empty() {
            return Payload::Text(text.to_string());
        }
        Payload::Command {
            name: name.to_lowercase(),
            addressee,
            args: args.to_string(),
        }
    }

    fn from_message(msg: &Message) -> Self {
        if let Some(text) = msg.text() {
            return Payload::from_text(text);
        }
        if let Some(sizes) = msg.photo() {
            if let Some(largest) = sizes
                .iter()
                .max_by_key(|p| u64::from(p.width) * u64::from(p.height))
            {
                return Payload::Photo {
                    file_id: largest.file.id.to_string(),
                    caption: msg.caption().map(str::to_string),
                };
            }
        }
        if let Some(web_app) = msg.web_app_data() {
            return Payload::WebAppData {
                data: web_app.data.clone(),
                button_text: web_app.button_text.clone(),
            };
        }
        Payload::Unsupported
    }
}

/// A parsed webhook delivery. Immutable once built.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    update_id: u64,
    sender_id: Option<u64>,
    chat_id: Option<i64>,
    payload: Payload,
    received_at: DateTime<Utc>,
}

impl InboundEvent {
    pub fn new(
        update_id: u64,
        sender_id: Option<u64>,
        chat_id: Option<i64>,
        payload: Payload,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            update_id,
            sender_id,
            chat_id,
            payload,
            received_at,
        }
    }

    /// Parse a raw webhook body, stamping it with the current time.
    pub fn parse(body: &[u8]) -> Result<Self, EnvelopeError> {
        let update: Update = serde_json::from_slice(body)?;
        Ok(Self::from_update(update, Utc::now()))
    }

    pub fn from_update(update: Update, received_at: DateTime<Utc>) -> Self {
        let update_id = u64::from(update.id.0);
        match &update.kind {
            UpdateKind::Message(msg) | UpdateKind::ChannelPost(msg) => Self::new(
                update_id,
                msg.from.as_ref().map(|u| u.id.0),
                Some(msg.chat.id.0),
                Payload::from_message(msg),
                received_at,
            ),
            _ => Self::new(update_id, None, None, Payload::Unsupported, received_at),
        }
    }

    pub fn update_id(&self) -> u64 {
        self.update_id
    }

    pub fn sender_id(&self) -> Option<u64> {
        self.sender_id
    }

    pub fn chat_id(&self) -> Option<i64> {
        self.chat_id
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn text_update(update_id: u64, text: &str) -> serde_json::Value {
        json!({
            "update_id": update_id,
            "message": {
                "message_id": 7,
                "date": 1_700_000_000,
                "chat": { "id": 42, "type": "private", "first_name": "Ada" },
                "from": { "id": 42, "is_bot": false, "first_name": "Ada" },
                "text": text
            }
        })
    }

    pub(crate) fn text_event(update_id: u64, text: &str) -> InboundEvent {
        InboundEvent::new(
            update_id,
            Some(42),
            Some(42),
            Payload::from_text(text),
            Utc::now(),
        )
    }

    #[test]
    fn test_classify_text() {
        assert_eq!(Payload::from_text("hello"), Payload::Text("hello".to_string()));
        assert_eq!(
            Payload::from_text("/start"),
            Payload::Command {
                name: "start".to_string(),
                addressee: None,
                args: String::new()
            }
        );
        assert_eq!(
            Payload::from_text("/Echo@MyBot  some words "),
            Payload::Command {
                name: "echo".to_string(),
                addressee: Some("MyBot".to_string()),
                args: "some words".to_string()
            }
        );
        assert_eq!(
            Payload::from_text("/help@"),
            Payload::Command {
                name: "help".to_string(),
                addressee: None,
                args: String::new()
            }
        );
        assert_eq!(Payload::from_text("/"), Payload::Text("/".to_string()));
        assert_eq!(Payload::from_text("/ x"), Payload::Text("/ x".to_string()));
    }

    #[test]
    fn test_parse_text_message() {
        let body = serde_json::to_vec(&text_update(1001, "/start")).unwrap();
        let event = InboundEvent::parse(&body).unwrap();
        assert_eq!(event.update_id(), 1001);
        assert_eq!(event.sender_id(), Some(42));
        assert_eq!(event.chat_id(), Some(42));
        assert!(matches!(event.payload(), Payload::Command { name, .. } if name == "start"));
    }

    #[test]
    fn test_parse_photo_picks_largest() {
        let body = json!({
            "update_id": 5,
            "message": {
                "message_id": 8,
                "date": 1_700_000_000,
                "chat": { "id": 42, "type": "private", "first_name": "Ada" },
                "from": { "id": 42, "is_bot": false, "first_name": "Ada" },
                "photo": [
                    { "file_id": "small", "file_unique_id": "s", "width": 90, "height": 90, "file_size": 100 },
                    { "file_id": "large", "file_unique_id": "l", "width": 800, "height": 600, "file_size": 9000 }
                ],
                "caption": "look"
            }
        });
        let event = InboundEvent::parse(&serde_json::to_vec(&body).unwrap()).unwrap();
        assert_eq!(
            event.payload(),
            &Payload::Photo {
                file_id: "large".to_string(),
                caption: Some("look".to_string())
            }
        );
    }

    #[test]
    fn test_parse_web_app_data() {
        let body = json!({
            "update_id": 6,
            "message": {
                "message_id": 9,
                "date": 1_700_000_000,
                "chat": { "id": 42, "type": "private", "first_name": "Ada" },
                "from": { "id": 42, "is_bot": false, "first_name": "Ada" },
                "web_app_data": { "data": "hello from app", "button_text": "Open Web App" }
            }
        });
        let event = InboundEvent::parse(&serde_json::to_vec(&body).unwrap()).unwrap();
        assert_eq!(
            event.payload(),
            &Payload::WebAppData {
                data: "hello from app".to_string(),
                button_text: "Open Web App".to_string()
            }
        );
    }

    #[test]
    fn test_malformed_bodies() {
        assert!(InboundEvent::parse(b"{not json").is_err());
        assert!(InboundEvent::parse(b"").is_err());
        assert!(InboundEvent::parse(br#"{"message": {"text": "hi"}}"#).is_err());
    }
}
