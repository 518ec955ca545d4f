//! Everything the gateway sends to Telegram: replies from handlers and the
//! webhook control calls.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Url;
use teloxide::payloads::{SendMessageSetters, SetWebhookSetters};
use teloxide::prelude::*;
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup, WebAppInfo};
use tracing::info;

use crate::config::WebhookConfig;

/// Reply surface handed to handlers.
#[async_trait]
pub trait Outbound: Send + Sync {
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<()>;

    /// Send `text` with a single inline button that opens `url` as a Web App.
    async fn send_web_app_button(&self, chat_id: i64, text: &str, label: &str, url: &Url)
        -> Result<()>;
}

pub struct TelegramOutbound {
    bot: Bot,
}

impl TelegramOutbound {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl Outbound for TelegramOutbound {
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<()> {
        self.bot
            .send_message(ChatId(chat_id), text)
            .await
            .context("sendMessage failed")?;
        Ok(())
    }

    async fn send_web_app_button(
        &self,
        chat_id: i64,
        text: &str,
        label: &str,
        url: &Url,
    ) -> Result<()> {
        let keyboard = InlineKeyboardMarkup::new(vec![vec![InlineKeyboardButton::web_app(
            label,
            WebAppInfo { url: url.clone() },
        )]]);
        self.bot
            .send_message(ChatId(chat_id), text)
            .reply_markup(keyboard)
            .await
            .context("sendMessage with Web App button failed")?;
        Ok(())
    }
}

/// Webhook registration as reported by Telegram, with the URL reduced to its
/// host so the path secret never reaches a log line.
#[derive(Debug, Clone)]
pub struct WebhookStatus {
    pub host: Option<String>,
    pub pending_update_count: u32,
    pub last_error_message: Option<String>,
}

impl WebhookStatus {
    pub fn is_registered(&self) -> bool {
        self.host.is_some()
    }
}

/// Point Telegram at this gateway. Safe to repeat: Telegram replaces any
/// previous registration.
pub async fn register_webhook(bot: &Bot, config: &WebhookConfig) -> Result<()> {
    let url = config.callback_url()?;
    let host = url.host_str().unwrap_or_default().to_string();

    let mut request = bot.set_webhook(url);
    if let Some(secret) = &config.header_secret {
        request = request.secret_token(secret.expose().to_string());
    }
    request.await.context("setWebhook failed")?;

    info!("Webhook registered on host {}", host);
    Ok(())
}

pub async fn delete_webhook(bot: &Bot) -> Result<()> {
    bot.delete_webhook().await.context("deleteWebhook failed")?;
    info!("Webhook deleted");
    Ok(())
}

pub async fn webhook_status(bot: &Bot) -> Result<WebhookStatus> {
    let info = bot
        .get_webhook_info()
        .await
        .context("getWebhookInfo failed")?;
    Ok(WebhookStatus {
        host: info
            .url
            .as_ref()
            .and_then(|u| u.host_str().map(str::to_string)),
        pending_update_count: info.pending_update_count,
        last_error_message: info.last_error_message,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::secret::Secret;
    use axum::body::Bytes;
    use axum::extract::State;
    use axum::http::Uri;
    use axum::{Json, Router};
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum Sent {
        Text { chat_id: i64, text: String },
        WebAppButton {
            chat_id: i64,
            text: String,
            label: String,
            url: String,
        },
    }

    /// Records every outgoing message instead of calling Telegram.
    #[derive(Default)]
    pub(crate) struct RecordingOutbound {
        pub(crate) sent: Mutex<Vec<Sent>>,
    }

    impl RecordingOutbound {
        pub(crate) async fn sent(&self) -> Vec<Sent> {
            self.sent.lock().await.clone()
        }
    }

    #[async_trait]
    impl Outbound for RecordingOutbound {
        async fn send_text(&self, chat_id: i64, text: &str) -> Result<()> {
            self.sent.lock().await.push(Sent::Text {
                chat_id,
                text: text.to_string(),
            });
            Ok(())
        }

        async fn send_web_app_button(
            &self,
            chat_id: i64,
            text: &str,
            label: &str,
            url: &Url,
        ) -> Result<()> {
            self.sent.lock().await.push(Sent::WebAppButton {
                chat_id,
                text: text.to_string(),
                label: label.to_string(),
                url: url.to_string(),
            });
            Ok(())
        }
    }

    #[test]
    fn test_webhook_status_registration() {
        let status = WebhookStatus {
            host: Some("bot.example.com".to_string()),
            pending_update_count: 3,
            last_error_message: None,
        };
        assert!(status.is_registered());
        let empty = WebhookStatus {
            host: None,
            pending_update_count: 0,
            last_error_message: None,
        };
        assert!(!empty.is_registered());
    }

    const TOKEN: &str = "123456789:AAHdqTcvCH1vGWJxfSeofSAs0K5PALDsaw";

    /// Bot API calls seen by the local stub: (request path, JSON body).
    type Calls = Arc<Mutex<Vec<(String, serde_json::Value)>>>;

    async fn fake_bot_api(
        State(calls): State<Calls>,
        uri: Uri,
        body: Bytes,
    ) -> Json<serde_json::Value> {
        let payload = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        let method = uri.path().rsplit('/').next().unwrap_or_default().to_lowercase();
        calls.lock().await.push((uri.path().to_string(), payload));
        let result = if method == "getwebhookinfo" {
            json!({
                "url": "https://bot.example.com/webhook/abc",
                "has_custom_certificate": false,
                "pending_update_count": 3,
                "last_error_date": 1_700_000_000,
                "last_error_message": "Connection refused"
            })
        } else {
            json!(true)
        };
        Json(json!({ "ok": true, "result": result }))
    }

    /// A `Bot` talking to a local stub instead of api.telegram.org.
    async fn stub_bot() -> (Bot, Calls) {
        let calls = Calls::default();
        let app = Router::new().fallback(fake_bot_api).with_state(calls.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        let bot = Bot::new(TOKEN).set_api_url(Url::parse(&format!("http://{}/", addr)).unwrap());
        (bot, calls)
    }

    fn webhook_config(header_secret: Option<&str>) -> WebhookConfig {
        WebhookConfig {
            token: Secret::new(TOKEN),
            public_url: Url::parse("https://bot.example.com").unwrap(),
            port: 8000,
            path_secret: Secret::new("path-secret-123"),
            path_secret_generated: false,
            header_secret: header_secret.map(Secret::new),
        }
    }

    #[tokio::test]
    async fn test_register_webhook_sends_path_secret_not_token() {
        let (bot, calls) = stub_bot().await;
        register_webhook(&bot, &webhook_config(Some("header-secret")))
            .await
            .unwrap();

        let calls = calls.lock().await;
        assert_eq!(calls.len(), 1);
        let (path, body) = &calls[0];
        assert!(path.to_lowercase().ends_with("/setwebhook"), "{}", path);
        assert_eq!(
            body["url"],
            "https://bot.example.com/webhook/path-secret-123"
        );
        assert!(!body["url"].as_str().unwrap().contains("AAHdqTcv"));
        assert_eq!(body["secret_token"], "header-secret");
    }

    #[tokio::test]
    async fn test_register_webhook_without_header_secret() {
        let (bot, calls) = stub_bot().await;
        register_webhook(&bot, &webhook_config(None)).await.unwrap();

        let calls = calls.lock().await;
        assert!(calls[0].1.get("secret_token").is_none());
    }

    #[tokio::test]
    async fn test_delete_webhook() {
        let (bot, calls) = stub_bot().await;
        delete_webhook(&bot).await.unwrap();

        let calls = calls.lock().await;
        assert_eq!(calls.len(), 1);
        assert!(calls[0].0.to_lowercase().ends_with("/deletewebhook"));
    }

    #[tokio::test]
    async fn test_webhook_status_reduces_url_to_host() {
        let (bot, _calls) = stub_bot().await;
        let status = webhook_status(&bot).await.unwrap();

        assert_eq!(status.host.as_deref(), Some("bot.example.com"));
        assert_eq!(status.pending_update_count, 3);
        assert_eq!(status.last_error_message.as_deref(), Some("Connection refused"));
    }
}
