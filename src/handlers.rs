//! Built-in demo handlers: greeting, Web App button, echo, photo and Web App
//! data acknowledgements.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Url;
use tracing::{debug, info};

use crate::event::{InboundEvent, Payload};
use crate::outbound::Outbound;
use crate::router::{CommandRouter, Handler, RouteKey, RouterError};

/// Dependencies shared by the built-in handlers.
#[derive(Clone)]
pub struct HandlerContext {
    pub outbound: Arc<dyn Outbound>,
    pub web_app_url: Url,
}

impl HandlerContext {
    async fn reply(&self, event: &InboundEvent, text: &str) -> Result<()> {
        match event.chat_id() {
            Some(chat_id) => self.outbound.send_text(chat_id, text).await,
            None => {
                debug!(update_id = event.update_id(), "Update has no chat, not replying");
                Ok(())
            }
        }
    }
}

pub struct StartHandler {
    ctx: HandlerContext,
}

#[async_trait]
impl Handler for StartHandler {
    async fn handle(&self, event: &InboundEvent) -> Result<()> {
        info!(
            update_id = event.update_id(),
            "/start from user {:?}",
            event.sender_id()
        );
        if let Payload::Command { args, .. } = event.payload() {
            if !args.is_empty() {
                debug!(update_id = event.update_id(), "Deep-link payload: {}", args);
            }
        }
        self.ctx
            .reply(
                event,
                "Hello! The bot is up and running 🚀\nUse /openweb to open the Web App.",
            )
            .await
    }

    fn description(&self) -> &str {
        "Greeting"
    }
}

pub struct OpenWebHandler {
    ctx: HandlerContext,
}

#[async_trait]
impl Handler for OpenWebHandler {
    async fn handle(&self, event: &InboundEvent) -> Result<()> {
        let Some(chat_id) = event.chat_id() else {
            return Ok(());
        };
        self.ctx
            .outbound
            .send_web_app_button(
                chat_id,
                "Press the button to open the Web App:",
                "Open Web App",
                &self.ctx.web_app_url,
            )
            .await
    }

    fn description(&self) -> &str {
        "Open the Web App"
    }
}

pub struct HelpHandler {
    ctx: HandlerContext,
    text: String,
}

impl HelpHandler {
    fn new(ctx: HandlerContext, commands: &[(String, String)]) -> Self {
        let mut text = String::from("Commands:\n");
        for (name, description) in commands {
            text.push_str(&format!("/{} - {}\n", name, description));
        }
        text.push_str("/help - Show this message");
        Self { ctx, text }
    }
}

#[async_trait]
impl Handler for HelpHandler {
    async fn handle(&self, event: &InboundEvent) -> Result<()> {
        self.ctx.reply(event, &self.text).await
    }

    fn description(&self) -> &str {
        "Show this message"
    }
}

pub struct EchoHandler {
    ctx: HandlerContext,
}

#[async_trait]
impl Handler for EchoHandler {
    async fn handle(&self, event: &InboundEvent) -> Result<()> {
        if let Payload::Text(text) = event.payload() {
            self.ctx.reply(event, &format!("You wrote: {}", text)).await?;
        }
        Ok(())
    }
}

pub struct PhotoHandler {
    ctx: HandlerContext,
}

#[async_trait]
impl Handler for PhotoHandler {
    async fn handle(&self, event: &InboundEvent) -> Result<()> {
        let Payload::Photo { file_id, caption } = event.payload() else {
            return Ok(());
        };
        debug!(update_id = event.update_id(), file_id = %file_id, "Photo received");
        match caption {
            Some(caption) => {
                self.ctx
                    .reply(event, &format!("Photo received! 📸\nCaption: {}", caption))
                    .await
            }
            None => self.ctx.reply(event, "Photo received! 📸").await,
        }
    }
}

pub struct WebAppDataHandler {
    ctx: HandlerContext,
}

#[async_trait]
impl Handler for WebAppDataHandler {
    async fn handle(&self, event: &InboundEvent) -> Result<()> {
        if let Payload::WebAppData { data, button_text } = event.payload() {
            info!(
                update_id = event.update_id(),
                "Web App data received via '{}' ({} bytes)",
                button_text,
                data.len()
            );
            self.ctx
                .reply(event, &format!("Got data from the Web App: {}", data))
                .await?;
        }
        Ok(())
    }
}

/// Catches commands nobody registered and update kinds the gateway does not
/// model.
pub struct UnknownHandler {
    ctx: HandlerContext,
}

#[async_trait]
impl Handler for UnknownHandler {
    async fn handle(&self, event: &InboundEvent) -> Result<()> {
        match event.payload() {
            Payload::Command { name, .. } => {
                self.ctx
                    .reply(event, &format!("Unknown command /{}. Try /help.", name))
                    .await
            }
            _ => {
                debug!(update_id = event.update_id(), "Ignoring unsupported update");
                Ok(())
            }
        }
    }
}

/// Register the built-in handlers. `/help` is registered last so it lists
/// every command before it.
pub fn register_builtin(router: &mut CommandRouter, ctx: HandlerContext) -> Result<(), RouterError> {
    router.register(
        RouteKey::command("start"),
        Arc::new(StartHandler { ctx: ctx.clone() }),
    )?;
    router.register(
        RouteKey::command("openweb"),
        Arc::new(OpenWebHandler { ctx: ctx.clone() }),
    )?;
    router.register(RouteKey::Text, Arc::new(EchoHandler { ctx: ctx.clone() }))?;
    router.register(RouteKey::Photo, Arc::new(PhotoHandler { ctx: ctx.clone() }))?;
    router.register(
        RouteKey::WebAppData,
        Arc::new(WebAppDataHandler { ctx: ctx.clone() }),
    )?;
    let commands = router.commands();
    router.register(
        RouteKey::command("help"),
        Arc::new(HelpHandler::new(ctx.clone(), &commands)),
    )?;
    router.set_fallback(Arc::new(UnknownHandler { ctx }));
    Ok(())
}
