use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::event::{InboundEvent, Payload};

/// What an event is routed on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RouteKey {
    Command(String),
    Text,
    Photo,
    WebAppData,
}

impl RouteKey {
    /// Key for a command, normalised the same way incoming commands are.
    pub fn command(name: &str) -> Self {
        RouteKey::Command(name.trim_start_matches('/').to_lowercase())
    }

    pub fn for_payload(payload: &Payload) -> Option<Self> {
        match payload {
            Payload::Command { name, .. } => Some(RouteKey::Command(name.clone())),
            Payload::Text(_) => Some(RouteKey::Text),
            Payload::Photo { .. } => Some(RouteKey::Photo),
            Payload::WebAppData { .. } => Some(RouteKey::WebAppData),
            Payload::Unsupported => None,
        }
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteKey::Command(name) => write!(f, "/{}", name),
            RouteKey::Text => write!(f, "text"),
            RouteKey::Photo => write!(f, "photo"),
            RouteKey::WebAppData => write!(f, "web_app_data"),
        }
    }
}

#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, event: &InboundEvent) -> anyhow::Result<()>;

    /// One-line summary shown by `/help`.
    fn description(&self) -> &str {
        ""
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouterError {
    #[error("a handler is already registered for {0}")]
    DuplicateRoute(RouteKey),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled,
    /// No handler matched and there is no fallback.
    Unrouted,
    /// A command addressed to another bot (`/start@OtherBot`). Not routed,
    /// not even to the fallback.
    Ignored,
    /// The handler returned an error or panicked. The event still counts as
    /// delivered.
    Failed,
}

#[derive(Default)]
pub struct CommandRouter {
    routes: HashMap<RouteKey, Arc<dyn Handler>>,
    fallback: Option<Arc<dyn Handler>>,
    bot_username: Option<String>,
}

impl CommandRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Keys are unique; a second registration fails.
    pub fn register(&mut self, key: RouteKey, handler: Arc<dyn Handler>) -> Result<(), RouterError> {
        if self.routes.contains_key(&key) {
            return Err(RouterError::DuplicateRoute(key));
        }
        debug!("Registered handler for {}", key);
        self.routes.insert(key, handler);
        Ok(())
    }

    /// Handler for events no key matches, including unsupported updates.
    pub fn set_fallback(&mut self, handler: Arc<dyn Handler>) {
        self.fallback = Some(handler);
    }

    /// This bot's username. Once set, commands addressed to any other bot are
    /// ignored. Without it every addressed command is accepted.
    pub fn set_bot_username(&mut self, username: impl Into<String>) {
        self.bot_username = Some(username.into());
    }

    fn addressed_elsewhere(&self, payload: &Payload) -> bool {
        match (payload, &self.bot_username) {
            (
                Payload::Command {
                    addressee: Some(to),
                    ..
                },
                Some(me),
            ) => !to.eq_ignore_ascii_case(me),
            _ => false,
        }
    }

    /// Registered commands with their descriptions, sorted by name.
    pub fn commands(&self) -> Vec<(String, String)> {
        let mut commands: Vec<(String, String)> = self
            .routes
            .iter()
            .filter_map(|(key, handler)| match key {
                RouteKey::Command(name) => Some((name.clone(), handler.description().to_string())),
                _ => None,
            })
            .collect();
        commands.sort();
        commands
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    /// Route one event and run its handler to completion.
    ///
    /// Never returns an error: handler failures and panics are logged with
    /// the update id and swallowed.
    pub async fn dispatch(&self, event: &InboundEvent) -> DispatchOutcome {
        if self.addressed_elsewhere(event.payload()) {
            debug!(update_id = event.update_id(), "Command addressed to another bot");
            return DispatchOutcome::Ignored;
        }
        let key = RouteKey::for_payload(event.payload());
        let handler = key
            .as_ref()
            .and_then(|k| self.routes.get(k))
            .or(self.fallback.as_ref());

        let Some(handler) = handler else {
            warn!(
                update_id = event.update_id(),
                "No handler for update ({})",
                key.map(|k| k.to_string()).unwrap_or_else(|| "unsupported".to_string())
            );
            return DispatchOutcome::Unrouted;
        };

        let route = key
            .map(|k| k.to_string())
            .unwrap_or_else(|| "fallback".to_string());
        debug!(update_id = event.update_id(), route = %route, "Dispatching update");

        match AssertUnwindSafe(handler.handle(event)).catch_unwind().await {
            Ok(Ok(())) => DispatchOutcome::Handled,
            Ok(Err(e)) => {
                error!(update_id = event.update_id(), route = %route, "Handler failed: {:#}", e);
                DispatchOutcome::Failed
            }
            Err(panic) => {
                error!(
                    update_id = event.update_id(),
                    route = %route,
                    "Handler panicked: {}",
                    panic_message(panic.as_ref())
                );
                DispatchOutcome::Failed
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
