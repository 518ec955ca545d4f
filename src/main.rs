mod config;
mod event;
mod gateway;
mod handlers;
mod outbound;
mod queue;
mod receiver;
mod router;
mod secret;
mod worker;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use teloxide::prelude::Requester;
use teloxide::Bot;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::gateway::{Gateway, GatewaySettings};
use crate::handlers::HandlerContext;
use crate::outbound::TelegramOutbound;
use crate::router::CommandRouter;

#[derive(Parser)]
#[command(name = "hookgate", version, about = "Telegram webhook-to-task dispatch gateway")]
struct Cli {
    /// TOML file with [dispatch] and [webapp] settings (default: hookgate.toml if present)
    #[arg(short, long, global = true, env = "HOOKGATE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Clone, Copy)]
enum Command {
    /// Register the webhook and serve updates (default)
    Serve,
    /// Register the webhook with Telegram and exit
    SetWebhook,
    /// Remove the webhook registration
    DeleteWebhook,
    /// Show the webhook registration as Telegram sees it
    WebhookInfo,
    /// Validate the environment and print the configuration with secrets masked
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,hookgate=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    // Missing or invalid settings end the process here with a non-zero exit.
    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    info!("Configuration loaded successfully");

    let bot = Bot::new(config.webhook.token.expose());

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config, bot).await,
        Command::SetWebhook => {
            if config.webhook.path_secret_generated {
                anyhow::bail!(
                    "WEBHOOK_SECRET is not set; a one-off registration would not match the next `serve`"
                );
            }
            outbound::register_webhook(&bot, &config.webhook).await
        }
        Command::DeleteWebhook => outbound::delete_webhook(&bot).await,
        Command::WebhookInfo => {
            let status = outbound::webhook_status(&bot).await?;
            if status.is_registered() {
                println!(
                    "Webhook registered on host: {}",
                    status.host.as_deref().unwrap_or_default()
                );
            } else {
                println!("No webhook registered");
            }
            println!("Pending updates: {}", status.pending_update_count);
            if let Some(message) = &status.last_error_message {
                println!("Last delivery error: {}", message);
            }
            Ok(())
        }
        Command::CheckConfig => {
            print_config(&config);
            Ok(())
        }
    }
}

async fn serve(config: Config, bot: Bot) -> Result<()> {
    info!("  Public URL: {}", config.webhook.public_url);
    info!("  Port: {}", config.webhook.port);
    info!("  Token: {}", config.webhook.token);
    if config.webhook.header_secret.is_none() {
        info!("  No header secret configured; relying on the path secret alone");
    }

    let ctx = HandlerContext {
        outbound: Arc::new(TelegramOutbound::new(bot.clone())),
        web_app_url: config.webapp.url.clone(),
    };
    let mut router = CommandRouter::new();
    handlers::register_builtin(&mut router, ctx).context("Failed to register handlers")?;
    match bot.get_me().await {
        Ok(me) => match me.user.username.clone() {
            Some(username) => {
                info!("  Bot username: @{}", username);
                router.set_bot_username(username);
            }
            None => warn!("Bot has no username; accepting commands addressed to any bot"),
        },
        Err(e) => warn!(
            "getMe failed, accepting commands addressed to any bot: {}",
            e
        ),
    }

    let gateway = Gateway::new(GatewaySettings::from_config(&config), router);

    let addr = format!("0.0.0.0:{}", config.webhook.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;

    // A failed registration is not fatal: an earlier one may still be live.
    if let Err(e) = outbound::register_webhook(&bot, &config.webhook).await {
        error!("Webhook registration failed: {:#}", e);
    }

    gateway.serve(listener, shutdown_signal()).await
}

fn print_config(config: &Config) {
    println!("Bot token:         {}", config.webhook.token);
    println!("Public URL:        {}", config.webhook.public_url);
    println!("Port:              {}", config.webhook.port);
    println!(
        "Path secret:       {}{}",
        config.webhook.path_secret,
        if config.webhook.path_secret_generated {
            " (generated)"
        } else {
            ""
        }
    );
    println!(
        "Header secret:     {}",
        config
            .webhook
            .header_secret
            .as_ref()
            .map(|s| s.masked())
            .unwrap_or_else(|| "(none)".to_string())
    );
    println!("Queue capacity:    {}", config.dispatch.queue_capacity);
    println!("Workers:           {}", config.dispatch.workers);
    println!("Overflow policy:   {}", config.dispatch.overflow);
    println!("Shutdown grace:    {}s", config.dispatch.shutdown_grace_secs);
    println!("Serve Web App:     {}", config.webapp.serve_page);
    println!("Web App URL:       {}", config.webapp.url);
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}
