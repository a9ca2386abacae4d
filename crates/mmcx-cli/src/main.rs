//! mmcx - Telegram bridge for the MMC chat backend.
//!
//! Wires the pieces together: config, logging, the Telegram client, the
//! update poll loop, and the outbound sender, then supervises both tasks
//! until a shutdown signal cancels them.

mod logging;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use mmcx_config::Config;
use mmcx_ipc::EventBus;
use mmcx_telegram::client::{ApiReply, TelegramClient};
use mmcx_telegram::inbound::BridgeHandler;
use mmcx_telegram::outbound::OutboundSender;
use mmcx_telegram::poll;
use mmcx_telegram::state::RuntimeState;

#[derive(Parser, Debug)]
#[command(name = "mmcx", about = "Telegram bridge for the MMC chat backend", version)]
struct Cli {
    /// Path to the TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level filter (overrides the config file)
    #[arg(long)]
    log_level: Option<String>,
}

fn identity_from_reply(reply: &ApiReply) -> Option<(i64, Option<String>)> {
    let result = reply.result()?;
    let id = result.get("id")?.as_i64()?;
    let username = result
        .get("username")
        .and_then(|u| u.as_str())
        .map(str::to_string);
    Some((id, username))
}

async fn wait_for_shutdown() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {e}");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .or_else(Config::default_path)
        .context("no config path given and no default config directory available")?;
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    let log_level = cli
        .log_level
        .as_deref()
        .or(config.core.log_level.as_deref())
        .unwrap_or("info");
    let _log_guard = logging::init_logging(&config.data_dir().join("logs"), log_level)?;

    info!("mmcx starting (config: {})", config_path.display());

    let client = Arc::new(TelegramClient::new(&config.telegram)?);
    let state = Arc::new(Mutex::new(RuntimeState::new(
        config.telegram.message_index_limit,
    )));

    // Identity bootstrap. Without it the bridge cannot recognize the backend
    // echoing our own messages as reply targets, but it can still run.
    match client.get_me().await {
        Ok(reply) if reply.is_ok() => match identity_from_reply(&reply) {
            Some((bot_id, username)) => {
                info!(bot_id, username = username.as_deref(), "telegram identity resolved");
                state.lock().await.set_identity(bot_id, username);
            }
            None => warn!("getMe reply is missing the bot id"),
        },
        Ok(reply) => warn!("getMe failed: {:?}", reply.description()),
        Err(e) => warn!("could not fetch telegram identity: {e:#}"),
    }

    let bus = EventBus::new();
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let poll_task = {
        let client = client.clone();
        let telegram_cfg = config.telegram.clone();
        let handler = BridgeHandler::new(client.clone(), state.clone(), bus.clone());
        let cancel = cancel_rx.clone();
        tokio::spawn(async move {
            poll::poll_loop(&client, &handler, &telegram_cfg, cancel).await;
        })
    };

    let send_task = {
        let sender = OutboundSender::new(client.clone(), state.clone());
        let outbound_rx = bus.outbound_subscribe();
        let cancel = cancel_rx.clone();
        tokio::spawn(async move {
            sender.run(outbound_rx, cancel).await;
        })
    };

    wait_for_shutdown().await;
    info!("shutdown signal received, stopping tasks");
    let _ = cancel_tx.send(true);

    let _ = poll_task.await;
    let _ = send_task.await;

    info!("mmcx stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_extracted_from_get_me_reply() {
        let reply = ApiReply::from_body(
            200,
            r#"{"ok":true,"result":{"id":4242,"is_bot":true,"username":"bridge_bot"}}"#,
        );
        assert_eq!(
            identity_from_reply(&reply),
            Some((4242, Some("bridge_bot".to_string())))
        );
    }

    #[test]
    fn identity_requires_an_id() {
        let reply = ApiReply::from_body(200, r#"{"ok":true,"result":{"username":"x"}}"#);
        assert_eq!(identity_from_reply(&reply), None);
        let reply = ApiReply::from_body(401, r#"{"ok":false,"description":"Unauthorized"}"#);
        assert_eq!(identity_from_reply(&reply), None);
    }
}
