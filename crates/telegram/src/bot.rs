use std::{sync::Arc, time::Duration};

use {
    deskbridge_bridge::BridgeRouter,
    deskbridge_config::TelegramConfig,
    secrecy::ExposeSecret,
    teloxide::{
        ApiError, RequestError,
        prelude::*,
        types::{AllowedUpdate, BotCommand, UpdateKind},
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info, warn},
};

use crate::{
    error::{Error, Result},
    handlers,
};

const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Build a bot whose HTTP client outlives the long-poll timeout, so the
/// client does not abort `getUpdates` before Telegram answers.
pub fn build_bot(config: &TelegramConfig) -> Result<Bot> {
    let token = config.token.expose_secret();
    if token.trim().is_empty() {
        return Err(Error::message("telegram bot token is empty"));
    }
    let client = teloxide::net::default_reqwest_settings()
        .timeout(Duration::from_secs(u64::from(config.poll_timeout_secs) + 15))
        .build()?;
    Ok(Bot::with_client(token, client))
}

/// Verify the bot and spawn the polling loop.
///
/// Updates are handled one at a time in arrival order. The loop runs until
/// the returned token is cancelled, or until another process starts polling
/// with the same token.
pub async fn start_polling(
    bot: Bot,
    router: Arc<BridgeRouter>,
    poll_timeout_secs: u32,
) -> Result<CancellationToken> {
    let me = bot.get_me().await?;

    // Long polling does not work while a webhook is set.
    bot.delete_webhook().send().await?;

    let commands = vec![BotCommand::new("start", "Choose a department")];
    if let Err(e) = bot.set_my_commands(commands).await {
        warn!("failed to register bot commands: {e}");
    }

    info!(
        username = ?me.username,
        "telegram bot connected (webhook cleared)"
    );

    let cancel = CancellationToken::new();
    let loop_cancel = cancel.clone();
    tokio::spawn(async move {
        poll_updates(bot, router, poll_timeout_secs, loop_cancel).await;
    });
    Ok(cancel)
}

async fn poll_updates(
    bot: Bot,
    router: Arc<BridgeRouter>,
    poll_timeout_secs: u32,
    cancel: CancellationToken,
) {
    info!("starting telegram polling loop");
    let mut offset: i32 = 0;

    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = bot
                .get_updates()
                .offset(offset)
                .timeout(poll_timeout_secs)
                .allowed_updates(vec![AllowedUpdate::Message, AllowedUpdate::CallbackQuery])
                .send() => result,
        };

        match result {
            Ok(updates) => {
                debug!(count = updates.len(), "got telegram updates");
                for update in updates {
                    offset = update.id.as_offset();
                    dispatch(update.kind, &bot, &router).await;
                }
            },
            Err(RequestError::Api(ApiError::TerminatedByOtherGetUpdates)) => {
                warn!("telegram polling stopped: another instance is running with this token");
                cancel.cancel();
                break;
            },
            Err(e) => {
                warn!(error = %e, "telegram getUpdates failed");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    () = tokio::time::sleep(ERROR_BACKOFF) => {},
                }
            },
        }
    }
    info!("telegram polling stopped");
}

async fn dispatch(kind: UpdateKind, bot: &Bot, router: &BridgeRouter) {
    match kind {
        UpdateKind::Message(msg) => {
            let chat_id = msg.chat.id.0;
            debug!(chat_id, "received telegram message");
            if let Err(e) = handlers::handle_message(msg, router).await {
                error!(chat_id, error = %e, "error handling telegram message");
            }
        },
        UpdateKind::CallbackQuery(query) => {
            debug!(callback_data = ?query.data, "received telegram callback query");
            if let Err(e) = handlers::handle_callback_query(query, bot, router).await {
                error!(error = %e, "error handling telegram callback query");
            }
        },
        other => debug!("ignoring update: {other:?}"),
    }
}
