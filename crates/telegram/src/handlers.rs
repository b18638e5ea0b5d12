use {
    deskbridge_bridge::BridgeRouter,
    deskbridge_channels::{BotUser, parse_department_callback},
    teloxide::{
        prelude::*,
        types::{CallbackQuery, Message, User},
    },
    tracing::{debug, warn},
};

use crate::error::Result;

fn bot_user(user: &User) -> BotUser {
    let mut display_name = user.first_name.clone();
    if let Some(last) = user.last_name.as_deref().filter(|l| !l.is_empty()) {
        display_name.push(' ');
        display_name.push_str(last);
    }
    BotUser {
        id: user.id.0.to_string(),
        display_name,
        username: user.username.clone(),
    }
}

/// `/start` with its optional deep-link argument, `None` for anything else.
///
/// Group chats address the bot as `/start@name`, which counts as well.
fn parse_start(text: &str) -> Option<Option<&str>> {
    let mut parts = text.trim().splitn(2, char::is_whitespace);
    let command = parts.next()?;
    let command = command.split('@').next().unwrap_or(command);
    if command != "/start" {
        return None;
    }
    Some(parts.next().map(str::trim).filter(|arg| !arg.is_empty()))
}

/// Handle one incoming message: `/start` opens the menu, other commands
/// are ignored, and plain text goes to the selected department.
pub async fn handle_message(msg: Message, router: &BridgeRouter) -> Result<()> {
    let Some(from) = msg.from.as_ref() else {
        debug!(chat_id = msg.chat.id.0, "message without sender ignored");
        return Ok(());
    };
    if from.is_bot {
        return Ok(());
    }
    let Some(text) = msg.text() else {
        debug!(chat_id = msg.chat.id.0, "non-text message ignored");
        return Ok(());
    };

    let conversation_id = msg.chat.id.0.to_string();
    let user = bot_user(from);

    if let Some(argument) = parse_start(text) {
        router
            .handle_start(&conversation_id, &user, argument)
            .await?;
        return Ok(());
    }
    if text.starts_with('/') {
        debug!(chat_id = %conversation_id, command = text, "unknown command ignored");
        return Ok(());
    }
    router.handle_message(&conversation_id, &user, text).await?;
    Ok(())
}

/// Handle a department button press.
pub async fn handle_callback_query(
    query: CallbackQuery,
    bot: &Bot,
    router: &BridgeRouter,
) -> Result<()> {
    // Dismiss the loading spinner first, whatever the data says.
    if let Err(e) = bot.answer_callback_query(&query.id).await {
        warn!(error = %e, "failed to answer callback query");
    }

    let Some(department_id) = query.data.as_deref().and_then(parse_department_callback) else {
        debug!(data = ?query.data, "callback without department ignored");
        return Ok(());
    };
    let Some(chat_id) = query.message.as_ref().map(|m| m.chat().id) else {
        debug!("callback without message ignored");
        return Ok(());
    };

    let conversation_id = chat_id.0.to_string();
    let user = bot_user(&query.from);
    router
        .handle_department_selected(&conversation_id, &user, &department_id)
        .await?;
    Ok(())
}
