use std::{future::Future, time::Duration};

use {
    async_trait::async_trait,
    deskbridge_channels::{BotOutbound, ChannelType, DepartmentChoice, Error, Result},
    teloxide::{
        RequestError,
        payloads::SendMessageSetters,
        prelude::*,
        types::{ChatId, InlineKeyboardButton, InlineKeyboardMarkup},
    },
    tracing::{debug, warn},
};

const TELEGRAM_RETRY_AFTER_MAX_RETRIES: usize = 4;

/// Sends bridge replies and menus to Telegram chats.
#[derive(Clone)]
pub struct TelegramOutbound {
    bot: Bot,
}

impl TelegramOutbound {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    async fn run_with_retry<T, F, Fut>(
        &self,
        chat_id: &str,
        operation: &'static str,
        mut request: F,
    ) -> std::result::Result<T, RequestError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, RequestError>>,
    {
        let mut retries = 0usize;

        loop {
            match request().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let Some(wait) = retry_after_duration(&err) else {
                        return Err(err);
                    };
                    if retries >= TELEGRAM_RETRY_AFTER_MAX_RETRIES {
                        warn!(
                            chat_id,
                            operation,
                            retries,
                            retry_after_secs = wait.as_secs(),
                            "telegram rate limit persisted after retries"
                        );
                        return Err(err);
                    }
                    retries += 1;
                    warn!(
                        chat_id,
                        operation,
                        retries,
                        retry_after_secs = wait.as_secs(),
                        "telegram rate limited, waiting before retry"
                    );
                    tokio::time::sleep(wait).await;
                },
            }
        }
    }
}

fn retry_after_duration(error: &RequestError) -> Option<Duration> {
    match error {
        RequestError::RetryAfter(wait) => Some(wait.duration()),
        _ => None,
    }
}

fn parse_chat_id(conversation_id: &str) -> Result<ChatId> {
    conversation_id
        .parse::<i64>()
        .map(ChatId)
        .map_err(|_| Error::invalid_input(format!("not a telegram chat id: {conversation_id}")))
}

/// Telegram API rejections are final; anything else may clear up.
fn channel_error(operation: &str, error: RequestError) -> Error {
    if matches!(error, RequestError::Api(_)) {
        Error::external(operation, error)
    } else {
        Error::unavailable(format!("{operation}: {error}"))
    }
}

/// One button per row.
pub fn department_keyboard(choices: &[DepartmentChoice]) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(
        choices
            .iter()
            .map(|c| vec![InlineKeyboardButton::callback(c.label.clone(), c.callback_data())]),
    )
}

#[async_trait]
impl BotOutbound for TelegramOutbound {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Telegram
    }

    async fn send_text(&self, conversation_id: &str, text: &str) -> Result<()> {
        let chat = parse_chat_id(conversation_id)?;
        self.run_with_retry(conversation_id, "send_message", || {
            self.bot.send_message(chat, text).send()
        })
        .await
        .map_err(|e| channel_error("send_message", e))?;
        debug!(chat_id = conversation_id, "telegram message sent");
        Ok(())
    }

    async fn send_department_menu(
        &self,
        conversation_id: &str,
        text: &str,
        choices: &[DepartmentChoice],
    ) -> Result<()> {
        let chat = parse_chat_id(conversation_id)?;
        let keyboard = department_keyboard(choices);
        self.run_with_retry(conversation_id, "send_department_menu", || {
            self.bot
                .send_message(chat, text)
                .reply_markup(keyboard.clone())
                .send()
        })
        .await
        .map_err(|e| channel_error("send_department_menu", e))?;
        Ok(())
    }
}
