//! Telegram destination using teloxide `Bot` directly (send-only, no dispatcher).

use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::ParseMode;
use teloxide::{ApiError, RequestError};

use crate::config::TelegramSettings;
use crate::format::Dialect;

use super::{Destination, DestinationError, Session};

/// Telegram destination posting MarkdownV2 messages to one chat.
pub struct TelegramDestination {
    bot: Bot,
    chat_id: ChatId,
}

impl std::fmt::Debug for TelegramDestination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramDestination")
            .field("chat_id", &self.chat_id)
            .finish_non_exhaustive()
    }
}

impl TelegramDestination {
    /// Create a destination from resolved settings.
    pub fn new(settings: TelegramSettings) -> Self {
        Self {
            bot: Bot::new(settings.bot_token),
            chat_id: ChatId(settings.chat_id),
        }
    }
}

/// Map a teloxide error, flagging token rejection as unauthorized.
pub fn map_request_error(error: RequestError) -> DestinationError {
    match error {
        RequestError::Api(ApiError::InvalidToken) => {
            DestinationError::Unauthorized("telegram rejected the bot token".to_owned())
        }
        other => DestinationError::Telegram(other.to_string()),
    }
}

#[async_trait]
impl Destination for TelegramDestination {
    fn name(&self) -> &str {
        "telegram"
    }

    fn dialect(&self) -> Dialect {
        Dialect::TelegramMarkdown
    }

    /// Bot tokens do not expire; `getMe` only proves the token works.
    async fn authenticate(&self) -> Result<Session, DestinationError> {
        let me = self.bot.get_me().await.map_err(|e| match map_request_error(e) {
            DestinationError::Unauthorized(msg) => DestinationError::Auth(msg),
            other => other,
        })?;
        Ok(Session {
            auth_token: None,
            user_id: Some(me.user.id.0.to_string()),
        })
    }

    async fn send(&self, _session: &Session, text: &str) -> Result<(), DestinationError> {
        self.bot
            .send_message(self.chat_id, text)
            .parse_mode(ParseMode::MarkdownV2)
            .await
            .map(|_| ())
            .map_err(map_request_error)
    }
}
