//! Chat backends behind the [`Destination`] trait.
//!
//! Two destinations are implemented:
//! - [`telegram::TelegramDestination`]: Bot API via teloxide, MarkdownV2
//! - [`rocketchat::RocketChatDestination`]: REST `login` + `chat.sendMessage`
//!
//! A destination is stateless apart from its credentials; the session it
//! returns from [`Destination::authenticate`] is stored by the owning
//! aggregator and handed back on every send.

use async_trait::async_trait;

use crate::capture::sanitizer::Sanitizer;
use crate::format::Dialect;

pub mod rocketchat;
pub mod telegram;

/// Credentials obtained from a successful login.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Session {
    /// Bearer/auth token, when the backend issues one.
    pub auth_token: Option<String>,
    /// Account or session id paired with the token.
    pub user_id: Option<String>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("auth_token", &self.auth_token.as_ref().map(|_| "[REDACTED]"))
            .field("user_id", &self.user_id)
            .finish()
    }
}

/// Errors from a destination call.
#[derive(Debug, thiserror::Error)]
pub enum DestinationError {
    /// The backend rejected the credentials; the caller should re-login.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Login did not produce a session.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// HTTP transport failure.
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The backend answered with an error status.
    #[error("destination returned non-success status {status}: {body}")]
    HttpStatus {
        /// HTTP status code.
        status: u16,
        /// Shortened response body.
        body: String,
    },

    /// The backend answered 2xx but reported failure in the body.
    #[error("destination rejected the message: {0}")]
    Rejected(String),

    /// The response did not match the expected schema.
    #[error("response parse error: {0}")]
    Parse(String),

    /// Telegram Bot API failure.
    #[error("telegram request failed: {0}")]
    Telegram(String),
}

impl DestinationError {
    /// Whether this is the authorization-failure indicator.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }
}

/// A chat backend messages are delivered to.
#[async_trait]
pub trait Destination: Send + Sync {
    /// Short name used in logs and audit records.
    fn name(&self) -> &str;

    /// Markup dialect messages for this backend are rendered in.
    fn dialect(&self) -> Dialect;

    /// Exchange configured credentials for a session.
    async fn authenticate(&self) -> Result<Session, DestinationError>;

    /// Deliver one message, already bounded by the hard limit.
    async fn send(&self, session: &Session, text: &str) -> Result<(), DestinationError>;
}

/// Check HTTP response status and return body text or a structured error.
///
/// 401 and 403 map to [`DestinationError::Unauthorized`]. Error bodies are
/// scrubbed of token-like values and shortened.
///
/// # Errors
///
/// Returns `Request` on transport failure, `Unauthorized` or `HttpStatus`
/// on non-2xx.
pub async fn check_http_response(response: reqwest::Response) -> Result<String, DestinationError> {
    let status = response.status();
    let body = response.text().await?;
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(DestinationError::Unauthorized(format!(
            "status {}: {}",
            status.as_u16(),
            shorten_error_body(&body)
        )));
    }
    if !status.is_success() {
        return Err(DestinationError::HttpStatus {
            status: status.as_u16(),
            body: shorten_error_body(&body),
        });
    }
    Ok(body)
}

fn shorten_error_body(raw: &str) -> String {
    let scrubbed = Sanitizer::default().scrub_text(raw);
    let collapsed = scrubbed.split_whitespace().collect::<Vec<_>>().join(" ");

    const MAX_ERROR_BODY_CHARS: usize = 256;
    if collapsed.chars().count() > MAX_ERROR_BODY_CHARS {
        let shortened = collapsed
            .chars()
            .take(MAX_ERROR_BODY_CHARS)
            .collect::<String>();
        return format!("{shortened}...[truncated]");
    }

    collapsed
}
