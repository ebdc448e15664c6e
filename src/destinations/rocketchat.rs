//! Rocket.Chat REST destination.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::RocketChatSettings;
use crate::format::Dialect;

use super::{check_http_response, Destination, DestinationError, Session};

// ---------------------------------------------------------------------------
// Wire types (pub for integration testing)
// ---------------------------------------------------------------------------

/// `POST /api/v1/login` body.
#[doc(hidden)]
#[derive(Debug, Serialize)]
pub struct LoginRequest<'a> {
    /// Login name.
    pub username: &'a str,
    /// Password.
    pub password: &'a str,
}

/// `POST /api/v1/login` response.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct LoginResponse {
    /// `success` or `error`.
    pub status: String,
    /// Present on success.
    #[serde(default)]
    pub data: Option<LoginData>,
    /// Present on failure.
    #[serde(default)]
    pub message: Option<String>,
}

/// Session fields in the login response.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginData {
    /// Token for `X-Auth-Token`.
    pub auth_token: String,
    /// Id for `X-User-Id`.
    pub user_id: String,
}

/// `POST /api/v1/chat.sendMessage` body.
#[doc(hidden)]
#[derive(Debug, Serialize)]
pub struct SendRequest<'a> {
    /// The message.
    pub message: OutgoingMessage<'a>,
}

/// Message envelope.
#[doc(hidden)]
#[derive(Debug, Serialize)]
pub struct OutgoingMessage<'a> {
    /// Room id or channel name.
    pub rid: &'a str,
    /// Message text.
    pub msg: &'a str,
}

/// `POST /api/v1/chat.sendMessage` response.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct SendResponse {
    /// Whether the message was accepted.
    pub success: bool,
    /// Error text when rejected.
    #[serde(default)]
    pub error: Option<String>,
}

/// Parse a login response body into a session.
///
/// # Errors
///
/// Returns `Parse` for an unexpected body and `Auth` when the server
/// reports a failed login.
#[doc(hidden)]
pub fn parse_login_response(body: &str) -> Result<Session, DestinationError> {
    let resp: LoginResponse =
        serde_json::from_str(body).map_err(|e| DestinationError::Parse(e.to_string()))?;
    match (resp.status.as_str(), resp.data) {
        ("success", Some(data)) => Ok(Session {
            auth_token: Some(data.auth_token),
            user_id: Some(data.user_id),
        }),
        (status, _) => Err(DestinationError::Auth(
            resp.message
                .unwrap_or_else(|| format!("login returned status '{status}'")),
        )),
    }
}

/// Parse a send response body.
///
/// # Errors
///
/// Returns `Parse` for an unexpected body and `Rejected` when `success` is false.
#[doc(hidden)]
pub fn parse_send_response(body: &str) -> Result<(), DestinationError> {
    let resp: SendResponse =
        serde_json::from_str(body).map_err(|e| DestinationError::Parse(e.to_string()))?;
    if resp.success {
        Ok(())
    } else {
        Err(DestinationError::Rejected(
            resp.error.unwrap_or_else(|| "success=false".to_owned()),
        ))
    }
}

// ---------------------------------------------------------------------------
// Destination
// ---------------------------------------------------------------------------

/// Rocket.Chat destination posting into one room.
pub struct RocketChatDestination {
    base: Url,
    username: String,
    password: String,
    channel: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for RocketChatDestination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocketChatDestination")
            .field("base", &self.base.as_str())
            .field("username", &self.username)
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

impl RocketChatDestination {
    /// Create a destination from resolved settings.
    pub fn new(settings: RocketChatSettings) -> Self {
        let mut base = settings.server_url;
        // `Url::join` replaces the last segment unless the path ends with '/'.
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Self {
            base,
            username: settings.username,
            password: settings.password,
            channel: settings.channel,
            client: reqwest::Client::new(),
        }
    }

    /// Absolute URL of an API endpoint.
    ///
    /// # Errors
    ///
    /// Returns `Parse` if the path cannot be joined.
    pub fn endpoint(&self, path: &str) -> Result<Url, DestinationError> {
        self.base
            .join(path)
            .map_err(|e| DestinationError::Parse(e.to_string()))
    }
}

#[async_trait]
impl Destination for RocketChatDestination {
    fn name(&self) -> &str {
        "rocketchat"
    }

    fn dialect(&self) -> Dialect {
        Dialect::Plain
    }

    async fn authenticate(&self) -> Result<Session, DestinationError> {
        let response = self
            .client
            .post(self.endpoint("api/v1/login")?)
            .json(&LoginRequest {
                username: &self.username,
                password: &self.password,
            })
            .send()
            .await?;
        let body = check_http_response(response).await.map_err(|e| match e {
            // A 401 on login means bad credentials, not an expired session.
            DestinationError::Unauthorized(msg) => DestinationError::Auth(msg),
            other => other,
        })?;
        parse_login_response(&body)
    }

    async fn send(&self, session: &Session, text: &str) -> Result<(), DestinationError> {
        let (Some(token), Some(user_id)) = (&session.auth_token, &session.user_id) else {
            return Err(DestinationError::Unauthorized(
                "session has no auth token".to_owned(),
            ));
        };
        let response = self
            .client
            .post(self.endpoint("api/v1/chat.sendMessage")?)
            .header("X-Auth-Token", token)
            .header("X-User-Id", user_id)
            .json(&SendRequest {
                message: OutgoingMessage {
                    rid: &self.channel,
                    msg: text,
                },
            })
            .send()
            .await?;
        let body = check_http_response(response).await?;
        parse_send_response(&body)
    }
}
