//! Telegram Bot API rendezvous channel
//!
//! A bot that is an administrator of a Telegram channel posts handshake
//! messages there and long-polls `getUpdates` for posts from the other side.
//!
//! | Channel operation | Bot API call |
//! |---|---|
//! | `self_test` | `getMe` |
//! | `tail` | `getUpdates {offset: -1, timeout: 0}` |
//! | `poll` | `getUpdates {offset: since + 1, timeout, allowed_updates: ["channel_post"]}` |
//! | `publish` | `sendMessage {chat_id, text}` |

use std::time::Duration;

use reqwest::blocking::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::hub::{Channel, ChannelEntry, ChannelError};
use crate::p2p::signaling::LONG_POLL_INTERVAL;

// ============================================================================
// Constants
// ============================================================================

pub const API_BASE_URL: &str = "https://api.telegram.org";

/// Added on top of the long-poll interval for the HTTP request timeout
const HTTP_GRACE: Duration = Duration::from_secs(10);

const CHANNEL_POST_UPDATES: &[&str] = &["channel_post"];

// ============================================================================
// Wire types
// ============================================================================

/// Envelope of every Bot API response
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    pub result: Option<T>,
    pub description: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn into_result(self) -> Result<T, ChannelError> {
        match (self.ok, self.result) {
            (true, Some(result)) => Ok(result),
            (true, None) => Err(ChannelError::Api("response carries no result".into())),
            (false, _) => Err(ChannelError::Api(
                self.description.unwrap_or_else(|| "Unknown error".into()),
            )),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
    pub first_name: String,
    pub username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub channel_post: Option<Message>,
}

#[derive(Debug, Serialize)]
struct GetUpdates<'a> {
    offset: i64,
    timeout: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    allowed_updates: Option<&'a [&'a str]>,
}

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: i64,
    text: &'a str,
}

/// Map updates to channel entries, keeping every update identifier
pub fn entries_from_updates(updates: Vec<Update>) -> Vec<ChannelEntry> {
    updates
        .into_iter()
        .map(|update| {
            let (scope, text) = match update.channel_post {
                Some(post) => (Some(post.chat.id), post.text),
                None => (None, None),
            };
            ChannelEntry {
                id: update.update_id,
                scope,
                text,
            }
        })
        .collect()
}

// ============================================================================
// Client
// ============================================================================

/// Bot API client bound to one bot token
pub struct TelegramHub {
    client: Client,
    endpoint: String,
}

impl TelegramHub {
    /// `proxy` accepts any URL reqwest understands (http, https, socks5)
    pub fn new(token: &str, proxy: Option<&str>) -> Result<Self, ChannelError> {
        Self::with_base_url(API_BASE_URL, token, proxy)
    }

    pub fn with_base_url(
        base_url: &str,
        token: &str,
        proxy: Option<&str>,
    ) -> Result<Self, ChannelError> {
        let mut builder = Client::builder().timeout(LONG_POLL_INTERVAL + HTTP_GRACE);
        if let Some(proxy) = proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy).map_err(http)?);
            log::info!("Using proxy {} for Bot API requests", proxy);
        }
        Ok(Self {
            client: builder.build().map_err(http)?,
            endpoint: format!("{}/bot{}", base_url.trim_end_matches('/'), token),
        })
    }

    fn call<P, R>(&self, method: &str, params: &P, timeout: Duration) -> Result<R, ChannelError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        log::trace!("Bot API call {}", method);
        let response: ApiResponse<R> = self
            .client
            .post(format!("{}/{}", self.endpoint, method))
            .timeout(timeout)
            .json(params)
            .send()
            .map_err(http)?
            .json()
            .map_err(http)?;
        response.into_result()
    }

    fn get_updates(&self, params: &GetUpdates<'_>) -> Result<Vec<Update>, ChannelError> {
        let timeout = Duration::from_secs(params.timeout) + HTTP_GRACE;
        self.call("getUpdates", params, timeout)
    }
}

/// `getUpdates` takes whole seconds; round up so a short poll still blocks
fn long_poll_secs(long_poll: Duration) -> u64 {
    long_poll.as_secs() + u64::from(long_poll.subsec_nanos() > 0)
}

/// The token is part of the request URL; keep it out of error messages
fn http(e: reqwest::Error) -> ChannelError {
    ChannelError::Http(e.without_url())
}

impl Channel for TelegramHub {
    fn self_test(&self) -> Result<String, ChannelError> {
        let me: User = self.call("getMe", &serde_json::json!({}), HTTP_GRACE)?;
        let name = me.username.unwrap_or(me.first_name);
        log::info!("Authorized as bot {} (id {})", name, me.id);
        Ok(name)
    }

    fn tail(&self) -> Result<i64, ChannelError> {
        let updates = self.get_updates(&GetUpdates {
            offset: -1,
            timeout: 0,
            allowed_updates: None,
        })?;
        Ok(updates.last().map_or(0, |u| u.update_id))
    }

    fn publish(&self, scope: i64, text: &str) -> Result<i64, ChannelError> {
        let message: Message = self.call(
            "sendMessage",
            &SendMessage {
                chat_id: scope,
                text,
            },
            HTTP_GRACE,
        )?;
        Ok(message.message_id)
    }

    fn poll(&self, since: i64, long_poll: Duration) -> Result<Vec<ChannelEntry>, ChannelError> {
        let updates = self.get_updates(&GetUpdates {
            offset: since + 1,
            timeout: long_poll_secs(long_poll),
            allowed_updates: Some(CHANNEL_POST_UPDATES),
        })?;
        log::trace!("getUpdates returned {} updates past {}", updates.len(), since);
        Ok(entries_from_updates(updates))
    }
}

// ============================================================================
// Tests
// ============================================================================
