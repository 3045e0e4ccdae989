//! Rendezvous channel abstraction
//!
//! A hub is a shared, append-only message board both peers can post to and
//! read from. Entries carry a monotonically increasing identifier; readers
//! track a cursor and only ever ask for entries past it.

use std::time::Duration;

use thiserror::Error;

/// One entry observed on the channel
///
/// Entries that are not channel posts (or carry no text) are still reported
/// with their identifier so readers can move their cursor past them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelEntry {
    pub id: i64,
    /// Identity of the chat the entry was posted to
    pub scope: Option<i64>,
    pub text: Option<String>,
}

impl ChannelEntry {
    pub fn post(id: i64, scope: i64, text: impl Into<String>) -> Self {
        Self {
            id,
            scope: Some(scope),
            text: Some(text.into()),
        }
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("HTTP request failed")]
    Http(#[from] reqwest::Error),

    #[error("API error: {0}")]
    Api(String),
}

/// Operations the handshake needs from a rendezvous transport
pub trait Channel {
    /// Verify credentials; returns the display name of our identity
    fn self_test(&self) -> Result<String, ChannelError>;

    /// Identifier of the newest entry, 0 if the channel is empty
    fn tail(&self) -> Result<i64, ChannelError>;

    /// Post `text` to `scope`; returns the identifier the channel assigned
    /// to the post
    ///
    /// This identifier may live in a different space from the entry
    /// identifiers returned by `tail` and `poll` (Telegram numbers messages
    /// per chat but updates per bot), so it is only good for logging and
    /// never feeds a cursor.
    fn publish(&self, scope: i64, text: &str) -> Result<i64, ChannelError>;

    /// Entries with identifier greater than `since`, in ascending order
    ///
    /// Blocks up to `long_poll` when nothing new is available.
    fn poll(&self, since: i64, long_poll: Duration) -> Result<Vec<ChannelEntry>, ChannelError>;
}

impl<C: Channel + ?Sized> Channel for &C {
    fn self_test(&self) -> Result<String, ChannelError> {
        (**self).self_test()
    }

    fn tail(&self) -> Result<i64, ChannelError> {
        (**self).tail()
    }

    fn publish(&self, scope: i64, text: &str) -> Result<i64, ChannelError> {
        (**self).publish(scope, text)
    }

    fn poll(&self, since: i64, long_poll: Duration) -> Result<Vec<ChannelEntry>, ChannelError> {
        (**self).poll(since, long_poll)
    }
}
