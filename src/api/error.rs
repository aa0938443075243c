//! Typed failures for feed requests the poller needs to tell apart.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("request timed out")]
    Timeout,

    #[error("request failed: {status} - {body}")]
    Status { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl FeedError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, FeedError::Timeout)
    }
}

impl From<reqwest::Error> for FeedError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FeedError::Timeout
        } else if e.is_decode() {
            FeedError::Decode(e.to_string())
        } else {
            FeedError::Transport(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_message() {
        let err = FeedError::Status {
            status: 502,
            body: "bad gateway".to_string(),
        };
        assert_eq!(err.to_string(), "request failed: 502 - bad gateway");
        assert!(!err.is_timeout());
        assert!(FeedError::Timeout.is_timeout());
    }
}
