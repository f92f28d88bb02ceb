use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which layer decided to retry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryLabel {
    /// Transport policy: retryable status or transient connection failure
    Client,
    /// Application layer: successful status with an empty body
    Empty,
    /// Application layer: body could not be read or decoded
    Exception,
}

impl RetryLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryLabel::Client => "client",
            RetryLabel::Empty => "empty",
            RetryLabel::Exception => "exception",
        }
    }
}

impl std::fmt::Display for RetryLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single backoff decision, published for diagnostics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryEvent {
    pub label: RetryLabel,
    #[serde(with = "millis")]
    pub delay: Duration,
    pub attempt: u32,
    pub url: String,
    pub timestamp: DateTime<Utc>,
}

impl RetryEvent {
    pub fn new(label: RetryLabel, delay: Duration, attempt: u32, url: &str) -> Self {
        Self {
            label,
            delay,
            attempt,
            url: url.to_string(),
            timestamp: Utc::now(),
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
