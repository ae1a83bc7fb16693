use crate::config::KafkaConfig;
use chrono::Utc;
use rdkafka::message::{Header, Headers, OwnedHeaders};
use std::time::Duration;

/// Header carrying how many times the events of a message were redelivered
pub const ATTEMPT_HEADER: &str = "x-redelivery-attempt";
/// Header carrying the earliest processing time, in epoch milliseconds
pub const NOT_BEFORE_HEADER: &str = "x-not-before";

/// Redelivery bookkeeping carried on a republished message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedeliveryStamp {
    /// 1 for the first redelivery
    pub attempt: u32,
    /// Epoch milliseconds before which the message must not be processed
    pub not_before_ms: i64,
}

impl RedeliveryStamp {
    /// Read the stamp from message headers. Messages straight from the
    /// upload source carry none; unreadable values count as absent.
    pub fn from_headers<H: Headers>(headers: &H) -> Option<Self> {
        let mut attempt = None;
        let mut not_before_ms = None;

        for header in headers.iter() {
            let Some(value) = header.value.and_then(|v| std::str::from_utf8(v).ok()) else {
                continue;
            };
            match header.key {
                ATTEMPT_HEADER => attempt = value.trim().parse::<u32>().ok(),
                NOT_BEFORE_HEADER => not_before_ms = value.trim().parse::<i64>().ok(),
                _ => {}
            }
        }

        Some(Self {
            attempt: attempt.filter(|a| *a > 0)?,
            not_before_ms: not_before_ms.unwrap_or(0),
        })
    }

    pub fn to_headers(&self) -> OwnedHeaders {
        let attempt = self.attempt.to_string();
        let not_before = self.not_before_ms.to_string();

        OwnedHeaders::new()
            .insert(Header {
                key: ATTEMPT_HEADER,
                value: Some(attempt.as_str()),
            })
            .insert(Header {
                key: NOT_BEFORE_HEADER,
                value: Some(not_before.as_str()),
            })
    }
}

/// Exponential backoff with a cap on the number of redeliveries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedeliveryPolicy {
    backoff: Duration,
    backoff_max: Duration,
    max_attempts: u32,
}

impl RedeliveryPolicy {
    pub fn new(backoff: Duration, backoff_max: Duration, max_attempts: u32) -> Self {
        Self {
            backoff,
            backoff_max: backoff_max.max(backoff),
            max_attempts,
        }
    }

    pub fn from_config(config: &KafkaConfig) -> Self {
        Self::new(
            Duration::from_millis(config.retry_backoff_ms),
            Duration::from_millis(config.retry_backoff_max_ms),
            config.max_redeliveries,
        )
    }

    /// Base delay, also used before re-reading a message whose handling failed
    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    /// Delay before redelivery number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.backoff
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }

    /// Stamp for the next redelivery after `previous`, or `None` once the
    /// attempts are used up.
    pub fn next(&self, previous: Option<&RedeliveryStamp>, now_ms: i64) -> Option<RedeliveryStamp> {
        let attempt = previous.map_or(1, |stamp| stamp.attempt.saturating_add(1));
        if attempt > self.max_attempts {
            return None;
        }

        let delay_ms = i64::try_from(self.delay_for(attempt).as_millis()).unwrap_or(i64::MAX);
        Some(RedeliveryStamp {
            attempt,
            not_before_ms: now_ms.saturating_add(delay_ms),
        })
    }

    /// How long to hold a stamped message before handling it. Bounded by the
    /// maximum backoff so a skewed or forged timestamp cannot stall the consumer.
    pub fn wait(&self, stamp: &RedeliveryStamp, now_ms: i64) -> Duration {
        let remaining = stamp.not_before_ms.saturating_sub(now_ms);
        u64::try_from(remaining)
            .map(Duration::from_millis)
            .unwrap_or(Duration::ZERO)
            .min(self.backoff_max)
    }
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
