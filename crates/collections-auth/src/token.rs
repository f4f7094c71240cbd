//! The `Token` schema (spec §3): an OAuth access/refresh token pair with
//! enough metadata to decide when it needs refreshing.

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use collections_core::Clock;

/// Buffer before `expires_at` at which a token is considered expired, so
/// in-flight requests don't race an access token's actual expiry.
pub const DEFAULT_BUFFER_SECS: i64 = 300;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Token {
    pub provider: String,
    pub account_id: String,
    pub access_token: String,
    pub token_type: String,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    pub refresh_token: Option<String>,
    pub scope: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub cached_at: OffsetDateTime,
}

impl Token {
    /// `is_expired := now() >= expires_at - buffer`.
    pub fn is_expired_at(&self, now: OffsetDateTime, buffer_secs: i64) -> bool {
        now >= self.expires_at - Duration::seconds(buffer_secs)
    }

    pub fn is_expired(&self, clock: &dyn Clock, buffer_secs: i64) -> bool {
        self.is_expired_at(clock.now(), buffer_secs)
    }

    pub fn is_valid(&self, clock: &dyn Clock, buffer_secs: i64) -> bool {
        !self.is_expired(clock, buffer_secs)
    }

    /// First 8 characters of the access token, for audit logging — never
    /// log a full token (spec §4.3 step 5).
    pub fn access_token_prefix(&self) -> &str {
        let end = self.access_token.char_indices().nth(8).map(|(i, _)| i).unwrap_or(self.access_token.len());
        &self.access_token[..end]
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use collections_core::FixedClock;

    fn token_expiring_in(secs: i64, now: OffsetDateTime) -> Token {
        Token {
            provider: "microsoft".into(),
            account_id: "acct1".into(),
            access_token: "abcdefghijklmnop".into(),
            token_type: "Bearer".into(),
            expires_at: now + Duration::seconds(secs),
            refresh_token: Some("refresh-xyz".into()),
            scope: Some("Mail.Send".into()),
            cached_at: now,
        }
    }

    #[test]
    fn expires_at_minus_buffer_is_expired() {
        let now = OffsetDateTime::UNIX_EPOCH;
        let clock = FixedClock::new(now);
        let tok = token_expiring_in(DEFAULT_BUFFER_SECS, now);
        assert!(tok.is_expired(&clock, DEFAULT_BUFFER_SECS));
    }

    #[test]
    fn expires_at_minus_buffer_plus_one_is_not_expired() {
        let now = OffsetDateTime::UNIX_EPOCH;
        let clock = FixedClock::new(now);
        let tok = token_expiring_in(DEFAULT_BUFFER_SECS + 1, now);
        assert!(!tok.is_expired(&clock, DEFAULT_BUFFER_SECS));
    }

    #[test]
    fn access_token_prefix_is_first_eight_chars() {
        let now = OffsetDateTime::UNIX_EPOCH;
        let tok = token_expiring_in(3600, now);
        assert_eq!(tok.access_token_prefix(), "abcdefgh");
    }
}
