//! Wall-clock helpers.
//!
//! Server timestamps and entry expiries are milliseconds since the Unix
//! epoch, matching what the upstream emits.

use chrono::Utc;

/// Milliseconds since the Unix epoch, as the upstream server counts them.
pub type ServerTimestamp = i64;

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_ms_is_recent() {
        // Anything after 2020-01-01 and before 2100.
        let now = now_ms();
        assert!(now > 1_577_836_800_000);
        assert!(now < 4_102_444_800_000);
    }
}
