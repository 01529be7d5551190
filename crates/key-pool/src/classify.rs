//! Upstream outcome classification
//!
//! The status code is the authoritative signal: 429 means the key used for
//! the request is rate limited. Transport errors carry no status, so their
//! message text is checked for the upstream's `rate_limit` marker as a
//! best-effort fallback. Text matching can misfire in both directions and is
//! never applied to responses that carry a real status.

/// Marker the upstream puts in rate-limit error types (`rate_limit_exceeded`,
/// `rate_limit_error`).
const RATE_LIMIT_MARKER: &str = "rate_limit";

/// What the proxy should do with an upstream result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamOutcome {
    /// Pass the response through unchanged
    Success,
    /// Report the key and retry with another one
    RateLimited,
    /// Surface to the caller, no retry
    Failed,
}

/// Classify an upstream HTTP status.
pub fn classify_status(status: u16) -> UpstreamOutcome {
    match status {
        429 => UpstreamOutcome::RateLimited,
        400..=599 => UpstreamOutcome::Failed,
        _ => UpstreamOutcome::Success,
    }
}

/// Whether transport error text looks like a rate limit (case-insensitive).
pub fn is_rate_limit_message(message: &str) -> bool {
    message.to_lowercase().contains(RATE_LIMIT_MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_429_is_rate_limited() {
        assert_eq!(classify_status(429), UpstreamOutcome::RateLimited);
    }

    #[test]
    fn client_errors_other_than_429_fail() {
        for status in [400, 401, 403, 404, 408, 422] {
            assert_eq!(
                classify_status(status),
                UpstreamOutcome::Failed,
                "status {status} must not be retried"
            );
        }
    }

    #[test]
    fn server_errors_fail() {
        for status in [500, 502, 503, 504, 599] {
            assert_eq!(classify_status(status), UpstreamOutcome::Failed);
        }
    }

    #[test]
    fn success_and_redirect_statuses_pass_through() {
        assert_eq!(classify_status(200), UpstreamOutcome::Success);
        assert_eq!(classify_status(201), UpstreamOutcome::Success);
        assert_eq!(classify_status(304), UpstreamOutcome::Success);
    }

    #[test]
    fn rate_limit_marker_matches_case_insensitively() {
        assert!(is_rate_limit_message("rate_limit_exceeded"));
        assert!(is_rate_limit_message(
            "error decoding response: type RATE_LIMIT_ERROR"
        ));
    }

    #[test]
    fn plain_rate_limit_wording_does_not_match() {
        // Only the underscore marker counts; prose like "rate limit" is too
        // ambiguous to drive key rotation.
        assert!(!is_rate_limit_message("Rate limit reached, slow down"));
        assert!(!is_rate_limit_message("connection refused"));
        assert!(!is_rate_limit_message(""));
    }
}
