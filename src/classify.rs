//! Failure classification and backoff timing
//!
//! Every provider failure is reduced to one of three classes before the retry
//! machinery decides what to do with it: rate limits rotate the credential,
//! transients retry in place, permanents advance the model roster.

use crate::Error;
use std::time::Duration;

/// Shared failure taxonomy driving retry decisions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorClass {
    /// Provider throttled the request; rotate credential and back off
    RateLimited {
        /// Backoff hint parsed from the provider's response
        retry_after: Option<Duration>,
    },
    /// Retryable on the same credential and model after a short wait
    Transient,
    /// This model will not serve the request; advance the roster
    Permanent,
}

/// Markers providers embed in throttling error bodies
const RATE_LIMIT_MARKERS: &[&str] = &["resource_exhausted", "rate limit", "quota"];

/// Markers for errors that are permanent for the attempted model
const PERMANENT_MARKERS: &[&str] = &["model_not_found", "does not exist", "not supported"];

/// Classify an error into the retry taxonomy.
///
/// Transport errors (`reqwest` timeouts, connect failures) are transient;
/// anything unrecognized is treated as transient too, so a single odd reply
/// never burns a model's roster position.
pub fn classify(error: &Error) -> ErrorClass {
    match error {
        Error::RateLimited { retry_after, message } => ErrorClass::RateLimited {
            retry_after: (*retry_after).or_else(|| extract_retry_hint(message)),
        },
        Error::ModelUnavailable(_) => ErrorClass::Permanent,
        Error::ProviderTransient(message) => {
            let lower = message.to_lowercase();
            if RATE_LIMIT_MARKERS.iter().any(|m| lower.contains(m)) {
                ErrorClass::RateLimited {
                    retry_after: extract_retry_hint(message),
                }
            } else if PERMANENT_MARKERS.iter().any(|m| lower.contains(m)) {
                ErrorClass::Permanent
            } else {
                ErrorClass::Transient
            }
        }
        Error::Http(_) | Error::Json(_) => ErrorClass::Transient,
        _ => ErrorClass::Transient,
    }
}

/// Extract a backoff hint from an error body.
///
/// Recognized shapes: `retry in N seconds`, `"retryDelay": "Ns"`, and
/// `retry-after: N`. Fractional seconds are accepted.
pub fn extract_retry_hint(message: &str) -> Option<Duration> {
    let lower = message.to_lowercase();

    if let Some(rest) = lower.split("retry in ").nth(1) {
        if let Some(secs) = leading_number(rest) {
            return Some(Duration::from_secs_f64(secs));
        }
    }

    if let Some(rest) = lower.split("retrydelay").nth(1) {
        // Skip the `": "` decoration between the field name and value
        let rest = rest.trim_start_matches(|c: char| !c.is_ascii_digit());
        if let Some(secs) = leading_number(rest) {
            return Some(Duration::from_secs_f64(secs));
        }
    }

    if let Some(rest) = lower.split("retry-after:").nth(1) {
        if let Some(secs) = leading_number(rest.trim_start()) {
            return Some(Duration::from_secs_f64(secs));
        }
    }

    None
}

fn leading_number(s: &str) -> Option<f64> {
    let end = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());
    if end == 0 {
        return None;
    }
    s[..end].parse().ok()
}

/// Compute the wait before the next attempt: exponential in the
/// request-local failure count, capped at the configured ceiling.
///
/// A provider retry hint is deliberately not consulted here; the hint
/// describes when the rate-limited credential recovers, so it becomes that
/// key's cooldown, while the request itself moves on to a different
/// credential after this (much shorter) wait.
pub fn backoff_delay(base: Duration, ceiling: Duration, failures: u32) -> Duration {
    let exp = base.saturating_mul(1u32 << failures.min(16));
    exp.min(ceiling)
}
