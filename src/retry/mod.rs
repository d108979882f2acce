//! Jittered exponential backoff shared by the step runner and the MCP
//! Router. The two call sites use different exponent bases — the step
//! runner backs off by `2^(attempt-1)`, the router by `2^attempt` — matching
//! the two call sites in the system this crate implements; they are not the
//! same formula and must not be unified.

use std::time::Duration;

use rand::Rng;

const BACKOFF_CAP_SECS: f64 = 60.0;

/// Backoff before the step runner's next attempt, given the attempt number
/// just completed (1-indexed).
pub fn step_backoff(base: Duration, attempt: u32) -> Duration {
    jittered(base, attempt.saturating_sub(1))
}

/// Backoff before the MCP Router's next attempt, given the attempt number
/// just completed (0-indexed, matching the router's internal loop).
pub fn router_backoff(base: Duration, attempt: u32) -> Duration {
    jittered(base, attempt)
}

fn jittered(base: Duration, exponent: u32) -> Duration {
    let scale = 2f64.powi(exponent as i32);
    let jitter = rand::thread_rng().gen_range(0.8..=1.2);
    let secs = (base.as_secs_f64() * scale * jitter).min(BACKOFF_CAP_SECS);
    Duration::from_secs_f64(secs.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_backoff_first_attempt_is_roughly_base() {
        let base = Duration::from_secs_f64(0.5);
        let d = step_backoff(base, 1);
        assert!(d.as_secs_f64() >= 0.4 && d.as_secs_f64() <= 0.6);
    }

    #[test]
    fn step_backoff_grows_with_attempt() {
        let base = Duration::from_secs_f64(0.5);
        let first = step_backoff(base, 1).as_secs_f64();
        let third = step_backoff(base, 3).as_secs_f64();
        assert!(third > first);
    }

    #[test]
    fn backoff_is_capped() {
        let base = Duration::from_secs_f64(10.0);
        let d = router_backoff(base, 10);
        assert!(d.as_secs_f64() <= BACKOFF_CAP_SECS);
    }

    #[test]
    fn router_backoff_first_attempt_doubles_base() {
        // attempt=1 uses exponent 1 (2^1), unlike step_backoff's 2^0.
        let base = Duration::from_secs_f64(0.5);
        let d = router_backoff(base, 1).as_secs_f64();
        assert!(d >= 0.8 && d <= 1.2);
    }
}
