//! Utility functions used by Flock, and available when writing load tests.

use lazy_static::lazy_static;
use rand::Rng;
use regex::Regex;
use std::cmp::{max, min};
use std::str::FromStr;
use std::time;

use crate::CANCELED;

lazy_static! {
    static ref TIMESPAN: Option<Regex> =
        Regex::new(r"((?P<hours>\d+?)h)?((?P<minutes>\d+?)m)?((?P<seconds>\d+?)s)?").ok();
}

/// Parse a string representing a time span and return the number of seconds.
///
/// Can be specified as an integer, indicating seconds. Or can use integers
/// together with one or more of "h", "m", and "s", in that order, indicating
/// "hours", "minutes", and "seconds".
///
/// Valid formats include: 20, 20s, 3m, 2h, 1h20m, 3h30m10s, etc.
///
/// # Example
/// ```rust
/// use flock::util;
///
/// // 1 hour 2 minutes and 3 seconds is 3,723 seconds.
/// assert_eq!(util::parse_timespan("1h2m3s"), 3_723);
///
/// // 45 seconds is 45 seconds.
/// assert_eq!(util::parse_timespan("45"), 45);
///
/// // Invalid value is 0 seconds.
/// assert_eq!(util::parse_timespan("foo"), 0);
/// ```
pub fn parse_timespan(time_str: &str) -> usize {
    if let Ok(t) = usize::from_str(time_str) {
        trace!("{} is integer: {} seconds", time_str, t);
        return t;
    }

    let time_matches = match TIMESPAN.as_ref().and_then(|re| re.captures(time_str)) {
        Some(m) => m,
        None => return 0,
    };
    let component = |name: &str| {
        time_matches
            .name(name)
            .and_then(|m| usize::from_str(m.as_str()).ok())
            .unwrap_or(0)
    };
    let hours = component("hours");
    let minutes = component("minutes");
    let seconds = component("seconds");
    let total = hours * 60 * 60 + minutes * 60 + seconds;
    trace!(
        "{} hours {} minutes {} seconds: {} seconds",
        hours,
        minutes,
        seconds,
        total
    );
    total
}

/// Sleep for a specified duration, minus the time spent doing other things.
///
/// Every control loop in Flock paces itself with this helper, returning a fresh
/// drift timer for the next pass.
pub async fn sleep_minus_drift(
    duration: time::Duration,
    drift: tokio::time::Instant,
) -> tokio::time::Instant {
    match duration.checked_sub(drift.elapsed()) {
        Some(delay) if delay.as_nanos() > 0 => tokio::time::sleep(delay).await,
        _ => debug!("sleep_minus_drift: drift was greater than or equal to duration, not sleeping"),
    };
    tokio::time::Instant::now()
}

/// Calculate the greatest common divisor of two integers using binary GCD (or Stein's) algorithm.
///
/// # Example
/// ```rust
/// use flock::util;
///
/// assert_eq!(util::gcd(1, 100), 1);
/// assert_eq!(util::gcd(9, 102), 3);
/// assert_eq!(util::gcd(12345, 67890), 15);
/// ```
pub fn gcd(u: usize, v: usize) -> usize {
    match ((u, v), (u & 1, v & 1)) {
        ((x, y), _) if x == y => x,
        ((0, y), _) | ((y, 0), _) => y,
        ((x, y), (0, 1)) | ((y, x), (1, 0)) => gcd(x >> 1, y),
        ((x, y), (0, 0)) => gcd(x >> 1, y >> 1) << 1,
        ((x, y), (1, 1)) => {
            let (x, y) = (min(x, y), max(x, y));
            gcd((y - x) >> 1, x)
        }
        _ => unreachable!(),
    }
}

/// Round half to even at the given step, so 15 rounds to 20 and 25 rounds to 20
/// when stepping by 10. Saturates at `u64::MAX`.
pub(crate) fn round_half_even(value: u64, step: u64) -> u64 {
    if step <= 1 {
        return value;
    }
    let quotient = value / step;
    let remainder = value % step;
    let doubled = remainder.saturating_mul(2);
    let rounded = if doubled > step || (doubled == step && quotient % 2 == 1) {
        quotient.saturating_add(1)
    } else {
        quotient
    };
    rounded.saturating_mul(step)
}

/// Round a non-negative float to the nearest integer, halves going to the even
/// neighbour, so 0.5 rounds to 0 and 1.5 rounds to 2. Values too large for a
/// `u64` saturate at `u64::MAX`, and NaN becomes 0.
pub(crate) fn round_half_even_f64(value: f64) -> u64 {
    let floor = value.floor();
    let rounded = match value - floor {
        diff if diff > 0.5 => floor + 1.0,
        diff if diff == 0.5 && floor % 2.0 != 0.0 => floor + 1.0,
        _ => floor,
    };
    // Float to integer casts saturate.
    rounded as u64
}

/// Truncate strings when they're too long to display.
///
/// # Example
/// ```rust
/// use flock::util;
///
/// assert_eq!(util::truncate_string("this is a long string", 9), "this is..");
/// assert_eq!(util::truncate_string("shorter string", 15), "shorter string");
/// ```
pub fn truncate_string(str_to_truncate: &str, max_length: usize) -> String {
    if max_length >= 2 && str_to_truncate.char_indices().count() > max_length {
        match str_to_truncate.char_indices().nth(max_length - 2) {
            None => str_to_truncate.to_string(),
            Some((idx, _)) => format!("{}..", &str_to_truncate[..idx]),
        }
    } else {
        str_to_truncate.to_string()
    }
}

/// Determine if a timer expired, with second granularity.
///
/// A `run_time` of 0 disables the timer.
pub fn timer_expired(started: time::Instant, run_time: usize) -> bool {
    run_time > 0 && started.elapsed().as_secs() >= run_time as u64
}

/// Determine if a timer expired, with millisecond granularity.
pub fn ms_timer_expired(started: time::Instant, elapsed: usize) -> bool {
    elapsed > 0 && started.elapsed().as_millis() >= elapsed as u128
}

/// Convert optional string to f32, otherwise defaulting to 1.0.
///
/// # Example
/// ```rust
/// use flock::util;
///
/// assert_eq!(util::get_hatch_rate(Some(".1".to_string())), 0.1);
/// assert_eq!(util::get_hatch_rate(Some("1.1.1".to_string())), 1.0);
/// assert_eq!(util::get_hatch_rate(None), 1.0);
/// ```
pub fn get_hatch_rate(hatch_rate: Option<String>) -> f32 {
    get_float_from_string(hatch_rate).unwrap_or(1.0)
}

/// Convert optional string to f32, otherwise return None.
pub fn get_float_from_string(string: Option<String>) -> Option<f32> {
    match string {
        Some(s) => match s.parse::<f32>() {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("failed to convert {} to float: {}", s, e);
                None
            }
        },
        None => None,
    }
}

/// Random duration between `min` and `max`, inclusive, at millisecond granularity.
pub(crate) fn random_duration(min: time::Duration, max: time::Duration) -> time::Duration {
    let low = min.as_millis() as u64;
    let high = max.as_millis() as u64;
    if high <= low {
        return min;
    }
    time::Duration::from_millis(rand::rng().random_range(low..=high))
}

/// Identifier for this process incarnation: the hostname plus a random suffix, so
/// a restarted process never reuses the sequence numbers of its predecessor.
pub(crate) fn node_id(prefix: &str) -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string());
    let suffix: u32 = rand::rng().random();
    format!("{}_{}_{:08x}", prefix, host, suffix)
}

/// Milliseconds since the unix epoch.
pub(crate) fn epoch_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// Internal helper to configure the control-c handler. Shutdown cleanly on the first
// ctrl-c. Exit abruptly on the second ctrl-c.
pub(crate) fn setup_ctrlc_handler() {
    match ctrlc::set_handler(move || {
        if CANCELED.read().map(|c| *c).unwrap_or(false) {
            warn!("caught another ctrl-c, exiting immediately...");
            std::process::exit(1);
        } else {
            warn!("caught ctrl-c, stopping...");
            if let Ok(mut canceled) = CANCELED.write() {
                *canceled = true;
            }
        }
    }) {
        Ok(_) => (),
        Err(e) => {
            // A handler is already installed, as happens when several runs share one
            // process. Reset the flag so each run starts uncanceled.
            if let Ok(mut canceled) = CANCELED.write() {
                *canceled = false;
            }
            info!("reset ctrl-c handler: {}", e);
        }
    }
}

/// Whether ctrl-c has been caught.
pub(crate) fn canceled() -> bool {
    CANCELED.read().map(|c| *c).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timespan() {
        assert_eq!(parse_timespan("0"), 0);
        assert_eq!(parse_timespan("foo"), 0);
        assert_eq!(parse_timespan("1"), 1);
        assert_eq!(parse_timespan("1s"), 1);
        assert_eq!(parse_timespan("1m"), 60);
        assert_eq!(parse_timespan("1m1s"), 61);
        assert_eq!(parse_timespan("10m5s"), 605);
        assert_eq!(parse_timespan("1h"), 3600);
        assert_eq!(parse_timespan("1h5m13s"), 3913);
        assert_eq!(parse_timespan("2h3min"), 7380);
        assert_eq!(parse_timespan("88h88m88s"), 322168);
    }

    #[test]
    fn greatest_common_divisor() {
        assert_eq!(gcd(2, 4), 2);
        assert_eq!(gcd(1, 4), 1);
        assert_eq!(gcd(9, 102), 3);
        assert_eq!(gcd(12345, 98765), 5);
        assert_eq!(gcd(0, 7), 7);
        assert_eq!(gcd(7, 0), 7);
        assert_eq!(gcd(gcd(30, 90), 60), 30);
    }

    #[test]
    fn half_even_rounding() {
        assert_eq!(round_half_even(147, 10), 150);
        assert_eq!(round_half_even(143, 10), 140);
        assert_eq!(round_half_even(145, 10), 140);
        assert_eq!(round_half_even(155, 10), 160);
        assert_eq!(round_half_even(3432, 100), 3400);
        assert_eq!(round_half_even(58760, 1000), 59000);
        assert_eq!(round_half_even(42, 1), 42);
        // Rounding up past the largest step saturates.
        assert_eq!(round_half_even(u64::MAX, 1000), u64::MAX);
        assert_eq!(round_half_even(u64::MAX, 10), u64::MAX);
    }

    #[test]
    fn half_even_float_rounding() {
        assert_eq!(round_half_even_f64(0.0), 0);
        assert_eq!(round_half_even_f64(0.4), 0);
        assert_eq!(round_half_even_f64(0.5), 0);
        assert_eq!(round_half_even_f64(0.6), 1);
        assert_eq!(round_half_even_f64(1.5), 2);
        assert_eq!(round_half_even_f64(2.5), 2);
        assert_eq!(round_half_even_f64(3.5), 4);
        assert_eq!(round_half_even_f64(1e300), u64::MAX);
    }

    #[test]
    fn truncate() {
        assert_eq!(truncate_string("the quick brown fox", 10), "the quic..");
        assert_eq!(truncate_string("abcde", 5), "abcde");
        assert_eq!(truncate_string("abcde", 3), "a..");
        assert_eq!(truncate_string("これはテストだ", 3), "こ..");
    }

    #[test]
    fn random_wait() {
        let min = time::Duration::from_millis(10);
        let max = time::Duration::from_millis(20);
        for _ in 0..100 {
            let wait = random_duration(min, max);
            assert!(wait >= min && wait <= max);
        }
        assert_eq!(random_duration(max, max), max);
        assert_eq!(random_duration(max, min), max);
    }

    #[test]
    fn unique_node_ids() {
        let first = node_id("worker");
        let second = node_id("worker");
        assert!(first.starts_with("worker_"));
        assert_ne!(first, second);
    }

    #[test]
    fn hatch_rate() {
        assert!((get_hatch_rate(Some("1".to_string())) - 1.0).abs() < f32::EPSILON);
        assert!((get_hatch_rate(Some(".5".to_string())) - 0.5).abs() < f32::EPSILON);
        assert!((get_hatch_rate(Some("12.345".to_string())) - 12.345).abs() < f32::EPSILON);
        assert!((get_hatch_rate(None) - 1.0).abs() < f32::EPSILON);
        assert!((get_hatch_rate(Some("2.1f".to_string())) - 1.0).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn timer() {
        let started = time::Instant::now();
        assert!(!timer_expired(started, 60));
        assert!(!timer_expired(started, 0));
        assert!(!ms_timer_expired(started, 0));
        tokio::time::sleep(time::Duration::from_millis(1100)).await;
        assert!(timer_expired(started, 1));
        assert!(ms_timer_expired(started, 1000));
    }
}
