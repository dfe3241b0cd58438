//! Sleep Prohibition
//!
//! Production code waits on I/O, timers owned by the work itself, or
//! cancellation. Blocking sleeps are forbidden everywhere; async sleeps are
//! allowed only for retry backoff and rate-limit queue waits.

use architectural_enforcement::{core_src, production_sources, report};

/// Files whose job includes waiting: retry backoff and rate-limit queueing
const SLEEP_ALLOWED: &[&str] = &["routing/dispatcher.rs", "rate_limit.rs"];

#[test]
fn test_no_blocking_sleep() {
    let mut violations = Vec::new();
    for file in production_sources(&core_src()) {
        for (line, text) in file.find("thread::sleep") {
            violations.push((file.relative.clone(), line, text.to_string()));
        }
    }
    assert!(
        violations.is_empty(),
        "Blocking sleep in async code:\n{}",
        report(&violations)
    );
}

#[test]
fn test_async_sleep_only_where_waiting_is_the_job() {
    let mut violations = Vec::new();
    for file in production_sources(&core_src()) {
        if SLEEP_ALLOWED.contains(&file.relative.as_str()) {
            continue;
        }
        for (line, text) in file.find("time::sleep") {
            violations.push((file.relative.clone(), line, text.to_string()));
        }
    }
    assert!(
        violations.is_empty(),
        "Sleeping outside the dispatcher and rate limiter:\n{}",
        report(&violations)
    );
}
