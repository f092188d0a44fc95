//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code MUST NOT sleep. Waiting happens on I/O,
//! timeouts or `tokio::time::interval`.
//! **Exception**: the pause between retries of one backend.

use architectural_enforcement::{has_nearby, production_sources, report};

#[test]
fn test_no_sleep_in_production_code() {
    let mut violations = Vec::new();

    for file in production_sources() {
        for (idx, (line_number, code)) in file.lines.iter().enumerate() {
            if !(code.contains("::sleep(") || code.contains(".sleep(")) {
                continue;
            }
            if code.contains("std::thread::sleep") {
                violations.push(file.violation(*line_number, "blocking sleep"));
                continue;
            }
            if has_nearby(&file.lines, idx, 5, &["backoff"]) {
                continue;
            }
            violations.push(file.violation(*line_number, "sleep"));
        }
    }

    report(
        "Sleep calls found in production code",
        &violations,
        &[
            "✅ ACCEPTABLE: tokio::time::sleep for retry backoff",
            "✅ ACCEPTABLE: tokio::time::interval for periodic tasks",
            "❌ FORBIDDEN: std::thread::sleep anywhere",
            "❌ FORBIDDEN: sleeping to wait for another task (use channels or Shared futures)",
        ],
    );
}
