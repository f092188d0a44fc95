//! Integration Test: Panic Prohibition
//!
//! **Policy**: production code propagates errors. `unwrap()` and `expect()`
//! belong in tests only.

use architectural_enforcement::{production_sources, report};

#[test]
fn test_no_unwrap_in_production_code() {
    let mut violations = Vec::new();

    for file in production_sources() {
        for (line_number, code) in &file.lines {
            if code.contains(".unwrap()") {
                violations.push(file.violation(*line_number, "unwrap"));
            }
            if code.contains(".expect(") {
                violations.push(file.violation(*line_number, "expect"));
            }
        }
    }

    report(
        "unwrap()/expect() in production code",
        &violations,
        &[
            "✅ REQUIRED: return Result and use `?`",
            "✅ ACCEPTABLE: unwrap_or, unwrap_or_else, unwrap_or_default",
        ],
    );
}

#[test]
fn test_production_sources_are_found() {
    let files = production_sources();
    assert!(
        files.iter().any(|f| f.path.ends_with("routing/router.rs")),
        "router.rs must be scanned"
    );
    assert!(
        !files.iter().any(|f| f.path.ends_with("routing/test_utils.rs")),
        "test-only helpers are skipped"
    );
}
