//! Integration Test: Blocking I/O Prohibition
//!
//! **Policy**: async functions in production code MUST NOT use blocking I/O.
//! **Required**: `tokio::fs` and `tokio::net` inside async code.
//!
//! Synchronous functions may read files directly; configuration loading runs
//! before the dispatcher starts.

use architectural_enforcement::{is_in_async_function, production_sources, report};

const BLOCKING: &[(&str, &str)] = &[
    ("std::fs::", "Blocking file I/O"),
    ("std::net::TcpStream", "Blocking network I/O"),
    ("std::net::TcpListener", "Blocking network I/O"),
    ("std::process::Command", "Blocking process spawn"),
    ("std::thread::sleep", "Blocking sleep"),
];

#[test]
fn test_no_blocking_io_in_async_code() {
    let mut violations = Vec::new();

    for file in production_sources() {
        for (idx, (line_number, code)) in file.lines.iter().enumerate() {
            for (pattern, what) in BLOCKING {
                if code.contains(pattern) && is_in_async_function(&file.lines, idx) {
                    violations.push(file.violation(*line_number, what));
                }
            }
        }
    }

    report(
        "Blocking I/O in async production code",
        &violations,
        &[
            "✅ REQUIRED: tokio::fs::read().await, tokio::net::TcpStream::connect().await",
            "✅ ACCEPTABLE: std::fs in synchronous functions (configuration loading)",
        ],
    );
}

#[test]
fn test_no_blocking_network_imports() {
    let mut violations = Vec::new();

    for file in production_sources() {
        for (line_number, code) in &file.lines {
            let code = code.trim();
            if code.starts_with("use std::net") && !code.contains("SocketAddr") {
                violations.push(file.violation(*line_number, "Blocking network import"));
            }
        }
    }

    report(
        "Blocking network types imported",
        &violations,
        &["✅ REQUIRED: tokio::net for every connection"],
    );
}
