//! Architectural Enforcement Integration Tests
//!
//! This package scans the switchboard crates and fails when production code
//! breaks one of the workspace rules:
//! - No sleeping except retry backoff
//! - No blocking I/O inside async functions
//! - No `unwrap()`/`expect()` outside tests
//!
//! "Production code" is every line of a source file above its first
//! `#[cfg(test)]`. Files that only exist for tests are skipped entirely.

use std::fs;
use std::path::{Path, PathBuf};

/// Source directories checked by every rule, relative to the workspace root
pub const PRODUCTION_DIRS: &[&str] = &["switchboard/core/src", "switchboard/cli/src"];

/// Files compiled only under `cfg(test)`
const TEST_ONLY_FILES: &[&str] = &["test_utils.rs"];

/// Production lines of one source file
pub struct SourceFile {
    pub path: PathBuf,
    /// `(line number, line)` pairs, comments stripped
    pub lines: Vec<(usize, String)>,
}

impl SourceFile {
    /// Read a file and keep only its production lines
    pub fn load(path: &Path) -> Option<Self> {
        let content = fs::read_to_string(path).ok()?;
        Some(Self::parse(path, &content))
    }

    pub fn parse(path: &Path, content: &str) -> Self {
        let lines = content
            .lines()
            .enumerate()
            .take_while(|(_, line)| !line.trim_start().starts_with("#[cfg(test)]"))
            .map(|(idx, line)| (idx + 1, strip_comment(line).to_string()))
            .collect();
        Self {
            path: path.to_path_buf(),
            lines,
        }
    }

    /// Format a violation at a line
    pub fn violation(&self, line_number: usize, what: &str) -> String {
        let text = self
            .lines
            .iter()
            .find(|(n, _)| *n == line_number)
            .map_or("", |(_, l)| l.trim());
        format!("{}:{} - {}: {}", self.path.display(), line_number, what, text)
    }
}

/// Everything before a `//` comment marker
///
/// A `//` inside a string literal (`"https://..."`) does not start a
/// comment. Character literals such as `'"'` do not open a string.
pub fn strip_comment(line: &str) -> &str {
    let bytes = line.as_bytes();
    let mut in_string = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if in_string => i += 1,
            b'"' => in_string = !in_string,
            b'\'' if !in_string => {
                if bytes.get(i + 1) == Some(&b'\\') && bytes.get(i + 3) == Some(&b'\'') {
                    i += 3;
                } else if bytes.get(i + 2) == Some(&b'\'') {
                    i += 2;
                }
            }
            b'/' if !in_string && bytes.get(i + 1) == Some(&b'/') => return &line[..i],
            _ => {}
        }
        i += 1;
    }
    line
}

/// Workspace root, two levels above this package
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .ancestors()
        .nth(2)
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}

/// Every production source file under [`PRODUCTION_DIRS`]
pub fn production_sources() -> Vec<SourceFile> {
    let root = workspace_root();
    let mut files = Vec::new();

    for dir in PRODUCTION_DIRS {
        let path = root.join(dir);
        if !path.exists() {
            continue;
        }
        for entry in walkdir::WalkDir::new(&path)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("rs") {
                continue;
            }
            let name = path.file_name().and_then(|s| s.to_str()).unwrap_or("");
            if TEST_ONLY_FILES.contains(&name) {
                continue;
            }
            if let Some(file) = SourceFile::load(path) {
                files.push(file);
            }
        }
    }
    files
}

/// Whether the function enclosing `idx` is `async`
///
/// Scans backwards for the nearest `fn` signature.
pub fn is_in_async_function(lines: &[(usize, String)], idx: usize) -> bool {
    for (_, line) in lines[..=idx].iter().rev() {
        let line = line.trim();
        if line.contains("fn ") {
            return line.contains("async fn ");
        }
    }
    false
}

/// Whether any line within `before` lines above `idx` mentions one of `words`
pub fn has_nearby(lines: &[(usize, String)], idx: usize, before: usize, words: &[&str]) -> bool {
    lines[idx.saturating_sub(before)..=idx].iter().any(|(_, line)| {
        let line = line.to_lowercase();
        words.iter().any(|w| line.contains(w))
    })
}

/// Print the violations and panic when there are any
pub fn report(rule: &str, violations: &[String], guidance: &[&str]) {
    if violations.is_empty() {
        return;
    }

    eprintln!("\n❌ CRITICAL: {rule}\n");
    for violation in violations {
        eprintln!("  ❌ {violation}");
    }
    eprintln!();
    for line in guidance {
        eprintln!("  {line}");
    }

    panic!(
        "\nFound {} violation(s) of '{rule}' in production code.\nFix these before merging!",
        violations.len()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_production_lines_stop_at_test_module() {
        let content = "fn a() {}\n// note\n#[cfg(test)]\nmod tests {\n    fn b() { x.unwrap(); }\n}\n";
        let file = SourceFile::parse(Path::new("x.rs"), content);
        assert_eq!(file.lines.len(), 2);
        assert_eq!(file.lines[1].1, "");
    }

    #[test]
    fn test_comment_marker_inside_string_is_kept() {
        let line = r#"let url = "https://api.example.com"; client.get(&url).unwrap(); // fetch"#;
        let code = strip_comment(line);
        assert!(code.contains(".unwrap()"));
        assert!(!code.contains("fetch"));

        assert_eq!(strip_comment(r#"let q = '"'; x.unwrap() // "#), r#"let q = '"'; x.unwrap() "#);
        assert_eq!(strip_comment(r#"let s = "a \" // b"; // c"#), r#"let s = "a \" // b"; "#);
        assert_eq!(strip_comment("fn f<'a>(x: &'a str) // note"), "fn f<'a>(x: &'a str) ");
        assert_eq!(strip_comment("/// docs"), "");
    }

    #[test]
    fn test_async_function_detection() {
        let lines: Vec<(usize, String)> = [
            "pub async fn probe(&self) {",
            "    let x = 1;",
            "}",
            "fn load() {",
            "    let y = 2;",
        ]
        .iter()
        .enumerate()
        .map(|(i, l)| (i + 1, (*l).to_string()))
        .collect();

        assert!(is_in_async_function(&lines, 1));
        assert!(!is_in_async_function(&lines, 4));
    }

    #[test]
    fn test_nearby_words() {
        let lines: Vec<(usize, String)> = ["let backoff = retry.backoff(1);", "a", "b", "sleep(x)"]
            .iter()
            .enumerate()
            .map(|(i, l)| (i + 1, (*l).to_string()))
            .collect();
        assert!(has_nearby(&lines, 3, 3, &["backoff"]));
        assert!(!has_nearby(&lines, 3, 1, &["backoff"]));
    }

    #[test]
    fn test_workspace_root_holds_the_crates() {
        assert!(workspace_root().join("switchboard/core/Cargo.toml").exists());
    }
}
