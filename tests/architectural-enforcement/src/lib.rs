//! Architectural Enforcement Integration Tests
//!
//! This package contains integration tests that enforce architectural principles
//! of the gateway core:
//! - No blocking sleeps, and async sleeps only where waiting is the job
//! - No `unwrap()`/`expect()` outside test code
//! - Leaf modules never reach up into the request orchestrator
//!
//! These tests are designed to catch violations early in the development cycle.

use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// Root of the gateway core sources
pub fn core_src() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../gateway/core/src")
        .canonicalize()
        .unwrap_or_else(|_| Path::new(env!("CARGO_MANIFEST_DIR")).join("../../gateway/core/src"))
}

/// A source file with its production section split from its tests
#[derive(Debug)]
pub struct SourceFile {
    /// Path relative to the crate `src/` directory, with `/` separators
    pub relative: String,
    /// Lines before the first `#[cfg(test)]`, numbered from 1
    pub production: Vec<(usize, String)>,
}

impl SourceFile {
    /// Production lines matching `needle`, skipping comments
    pub fn find(&self, needle: &str) -> Vec<(usize, &str)> {
        self.production
            .iter()
            .filter(|(_, line)| {
                let trimmed = line.trim_start();
                !trimmed.starts_with("//") && line.contains(needle)
            })
            .map(|(n, line)| (*n, line.as_str()))
            .collect()
    }
}

/// Every Rust file under `root`, test-only helper modules excluded
pub fn production_sources(root: &Path) -> Vec<SourceFile> {
    let mut files: Vec<SourceFile> = WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        .filter(|e| e.file_name() != "test_utils.rs")
        .filter_map(|e| {
            let content = fs::read_to_string(e.path()).ok()?;
            let relative = e
                .path()
                .strip_prefix(root)
                .ok()?
                .to_string_lossy()
                .replace('\\', "/");
            let production = content
                .lines()
                .take_while(|line| line.trim() != "#[cfg(test)]")
                .enumerate()
                .map(|(i, line)| (i + 1, line.to_string()))
                .collect();
            Some(SourceFile {
                relative,
                production,
            })
        })
        .collect();
    files.sort_by(|a, b| a.relative.cmp(&b.relative));
    files
}

/// Render violations for an assertion message
pub fn report(violations: &[(String, usize, String)]) -> String {
    violations
        .iter()
        .map(|(file, line, text)| format!("  {file}:{line}: {}", text.trim()))
        .collect::<Vec<_>>()
        .join("\n")
}
