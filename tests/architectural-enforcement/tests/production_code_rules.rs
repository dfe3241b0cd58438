//! Production Code Rules
//!
//! Errors are propagated rather than unwrapped, and modules below the
//! orchestrator never reach back up into it.

use architectural_enforcement::{core_src, production_sources, report};

/// Modules below the orchestrator in the dependency order
const LEAF_MODULES: &[&str] = &[
    "error.rs",
    "request.rs",
    "provider.rs",
    "rate_limit.rs",
    "usage.rs",
    "store/mod.rs",
    "store/memory.rs",
];

#[test]
fn test_no_unwrap_in_production_code() {
    let mut violations = Vec::new();
    for file in production_sources(&core_src()) {
        for needle in [".unwrap()", ".expect("] {
            for (line, text) in file.find(needle) {
                violations.push((file.relative.clone(), line, text.to_string()));
            }
        }
    }
    assert!(
        violations.is_empty(),
        "Errors must be propagated, not unwrapped:\n{}",
        report(&violations)
    );
}

#[test]
fn test_leaf_modules_do_not_depend_on_orchestrator() {
    let mut violations = Vec::new();
    for file in production_sources(&core_src()) {
        if !LEAF_MODULES.contains(&file.relative.as_str()) {
            continue;
        }
        for needle in ["routing::router", "routing::dispatcher", "QueryRouter"] {
            for (line, text) in file.find(needle) {
                violations.push((file.relative.clone(), line, text.to_string()));
            }
        }
    }
    assert!(
        violations.is_empty(),
        "Leaf modules reaching into the orchestrator:\n{}",
        report(&violations)
    );
}

#[test]
fn test_sources_are_scanned() {
    let files = production_sources(&core_src());
    assert!(files.iter().any(|f| f.relative == "routing/router.rs"));
    assert!(files.iter().all(|f| f.relative != "routing/test_utils.rs"));
}
