//! Test-file discovery for pool runs.

use std::path::{Path, PathBuf};

use glob::Pattern;
use tracing::{debug, warn};

use crate::pool::WorkUnit;

/// File suffixes treated as test files by default.
pub const DEFAULT_SUFFIXES: &[&str] = &["_test.gr", ".test.gr"];

/// Collect files under `roots` whose names end with one of `suffixes`.
///
/// A root that is a file is kept when it matches. Missing roots are
/// skipped. The result is sorted and de-duplicated; when `filter` is set,
/// only paths containing it are kept.
#[must_use]
pub fn discover(roots: &[PathBuf], suffixes: &[String], filter: Option<&str>) -> Vec<PathBuf> {
    let mut found = Vec::new();

    for root in roots {
        if root.is_file() {
            if has_suffix(root, suffixes) {
                found.push(root.clone());
            }
            continue;
        }
        if !root.is_dir() {
            debug!(root = %root.display(), "discovery root does not exist, skipping");
            continue;
        }

        let base = Pattern::escape(&root.to_string_lossy());
        for suffix in suffixes {
            let pattern = format!("{base}/**/*{}", Pattern::escape(suffix));
            match glob::glob(&pattern) {
                Ok(paths) => found.extend(paths.filter_map(|entry| match entry {
                    Ok(path) if path.is_file() => Some(path),
                    Ok(_) => None,
                    Err(err) => {
                        warn!(error = %err, "unreadable path during discovery");
                        None
                    }
                })),
                Err(err) => warn!(%pattern, error = %err, "invalid discovery pattern"),
            }
        }
    }

    if let Some(filter) = filter {
        found.retain(|p| p.to_string_lossy().contains(filter));
    }
    found.sort();
    found.dedup();
    found
}

fn has_suffix(path: &Path, suffixes: &[String]) -> bool {
    let name = path.to_string_lossy();
    suffixes.iter().any(|s| name.ends_with(s.as_str()))
}

/// One unit per file: `program args.. <file>`, keyed by the file path.
#[must_use]
pub fn units_for_files(files: &[PathBuf], program: &str, args: &[String]) -> Vec<WorkUnit> {
    files
        .iter()
        .map(|file| {
            let key = file.to_string_lossy().into_owned();
            let mut argv = args.to_vec();
            argv.push(key.clone());
            WorkUnit::new(key, program, argv)
        })
        .collect()
}
