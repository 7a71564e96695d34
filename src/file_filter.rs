//! Gitignore-style, size, and library-content file filtering (spec §4.G).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use glob::Pattern;
use serde::{Deserialize, Serialize};

use crate::config::FileFilteringConfig;

/// Why a candidate file was excluded, or that it was kept — the exit path
/// counted by [`FilterStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOutcome {
    ForceIncluded,
    IgnorePattern,
    Gitignore,
    TooLarge,
    CssFile,
    TestFile,
    DocFile,
    LogFile,
    LibraryContent,
    Included,
}

/// Counts of each [`FilterOutcome`] across one `filter` call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterStats {
    pub force_included: usize,
    pub ignore_pattern: usize,
    pub gitignore: usize,
    pub too_large: usize,
    pub css_file: usize,
    pub test_file: usize,
    pub doc_file: usize,
    pub log_file: usize,
    pub library_content: usize,
    pub included: usize,
}

impl FilterStats {
    fn record(&mut self, outcome: FilterOutcome) {
        match outcome {
            FilterOutcome::ForceIncluded => self.force_included += 1,
            FilterOutcome::IgnorePattern => self.ignore_pattern += 1,
            FilterOutcome::Gitignore => self.gitignore += 1,
            FilterOutcome::TooLarge => self.too_large += 1,
            FilterOutcome::CssFile => self.css_file += 1,
            FilterOutcome::TestFile => self.test_file += 1,
            FilterOutcome::DocFile => self.doc_file += 1,
            FilterOutcome::LogFile => self.log_file += 1,
            FilterOutcome::LibraryContent => self.library_content += 1,
            FilterOutcome::Included => self.included += 1,
        }
    }
}

/// Filters a candidate file list against a [`FileFilteringConfig`].
pub struct FileFilter {
    config: FileFilteringConfig,
    gitignore_patterns: Vec<String>,
}

fn compile_patterns(patterns: &[String]) -> Vec<Pattern> {
    patterns
        .iter()
        .filter_map(|p| Pattern::new(p).ok())
        .collect()
}

fn matches_any(patterns: &[Pattern], path: &Path) -> bool {
    let path_str = path.to_string_lossy();
    patterns.iter().any(|p| {
        p.matches(&path_str)
            || path
                .file_name()
                .map(|name| p.matches(&name.to_string_lossy()))
                .unwrap_or(false)
            || path_str.contains(p.as_str().trim_end_matches('/').trim_end_matches('*'))
                && p.as_str().ends_with('/')
    })
}

impl FileFilter {
    pub fn new(config: FileFilteringConfig) -> Self {
        Self {
            config,
            gitignore_patterns: Vec::new(),
        }
    }

    /// Load non-blank, non-comment lines from a project's `.gitignore` as
    /// additional ignore patterns, per spec §4.G `use_gitignore`.
    pub fn with_gitignore_content(mut self, content: &str) -> Self {
        self.gitignore_patterns = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(String::from)
            .collect();
        self
    }

    fn is_force_included(&self, path: &Path) -> bool {
        let patterns = compile_patterns(&self.config.force_include);
        matches_any(&patterns, path)
    }

    /// Decide the fate of one file per the first-match-wins ordering of
    /// §4.G: force_include -> ignore_patterns -> gitignore -> too_large ->
    /// conditional blocks -> library_content -> include.
    pub fn classify(&self, path: &Path, size_bytes: u64, content_preview: Option<&str>) -> FilterOutcome {
        if self.is_force_included(path) {
            return FilterOutcome::ForceIncluded;
        }

        let ignore = compile_patterns(&self.config.ignore_patterns);
        if matches_any(&ignore, path) {
            return FilterOutcome::IgnorePattern;
        }

        if self.config.use_gitignore {
            let gitignore = compile_patterns(&self.gitignore_patterns);
            if matches_any(&gitignore, path) {
                return FilterOutcome::Gitignore;
            }
        }

        if size_bytes > self.config.max_file_size_bytes {
            return FilterOutcome::TooLarge;
        }

        if self.config.css_files.enabled {
            let patterns = compile_patterns(&self.config.css_files.patterns);
            if matches_any(&patterns, path) {
                return FilterOutcome::CssFile;
            }
        }
        if self.config.test_files.enabled {
            let patterns = compile_patterns(&self.config.test_files.patterns);
            if matches_any(&patterns, path) {
                return FilterOutcome::TestFile;
            }
        }
        if self.config.doc_files.enabled {
            let patterns = compile_patterns(&self.config.doc_files.patterns);
            if matches_any(&patterns, path) {
                return FilterOutcome::DocFile;
            }
        }
        if self.config.log_files.enabled {
            let patterns = compile_patterns(&self.config.log_files.patterns);
            if matches_any(&patterns, path) {
                return FilterOutcome::LogFile;
            }
        }

        if self.config.detect_libraries {
            if let Some(preview) = content_preview {
                let first_lines: String = preview.lines().take(10).collect::<Vec<_>>().join("\n");
                if self
                    .config
                    .library_keywords
                    .iter()
                    .any(|kw| first_lines.contains(kw.as_str()))
                {
                    return FilterOutcome::LibraryContent;
                }
            }
        }

        FilterOutcome::Included
    }

    /// Filter a candidate list, returning the surviving paths and stats for
    /// every exit path taken. `sizes`/`previews` are best-effort sidecar
    /// data; a missing entry is treated as size 0 / no preview.
    pub fn filter(
        &self,
        candidates: &[PathBuf],
        sizes: &HashMap<PathBuf, u64>,
        previews: &HashMap<PathBuf, String>,
    ) -> (Vec<PathBuf>, FilterStats) {
        let mut stats = FilterStats::default();
        let mut kept = Vec::new();

        if !self.config.enabled {
            stats.included = candidates.len();
            return (candidates.to_vec(), stats);
        }

        for path in candidates {
            let size = sizes.get(path).copied().unwrap_or(0);
            let preview = previews.get(path).map(String::as_str);
            let outcome = self.classify(path, size, preview);
            stats.record(outcome);
            if matches!(outcome, FilterOutcome::ForceIncluded | FilterOutcome::Included) {
                kept.push(path.clone());
            }
        }

        (kept, stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> FileFilter {
        FileFilter::new(FileFilteringConfig::default())
    }

    #[test]
    fn excludes_ignore_pattern_directories() {
        let f = filter();
        let outcome = f.classify(Path::new("node_modules/lib/index.js"), 100, None);
        assert_eq!(outcome, FilterOutcome::IgnorePattern);
    }

    #[test]
    fn excludes_oversized_files() {
        let f = filter();
        let outcome = f.classify(Path::new("big.py"), 10_000_000, None);
        assert_eq!(outcome, FilterOutcome::TooLarge);
    }

    #[test]
    fn force_include_overrides_everything() {
        let mut config = FileFilteringConfig::default();
        config.force_include = vec!["node_modules/keep.js".into()];
        let f = FileFilter::new(config);
        let outcome = f.classify(Path::new("node_modules/keep.js"), 100, None);
        assert_eq!(outcome, FilterOutcome::ForceIncluded);
    }

    #[test]
    fn detects_library_content_by_keyword() {
        let f = filter();
        let outcome = f.classify(
            Path::new("vendor_lib.js"),
            100,
            Some("/* Copyright 2020 Example Corp */\nfunction noop() {}\n"),
        );
        assert_eq!(outcome, FilterOutcome::LibraryContent);
    }

    #[test]
    fn includes_plain_source_file() {
        let f = filter();
        let outcome = f.classify(Path::new("src/main.py"), 500, Some("def main(): pass"));
        assert_eq!(outcome, FilterOutcome::Included);
    }

    #[test]
    fn filter_is_idempotent() {
        let f = filter();
        let candidates = vec![PathBuf::from("src/main.py"), PathBuf::from("node_modules/a.js")];
        let sizes = HashMap::new();
        let previews = HashMap::new();
        let (once, _) = f.filter(&candidates, &sizes, &previews);
        let (twice, _) = f.filter(&once, &sizes, &previews);
        assert_eq!(once, twice);
    }

    #[test]
    fn gitignore_patterns_apply_when_enabled() {
        let f = filter().with_gitignore_content("dist_output/\n# comment\n\n*.tmp\n");
        let outcome = f.classify(Path::new("dist_output/bundle.js"), 10, None);
        assert_eq!(outcome, FilterOutcome::Gitignore);
    }

    proptest::proptest! {
        /// Filtering an already-filtered set is a no-op, for arbitrary
        /// extensions and directory segments (spec §8 round-trip property),
        /// complementing the fixed-case `filter_is_idempotent` above.
        #[test]
        fn filter_is_idempotent_for_arbitrary_paths(
            segments in proptest::collection::vec("[a-zA-Z_]{1,12}", 1..4),
            ext in "[a-z]{1,5}",
        ) {
            let f = filter();
            let path = PathBuf::from(format!("{}.{}", segments.join("/"), ext));
            let candidates = vec![path];
            let sizes = HashMap::new();
            let previews = HashMap::new();
            let (once, _) = f.filter(&candidates, &sizes, &previews);
            let (twice, _) = f.filter(&once, &sizes, &previews);
            proptest::prop_assert_eq!(once, twice);
        }
    }
}
