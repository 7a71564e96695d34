//! Project walk and code-unit discovery (spec §4.H).

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use walkdir::WalkDir;

use crate::file_filter::FileFilter;
use crate::model::{CodeUnit, Priority, UnitType};

/// One symbol (function or class) found in a source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub kind: UnitType,
    pub start_line: u32,
    pub end_line: Option<u32>,
}

/// Extracts function/class symbols from source text. The crate ships a
/// conservative regex-based default; a caller embedding this crate may
/// substitute a real parser (`syn`, tree-sitter) without touching the rest
/// of the pipeline (spec §1).
pub trait SymbolExtractor: Send + Sync {
    fn extract(&self, language: &str, content: &str) -> Vec<Symbol>;
}

struct LanguagePatterns {
    function: Regex,
    class: Regex,
}

static PYTHON_PATTERNS: LazyLock<LanguagePatterns> = LazyLock::new(|| LanguagePatterns {
    function: Regex::new(r"(?m)^\s*def\s+([A-Za-z_][A-Za-z0-9_]*)\s*\(").unwrap(),
    class: Regex::new(r"(?m)^\s*class\s+([A-Za-z_][A-Za-z0-9_]*)").unwrap(),
});

static JAVASCRIPT_PATTERNS: LazyLock<LanguagePatterns> = LazyLock::new(|| LanguagePatterns {
    function: Regex::new(
        r"(?m)^\s*(?:export\s+)?(?:async\s+)?function\s*\*?\s*([A-Za-z_$][A-Za-z0-9_$]*)\s*\(|^\s*(?:export\s+)?const\s+([A-Za-z_$][A-Za-z0-9_$]*)\s*=\s*(?:async\s*)?\(",
    )
    .unwrap(),
    class: Regex::new(r"(?m)^\s*(?:export\s+)?class\s+([A-Za-z_$][A-Za-z0-9_$]*)").unwrap(),
});

static JAVA_PATTERNS: LazyLock<LanguagePatterns> = LazyLock::new(|| LanguagePatterns {
    function: Regex::new(
        r"(?m)^\s*(?:public|private|protected|static|\s)*[\w<>\[\]]+\s+([A-Za-z_][A-Za-z0-9_]*)\s*\([^;]*\)\s*\{",
    )
    .unwrap(),
    class: Regex::new(r"(?m)^\s*(?:public|private|protected|\s)*(?:class|interface)\s+([A-Za-z_][A-Za-z0-9_]*)").unwrap(),
});

static GO_PATTERNS: LazyLock<LanguagePatterns> = LazyLock::new(|| LanguagePatterns {
    function: Regex::new(r"(?m)^\s*func\s+(?:\([^)]*\)\s*)?([A-Za-z_][A-Za-z0-9_]*)\s*\(").unwrap(),
    class: Regex::new(r"(?m)^\s*type\s+([A-Za-z_][A-Za-z0-9_]*)\s+struct").unwrap(),
});

/// Default conservative extractor: a function/class keyword plus an
/// identifier per supported language, no AST-level precision claimed.
#[derive(Debug, Default)]
pub struct RegexSymbolExtractor;

impl SymbolExtractor for RegexSymbolExtractor {
    fn extract(&self, language: &str, content: &str) -> Vec<Symbol> {
        let patterns = match language {
            "python" => &*PYTHON_PATTERNS,
            "javascript" | "typescript" => &*JAVASCRIPT_PATTERNS,
            "java" => &*JAVA_PATTERNS,
            "go" => &*GO_PATTERNS,
            _ => return Vec::new(),
        };

        let mut symbols = Vec::new();
        for caps in patterns.function.captures_iter(content) {
            let name = caps
                .iter()
                .skip(1)
                .find_map(|m| m.map(|m| m.as_str().to_string()))
                .unwrap_or_else(|| "anonymous".to_string());
            let start_line = line_of_offset(content, caps.get(0).unwrap().start());
            symbols.push(Symbol {
                name,
                kind: UnitType::Function,
                start_line,
                end_line: None,
            });
        }
        for caps in patterns.class.captures_iter(content) {
            let name = caps[1].to_string();
            let start_line = line_of_offset(content, caps.get(0).unwrap().start());
            symbols.push(Symbol {
                name,
                kind: UnitType::Class,
                start_line,
                end_line: None,
            });
        }
        symbols
    }
}

fn line_of_offset(content: &str, offset: usize) -> u32 {
    content[..offset].matches('\n').count() as u32 + 1
}

/// Detect a language from a file extension, or `None` if unsupported.
pub fn detect_language(path: &Path) -> Option<&'static str> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("py") => Some("python"),
        Some("js" | "jsx" | "mjs" | "cjs") => Some("javascript"),
        Some("ts" | "tsx") => Some("typescript"),
        Some("java") => Some("java"),
        Some("go") => Some("go"),
        _ => None,
    }
}

static CRITICAL_KEYWORDS: &[&str] = &[
    "auth", "login", "password", "token", "session", "security", "admin", "config", "database",
    "api", "main", "app", "encrypt", "decrypt", "validate", "execute", "query", "delete",
    "create", "update",
];

static HIGH_KEYWORDS: &[&str] = &[
    "user", "payment", "order", "transaction", "crypto", "process", "handle", "parse", "verify",
    "check", "model", "handler", "processor", "validator",
];

static LOW_KEYWORDS: &[&str] = &["test", "spec", "mock"];

/// Deterministic path/name-substring priority assignment (spec §4.H).
pub fn assign_priority(path_or_name: &str) -> Priority {
    let lower = path_or_name.to_lowercase();
    if CRITICAL_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
        Priority::Critical
    } else if HIGH_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
        Priority::High
    } else if LOW_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
        Priority::Low
    } else {
        Priority::Medium
    }
}

/// Walks a project tree and produces [`CodeUnit`]s: one file-level unit per
/// discovered file, plus one function/class unit per extracted symbol for
/// languages the [`SymbolExtractor`] supports.
pub struct Discovery {
    extractor: Box<dyn SymbolExtractor>,
}

impl Default for Discovery {
    fn default() -> Self {
        Self::new(Box::new(RegexSymbolExtractor))
    }
}

impl Discovery {
    pub fn new(extractor: Box<dyn SymbolExtractor>) -> Self {
        Self { extractor }
    }

    /// Enumerate candidate file paths under `root`, without reading them —
    /// the caller runs these through [`FileFilter`] before [`Self::units_for_file`].
    pub fn walk(&self, root: &Path) -> Vec<PathBuf> {
        WalkDir::new(root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.path().to_path_buf())
            .collect()
    }

    /// Produce the file-level unit plus any function/class units extracted
    /// from `content`. `rel_path` is used for priority keyword matching and
    /// as the unit's stored file path.
    pub fn units_for_file(&self, rel_path: &str, content: &str) -> Vec<CodeUnit> {
        let mut units = Vec::new();
        let line_count = content.lines().count().max(1) as u32;
        let file_priority = assign_priority(rel_path);

        units.push(CodeUnit::new(
            rel_path,
            rel_path,
            UnitType::File,
            1,
            line_count,
            file_priority,
        ));

        if let Some(language) = detect_language(Path::new(rel_path)) {
            let symbols = self.extractor.extract(language, content);
            for (i, symbol) in symbols.iter().enumerate() {
                let end_line = symbol.end_line.unwrap_or_else(|| {
                    symbols
                        .get(i + 1)
                        .map(|next| next.start_line.saturating_sub(1).max(symbol.start_line))
                        .unwrap_or(line_count)
                });
                let priority = {
                    let by_name = assign_priority(&symbol.name);
                    if by_name == Priority::Medium {
                        file_priority
                    } else {
                        by_name
                    }
                };
                units.push(CodeUnit::new(
                    rel_path,
                    symbol.name.clone(),
                    symbol.kind,
                    symbol.start_line,
                    end_line,
                    priority,
                ));
            }
        }

        units
    }

    /// Run `walk` followed by filtering and per-file unit extraction. The
    /// caller supplies file contents (already loaded, e.g. for filtering
    /// previews) keyed by relative path.
    pub fn discover(
        &self,
        root: &Path,
        filter: &FileFilter,
        contents: &[(PathBuf, String)],
    ) -> Vec<CodeUnit> {
        use std::collections::HashMap;
        let candidates: Vec<PathBuf> = contents.iter().map(|(p, _)| p.clone()).collect();
        let sizes: HashMap<PathBuf, u64> = contents
            .iter()
            .map(|(p, c)| (p.clone(), c.len() as u64))
            .collect();
        let previews: HashMap<PathBuf, String> = contents
            .iter()
            .map(|(p, c)| (p.clone(), c.chars().take(2000).collect()))
            .collect();
        let (kept, _) = filter.filter(&candidates, &sizes, &previews);

        let content_by_path: HashMap<&PathBuf, &String> =
            contents.iter().map(|(p, c)| (p, c)).collect();

        kept.into_iter()
            .flat_map(|path| {
                let content = content_by_path.get(&path).map(|s| s.as_str()).unwrap_or("");
                let rel = path
                    .strip_prefix(root)
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .to_string();
                self.units_for_file(&rel, content)
            })
            .collect()
    }
}
