//! HTML/JS front-end dispatch-strategy classification (spec §4.N).

use std::sync::LazyLock;

use regex::Regex;

/// The dispatch strategy the orchestrator should use for a front-end file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Skip,
    Hotspot,
    InputExtraction,
    Light,
}

/// Classification result: the chosen strategy plus the lines a hotspot
/// prompt should carry and the estimated seconds saved by not doing a
/// full-prompt analysis.
#[derive(Debug, Clone)]
pub struct OptimizerDecision {
    pub strategy: Strategy,
    pub matched_lines: Vec<(u32, String)>,
    pub estimated_seconds_saved: f64,
}

static DYNAMIC_MARKERS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<script|<form|onclick|onerror|onload|fetch\(|XMLHttpRequest|addEventListener").unwrap());

static STATIC_MARKERS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<div|<span|<p>|<img|<a\s+href|<table|<ul|<li>").unwrap());

static HOTSPOT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"\.innerHTML\s*=").unwrap(),
        Regex::new(r"document\.write\(").unwrap(),
        Regex::new(r"\beval\(").unwrap(),
        Regex::new(r#"(?i)(api[_-]?key|secret|password)\s*[:=]\s*['"][A-Za-z0-9_\-]{8,}['"]"#).unwrap(),
        Regex::new(r"(document\.location|window\.location|document\.referrer|document\.cookie)").unwrap(),
    ]
});

static INPUT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"<form[\s>]").unwrap(),
        Regex::new(r"\$\.ajax\(|fetch\(|axios\.").unwrap(),
        Regex::new(r"URLSearchParams|location\.search|req\.query|req\.params").unwrap(),
    ]
});

fn count_matches(pattern: &Regex, content: &str) -> usize {
    pattern.find_iter(content).count()
}

/// Classify one front-end file's dispatch strategy per spec §4.N.
pub fn classify(content: &str) -> OptimizerDecision {
    let dynamic_count = count_matches(&DYNAMIC_MARKERS, content);
    let static_count = count_matches(&STATIC_MARKERS, content);
    let total_markers = dynamic_count + static_count;

    let is_pure_static = dynamic_count == 0
        || (total_markers > 0
            && static_count as f64 / total_markers as f64 >= 0.8
            && dynamic_count < 3)
        || (content.len() > 5000 && dynamic_count < 5);

    if is_pure_static {
        return OptimizerDecision {
            strategy: Strategy::Skip,
            matched_lines: Vec::new(),
            estimated_seconds_saved: content.len() as f64 / 1000.0,
        };
    }

    let hotspot_lines = matched_lines(&HOTSPOT_PATTERNS, content);
    if !hotspot_lines.is_empty() {
        return OptimizerDecision {
            strategy: Strategy::Hotspot,
            matched_lines: hotspot_lines,
            estimated_seconds_saved: 0.0,
        };
    }

    let input_lines = matched_lines(&INPUT_PATTERNS, content);
    if !input_lines.is_empty() {
        return OptimizerDecision {
            strategy: Strategy::InputExtraction,
            matched_lines: input_lines,
            estimated_seconds_saved: 0.0,
        };
    }

    OptimizerDecision {
        strategy: Strategy::Light,
        matched_lines: Vec::new(),
        estimated_seconds_saved: content.len() as f64 / 1000.0 * 0.5,
    }
}

fn matched_lines(patterns: &[Regex], content: &str) -> Vec<(u32, String)> {
    let mut result = Vec::new();
    for (i, line) in content.lines().enumerate() {
        if patterns.iter().any(|p| p.is_match(line)) {
            result.push((i as u32 + 1, line.to_string()));
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pure_static_html_is_skipped() {
        let content = "<div><p>Hello</p><span>World</span><table></table></div>";
        let decision = classify(content);
        assert_eq!(decision.strategy, Strategy::Skip);
    }

    #[test]
    fn inner_html_assignment_is_hotspot() {
        let content = "<script>\nfunction render(x) {\n  el.innerHTML = x;\n}\n</script>";
        let decision = classify(content);
        assert_eq!(decision.strategy, Strategy::Hotspot);
        assert!(!decision.matched_lines.is_empty());
    }

    #[test]
    fn hardcoded_secret_is_hotspot() {
        let content = "<script>\nconst apiKey = \"sk_live_abcdef1234567890\";\nfetch('/x');\n</script>";
        let decision = classify(content);
        assert_eq!(decision.strategy, Strategy::Hotspot);
    }

    #[test]
    fn form_without_hotspot_is_input_extraction() {
        let content = "<script>fetch('/x')</script>\n<form action=\"/submit\"><input name=\"q\"></form>";
        let decision = classify(content);
        assert_eq!(decision.strategy, Strategy::InputExtraction);
    }

    #[test]
    fn dynamic_content_without_forms_or_hotspots_is_light() {
        let content = "<script>\naddEventListener('click', () => console.log('hi'));\n</script>";
        let decision = classify(content);
        assert_eq!(decision.strategy, Strategy::Light);
    }
}
