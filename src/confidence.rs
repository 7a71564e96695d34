//! Six-factor confidence calculator (spec §4.M).

use crate::model::{Category, ConfidenceFactors, Finding};

/// Context the caller supplies alongside a finding so the calculator can
/// adjust the LLM-reported confidence for framework mitigation, layer
/// appropriateness, and calibration against historical precision.
#[derive(Debug, Clone, Default)]
pub struct ConfidenceContext {
    pub frameworks: Vec<String>,
    pub architecture_layer: String,
    pub tech_stack: Vec<String>,
    pub has_security_config: bool,
    pub call_chain_known: bool,
}

const WEIGHT_FRAMEWORK_PROTECTION: f64 = 0.25;
const WEIGHT_ARCHITECTURE_APPROPRIATENESS: f64 = 0.15;
const WEIGHT_CODE_COMPLEXITY: f64 = 0.10;
const WEIGHT_PATTERN_RELIABILITY: f64 = 0.15;
const WEIGHT_CONTEXT_COMPLETENESS: f64 = 0.10;
const WEIGHT_HISTORICAL_ACCURACY: f64 = 0.25;

/// Frameworks known to mitigate specific finding categories out of the box.
fn framework_mitigates(framework: &str, category: Category) -> bool {
    let framework = framework.to_lowercase();
    match category {
        Category::Injection => {
            ["hibernate", "sqlalchemy", "django", "activerecord", "jpa"].contains(&framework.as_str())
        }
        Category::OutputEncoding => {
            ["react", "vue", "angular", "django", "rails"].contains(&framework.as_str())
        }
        Category::SessionManagement => {
            ["spring security", "django", "devise"].contains(&framework.as_str())
        }
        _ => false,
    }
}

/// Per-finding-category historical precision, standing in for measured
/// calibration data this crate does not have access to (SPEC_FULL.md §9).
fn historical_accuracy(category: Category) -> f64 {
    match category {
        Category::Injection => 0.82,
        Category::Authentication | Category::Authorization => 0.75,
        Category::Cryptography => 0.78,
        Category::SensitiveData => 0.7,
        Category::InputValidation => 0.65,
        Category::OutputEncoding => 0.68,
        Category::SessionManagement => 0.7,
        Category::Configuration => 0.6,
        Category::CodeQuality => 0.5,
        Category::Dependency => 0.55,
        Category::Other => 0.5,
    }
}

/// Applies the six weighted factors of §4.M to an LLM-reported finding.
pub struct ConfidenceCalculator;

impl Default for ConfidenceCalculator {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfidenceCalculator {
    pub fn new() -> Self {
        Self
    }

    /// Returns the clamped final confidence and the per-factor breakdown.
    pub fn calculate(&self, finding: &Finding, context: &ConfidenceContext) -> (f64, ConfidenceFactors) {
        let framework_protection = if context
            .frameworks
            .iter()
            .any(|f| framework_mitigates(f, finding.category))
        {
            0.4
        } else {
            0.9
        };

        let architecture_appropriateness = match (context.architecture_layer.as_str(), finding.category) {
            ("dao", Category::Authorization) | ("dao", Category::Authentication) => 0.4,
            ("entity", Category::Injection) => 0.5,
            ("config", Category::CodeQuality) => 0.5,
            _ => 0.85,
        };

        // Longer snippets are a weak proxy for higher complexity, hence
        // higher false-positive risk, hence lower confidence.
        let code_complexity = match finding.code_snippet.as_ref().map(|s| s.len()) {
            Some(len) if len > 500 => 0.5,
            Some(len) if len > 150 => 0.7,
            Some(_) => 0.9,
            None => 0.75,
        };

        let pattern_reliability = historical_accuracy(finding.category);

        let mut completeness_signals = 0u32;
        if !context.frameworks.is_empty() {
            completeness_signals += 1;
        }
        if context.architecture_layer != "unknown" && !context.architecture_layer.is_empty() {
            completeness_signals += 1;
        }
        if !context.tech_stack.is_empty() {
            completeness_signals += 1;
        }
        if context.has_security_config {
            completeness_signals += 1;
        }
        if context.call_chain_known {
            completeness_signals += 1;
        }
        let context_completeness = completeness_signals as f64 / 5.0;

        let historical_accuracy = historical_accuracy(finding.category);

        let factors = ConfidenceFactors {
            framework_protection,
            architecture_appropriateness,
            code_complexity,
            pattern_reliability,
            context_completeness,
            historical_accuracy,
        };

        let score = WEIGHT_FRAMEWORK_PROTECTION * factors.framework_protection
            + WEIGHT_ARCHITECTURE_APPROPRIATENESS * factors.architecture_appropriateness
            + WEIGHT_CODE_COMPLEXITY * factors.code_complexity
            + WEIGHT_PATTERN_RELIABILITY * factors.pattern_reliability
            + WEIGHT_CONTEXT_COMPLETENESS * factors.context_completeness
            + WEIGHT_HISTORICAL_ACCURACY * factors.historical_accuracy;

        (score.clamp(0.0, 1.0), factors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Severity;

    fn finding(category: Category, snippet: Option<&str>) -> Finding {
        Finding {
            id: "abc".into(),
            title: "Test".into(),
            description: "desc".into(),
            severity: Severity::Medium,
            category,
            file_path: "a.py".into(),
            line_number: None,
            code_snippet: snippet.map(String::from),
            cwe_id: None,
            confidence: 0.5,
            confidence_factors: None,
            cross_file_evidence: Vec::new(),
            cross_file_recommendation: None,
        }
    }

    #[test]
    fn weights_sum_to_one() {
        let sum = WEIGHT_FRAMEWORK_PROTECTION
            + WEIGHT_ARCHITECTURE_APPROPRIATENESS
            + WEIGHT_CODE_COMPLEXITY
            + WEIGHT_PATTERN_RELIABILITY
            + WEIGHT_CONTEXT_COMPLETENESS
            + WEIGHT_HISTORICAL_ACCURACY;
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn framework_mitigation_lowers_score() {
        let calc = ConfidenceCalculator::new();
        let f = finding(Category::Injection, None);
        let (unmitigated, _) = calc.calculate(&f, &ConfidenceContext::default());
        let (mitigated, _) = calc.calculate(
            &f,
            &ConfidenceContext {
                frameworks: vec!["hibernate".into()],
                ..Default::default()
            },
        );
        assert!(mitigated < unmitigated);
    }

    #[test]
    fn dao_layer_authorization_is_discounted() {
        let calc = ConfidenceCalculator::new();
        let f = finding(Category::Authorization, None);
        let (score, factors) = calc.calculate(
            &f,
            &ConfidenceContext {
                architecture_layer: "dao".into(),
                ..Default::default()
            },
        );
        assert_eq!(factors.architecture_appropriateness, 0.4);
        assert!(score < 0.8);
    }

    #[test]
    fn score_is_clamped_to_unit_interval() {
        let calc = ConfidenceCalculator::new();
        let f = finding(Category::Injection, None);
        let (score, _) = calc.calculate(&f, &ConfidenceContext::default());
        assert!((0.0..=1.0).contains(&score));
    }
}
