//! Domain classifier (spec §4.4).
//!
//! Two strategies compose: a rule-based pass always runs and produces a
//! base candidate; an optional embedding-based strategy may override it,
//! but only when its similarity margin clears a configured floor. Never
//! throws; an unavailable embedding path degrades silently to the
//! rule-based candidate.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Closed domain tag set (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    /// Source code generation/review.
    Code,
    /// Medical/clinical content.
    Medical,
    /// Legal content.
    Legal,
    /// Financial content.
    Financial,
    /// Data analysis/ETL.
    Data,
    /// Mathematics/proofs.
    Math,
    /// Structured output (JSON/schema-bound).
    Structured,
    /// Creative writing.
    Creative,
    /// No domain signal detected.
    General,
    /// Open-ended conversation.
    Conversation,
    /// Tool/function-calling heavy.
    Tool,
    /// Retrieval-augmented generation.
    Rag,
    /// Summarization.
    Summary,
    /// Translation.
    Translation,
    /// Multimodal (image/audio references).
    Multimodal,
}

type DomainRule = (Domain, &'static Lazy<Regex>);

static CODE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(function|class|compile|stack trace|refactor|```)\b").unwrap());
static MEDICAL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(diagnos\w*|symptom|patient|dosage|treatment)\b").unwrap());
static LEGAL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(statute|contract|liability|plaintiff|jurisdiction)\b").unwrap());
static FINANCIAL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(portfolio|valuation|interest rate|balance sheet|equity)\b").unwrap());
static DATA_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(dataset|dataframe|etl|pipeline|sql query)\b").unwrap());
static MATH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(theorem|prove|integral|derivative|equation)\b").unwrap());
static STRUCTURED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(json schema|return json|structured output)\b").unwrap());
static CREATIVE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(poem|story|novel|lyrics|screenplay)\b").unwrap());
static TOOL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(call the|invoke|use the .* tool|function call)\b").unwrap());
static RAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(according to the document|based on the retrieved|cite the source)\b").unwrap());
static SUMMARY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(summarize|tl;dr|key takeaways)\b").unwrap());
static TRANSLATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(translate|in french|in spanish|into japanese)\b").unwrap());
static MULTIMODAL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(this image|the attached photo|in the audio)\b").unwrap());

static RULES: Lazy<Vec<DomainRule>> = Lazy::new(|| {
    vec![
        (Domain::Medical, &MEDICAL_RE),
        (Domain::Legal, &LEGAL_RE),
        (Domain::Financial, &FINANCIAL_RE),
        (Domain::Code, &CODE_RE),
        (Domain::Math, &MATH_RE),
        (Domain::Data, &DATA_RE),
        (Domain::Structured, &STRUCTURED_RE),
        (Domain::Tool, &TOOL_RE),
        (Domain::Rag, &RAG_RE),
        (Domain::Summary, &SUMMARY_RE),
        (Domain::Translation, &TRANSLATION_RE),
        (Domain::Multimodal, &MULTIMODAL_RE),
        (Domain::Creative, &CREATIVE_RE),
    ]
});

/// An embedding-based override candidate, supplied by an optional,
/// caller-wired semantic step. Out of scope to implement the embedder
/// itself (spec §1); this crate only consumes its output.
#[derive(Debug, Clone, Copy)]
pub struct EmbeddingCandidate {
    /// The domain the embedding strategy proposes.
    pub domain: Domain,
    /// Similarity margin over the second-best candidate, in `[0, 1]`.
    pub margin: f32,
}

/// Rule-based + optional-embedding domain classifier.
#[derive(Debug, Clone, Copy)]
pub struct DomainClassifier {
    /// Minimum margin an embedding candidate needs to override the
    /// rule-based base candidate.
    pub override_margin_floor: f32,
}

impl Default for DomainClassifier {
    fn default() -> Self {
        Self {
            override_margin_floor: 0.15,
        }
    }
}

impl DomainClassifier {
    /// Construct with a custom override margin floor.
    #[must_use]
    pub fn with_override_margin_floor(margin: f32) -> Self {
        Self {
            override_margin_floor: margin,
        }
    }

    /// Rule-based base candidate. Never fails; returns [`Domain::General`]
    /// if nothing matches.
    #[must_use]
    pub fn base_candidate(&self, text: &str) -> Domain {
        // `Conversation` is reserved for callers who want to explicitly
        // tag multi-turn chit-chat; the rule pass never emits it itself
        // since it has no distinguishing lexical signal.
        RULES
            .iter()
            .find(|(_, re)| re.is_match(text))
            .map(|(domain, _)| *domain)
            .unwrap_or(Domain::General)
    }

    /// Classify `text`, optionally consulting an embedding candidate. The
    /// embedding candidate overrides the rule-based base only if its
    /// margin exceeds `override_margin_floor`; otherwise (or if `None`),
    /// the rule-based candidate wins.
    #[must_use]
    pub fn classify(&self, text: &str, embedding: Option<EmbeddingCandidate>) -> Domain {
        let base = self.base_candidate(text);
        match embedding {
            Some(candidate) if candidate.margin > self.override_margin_floor => candidate.domain,
            _ => base,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn code_keywords_select_code_domain() {
        let domain = DomainClassifier::default().base_candidate("Refactor this function to use a stack trace.");
        assert_eq!(domain, Domain::Code);
    }

    #[test]
    fn no_match_falls_back_to_general() {
        let domain = DomainClassifier::default().base_candidate("Hello there, how are you?");
        assert_eq!(domain, Domain::General);
    }

    #[test]
    fn embedding_override_requires_margin_above_floor() {
        let classifier = DomainClassifier::default();
        let weak = EmbeddingCandidate {
            domain: Domain::Medical,
            margin: 0.05,
        };
        let domain = classifier.classify("Hello there", Some(weak));
        assert_eq!(domain, Domain::General);
    }

    #[test]
    fn embedding_override_applies_above_floor() {
        let classifier = DomainClassifier::default();
        let strong = EmbeddingCandidate {
            domain: Domain::Medical,
            margin: 0.5,
        };
        let domain = classifier.classify("Hello there", Some(strong));
        assert_eq!(domain, Domain::Medical);
    }

    #[test]
    fn medical_rule_takes_priority_over_code_when_both_present() {
        let domain = DomainClassifier::default().base_candidate("function to track patient dosage");
        assert_eq!(domain, Domain::Medical);
    }

    #[test]
    fn classifier_never_panics_on_empty_text() {
        let domain = DomainClassifier::default().base_candidate("");
        assert_eq!(domain, Domain::General);
    }
}
