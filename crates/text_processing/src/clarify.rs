//! Critical-word clarification
//!
//! A closed set of categories with tenant-overridable word lists. Any token
//! in a critical category whose confidence falls below the threshold turns
//! the segment into a clarification prompt instead of a committed turn,
//! until the per-call cap is reached.

use std::collections::HashMap;

use callweave_core::{ClarificationRequest, ClarificationStrategy, WordConfidence};

/// Critical-word category names (closed set)
pub const CATEGORY_NUMBERS: &str = "numbers";
pub const CATEGORY_DESTRUCTIVE: &str = "destructive_actions";
pub const CATEGORY_NEGATIONS: &str = "negations";
pub const CATEGORY_CONFIRMATIONS: &str = "confirmations";

/// Per-category word lists; defaults are Spanish telephony vocabulary
#[derive(Debug, Clone)]
pub struct CriticalCategories {
    categories: HashMap<&'static str, Vec<String>>,
}

impl Default for CriticalCategories {
    fn default() -> Self {
        let mut categories: HashMap<&'static str, Vec<String>> = HashMap::new();
        categories.insert(
            CATEGORY_NUMBERS,
            [
                "cero", "uno", "dos", "tres", "cuatro", "cinco", "seis", "siete", "ocho",
                "nueve", "diez", "cien", "mil", "millón",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        );
        categories.insert(
            CATEGORY_DESTRUCTIVE,
            ["cancelar", "eliminar", "borrar", "cerrar", "anular", "dar de baja"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        );
        categories.insert(
            CATEGORY_NEGATIONS,
            ["no", "nunca", "tampoco", "jamás"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        );
        categories.insert(
            CATEGORY_CONFIRMATIONS,
            ["sí", "si", "confirmo", "acepto", "de acuerdo", "correcto"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        );
        Self { categories }
    }
}

impl CriticalCategories {
    /// Replace one category's list with a tenant override; unknown category
    /// names are ignored (the set is closed).
    pub fn override_category(&mut self, name: &str, words: Vec<String>) {
        let key = match name {
            CATEGORY_NUMBERS => CATEGORY_NUMBERS,
            CATEGORY_DESTRUCTIVE => CATEGORY_DESTRUCTIVE,
            CATEGORY_NEGATIONS => CATEGORY_NEGATIONS,
            CATEGORY_CONFIRMATIONS => CATEGORY_CONFIRMATIONS,
            other => {
                tracing::warn!(category = other, "Ignoring unknown critical-word category");
                return;
            }
        };
        self.categories
            .insert(key, words.into_iter().map(|w| w.to_lowercase()).collect());
    }

    /// Category a lowercased token belongs to, if any
    fn category_of(&self, token: &str) -> Option<&'static str> {
        for (name, words) in &self.categories {
            if words.iter().any(|w| w == token) {
                return Some(name);
            }
        }
        None
    }
}

/// Outcome of evaluating a segment for clarification
#[derive(Debug, Clone, PartialEq)]
pub enum ClarificationOutcome {
    /// Commit the turn unchanged
    Commit,
    /// Ask the caller to clarify; the turn is not committed
    Clarify(ClarificationRequest),
}

/// Clarifier with a per-call budget
pub struct Clarifier {
    categories: CriticalCategories,
    confidence_threshold: f32,
    max_per_call: u32,
}

impl Clarifier {
    pub fn new(categories: CriticalCategories, confidence_threshold: f32, max_per_call: u32) -> Self {
        Self {
            categories,
            confidence_threshold,
            max_per_call,
        }
    }

    /// Evaluate a segment's words.
    ///
    /// `asked_so_far` is the number of clarifications already spoken in this
    /// call; exactly at the cap the trigger is suppressed and the turn
    /// commits.
    pub fn evaluate(&self, words: &[WordConfidence], asked_so_far: u32) -> ClarificationOutcome {
        if asked_so_far >= self.max_per_call {
            return ClarificationOutcome::Commit;
        }

        for word in words {
            let token = word.word.to_lowercase();
            let token = token.trim_matches(|c: char| !c.is_alphanumeric());
            if token.is_empty() {
                continue;
            }

            if let Some(category) = self.categories.category_of(token) {
                if word.confidence < self.confidence_threshold {
                    let strategy = strategy_for(category);
                    let request = ClarificationRequest {
                        strategy,
                        word: token.to_string(),
                        category: category.to_string(),
                        prompt: prompt_for(strategy, token),
                    };
                    tracing::info!(
                        word = %request.word,
                        category = %request.category,
                        confidence = word.confidence,
                        "Low-confidence critical word, requesting clarification"
                    );
                    return ClarificationOutcome::Clarify(request);
                }
            }
        }

        ClarificationOutcome::Commit
    }
}

/// Strategy per category: destructive actions and negations demand explicit
/// confirmation, numbers are spelled out, confirmations get a full repeat.
fn strategy_for(category: &str) -> ClarificationStrategy {
    match category {
        CATEGORY_DESTRUCTIVE | CATEGORY_NEGATIONS => ClarificationStrategy::ExplicitConfirmation,
        CATEGORY_NUMBERS => ClarificationStrategy::SpellOut,
        CATEGORY_CONFIRMATIONS => ClarificationStrategy::FullRepeat,
        _ => ClarificationStrategy::ImplicitClarification,
    }
}

/// Spanish prompt templates per strategy
fn prompt_for(strategy: ClarificationStrategy, word: &str) -> String {
    match strategy {
        ClarificationStrategy::ExplicitConfirmation => format!(
            "¿Dijiste '{}'? Quiero confirmar antes de proceder.",
            word
        ),
        ClarificationStrategy::FullRepeat => {
            "¿Podrías repetir lo que acabas de decir?".to_string()
        }
        ClarificationStrategy::ImplicitClarification => {
            format!("Entiendo que mencionaste '{}', ¿es correcto?", word)
        }
        ClarificationStrategy::SpellOut => format!(
            "¿Podrías decirme '{}' dígito por dígito, por favor?",
            word
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(list: &[(&str, f32)]) -> Vec<WordConfidence> {
        list.iter()
            .map(|(w, c)| WordConfidence {
                word: w.to_string(),
                confidence: *c,
                start: 0.0,
                end: 0.0,
            })
            .collect()
    }

    fn clarifier() -> Clarifier {
        Clarifier::new(CriticalCategories::default(), 0.6, 3)
    }

    #[test]
    fn test_low_confidence_destructive_word_clarifies() {
        let outcome = clarifier().evaluate(
            &words(&[
                ("Quiero", 0.95),
                ("cancelar", 0.40),
                ("mi", 0.97),
                ("cuenta", 0.92),
            ]),
            0,
        );

        match outcome {
            ClarificationOutcome::Clarify(req) => {
                assert_eq!(req.strategy, ClarificationStrategy::ExplicitConfirmation);
                assert_eq!(req.word, "cancelar");
                assert_eq!(req.category, CATEGORY_DESTRUCTIVE);
                assert_eq!(
                    req.prompt,
                    "¿Dijiste 'cancelar'? Quiero confirmar antes de proceder."
                );
            }
            other => panic!("expected clarification, got {:?}", other),
        }
    }

    #[test]
    fn test_confident_critical_word_commits() {
        let outcome = clarifier().evaluate(&words(&[("cancelar", 0.95)]), 0);
        assert_eq!(outcome, ClarificationOutcome::Commit);
    }

    #[test]
    fn test_non_critical_low_confidence_commits() {
        let outcome = clarifier().evaluate(&words(&[("mañana", 0.2)]), 0);
        assert_eq!(outcome, ClarificationOutcome::Commit);
    }

    #[test]
    fn test_cap_suppresses_clarification() {
        let c = clarifier();
        let w = words(&[("cancelar", 0.40)]);

        // Below the cap: clarifies
        assert!(matches!(
            c.evaluate(&w, 2),
            ClarificationOutcome::Clarify(_)
        ));
        // Exactly at the cap: commits
        assert_eq!(c.evaluate(&w, 3), ClarificationOutcome::Commit);
    }

    #[test]
    fn test_number_uses_spell_out() {
        let outcome = clarifier().evaluate(&words(&[("siete", 0.3)]), 0);
        match outcome {
            ClarificationOutcome::Clarify(req) => {
                assert_eq!(req.strategy, ClarificationStrategy::SpellOut);
            }
            other => panic!("expected clarification, got {:?}", other),
        }
    }

    #[test]
    fn test_tenant_override_replaces_list() {
        let mut categories = CriticalCategories::default();
        categories.override_category(CATEGORY_DESTRUCTIVE, vec!["rescindir".to_string()]);
        let c = Clarifier::new(categories, 0.6, 3);

        // Old word no longer critical
        assert_eq!(
            c.evaluate(&words(&[("cancelar", 0.4)]), 0),
            ClarificationOutcome::Commit
        );
        // New word is
        assert!(matches!(
            c.evaluate(&words(&[("rescindir", 0.4)]), 0),
            ClarificationOutcome::Clarify(_)
        ));
    }
}
