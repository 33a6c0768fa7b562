//! Conversation context detection
//!
//! Flags computed over a sliding window of recent user turns: repeated
//! questions, accumulated frustration, explicit escalation, and confusion.
//! The turn controller and dialogue prompt both consume them.

use std::collections::HashSet;
use std::collections::VecDeque;
use unicode_segmentation::UnicodeSegmentation;

pub use callweave_core::ContextFlags;

const FRUSTRATION_KEYWORDS: &[&str] = &[
    "harto", "cansado", "molesto", "enfadado", "furioso", "inaceptable", "queja", "terrible",
    "horrible", "esperando", "nadie",
];

const ESCALATION_KEYWORDS: &[&str] = &[
    "agente", "humano", "persona", "supervisor", "encargado", "operador",
];

const WH_WORDS: &[&str] = &[
    "qué", "que", "cómo", "como", "cuándo", "cuando", "dónde", "donde", "quién", "quien",
    "cuál", "cual", "por qué", "cuánto", "cuanto",
];

/// Sliding-window context detector; keeps the last 4 user turns
pub struct ContextDetector {
    window: VecDeque<String>,
    window_size: usize,
}

impl Default for ContextDetector {
    fn default() -> Self {
        Self::new(4)
    }
}

impl ContextDetector {
    pub fn new(window_size: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(window_size),
            window_size,
        }
    }

    /// Push a committed user turn and return the updated flags
    pub fn push_turn(&mut self, text: &str) -> ContextFlags {
        let flags = self.detect(text);

        if self.window.len() == self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(text.to_lowercase());

        flags
    }

    /// Current flags without mutating the window
    pub fn detect(&self, incoming: &str) -> ContextFlags {
        let incoming_lower = incoming.to_lowercase();

        let repeated_question = is_question(&incoming_lower)
            && self
                .window
                .iter()
                .filter(|t| is_question(t))
                .any(|t| jaccard(t, &incoming_lower) > 0.6);

        // Frustration over the last 3 turns including the incoming one
        let mut frustration_hits = count_keywords(&incoming_lower, FRUSTRATION_KEYWORDS);
        for turn in self.window.iter().rev().take(2) {
            frustration_hits += count_keywords(turn, FRUSTRATION_KEYWORDS);
        }
        let user_frustrated = frustration_hits >= 2;

        let escalation_request = ESCALATION_KEYWORDS
            .iter()
            .any(|k| incoming_lower.unicode_words().any(|t| t == *k));

        // Confusion over the last 4 turns including the incoming one
        let mut wh_count = if is_wh_question(&incoming_lower) { 1 } else { 0 };
        for turn in self.window.iter().rev().take(3) {
            if is_wh_question(turn) {
                wh_count += 1;
            }
        }
        let confused = wh_count >= 3;

        ContextFlags {
            repeated_question,
            user_frustrated,
            escalation_request,
            confused,
        }
    }

    pub fn reset(&mut self) {
        self.window.clear();
    }
}

fn is_question(text: &str) -> bool {
    text.contains('?') || text.contains('¿') || is_wh_question(text)
}

fn is_wh_question(text: &str) -> bool {
    text.unicode_words().take(3).any(|t| WH_WORDS.contains(&t))
}

fn count_keywords(text: &str, keywords: &[&str]) -> usize {
    text.unicode_words().filter(|t| keywords.contains(t)).count()
}

/// Token-set Jaccard similarity over unicode words
fn jaccard(a: &str, b: &str) -> f32 {
    let set_a: HashSet<&str> = a.unicode_words().collect();
    let set_b: HashSet<&str> = b.unicode_words().collect();
    if set_a.is_empty() && set_b.is_empty() {
        return 0.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    intersection as f32 / union as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeated_question() {
        let mut d = ContextDetector::default();
        d.push_turn("¿cuál es mi saldo actual?");
        let flags = d.detect("¿cuál es mi saldo actual por favor?");
        assert!(flags.repeated_question);
    }

    #[test]
    fn test_different_question_not_repeated() {
        let mut d = ContextDetector::default();
        d.push_turn("¿cuál es mi saldo?");
        let flags = d.detect("¿cómo cambio mi dirección de correo?");
        assert!(!flags.repeated_question);
    }

    #[test]
    fn test_frustration_accumulates() {
        let mut d = ContextDetector::default();
        d.push_turn("estoy harto de esperar");
        let flags = d.detect("esto es inaceptable");
        assert!(flags.user_frustrated);
    }

    #[test]
    fn test_single_frustration_keyword_not_enough() {
        let d = ContextDetector::default();
        let flags = d.detect("estoy molesto");
        assert!(!flags.user_frustrated);
    }

    #[test]
    fn test_escalation_request() {
        let d = ContextDetector::default();
        let flags = d.detect("quiero hablar con un agente humano");
        assert!(flags.escalation_request);
    }

    #[test]
    fn test_confusion_over_window() {
        let mut d = ContextDetector::default();
        d.push_turn("¿qué significa este cargo?");
        d.push_turn("¿cómo funciona la factura?");
        let flags = d.detect("¿dónde veo mis movimientos?");
        assert!(flags.confused);
    }

    #[test]
    fn test_window_bounded() {
        let mut d = ContextDetector::new(2);
        d.push_turn("uno");
        d.push_turn("dos");
        d.push_turn("tres");
        assert_eq!(d.window.len(), 2);
    }

    #[test]
    fn test_jaccard_bounds() {
        assert!((jaccard("a b c", "a b c") - 1.0).abs() < 1e-6);
        assert!(jaccard("a b", "c d") < 1e-6);
    }
}
