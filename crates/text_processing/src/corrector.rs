//! Exact-dictionary online correction
//!
//! A tenant dictionary layered over a global seed list, matched token-wise
//! after lowercasing and trimming punctuation. The whole pass runs under a
//! hard budget; when the deadline is hit remaining tokens pass through
//! uncorrected.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use callweave_core::WordConfidence;

/// Correction applied to one token
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AppliedCorrection {
    pub original: String,
    pub corrected: String,
}

/// Result of an online correction pass
#[derive(Debug, Clone, Default)]
pub struct CorrectionResult {
    pub text: String,
    pub corrections: Vec<AppliedCorrection>,
    /// Word list rewritten so it stays consistent with `text`
    pub words: Vec<WordConfidence>,
    /// True when the budget expired before all tokens were checked
    pub budget_exhausted: bool,
}

/// Seed corrections shipped with the process; tenants layer on top.
/// Misheard → canonical, Spanish telephony domain.
const GLOBAL_SEED: &[(&str, &str)] = &[
    ("salgo", "saldo"),
    ("cuesta", "cuenta"),
    ("tarjeto", "tarjeta"),
    ("fatura", "factura"),
    ("cancelacion", "cancelación"),
    ("trasferencia", "transferencia"),
];

/// Copy-on-write correction dictionary
///
/// Readers clone an `Arc` snapshot; reloads swap the snapshot atomically so
/// the hot path never takes a write lock.
pub struct CorrectionDictionary {
    snapshot: RwLock<Arc<HashMap<String, String>>>,
}

impl CorrectionDictionary {
    /// Build from the global seed only
    pub fn seeded() -> Self {
        let map = GLOBAL_SEED
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self {
            snapshot: RwLock::new(Arc::new(map)),
        }
    }

    /// Build from the seed plus tenant entries (tenant wins on conflicts)
    pub fn with_tenant_entries(entries: impl IntoIterator<Item = (String, String)>) -> Self {
        let dict = Self::seeded();
        dict.reload(entries);
        dict
    }

    /// Replace tenant entries; the seed always stays underneath
    pub fn reload(&self, entries: impl IntoIterator<Item = (String, String)>) {
        let mut map: HashMap<String, String> = GLOBAL_SEED
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        for (k, v) in entries {
            map.insert(k.to_lowercase(), v);
        }
        *self.snapshot.write() = Arc::new(map);
    }

    /// Learn one correction pair into the current snapshot
    pub fn learn(&self, original: &str, corrected: &str) {
        let mut map = (**self.snapshot.read()).clone();
        map.insert(original.trim().to_lowercase(), corrected.trim().to_string());
        *self.snapshot.write() = Arc::new(map);
    }

    /// Remove a learned pair, reverting to seed behaviour for that token
    pub fn unlearn(&self, original: &str) {
        let key = original.trim().to_lowercase();
        let mut map = (**self.snapshot.read()).clone();
        map.remove(&key);
        if let Some((_, v)) = GLOBAL_SEED.iter().find(|(k, _)| *k == key) {
            map.insert(key, v.to_string());
        }
        *self.snapshot.write() = Arc::new(map);
    }

    pub fn lookup_snapshot(&self) -> Arc<HashMap<String, String>> {
        self.snapshot.read().clone()
    }
}

/// Online corrector running the dictionary pass under a budget
pub struct OnlineCorrector {
    dictionary: Arc<CorrectionDictionary>,
    budget: Duration,
}

impl OnlineCorrector {
    pub fn new(dictionary: Arc<CorrectionDictionary>, budget_ms: u64) -> Self {
        Self {
            dictionary,
            budget: Duration::from_millis(budget_ms),
        }
    }

    /// Correct a transcript token-wise.
    ///
    /// Matching strips trailing punctuation and lowercases; the replacement
    /// preserves the original token's leading capitalization.
    pub fn correct(&self, text: &str, words: &[WordConfidence]) -> CorrectionResult {
        let deadline = Instant::now() + self.budget;
        let dict = self.dictionary.lookup_snapshot();

        let mut corrections = Vec::new();
        let mut out_tokens: Vec<String> = Vec::new();
        let mut budget_exhausted = false;

        for token in text.split_whitespace() {
            if Instant::now() >= deadline {
                budget_exhausted = true;
                out_tokens.push(token.to_string());
                continue;
            }

            match lookup_token(&dict, token) {
                Some(replacement) => {
                    corrections.push(AppliedCorrection {
                        original: strip_punctuation(token).to_lowercase(),
                        corrected: replacement.clone(),
                    });
                    out_tokens.push(recompose(token, &replacement));
                }
                None => out_tokens.push(token.to_string()),
            }
        }

        let corrected_text = out_tokens.join(" ");

        // Rewrite the word list so word/text consistency holds downstream
        let out_words = words
            .iter()
            .map(|w| {
                let corrected = lookup_token(&dict, &w.word)
                    .map(|r| recompose(&w.word, &r))
                    .unwrap_or_else(|| w.word.clone());
                WordConfidence {
                    word: corrected,
                    confidence: w.confidence,
                    start: w.start,
                    end: w.end,
                }
            })
            .collect();

        if !corrections.is_empty() {
            tracing::debug!(
                count = corrections.len(),
                budget_exhausted,
                "Applied dictionary corrections"
            );
        }

        CorrectionResult {
            text: corrected_text,
            corrections,
            words: out_words,
            budget_exhausted,
        }
    }
}

fn strip_punctuation(token: &str) -> &str {
    token.trim_matches(|c: char| !c.is_alphanumeric())
}

fn lookup_token(dict: &HashMap<String, String>, token: &str) -> Option<String> {
    let bare = strip_punctuation(token);
    if bare.is_empty() {
        return None;
    }
    dict.get(&bare.to_lowercase()).cloned()
}

/// Re-attach surrounding punctuation and initial capitalization
fn recompose(original: &str, replacement: &str) -> String {
    let bare = strip_punctuation(original);
    let prefix_len = original.find(bare).unwrap_or(0);
    let prefix = &original[..prefix_len];
    let suffix = &original[prefix_len + bare.len()..];

    let capitalized = bare.chars().next().map(|c| c.is_uppercase()).unwrap_or(false);
    let body = if capitalized {
        let mut chars = replacement.chars();
        match chars.next() {
            Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
            None => String::new(),
        }
    } else {
        replacement.to_string()
    };

    format!("{}{}{}", prefix, body, suffix)
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

    fn corrector() -> OnlineCorrector {
        OnlineCorrector::new(Arc::new(CorrectionDictionary::seeded()), 20)
    }

    #[test]
    fn test_seed_corrections_applied() {
        let result = corrector().correct(
            "Necesito revisar el salgo de mi cuesta",
            &words(&[
                ("Necesito", 0.95),
                ("revisar", 0.93),
                ("el", 0.99),
                ("salgo", 0.7),
                ("de", 0.99),
                ("mi", 0.98),
                ("cuesta", 0.6),
            ]),
        );

        assert_eq!(result.text, "Necesito revisar el saldo de mi cuenta");
        assert_eq!(result.corrections.len(), 2);
        assert_eq!(result.corrections[0].original, "salgo");
        assert_eq!(result.corrections[0].corrected, "saldo");
        assert_eq!(result.corrections[1].original, "cuesta");
        assert_eq!(result.corrections[1].corrected, "cuenta");
        assert!(!result.budget_exhausted);
    }

    #[test]
    fn test_word_list_stays_consistent() {
        let result = corrector().correct(
            "el salgo",
            &words(&[("el", 0.99), ("salgo", 0.7)]),
        );
        let joined: Vec<&str> = result.words.iter().map(|w| w.word.as_str()).collect();
        assert_eq!(joined.join(" "), result.text);
    }

    #[test]
    fn test_capitalization_preserved() {
        let result = corrector().correct("Salgo actual", &words(&[("Salgo", 0.5), ("actual", 0.9)]));
        assert_eq!(result.text, "Saldo actual");
    }

    #[test]
    fn test_punctuation_preserved() {
        let result = corrector().correct("mi cuesta.", &words(&[("mi", 0.9), ("cuesta.", 0.6)]));
        assert_eq!(result.text, "mi cuenta.");
    }

    #[test]
    fn test_learn_then_unlearn() {
        let dict = Arc::new(CorrectionDictionary::seeded());
        let corrector = OnlineCorrector::new(dict.clone(), 20);

        dict.learn("ipoteca", "hipoteca");
        let result = corrector.correct("mi ipoteca", &[]);
        assert_eq!(result.text, "mi hipoteca");

        dict.unlearn("ipoteca");
        let result = corrector.correct("mi ipoteca", &[]);
        assert_eq!(result.text, "mi ipoteca");
    }

    #[test]
    fn test_tenant_overrides_seed() {
        let dict = Arc::new(CorrectionDictionary::with_tenant_entries(vec![(
            "salgo".to_string(),
            "salgo".to_string(),
        )]));
        let corrector = OnlineCorrector::new(dict, 20);
        let result = corrector.correct("el salgo", &[]);
        // Tenant mapped the token to itself, suppressing the seed entry
        assert_eq!(result.text, "el salgo");
    }

    #[test]
    fn test_zero_budget_passes_through() {
        let corrector = OnlineCorrector::new(Arc::new(CorrectionDictionary::seeded()), 0);
        let result = corrector.correct("el salgo", &[]);
        assert!(result.budget_exhausted);
        assert_eq!(result.text, "el salgo");
    }
}
