//! Lexical sentiment and prosody fusion
//!
//! A lexicon-based scorer (Spanish-tuned by default, tenant-replaceable)
//! produces the lexical label; fusion with prosody promotes neutral
//! segments spoken nervously to frustrated, and reinforces positive
//! segments spoken with excitement.

use std::collections::HashMap;

use callweave_core::{EmotionalTone, FusedSentiment, ProsodyFeatures, SentimentLabel};

/// Weighted keyword lexicon
#[derive(Debug, Clone)]
pub struct SentimentLexicon {
    weights: HashMap<String, f32>,
}

impl Default for SentimentLexicon {
    fn default() -> Self {
        Self::spanish()
    }
}

impl SentimentLexicon {
    /// Default Spanish-tuned lexicon
    pub fn spanish() -> Self {
        let entries: &[(&str, f32)] = &[
            // Positive
            ("gracias", 0.6),
            ("perfecto", 0.8),
            ("excelente", 0.9),
            ("genial", 0.8),
            ("bien", 0.4),
            ("bueno", 0.3),
            ("encantado", 0.7),
            ("estupendo", 0.8),
            // Negative
            ("problema", -0.5),
            ("error", -0.5),
            ("mal", -0.5),
            ("terrible", -0.9),
            ("horrible", -0.9),
            ("inaceptable", -0.9),
            ("queja", -0.7),
            ("reclamación", -0.7),
            ("molesto", -0.6),
            ("enfadado", -0.8),
            ("furioso", -0.95),
            ("harto", -0.8),
            ("cansado", -0.4),
            ("esperando", -0.3),
            ("nadie", -0.4),
            ("imposible", -0.6),
            ("estafa", -0.9),
        ];
        Self {
            weights: entries
                .iter()
                .map(|(w, s)| (w.to_string(), *s))
                .collect(),
        }
    }

    /// Tenant-supplied lexicon
    pub fn from_entries(entries: impl IntoIterator<Item = (String, f32)>) -> Self {
        Self {
            weights: entries
                .into_iter()
                .map(|(w, s)| (w.to_lowercase(), s))
                .collect(),
        }
    }

    /// Mean weight of matched tokens, 0 when nothing matches
    fn score(&self, text: &str) -> (f32, usize) {
        let mut total = 0.0;
        let mut hits = 0usize;
        for token in text.split_whitespace() {
            let token = token
                .trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase();
            if let Some(w) = self.weights.get(&token) {
                total += w;
                hits += 1;
            }
        }
        if hits == 0 {
            (0.0, 0)
        } else {
            ((total / hits as f32).clamp(-1.0, 1.0), hits)
        }
    }
}

/// Fuses lexical and prosody signals into one labeled score
pub struct SentimentFuser {
    lexicon: SentimentLexicon,
}

impl SentimentFuser {
    pub fn new(lexicon: SentimentLexicon) -> Self {
        Self { lexicon }
    }

    pub fn fuse(&self, text: &str, prosody: &ProsodyFeatures) -> FusedSentiment {
        let (score, hits) = self.lexicon.score(text);
        let token_count = text.split_whitespace().count().max(1);

        let lexical_label = if score > 0.2 {
            SentimentLabel::Positive
        } else if score < -0.6 {
            SentimentLabel::Angry
        } else if score < -0.2 {
            SentimentLabel::Frustrated
        } else {
            SentimentLabel::Neutral
        };

        // Confidence grows with lexicon coverage; prosody agreement adds a
        // fixed bonus below.
        let mut confidence = (hits as f32 / token_count as f32).clamp(0.0, 1.0) * 0.7 + 0.2;

        let (label, score) = match (lexical_label, prosody.emotional_tone) {
            // Neutral words spoken nervously read as frustration
            (SentimentLabel::Neutral, EmotionalTone::Nervous)
            | (SentimentLabel::Neutral, EmotionalTone::Concerned) => {
                (SentimentLabel::Frustrated, (score - 0.3).clamp(-1.0, 1.0))
            }
            // Positive words spoken excitedly stay positive, stronger
            (SentimentLabel::Positive, EmotionalTone::Excited) => {
                confidence = (confidence + 0.2).min(1.0);
                (SentimentLabel::Positive, (score + 0.2).clamp(-1.0, 1.0))
            }
            (label, _) => (label, score),
        };

        FusedSentiment {
            label,
            score,
            confidence,
            emotional_tone: prosody.emotional_tone,
        }
    }
}

impl Default for SentimentFuser {
    fn default() -> Self {
        Self::new(SentimentLexicon::default())
    }
}
