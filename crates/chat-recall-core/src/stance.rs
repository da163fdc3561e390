//! Stance classification capability.
//!
//! The flip detector only needs `classify_stance(topic, quotes)`. The LLM
//! backed implementation lives in the app crate; [`KeywordStanceClassifier`]
//! is the deterministic rule-based stand-in used offline and in tests.

use async_trait::async_trait;

use crate::chunk::word_tokens;
use crate::error::ProviderError;
use crate::models::Stance;

/// Judges the stance a set of quotes takes towards a topic.
#[async_trait]
pub trait StanceClassifier: Send + Sync {
    fn name(&self) -> &str;

    /// Dominant stance of `quotes` towards `topic`.
    ///
    /// Called with a single quote per call by the flip detector so that
    /// per-window agreement can be measured.
    async fn classify_stance(&self, topic: &str, quotes: &[String])
        -> Result<Stance, ProviderError>;
}

const POSITIVE: &[&str] = &[
    // en
    "good", "great", "love", "like", "bullish", "awesome", "amazing", "future", "best",
    "excellent", "promising", "buy", "moon", "brilliant",
    // uk
    "добр", "клас", "круто", "крута", "люблю", "подоба", "вірю", "супер", "чудов",
    "перспектив", "майбутн", "геніальн", "купую", "купуйте", "зросте", "топчик",
    // ru
    "хорош", "нрав", "отличн", "верю",
];

const NEGATIVE: &[&str] = &[
    // en
    "bad", "hate", "scam", "bearish", "terrible", "awful", "dead", "bubble", "ponzi",
    "worst", "garbage", "useless", "sell", "fraud",
    // uk
    "погано", "поган", "скам", "лохотрон", "пірамід", "фігн", "дурн", "ненавид", "жах",
    "мертв", "бульбашк", "обман", "відстій", "відстой", "шлак", "продавайте",
    // ru
    "плох", "развод", "ерунд", "хрень", "ненавиж", "пирамид",
];

const NEGATORS: &[&str] = &["не", "ні", "нє", "not", "no", "never", "don't", "нет", "ніколи", "никогда"];

/// Lexicon-based stance classifier (English, Ukrainian, Russian).
///
/// Stems of 4+ characters match by prefix, shorter ones exactly. A negator
/// directly before a sentiment word flips its polarity. No sentiment words
/// at all yields [`Stance::Unknown`]; balanced hits yield
/// [`Stance::Neutral`].
#[derive(Debug, Default, Clone)]
pub struct KeywordStanceClassifier;

impl KeywordStanceClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Synchronous core of the classifier.
    pub fn score(&self, text: &str) -> Stance {
        let tokens = word_tokens(text);
        let mut score = 0i32;
        let mut hits = 0u32;

        for (i, token) in tokens.iter().enumerate() {
            let polarity = if matches_any(token, POSITIVE) {
                1
            } else if matches_any(token, NEGATIVE) {
                -1
            } else {
                continue;
            };
            let negated = i > 0 && NEGATORS.contains(&tokens[i - 1].as_str());
            score += if negated { -polarity } else { polarity };
            hits += 1;
        }

        match (hits, score) {
            (0, _) => Stance::Unknown,
            (_, s) if s > 0 => Stance::Positive,
            (_, s) if s < 0 => Stance::Negative,
            _ => Stance::Neutral,
        }
    }
}

fn matches_any(token: &str, lexicon: &[&str]) -> bool {
    lexicon.iter().any(|stem| {
        if stem.chars().count() >= 4 {
            token.starts_with(stem)
        } else {
            token == *stem
        }
    })
}

#[async_trait]
impl StanceClassifier for KeywordStanceClassifier {
    fn name(&self) -> &str {
        "keyword"
    }

    async fn classify_stance(
        &self,
        _topic: &str,
        quotes: &[String],
    ) -> Result<Stance, ProviderError> {
        Ok(self.score(&quotes.join("\n")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positive_and_negative() {
        let c = KeywordStanceClassifier::new();
        assert_eq!(c.score("crypto is great, I love it"), Stance::Positive);
        assert_eq!(c.score("crypto is a scam"), Stance::Negative);
        assert_eq!(c.score("крипта це скам і піраміда"), Stance::Negative);
        assert_eq!(c.score("біткоїн це майбутнє, купую"), Stance::Positive);
    }

    #[test]
    fn test_negation_flips_polarity() {
        let c = KeywordStanceClassifier::new();
        assert_eq!(c.score("this is not good"), Stance::Negative);
        assert_eq!(c.score("не погано взагалі"), Stance::Positive);
    }

    #[test]
    fn test_unknown_and_neutral() {
        let c = KeywordStanceClassifier::new();
        assert_eq!(c.score("what time is the meeting"), Stance::Unknown);
        assert_eq!(c.score("good and bad"), Stance::Neutral);
    }

    #[tokio::test]
    async fn test_classify_stance_joins_quotes() {
        let c = KeywordStanceClassifier::new();
        let quotes = vec!["love it".to_string(), "great stuff".to_string()];
        assert_eq!(
            c.classify_stance("crypto", &quotes).await.unwrap(),
            Stance::Positive
        );
    }
}
