//! Wake phrase matching on transcripts.
//!
//! Each utterance is transcribed first, then checked for a configured trigger
//! phrase. Matching is fuzzy (normalized edit distance per word window) so
//! near-misses like "jarvys" still count, with the configured sensitivity as
//! the minimum confidence. A candidate window must start with the same letter
//! as the phrase. Whatever follows the phrase in the same utterance
//! ("jarvis what time is it") is returned as the remainder.

#[derive(Debug, Clone, PartialEq)]
pub struct WakeMatch {
    pub phrase: String,
    pub confidence: f32,
    /// Text spoken after the wake phrase in the same utterance (may be empty)
    pub remainder: String,
}

pub struct WakeMatcher {
    /// Each phrase as normalized words
    phrases: Vec<Vec<String>>,
    sensitivity: f32,
}

impl WakeMatcher {
    pub fn new(wake_words: &[String], sensitivity: f32) -> Self {
        let phrases: Vec<Vec<String>> = wake_words
            .iter()
            .map(|phrase| phrase.split_whitespace().map(normalize_word).collect::<Vec<_>>())
            .filter(|words: &Vec<String>| words.iter().any(|w| !w.is_empty()))
            .collect();

        tracing::debug!(wake_words = ?phrases, sensitivity, "wake matcher initialized");

        Self {
            phrases,
            sensitivity,
        }
    }

    /// Find the earliest, most confident wake phrase in `transcript`.
    pub fn detect(&self, transcript: &str) -> Option<WakeMatch> {
        let tokens: Vec<&str> = transcript.split_whitespace().collect();
        let words: Vec<String> = tokens.iter().map(|t| normalize_word(t)).collect();

        let mut best: Option<(usize, usize, f32, &Vec<String>)> = None;

        for phrase in &self.phrases {
            let n = phrase.len();
            if n == 0 || words.len() < n {
                continue;
            }
            let target = phrase.join(" ");

            for start in 0..=(words.len() - n) {
                let window = words[start..start + n].join(" ");
                // Short phrases tolerate too many edits otherwise ("harris" vs "jarvis")
                if window.chars().next() != target.chars().next() {
                    continue;
                }
                let confidence = similarity(&window, &target);
                if confidence < self.sensitivity {
                    continue;
                }
                let better = match best {
                    None => true,
                    Some((best_start, _, best_conf, _)) => {
                        start < best_start || (start == best_start && confidence > best_conf)
                    }
                };
                if better {
                    best = Some((start, n, confidence, phrase));
                }
            }
        }

        best.map(|(start, n, confidence, phrase)| {
            let remainder = tokens[start + n..]
                .join(" ")
                .trim_start_matches(|c: char| c.is_ascii_punctuation() || c.is_whitespace())
                .to_string();
            WakeMatch {
                phrase: phrase.join(" "),
                confidence,
                remainder,
            }
        })
    }
}

fn normalize_word(word: &str) -> String {
    word.chars()
        .filter(|c| c.is_alphanumeric() || *c == '\'')
        .flat_map(char::to_lowercase)
        .collect()
}

/// 1.0 for identical strings, falling toward 0.0 with edit distance.
fn similarity(a: &str, b: &str) -> f32 {
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 1.0;
    }
    1.0 - levenshtein(a, b) as f32 / longest as f32
}

fn levenshtein(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != *cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jarvis() -> WakeMatcher {
        WakeMatcher::new(&["jarvis".to_string()], 0.6)
    }

    #[test]
    fn test_exact_wake_word() {
        let m = jarvis().detect("Jarvis.").unwrap();
        assert_eq!(m.phrase, "jarvis");
        assert_eq!(m.confidence, 1.0);
        assert_eq!(m.remainder, "");
    }

    #[test]
    fn test_remainder_after_wake_word() {
        let m = jarvis().detect("Hey Jarvis, what is two plus two?").unwrap();
        assert_eq!(m.remainder, "what is two plus two?");
    }

    #[test]
    fn test_fuzzy_match_respects_sensitivity() {
        assert!(jarvis().detect("jarvys").is_some());
        assert!(jarvis().detect("what is the weather").is_none());

        let strict = WakeMatcher::new(&["jarvis".to_string()], 1.0);
        assert!(strict.detect("jarvys").is_none());
    }

    #[test]
    fn test_candidate_must_share_first_letter() {
        assert!(jarvis().detect("harris what time is it").is_none());
        assert!(jarvis().detect("marvis").is_none());
        let m = jarvis().detect("jarvys what time is it").unwrap();
        assert_eq!(m.remainder, "what time is it");
    }

    #[test]
    fn test_multi_word_phrase() {
        let matcher = WakeMatcher::new(&["hey computer".to_string()], 0.8);
        let m = matcher.detect("okay hey computer lights on").unwrap();
        assert_eq!(m.phrase, "hey computer");
        assert_eq!(m.remainder, "lights on");
        assert!(matcher.detect("computer").is_none());
    }

    #[test]
    fn test_levenshtein() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("same", "same"), 0);
    }

    #[test]
    fn test_blank_phrases_are_ignored() {
        let matcher = WakeMatcher::new(&["  ".to_string()], 0.6);
        assert!(matcher.phrases.is_empty());
        assert!(matcher.detect("anything at all").is_none());
    }
}
