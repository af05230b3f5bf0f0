use std::collections::HashSet;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

const MIN_TOKEN_CHARS: usize = 3;

const STOPWORDS: &[&str] = &[
    "the", "and", "but", "for", "nor", "yet", "not", "are", "was", "were", "been", "being",
    "has", "have", "had", "does", "did", "doing", "can", "could", "should", "would", "will",
    "shall", "may", "might", "must", "this", "that", "these", "those", "there", "here", "then",
    "than", "with", "without", "from", "into", "onto", "about", "above", "below", "over",
    "under", "again", "very", "just", "also", "only", "some", "any", "all", "each", "more",
    "most", "such", "what", "which", "who", "whom", "whose", "when", "where", "why", "how",
    "you", "your", "yours", "yourself", "she", "her", "hers", "him", "his", "himself", "its",
    "itself", "they", "them", "their", "theirs", "our", "ours", "ourselves", "myself", "mine",
    "tell", "please", "give", "want", "like", "really", "because", "while", "through",
    "after", "before", "during", "other", "something", "anything", "everything",
];

/// One concept and the related terms it broadens into.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Concept {
    pub concept: String,
    pub terms: Vec<String>,
}

/// Static mapping from concept key to related terms, loaded once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConceptTable {
    concepts: Vec<Concept>,
}

impl Default for ConceptTable {
    fn default() -> Self {
        let builtin: &[(&str, &[&str])] = &[
            ("love", &["beloved", "heart", "affection", "devotion", "lover"]),
            ("justice", &["fair", "righteous", "equity", "right"]),
            ("peace", &["tranquil", "serenity", "calm", "rest"]),
            ("soul", &["spirit", "spiritual", "essence", "inner"]),
            ("god", &["divine", "lord", "creator", "almighty"]),
            ("wisdom", &["knowledge", "understand", "know", "wise"]),
            ("truth", &["reality", "true", "sincere"]),
            ("death", &["eternal", "immortal", "die", "perish"]),
            ("friend", &["companion", "brother", "fellowship"]),
            ("world", &["earth", "earthly", "material", "dust"]),
        ];

        Self::from_concepts(
            builtin
                .iter()
                .map(|(concept, terms)| Concept {
                    concept: concept.to_string(),
                    terms: terms.iter().map(|t| t.to_string()).collect(),
                })
                .collect(),
        )
    }
}

impl ConceptTable {
    pub fn from_concepts(concepts: Vec<Concept>) -> Self {
        let concepts = concepts
            .into_iter()
            .map(|c| Concept {
                concept: c.concept.trim().to_lowercase(),
                terms: c
                    .terms
                    .into_iter()
                    .map(|t| t.trim().to_lowercase())
                    .filter(|t| !t.is_empty())
                    .collect(),
            })
            .filter(|c| !c.concept.is_empty())
            .collect();
        Self { concepts }
    }

    /// Reads a JSON array of `{ "concept": ..., "terms": [...] }` objects.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading concept table: {}", path.display()))?;
        let concepts: Vec<Concept> = serde_json::from_str(&raw)
            .with_context(|| format!("failed parsing concept table: {}", path.display()))?;
        if concepts.is_empty() {
            anyhow::bail!("concept table {} is empty", path.display());
        }
        Ok(Self::from_concepts(concepts))
    }

    pub fn concepts(&self) -> &[Concept] {
        &self.concepts
    }

    /// Broadens message tokens into the deduplicated candidate term set.
    ///
    /// Only concepts contribute terms: a token that matches a concept key or
    /// one of its terms (exactly or as a prefix, so "loved" hits "love")
    /// adds that key and all its terms. Tokens matching no concept add
    /// nothing. Order follows first appearance.
    pub fn expand(&self, tokens: &[String]) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();

        for token in tokens {
            for concept in &self.concepts {
                let hit = std::iter::once(&concept.concept)
                    .chain(concept.terms.iter())
                    .any(|trigger| token_hits(token, trigger));
                if !hit {
                    continue;
                }
                push_unique_term(&mut out, &mut seen, &concept.concept);
                for term in &concept.terms {
                    push_unique_term(&mut out, &mut seen, term);
                }
            }
        }

        out
    }

    pub fn candidate_terms(&self, message: &str) -> Vec<String> {
        self.expand(&tokenize(message))
    }
}

fn token_hits(token: &str, trigger: &str) -> bool {
    token == trigger || (trigger.chars().count() >= 4 && token.starts_with(trigger))
}

fn push_unique_term(terms: &mut Vec<String>, seen: &mut HashSet<String>, term: &str) {
    if seen.insert(term.to_string()) {
        terms.push(term.to_string());
    }
}

fn token_regex() -> &'static Regex {
    static TOKEN_RE: OnceLock<Regex> = OnceLock::new();
    TOKEN_RE.get_or_init(|| {
        Regex::new(r"[\p{L}\p{N}]+(?:'[\p{L}]+)?").unwrap_or_else(|_| Regex::new("^$").unwrap())
    })
}

/// Lowercase words of at least three characters, stop words removed,
/// duplicates dropped.
pub fn tokenize(message: &str) -> Vec<String> {
    let stopwords: HashSet<&'static str> = STOPWORDS.iter().copied().collect();
    let mut seen = HashSet::new();
    let mut out = Vec::new();

    for m in token_regex().find_iter(message) {
        let token = m.as_str().to_lowercase();
        if token.chars().count() < MIN_TOKEN_CHARS || stopwords.contains(token.as_str()) {
            continue;
        }
        if seen.insert(token.clone()) {
            out.push(token);
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_drops_short_words_and_stopwords() {
        let tokens = tokenize("Tell me about the Love of God, and how to be at peace");
        assert_eq!(tokens, vec!["love", "god", "peace"]);
    }

    #[test]
    fn tokenize_handles_blank_input() {
        assert!(tokenize("").is_empty());
        assert!(tokenize("   \n\t ").is_empty());
    }

    #[test]
    fn concept_key_expands_to_all_terms() {
        let table = ConceptTable::default();
        let terms = table.candidate_terms("justice");
        assert_eq!(terms[0], "justice");
        for expected in ["fair", "righteous", "equity", "right"] {
            assert!(terms.iter().any(|t| t == expected), "missing {expected}");
        }
    }

    #[test]
    fn synonym_pulls_in_its_concept() {
        let table = ConceptTable::default();
        let terms = table.candidate_terms("my beloved");
        assert!(terms.contains(&"love".to_string()));
        assert!(terms.contains(&"devotion".to_string()));
    }

    #[test]
    fn inflected_token_matches_by_prefix() {
        let table = ConceptTable::default();
        let terms = table.candidate_terms("I loved them");
        assert!(terms.contains(&"beloved".to_string()));
        assert!(!terms.contains(&"loved".to_string()));
    }

    #[test]
    fn tokens_outside_the_table_add_no_terms() {
        let table = ConceptTable::default();
        assert!(table.candidate_terms("prosperity and generosity").is_empty());
        // "art" is a substring of "heart" but not a trigger.
        assert!(table.candidate_terms("What about modern art?").is_empty());
    }

    #[test]
    fn only_concept_terms_survive_a_mixed_message() {
        let table = ConceptTable::default();
        let terms = table.candidate_terms("modern peace");
        assert_eq!(terms, vec!["peace", "tranquil", "serenity", "calm", "rest"]);
    }

    #[test]
    fn custom_table_is_normalized() {
        let table = ConceptTable::from_concepts(vec![Concept {
            concept: " Hope ".to_string(),
            terms: vec!["Trust".to_string(), "".to_string()],
        }]);
        assert_eq!(table.concepts()[0].concept, "hope");
        assert_eq!(table.concepts()[0].terms, vec!["trust"]);
        assert_eq!(table.candidate_terms("hope"), vec!["hope", "trust"]);
    }
}
