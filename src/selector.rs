use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::expansion::ConceptTable;
use crate::models::{Quotation, SelectionRequest};
use crate::random::RandomSource;
use crate::store::QuotationStore;

const TERM_WEIGHT: f32 = 1.0;
const ADDRESSEE_BONUS: f32 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Direct,
    Concept,
    Fallback,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Direct => "direct",
            Tier::Concept => "concept",
            Tier::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub quotation: Quotation,
    pub tier: Tier,
}

#[derive(Debug, Clone, Copy)]
pub struct SelectionLimits {
    /// Upper bound on records fetched for concept scoring.
    pub candidate_cap: usize,
    /// Upper bound on records the random fallback draws from.
    pub fallback_pool: usize,
    pub timeout: Duration,
}

impl Default for SelectionLimits {
    fn default() -> Self {
        Self {
            candidate_cap: 50,
            fallback_pool: 10,
            timeout: Duration::from_millis(2_500),
        }
    }
}

/// Picks at most one quotation for a chat message: direct text match, then
/// concept-expanded keyword match, then a random eligible record.
///
/// Store failures, timeouts and cancellation all degrade to `None`; nothing
/// here returns an error to the caller.
#[derive(Clone)]
pub struct QuotationSelector {
    store: Arc<dyn QuotationStore>,
    concepts: Arc<ConceptTable>,
    random: Arc<dyn RandomSource>,
    limits: SelectionLimits,
}

impl QuotationSelector {
    pub fn new(
        store: Arc<dyn QuotationStore>,
        concepts: Arc<ConceptTable>,
        random: Arc<dyn RandomSource>,
        limits: SelectionLimits,
    ) -> Self {
        Self {
            store,
            concepts,
            random,
            limits,
        }
    }

    pub async fn select(
        &self,
        request: &SelectionRequest,
        cancel: &CancellationToken,
    ) -> Option<Quotation> {
        self.select_with_tier(request, cancel)
            .await
            .map(|selection| selection.quotation)
    }

    pub async fn select_with_tier(
        &self,
        request: &SelectionRequest,
        cancel: &CancellationToken,
    ) -> Option<Selection> {
        if cancel.is_cancelled() {
            debug!("quotation selection cancelled before start");
            return None;
        }

        let work = tokio::time::timeout(self.limits.timeout, self.run_tiers(request));
        let selection = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("quotation selection cancelled");
                return None;
            }
            outcome = work => match outcome {
                Ok(selection) => selection,
                Err(_) => {
                    warn!(
                        timeout_ms = self.limits.timeout.as_millis() as u64,
                        "quotation selection timed out"
                    );
                    return None;
                }
            },
        };

        match &selection {
            Some(found) => debug!(
                tier = found.tier.as_str(),
                id = %found.quotation.id,
                "selected quotation"
            ),
            None => debug!("no eligible quotation"),
        }
        selection
    }

    async fn run_tiers(&self, request: &SelectionRequest) -> Option<Selection> {
        if let Some(quotation) = self.direct_match(request).await {
            return Some(Selection {
                quotation,
                tier: Tier::Direct,
            });
        }
        if let Some(quotation) = self.concept_match(request).await {
            return Some(Selection {
                quotation,
                tier: Tier::Concept,
            });
        }
        self.fallback(request).await.map(|quotation| Selection {
            quotation,
            tier: Tier::Fallback,
        })
    }

    async fn direct_match(&self, request: &SelectionRequest) -> Option<Quotation> {
        let fragment = request.message.trim();
        if fragment.is_empty() {
            return None;
        }

        match self
            .store
            .find_containing(fragment, &request.exclude_ids, 1)
            .await
        {
            Ok(records) => retain_eligible(records, &request.exclude_ids)
                .into_iter()
                .next(),
            Err(err) => {
                warn!(error = %err, "direct quotation lookup failed");
                None
            }
        }
    }

    async fn concept_match(&self, request: &SelectionRequest) -> Option<Quotation> {
        let terms = self.concepts.candidate_terms(&request.message);
        if terms.is_empty() {
            return None;
        }

        let candidates = match self
            .store
            .search_terms(&terms, &request.exclude_ids, self.limits.candidate_cap)
            .await
        {
            Ok(records) => retain_eligible(records, &request.exclude_ids),
            Err(err) => {
                warn!(error = %err, terms = terms.len(), "concept quotation search failed");
                return None;
            }
        };

        pick_highest_scoring(candidates, &terms)
    }

    async fn fallback(&self, request: &SelectionRequest) -> Option<Quotation> {
        let pool = match self
            .store
            .list_eligible(&request.exclude_ids, self.limits.fallback_pool)
            .await
        {
            Ok(records) => retain_eligible(records, &request.exclude_ids),
            Err(err) => {
                warn!(error = %err, "fallback quotation listing failed");
                return None;
            }
        };

        if pool.is_empty() {
            return None;
        }
        let index = self.random.index(pool.len()).min(pool.len() - 1);
        pool.into_iter().nth(index)
    }
}

fn retain_eligible(records: Vec<Quotation>, exclude: &HashSet<String>) -> Vec<Quotation> {
    records
        .into_iter()
        .filter(|record| !exclude.contains(&record.id))
        .collect()
}

/// +1 per distinct term found anywhere in the record, +1.5 once when any
/// term appears in the addressee.
pub fn score_candidate(record: &Quotation, terms: &[String]) -> f32 {
    let addressee = record.addressee.to_lowercase();
    let haystack = format!(
        "{}\n{}\n{}",
        record.text.to_lowercase(),
        addressee,
        record
            .section_title
            .as_deref()
            .unwrap_or_default()
            .to_lowercase()
    );

    let mut seen = HashSet::new();
    let mut score = 0.0f32;
    let mut addressee_hit = false;
    for term in terms {
        let term = term.to_lowercase();
        if term.is_empty() || !seen.insert(term.clone()) {
            continue;
        }
        if haystack.contains(&term) {
            score += TERM_WEIGHT;
        }
        if addressee.contains(&term) {
            addressee_hit = true;
        }
    }

    if addressee_hit {
        score += ADDRESSEE_BONUS;
    }
    score
}

/// Ties keep the earliest candidate.
fn pick_highest_scoring(candidates: Vec<Quotation>, terms: &[String]) -> Option<Quotation> {
    let mut best: Option<(f32, Quotation)> = None;
    for candidate in candidates {
        let score = score_candidate(&candidate, terms);
        match &best {
            Some((best_score, _)) if score <= *best_score => {}
            _ => best = Some((score, candidate)),
        }
    }
    best.map(|(_, quotation)| quotation)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::Result;
    use async_trait::async_trait;

    use super::*;
    use crate::models::Part;
    use crate::random::SeededRandom;
    use crate::store::MemoryStore;

    fn quotation(id: &str, number: i64, addressee: &str, text: &str) -> Quotation {
        Quotation {
            id: id.to_string(),
            text: text.to_string(),
            addressee: addressee.to_string(),
            part: Part::Arabic,
            number,
            section_title: None,
        }
    }

    fn corpus() -> Vec<Quotation> {
        vec![
            quotation(
                "q1",
                1,
                "O Son of Spirit",
                "My first counsel is this: Possess a pure, kindly and radiant heart.",
            ),
            quotation(
                "q2",
                2,
                "O Son of Spirit",
                "The best beloved of all things in My sight is Justice; turn not away therefrom.",
            ),
            quotation(
                "q3",
                3,
                "O Son of Man",
                "Veiled in My immemorial being and in the ancient eternity of My essence.",
            ),
            quotation(
                "q4",
                4,
                "O Son of Being",
                "Love Me, that I may love thee. If thou lovest Me not, My love can in no wise reach thee.",
            ),
            quotation(
                "q5",
                5,
                "O Friend",
                "In the garden of thy heart plant naught but the rose of love.",
            ),
        ]
    }

    fn selector_with(store: impl QuotationStore + 'static, seed: u64) -> QuotationSelector {
        QuotationSelector::new(
            Arc::new(store),
            Arc::new(ConceptTable::default()),
            Arc::new(SeededRandom::new(seed)),
            SelectionLimits::default(),
        )
    }

    fn selector(records: Vec<Quotation>) -> QuotationSelector {
        selector_with(MemoryStore::new(records), 42)
    }

    #[tokio::test]
    async fn exact_text_is_returned_by_direct_match() {
        let selector = selector(corpus());
        let text = corpus()[2].text.clone();

        let selection = selector
            .select_with_tier(&SelectionRequest::new(text), &CancellationToken::new())
            .await
            .expect("direct match");
        assert_eq!(selection.tier, Tier::Direct);
        assert_eq!(selection.quotation.id, "q3");
    }

    #[tokio::test]
    async fn direct_match_prefers_first_in_store_order() {
        let selector = selector(corpus());

        let selection = selector
            .select_with_tier(&SelectionRequest::new("HEART"), &CancellationToken::new())
            .await
            .expect("direct match");
        assert_eq!(selection.tier, Tier::Direct);
        assert_eq!(selection.quotation.id, "q1");
    }

    #[tokio::test]
    async fn direct_match_skips_excluded_records() {
        let selector = selector(corpus());
        let request = SelectionRequest::new("heart").excluding(["q1"]);

        let selection = selector
            .select_with_tier(&request, &CancellationToken::new())
            .await
            .expect("direct match");
        assert_eq!(selection.tier, Tier::Direct);
        assert_eq!(selection.quotation.id, "q5");
    }

    #[tokio::test]
    async fn concept_match_scores_distinct_terms() {
        let selector = selector(corpus());
        let request = SelectionRequest::new("How do I find real love?");

        let selection = selector
            .select_with_tier(&request, &CancellationToken::new())
            .await
            .expect("concept match");
        assert_eq!(selection.tier, Tier::Concept);
        // q2 ("beloved") and q5 ("heart", "love") both score 2; store order decides.
        assert_eq!(selection.quotation.id, "q2");
    }

    #[tokio::test]
    async fn addressee_bonus_outranks_single_text_hit() {
        let records = vec![
            quotation("a", 1, "O Son of Man", "Be a companion to the poor and befriend them."),
            quotation("b", 2, "O Friend", "Walk with patience."),
        ];
        let selector = selector(records);

        let selection = selector
            .select_with_tier(
                &SelectionRequest::new("I need a friend"),
                &CancellationToken::new(),
            )
            .await
            .expect("concept match");
        assert_eq!(selection.tier, Tier::Concept);
        assert_eq!(selection.quotation.id, "b");
    }

    #[tokio::test]
    async fn equal_scores_keep_store_order() {
        let records = vec![
            quotation("z", 2, "O Son of Man", "Seek wisdom."),
            quotation("y", 1, "O Son of Man", "Be wise."),
        ];
        let selector = selector(records);

        for _ in 0..5 {
            let selection = selector
                .select_with_tier(
                    &SelectionRequest::new("teach me wisdom"),
                    &CancellationToken::new(),
                )
                .await
                .expect("concept match");
            assert_eq!(selection.tier, Tier::Concept);
            assert_eq!(selection.quotation.id, "y");
        }
    }

    #[tokio::test]
    async fn prosperity_scenario_falls_back_to_only_record() {
        let selector = selector(vec![quotation(
            "1",
            1,
            "O Son of Man",
            "Be generous in prosperity",
        )]);
        let selection = selector
            .select_with_tier(
                &SelectionRequest::new("Tell me about prosperity and generosity"),
                &CancellationToken::new(),
            )
            .await
            .expect("a quotation");
        assert_eq!(selection.tier, Tier::Fallback);
        assert_eq!(selection.quotation.id, "1");
    }

    #[tokio::test]
    async fn words_outside_the_concept_table_fall_back() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(vec![
                quotation("a", 1, "O Son of Spirit", "Walk in My ways."),
                quotation("b", 2, "O Son of Spirit", "Possess a pure, kindly and radiant heart."),
            ]),
            ..Default::default()
        });
        let selector = QuotationSelector::new(
            store.clone(),
            Arc::new(ConceptTable::default()),
            Arc::new(SeededRandom::new(9)),
            SelectionLimits::default(),
        );

        let mut hits = HashSet::new();
        for _ in 0..40 {
            let selection = selector
                .select_with_tier(
                    &SelectionRequest::new("What about modern art?"),
                    &CancellationToken::new(),
                )
                .await
                .expect("fallback");
            assert_eq!(selection.tier, Tier::Fallback);
            hits.insert(selection.quotation.id);
        }
        assert_eq!(hits.len(), 2);
        // Direct lookup plus listing; no term search is issued.
        assert_eq!(store.calls.load(Ordering::SeqCst), 80);
    }

    #[tokio::test]
    async fn empty_message_falls_back_to_remaining_record() {
        let selector = selector(corpus().into_iter().take(3).collect());
        let request = SelectionRequest::new("").excluding(["q1", "q3"]);

        let selection = selector
            .select_with_tier(&request, &CancellationToken::new())
            .await
            .expect("fallback");
        assert_eq!(selection.tier, Tier::Fallback);
        assert_eq!(selection.quotation.id, "q2");
    }

    #[tokio::test]
    async fn empty_store_yields_none() {
        let selector = selector(vec![]);
        let found = selector
            .select(&SelectionRequest::new("love"), &CancellationToken::new())
            .await;
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn full_exclusion_yields_none_for_any_message() {
        let selector = selector(corpus());
        let all_ids: Vec<String> = corpus().into_iter().map(|q| q.id).collect();

        for message in ["", "love", "Possess a pure", "zebra crossings"] {
            let request = SelectionRequest::new(message).excluding(all_ids.clone());
            let found = selector.select(&request, &CancellationToken::new()).await;
            assert!(found.is_none(), "message {message:?} returned a record");
        }
    }

    #[tokio::test]
    async fn exclusion_holds_across_every_tier() {
        let selector = selector(corpus());
        let excluded = ["q1", "q2", "q4"];

        for message in ["heart", "love and justice", "", "nothing relevant", "rose"] {
            for _ in 0..10 {
                let request = SelectionRequest::new(message).excluding(excluded);
                if let Some(found) = selector.select(&request, &CancellationToken::new()).await {
                    assert!(!excluded.contains(&found.id.as_str()));
                }
            }
        }
    }

    #[tokio::test]
    async fn concept_selection_is_reproducible() {
        let selector = selector(corpus());
        let request = SelectionRequest::new("justice and the heart");

        let first = selector
            .select_with_tier(&request, &CancellationToken::new())
            .await;
        let chosen = first.as_ref().expect("concept match");
        assert_eq!(chosen.tier, Tier::Concept);
        assert_eq!(chosen.quotation.id, "q2");
        for _ in 0..10 {
            let again = selector
                .select_with_tier(&request, &CancellationToken::new())
                .await;
            assert_eq!(again, first);
        }
    }

    #[tokio::test]
    async fn fallback_reaches_every_eligible_record() {
        let selector = selector(corpus());
        let request = SelectionRequest::new("").excluding(["q3"]);
        let mut hits: HashMap<String, usize> = HashMap::new();

        for _ in 0..400 {
            let selection = selector
                .select_with_tier(&request, &CancellationToken::new())
                .await
                .expect("fallback");
            assert_eq!(selection.tier, Tier::Fallback);
            *hits.entry(selection.quotation.id).or_default() += 1;
        }

        assert!(!hits.contains_key("q3"));
        for id in ["q1", "q2", "q4", "q5"] {
            assert!(hits.get(id).copied().unwrap_or(0) > 0, "{id} never selected");
        }
    }

    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        fail_direct: bool,
        fail_terms: bool,
        fail_listing: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl QuotationStore for FlakyStore {
        async fn find_containing(
            &self,
            fragment: &str,
            exclude: &HashSet<String>,
            limit: usize,
        ) -> Result<Vec<Quotation>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_direct {
                anyhow::bail!("connection refused");
            }
            self.inner.find_containing(fragment, exclude, limit).await
        }

        async fn search_terms(
            &self,
            terms: &[String],
            exclude: &HashSet<String>,
            limit: usize,
        ) -> Result<Vec<Quotation>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_terms {
                anyhow::bail!("connection refused");
            }
            self.inner.search_terms(terms, exclude, limit).await
        }

        async fn list_eligible(
            &self,
            exclude: &HashSet<String>,
            limit: usize,
        ) -> Result<Vec<Quotation>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_listing {
                anyhow::bail!("connection refused");
            }
            self.inner.list_eligible(exclude, limit).await
        }

        async fn get(&self, id: &str) -> Result<Option<Quotation>> {
            self.inner.get(id).await
        }

        async fn count(&self) -> Result<i64> {
            self.inner.count().await
        }
    }

    #[tokio::test]
    async fn failing_tiers_fall_through_to_fallback() {
        let store = FlakyStore {
            inner: MemoryStore::new(corpus()),
            fail_direct: true,
            fail_terms: true,
            ..Default::default()
        };
        let selector = selector_with(store, 1);

        let selection = selector
            .select_with_tier(&SelectionRequest::new("love"), &CancellationToken::new())
            .await
            .expect("fallback");
        assert_eq!(selection.tier, Tier::Fallback);
    }

    #[tokio::test]
    async fn unreachable_store_yields_none() {
        let store = FlakyStore {
            inner: MemoryStore::new(corpus()),
            fail_direct: true,
            fail_terms: true,
            fail_listing: true,
            ..Default::default()
        };
        let selector = selector_with(store, 1);

        let found = selector
            .select(&SelectionRequest::new("love"), &CancellationToken::new())
            .await;
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn direct_hit_issues_a_single_query() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(corpus()),
            ..Default::default()
        });
        let selector = QuotationSelector::new(
            store.clone(),
            Arc::new(ConceptTable::default()),
            Arc::new(SeededRandom::new(3)),
            SelectionLimits::default(),
        );

        selector
            .select(&SelectionRequest::new("radiant heart"), &CancellationToken::new())
            .await
            .expect("direct match");
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }

    struct StalledStore;

    #[async_trait]
    impl QuotationStore for StalledStore {
        async fn find_containing(
            &self,
            _fragment: &str,
            _exclude: &HashSet<String>,
            _limit: usize,
        ) -> Result<Vec<Quotation>> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(vec![])
        }

        async fn search_terms(
            &self,
            _terms: &[String],
            _exclude: &HashSet<String>,
            _limit: usize,
        ) -> Result<Vec<Quotation>> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(vec![])
        }

        async fn list_eligible(
            &self,
            _exclude: &HashSet<String>,
            _limit: usize,
        ) -> Result<Vec<Quotation>> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(vec![])
        }

        async fn get(&self, _id: &str) -> Result<Option<Quotation>> {
            Ok(None)
        }

        async fn count(&self) -> Result<i64> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn deadline_abandons_stalled_store() {
        let selector = QuotationSelector::new(
            Arc::new(StalledStore),
            Arc::new(ConceptTable::default()),
            Arc::new(SeededRandom::new(3)),
            SelectionLimits {
                timeout: Duration::from_millis(20),
                ..SelectionLimits::default()
            },
        );

        let found = selector
            .select(&SelectionRequest::new("love"), &CancellationToken::new())
            .await;
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn cancellation_abandons_selection() {
        let selector = selector_with(StalledStore, 3);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let found = selector.select(&SelectionRequest::new("love"), &cancel).await;
        assert!(found.is_none());
    }

    #[test]
    fn score_counts_each_term_once_and_adds_addressee_bonus() {
        let record = quotation("x", 1, "O Friend", "A friend in love, love and more love.");
        let terms = vec![
            "friend".to_string(),
            "love".to_string(),
            "love".to_string(),
            "absent".to_string(),
        ];
        assert_eq!(score_candidate(&record, &terms), 2.0 + ADDRESSEE_BONUS);
    }

    #[test]
    fn section_title_contributes_to_score() {
        let mut record = quotation("x", 1, "O Son of Man", "Plain passage.");
        record.section_title = Some("On Detachment".to_string());
        assert_eq!(score_candidate(&record, &["detachment".to_string()]), 1.0);
    }
}
