use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::Quotation;

/// Read-only access to the quotation table.
///
/// Case-insensitive comparisons fold ASCII letters only, matching SQLite's
/// `lower()`. Every query returns records in the store's natural order (part, then
/// number, then id) and never returns an id contained in `exclude`.
#[async_trait]
pub trait QuotationStore: Send + Sync {
    /// Records whose `text` contains `fragment`, compared case-insensitively.
    async fn find_containing(
        &self,
        fragment: &str,
        exclude: &HashSet<String>,
        limit: usize,
    ) -> Result<Vec<Quotation>>;

    /// Records where `text`, `addressee` or `section_title` contains any of
    /// `terms`, compared case-insensitively.
    async fn search_terms(
        &self,
        terms: &[String],
        exclude: &HashSet<String>,
        limit: usize,
    ) -> Result<Vec<Quotation>>;

    async fn list_eligible(&self, exclude: &HashSet<String>, limit: usize)
        -> Result<Vec<Quotation>>;

    async fn get(&self, id: &str) -> Result<Option<Quotation>>;

    async fn count(&self) -> Result<i64>;
}

/// Store backed by a `Vec`, kept sorted in natural order.
#[derive(Clone, Default)]
pub struct MemoryStore {
    records: Vec<Quotation>,
}

impl MemoryStore {
    pub fn new(mut records: Vec<Quotation>) -> Self {
        records.sort_by(|a, b| natural_key(a).cmp(&natural_key(b)));
        Self { records }
    }

    fn eligible<'a>(
        &'a self,
        exclude: &'a HashSet<String>,
    ) -> impl Iterator<Item = &'a Quotation> + 'a {
        self.records
            .iter()
            .filter(move |record| !exclude.contains(&record.id))
    }
}

fn natural_key(record: &Quotation) -> (i64, i64, &str) {
    (record.part.ordinal(), record.number, record.id.as_str())
}

#[async_trait]
impl QuotationStore for MemoryStore {
    async fn find_containing(
        &self,
        fragment: &str,
        exclude: &HashSet<String>,
        limit: usize,
    ) -> Result<Vec<Quotation>> {
        let needle = fragment.to_ascii_lowercase();
        Ok(self
            .eligible(exclude)
            .filter(|record| record.text.to_ascii_lowercase().contains(&needle))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn search_terms(
        &self,
        terms: &[String],
        exclude: &HashSet<String>,
        limit: usize,
    ) -> Result<Vec<Quotation>> {
        if terms.is_empty() {
            return Ok(vec![]);
        }
        let terms: Vec<String> = terms.iter().map(|term| term.to_ascii_lowercase()).collect();

        Ok(self
            .eligible(exclude)
            .filter(|record| {
                let columns = [
                    record.text.to_ascii_lowercase(),
                    record.addressee.to_ascii_lowercase(),
                    record
                        .section_title
                        .as_deref()
                        .unwrap_or_default()
                        .to_ascii_lowercase(),
                ];
                terms
                    .iter()
                    .any(|term| columns.iter().any(|column| column.contains(term.as_str())))
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn list_eligible(
        &self,
        exclude: &HashSet<String>,
        limit: usize,
    ) -> Result<Vec<Quotation>> {
        Ok(self.eligible(exclude).take(limit).cloned().collect())
    }

    async fn get(&self, id: &str) -> Result<Option<Quotation>> {
        Ok(self.records.iter().find(|record| record.id == id).cloned())
    }

    async fn count(&self) -> Result<i64> {
        Ok(self.records.len() as i64)
    }
}
