//! Black-box full-text index.
//!
//! A plain inverted token index: lowercased word tokens mapped to posting
//! lists, with a per-document term-frequency table so deletions and
//! relevance ranking work. The engine treats it purely as an iterator
//! provider - results come back in match-rank order with a relevance
//! percent per id, and the produced iterator is flagged unsorted.

use std::collections::HashMap;

use memdb_types::IdType;

use crate::idset::{AddMode, IdSet};

#[derive(Debug, Default)]
pub struct FullTextIndex {
    terms: HashMap<String, IdSet>,
    doc_terms: HashMap<IdType, Vec<String>>,
}

/// Ranked selection: ids in descending relevance, with a percent per id.
#[derive(Debug, Default)]
pub struct FtSelection {
    pub ids: Vec<IdType>,
    pub procs: Vec<u8>,
}

impl FullTextIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index the text of one document field.
    pub fn upsert(&mut self, id: IdType, text: &str) {
        self.delete(id);
        let tokens = tokenize(text);
        for token in &tokens {
            self.terms
                .entry(token.clone())
                .or_default()
                .add(id, AddMode::Ordered);
        }
        if !tokens.is_empty() {
            self.doc_terms.insert(id, tokens);
        }
    }

    /// Drop a document from all posting lists.
    pub fn delete(&mut self, id: IdType) {
        if let Some(tokens) = self.doc_terms.remove(&id) {
            for token in tokens {
                if let Some(posting) = self.terms.get_mut(&token) {
                    posting.erase(id);
                    if posting.is_empty() {
                        self.terms.remove(&token);
                    }
                }
            }
        }
    }

    /// Documents matching every query token, ranked by how much of their
    /// text the query covers.
    pub fn select(&self, query: &str) -> FtSelection {
        let tokens = tokenize(query);
        if tokens.is_empty() {
            return FtSelection::default();
        }

        let mut matched: Option<IdSet> = None;
        for token in &tokens {
            let posting = match self.terms.get(token) {
                Some(p) => p,
                None => return FtSelection::default(),
            };
            matched = Some(match matched {
                Some(acc) => acc.intersect(posting),
                None => posting.clone(),
            });
        }

        let matched = matched.unwrap_or_default();
        let mut ranked: Vec<(IdType, u8)> = matched
            .iter()
            .map(|id| {
                let doc_len = self.doc_terms.get(&id).map(|t| t.len()).unwrap_or(1).max(1);
                let hits: usize = self
                    .doc_terms
                    .get(&id)
                    .map(|terms| terms.iter().filter(|t| tokens.contains(t)).count())
                    .unwrap_or(0);
                let proc = ((hits * 100) / doc_len).min(100) as u8;
                (id, proc)
            })
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        FtSelection {
            ids: ranked.iter().map(|(id, _)| *id).collect(),
            procs: ranked.iter().map(|(_, p)| *p).collect(),
        }
    }

    /// Number of distinct terms.
    pub fn size(&self) -> usize {
        self.terms.len()
    }

    pub fn mem_size(&self) -> usize {
        self.terms
            .values()
            .map(|p| p.heap_size())
            .sum::<usize>()
            + self
                .doc_terms
                .values()
                .map(|t| t.iter().map(|s| s.capacity()).sum::<usize>())
                .sum::<usize>()
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_all_tokens_required() {
        let mut ft = FullTextIndex::new();
        ft.upsert(1, "quick brown fox");
        ft.upsert(2, "quick red fox");
        ft.upsert(3, "lazy dog");

        let hit = ft.select("quick fox");
        assert_eq!(hit.ids, vec![1, 2]);
        let miss = ft.select("quick dog");
        assert!(miss.ids.is_empty());
    }

    #[test]
    fn test_rank_order() {
        let mut ft = FullTextIndex::new();
        ft.upsert(1, "rust rust and a lot of other words to dilute the score");
        ft.upsert(2, "rust");
        let hit = ft.select("rust");
        // Document 2 is fully covered by the query and ranks first.
        assert_eq!(hit.ids[0], 2);
        assert!(hit.procs[0] >= hit.procs[1]);
    }

    #[test]
    fn test_delete() {
        let mut ft = FullTextIndex::new();
        ft.upsert(1, "hello world");
        ft.delete(1);
        assert!(ft.select("hello").ids.is_empty());
        assert_eq!(ft.size(), 0);
    }

    #[test]
    fn test_upsert_replaces() {
        let mut ft = FullTextIndex::new();
        ft.upsert(1, "old text");
        ft.upsert(1, "new text");
        assert!(ft.select("old").ids.is_empty());
        assert_eq!(ft.select("new").ids, vec![1]);
    }
}
