use crate::index::{tokenize, EntryKind, IndexEntry, ShareIndex};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::time::Instant;

pub const DEFAULT_LIMIT: usize = 100;
pub const MAX_LIMIT: usize = 1000;

const SCORE_EXACT: u32 = 100;
const SCORE_PREFIX: u32 = 50;
const SCORE_SUBSTRING: u32 = 20;
const SCORE_TOKEN: u32 = 30;
const SCORE_PARENT: u32 = 10;
const SCORE_FILE: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortBy {
    #[default]
    Relevance,
    Name,
    Size,
    #[serde(alias = "modified", alias = "modifiedAt", alias = "mtime")]
    ModifiedAt,
}

impl SortBy {
    /// Relevance reads best highest-first, everything else lowest-first
    pub fn default_order(&self) -> SortOrder {
        match self {
            SortBy::Relevance => SortOrder::Desc,
            _ => SortOrder::Asc,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub kind: Option<EntryKind>,
    /// Lowercase extensions without the dot; only constrains files
    pub extensions: Vec<String>,
    pub sort_by: SortBy,
    /// Falls back to [`SortBy::default_order`]
    pub sort_order: Option<SortOrder>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl SearchOptions {
    /// Set the extension filter, normalizing `.PDF` and `pdf` alike
    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.extensions = extensions
            .into_iter()
            .map(|e| e.as_ref().trim().trim_start_matches('.').to_lowercase())
            .filter(|e| !e.is_empty())
            .collect();
        self
    }

    pub fn with_kind(mut self, kind: EntryKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }

    fn accepts(&self, entry: &IndexEntry) -> bool {
        if let Some(kind) = self.kind {
            if entry.kind != kind {
                return false;
            }
        }
        if self.extensions.is_empty() || entry.kind == EntryKind::Directory {
            return true;
        }
        entry
            .extension
            .as_ref()
            .is_some_and(|ext| self.extensions.iter().any(|wanted| wanted == ext))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub path: String,
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    pub modified_at: DateTime<Utc>,
    pub extension: Option<String>,
    pub parent_path: String,
    pub score: u32,
}

impl SearchHit {
    fn from_entry(entry: &IndexEntry, score: u32) -> Self {
        Self {
            path: entry.path.clone(),
            name: entry.name.clone(),
            kind: entry.kind,
            size: entry.size,
            modified_at: entry.modified_at,
            extension: entry.extension.clone(),
            parent_path: entry.parent_path.clone(),
            score,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchResults {
    pub hits: Vec<SearchHit>,
    /// Matches before pagination
    pub total: usize,
    pub elapsed_ms: f64,
}

/// A query prepared once and scored against every entry
struct Query {
    text: String,
    tokens: Vec<String>,
}

impl Query {
    fn parse(raw: &str) -> Option<Self> {
        let text = raw.trim().to_lowercase();
        if text.is_empty() {
            return None;
        }
        Some(Self {
            tokens: tokenize(&text),
            text,
        })
    }
}

/// Stateless scorer over a resident [`ShareIndex`].
///
/// Search never suspends: the caller hands in a snapshot and gets ranked hits
/// back, so a concurrent rebuild cannot be observed half-way.
#[derive(Debug, Default, Clone, Copy)]
pub struct SearchEngine;

impl SearchEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn search(&self, index: &ShareIndex, query: &str, options: &SearchOptions) -> SearchResults {
        let start = Instant::now();
        let Some(query) = Query::parse(query) else {
            return SearchResults::default();
        };

        // Parallel scoring; enumerate keeps index order for stable tie-breaks
        let by_name = options.sort_by == SortBy::Name;
        let mut scored: Vec<Ranked> = index
            .entries
            .par_iter()
            .enumerate()
            .filter(|(_, entry)| options.accepts(entry))
            .filter_map(|(i, entry)| {
                let score = score_entry(entry, &query.text, &query.tokens);
                (score > 0).then(|| Ranked {
                    position: i,
                    score,
                    name_key: by_name.then(|| entry.name.to_lowercase()),
                })
            })
            .collect();

        let order = options.sort_order.unwrap_or_else(|| options.sort_by.default_order());
        let entries = &index.entries;
        scored.sort_by(|a, b| {
            let ordering = compare(options.sort_by, entries, a, b);
            match order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            }
        });

        let total = scored.len();
        let hits = scored
            .into_iter()
            .skip(options.offset)
            .take(options.effective_limit())
            .map(|r| SearchHit::from_entry(&entries[r.position], r.score))
            .collect();

        SearchResults {
            hits,
            total,
            elapsed_ms: start.elapsed().as_secs_f64() * 1000.0,
        }
    }
}

/// A matching entry waiting to be sorted
struct Ranked {
    position: usize,
    score: u32,
    /// Lowercased name, only computed for name sorts
    name_key: Option<String>,
}

fn compare(sort_by: SortBy, entries: &[IndexEntry], a: &Ranked, b: &Ranked) -> Ordering {
    let (ea, eb) = (&entries[a.position], &entries[b.position]);
    match sort_by {
        SortBy::Relevance => a.score.cmp(&b.score),
        SortBy::Name => a.name_key.cmp(&b.name_key),
        SortBy::Size => ea.size.cmp(&eb.size),
        SortBy::ModifiedAt => ea.modified_at.cmp(&eb.modified_at),
    }
}

/// Additive relevance of one entry for a lowercased query and its tokens.
pub fn score_entry(entry: &IndexEntry, query: &str, query_tokens: &[String]) -> u32 {
    let name = entry.name.to_lowercase();
    let mut score = if name == query {
        SCORE_EXACT
    } else if name.starts_with(query) {
        SCORE_PREFIX
    } else if name.contains(query) {
        SCORE_SUBSTRING
    } else {
        0
    };

    score += SCORE_TOKEN
        * query_tokens
            .iter()
            .filter(|t| entry.search_tokens.contains(t))
            .count() as u32;

    if entry.parent_path.to_lowercase().contains(query) {
        score += SCORE_PARENT;
    }

    if score > 0 && entry.is_file() {
        score += SCORE_FILE;
    }
    score
}
