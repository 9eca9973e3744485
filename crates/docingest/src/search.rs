//! Ranked document search: FTS5 full-text matches, case-insensitive
//! substring matches and a trigram word-similarity fallback for typos.
//!
//! Each document keeps the best score any of the three passes gave it.
//! Scores are tiered so full-text hits outrank substring hits, which
//! outrank fuzzy hits:
//!
//! | match      | score                         |
//! |------------|-------------------------------|
//! | full text  | 0.6 + 0.4 · r / (1 + r)       |
//! | substring  | 0.5                           |
//! | fuzzy      | 0.5 · similarity              |
//!
//! where `r = -bm25` (FTS5 reports better matches as more negative).
//!
//! Each pass takes the connection lock on its own, so workers can store
//! documents between passes. The fuzzy pass never reads every document:
//! it scores the index vocabulary first and loads only documents holding
//! a close enough term, scoring them after the lock is released.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::DeclaredType;
use crate::db::document_repo::{self, Document, DocumentId};
use crate::db::{Database, DatabaseError};

static WORD_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\w+").expect("valid regex"));

const SNIPPET_CONTEXT_CHARS: usize = 60;
const SUBSTRING_SCORE: f64 = 0.5;
const FULL_TEXT_FLOOR: f64 = 0.6;
/// Closest vocabulary terms kept per fuzzy query.
const FUZZY_TERM_LIMIT: usize = 200;
/// Documents scored per fuzzy query.
const FUZZY_CANDIDATE_LIMIT: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub term: String,
    pub limit: usize,
    pub offset: usize,
}

impl SearchQuery {
    pub fn new(term: impl Into<String>, limit: usize, offset: usize) -> Self {
        Self {
            term: term.into(),
            limit,
            offset,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    /// No term was given; the newest documents are listed.
    Latest,
    FullText,
    Substring,
    Fuzzy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub id: DocumentId,
    pub filename: String,
    pub source_path: String,
    pub declared_type: DeclaredType,
    pub snippet: String,
    pub score: f64,
    pub match_kind: MatchKind,
    pub created_at: DateTime<Utc>,
}

impl SearchHit {
    fn new(doc: &Document, snippet: String, score: f64, match_kind: MatchKind) -> Self {
        Self {
            id: doc.id,
            filename: doc.filename.clone(),
            source_path: doc.source_path.clone(),
            declared_type: doc.declared_type,
            snippet,
            score,
            match_kind,
            created_at: doc.created_at,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResults {
    pub hits: Vec<SearchHit>,
    /// Matches before pagination.
    pub total: u64,
}

/// Runs a query against the documents tables.
pub fn run(
    db: &Database,
    query: &SearchQuery,
    similarity_threshold: f64,
) -> Result<SearchResults, DatabaseError> {
    let term = query.term.trim();
    if term.is_empty() {
        let (docs, total) = db.with_conn(|conn| document_repo::latest(conn, query.limit, query.offset))?;
        let hits = docs
            .iter()
            .map(|doc| SearchHit::new(doc, leading_snippet(&doc.content), 0.0, MatchKind::Latest))
            .collect();
        return Ok(SearchResults { hits, total });
    }

    let tokens = tokenize(term);
    let mut best: HashMap<DocumentId, SearchHit> = HashMap::new();

    if let Some(expr) = fts_match_expression(&tokens) {
        for row in db.with_conn(|conn| document_repo::fts_search(conn, &expr))? {
            let score = full_text_score(row.rank);
            keep_best(
                &mut best,
                SearchHit::new(&row.document, row.snippet, score, MatchKind::FullText),
            );
        }
    }

    for doc in db.with_conn(|conn| document_repo::substring_search(conn, term))? {
        let snippet = substring_snippet(&doc, term);
        keep_best(
            &mut best,
            SearchHit::new(&doc, snippet, SUBSTRING_SCORE, MatchKind::Substring),
        );
    }

    for doc in fuzzy_candidates(db, &tokens, similarity_threshold)? {
        if best.contains_key(&doc.id) {
            continue;
        }
        if let Some(fuzzy) = fuzzy_match(&tokens, &doc) {
            if fuzzy.similarity >= similarity_threshold {
                keep_best(
                    &mut best,
                    SearchHit::new(
                        &doc,
                        fuzzy.snippet,
                        SUBSTRING_SCORE * fuzzy.similarity,
                        MatchKind::Fuzzy,
                    ),
                );
            }
        }
    }

    let mut hits: Vec<SearchHit> = best.into_values().collect();
    hits.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| b.created_at.cmp(&a.created_at))
            .then_with(|| b.id.cmp(&a.id))
    });

    let total = hits.len() as u64;
    let hits = hits
        .into_iter()
        .skip(query.offset)
        .take(query.limit)
        .collect();
    Ok(SearchResults { hits, total })
}

/// Documents that can reach `threshold` in [`fuzzy_match`].
///
/// A document's similarity is a mean over tokens, so it can only reach the
/// threshold if some token is at least that close to one of its words.
/// Those words are found in the index vocabulary; only documents holding
/// one of them are loaded.
fn fuzzy_candidates(
    db: &Database,
    tokens: &[String],
    threshold: f64,
) -> Result<Vec<Document>, DatabaseError> {
    let Some((min_chars, max_chars)) = term_length_range(tokens, threshold) else {
        return Ok(Vec::new());
    };
    let vocabulary = db.with_conn(|conn| document_repo::vocabulary(conn, min_chars, max_chars))?;
    let terms = similar_terms(tokens, &vocabulary, threshold);
    if terms.is_empty() {
        return Ok(Vec::new());
    }
    db.with_conn(|conn| document_repo::containing_any(conn, &terms, FUZZY_CANDIDATE_LIMIT))
}

/// Character lengths a word can have and still be `threshold`-similar to
/// some token. A padded word of `n` characters has at most `n + 2`
/// trigrams, and the Jaccard index of two sets is at most the ratio of
/// their sizes.
fn term_length_range(tokens: &[String], threshold: f64) -> Option<(usize, usize)> {
    let threshold = threshold.clamp(f64::EPSILON, 1.0);
    tokens
        .iter()
        .map(|token| {
            let padded = token.chars().count() as f64 + 2.0;
            let min = (threshold * padded - 2.0).floor().max(1.0) as usize;
            let max = (padded / threshold - 2.0).ceil().min(u16::MAX as f64) as usize;
            (min, max)
        })
        .reduce(|(lo, hi), (min, max)| (lo.min(min), hi.max(max)))
}

/// Vocabulary terms at least `threshold`-similar to some token, closest
/// first, at most [`FUZZY_TERM_LIMIT`].
fn similar_terms(tokens: &[String], vocabulary: &[String], threshold: f64) -> Vec<String> {
    let token_trigrams: Vec<_> = tokens.iter().map(|t| trigrams(t)).collect();
    let mut scored: Vec<(f64, &String)> = vocabulary
        .iter()
        .filter_map(|term| {
            let term_trigrams = trigrams(term);
            let closest = token_trigrams
                .iter()
                .map(|t| jaccard(t, &term_trigrams))
                .fold(0.0, f64::max);
            (closest >= threshold).then_some((closest, term))
        })
        .collect();
    scored.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(b.1)));
    scored
        .into_iter()
        .take(FUZZY_TERM_LIMIT)
        .map(|(_, term)| term.clone())
        .collect()
}

fn keep_best(best: &mut HashMap<DocumentId, SearchHit>, hit: SearchHit) {
    match best.get(&hit.id) {
        Some(existing) if existing.score >= hit.score => {}
        _ => {
            best.insert(hit.id, hit);
        }
    }
}

/// Lowercased word tokens of a query, deduplicated in order.
fn tokenize(term: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    WORD_RE
        .find_iter(term)
        .map(|m| m.as_str().to_lowercase())
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

/// An FTS5 expression requiring every token. Tokens are quoted so query
/// syntax (`AND`, `NEAR`, `*`, column filters) is matched literally.
fn fts_match_expression(tokens: &[String]) -> Option<String> {
    if tokens.is_empty() {
        return None;
    }
    Some(
        tokens
            .iter()
            .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
            .collect::<Vec<_>>()
            .join(" "),
    )
}

fn full_text_score(bm25: f64) -> f64 {
    let relevance = (-bm25).max(0.0);
    FULL_TEXT_FLOOR + (1.0 - FULL_TEXT_FLOOR) * relevance / (1.0 + relevance)
}

/// Trigrams of a word padded the way pg_trgm does: two spaces before, one
/// after.
fn trigrams(word: &str) -> HashSet<[char; 3]> {
    let padded: Vec<char> = format!("  {} ", word.to_lowercase()).chars().collect();
    padded.windows(3).map(|w| [w[0], w[1], w[2]]).collect()
}

struct FuzzyMatch {
    similarity: f64,
    snippet: String,
}

/// Mean over query tokens of each token's best similarity to any word of
/// the document, with a snippet around the best-matching content word.
fn fuzzy_match(tokens: &[String], doc: &Document) -> Option<FuzzyMatch> {
    let mut words: HashMap<String, (usize, usize)> = HashMap::new();
    for m in WORD_RE.find_iter(&doc.content) {
        words
            .entry(m.as_str().to_lowercase())
            .or_insert((m.start(), m.end()));
    }
    let filename_words: Vec<String> = WORD_RE
        .find_iter(&doc.filename)
        .map(|m| m.as_str().to_lowercase())
        .collect();
    if words.is_empty() && filename_words.is_empty() {
        return None;
    }

    let mut total = 0.0;
    let mut anchor: Option<(f64, usize, usize)> = None;
    for token in tokens {
        let token_trigrams = trigrams(token);
        let mut best = 0.0f64;
        for (word, &(start, end)) in &words {
            let sim = jaccard(&token_trigrams, &trigrams(word));
            if sim > best {
                best = sim;
            }
            if anchor.map_or(true, |(s, _, _)| sim > s) {
                anchor = Some((sim, start, end));
            }
        }
        for word in &filename_words {
            best = best.max(jaccard(&token_trigrams, &trigrams(word)));
        }
        total += best;
    }

    let snippet = match anchor {
        Some((_, start, end)) => snippet_around(&doc.content, start, end),
        None => doc.filename.clone(),
    };
    Some(FuzzyMatch {
        similarity: total / tokens.len() as f64,
        snippet,
    })
}

/// Jaccard similarity of two trigram sets, in [0, 1].
fn jaccard(a: &HashSet<[char; 3]>, b: &HashSet<[char; 3]>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        0.0
    } else {
        a.intersection(b).count() as f64 / union as f64
    }
}

fn substring_snippet(doc: &Document, term: &str) -> String {
    let lower = doc.content.to_lowercase();
    // Lowercasing can change byte lengths outside ASCII; only trust the
    // offset when it maps one to one.
    match lower.find(&term.to_lowercase()) {
        Some(start) if lower.len() == doc.content.len() => {
            snippet_around(&doc.content, start, start + term.len())
        }
        _ => leading_snippet(&doc.content),
    }
}

/// A window of text around `[start, end)` with the match in brackets.
fn snippet_around(text: &str, start: usize, end: usize) -> String {
    if start > end || end > text.len() || !text.is_char_boundary(start) || !text.is_char_boundary(end)
    {
        return leading_snippet(text);
    }

    let before_start = text[..start]
        .char_indices()
        .rev()
        .nth(SNIPPET_CONTEXT_CHARS - 1)
        .map_or(0, |(i, _)| i);
    let after_end = text[end..]
        .char_indices()
        .nth(SNIPPET_CONTEXT_CHARS)
        .map_or(text.len(), |(i, _)| end + i);

    let mut snippet = String::new();
    if before_start > 0 {
        snippet.push('…');
    }
    snippet.push_str(&text[before_start..start]);
    snippet.push('[');
    snippet.push_str(&text[start..end]);
    snippet.push(']');
    snippet.push_str(&text[end..after_end]);
    if after_end < text.len() {
        snippet.push('…');
    }
    collapse_whitespace(&snippet)
}

fn leading_snippet(text: &str) -> String {
    let cut = text
        .char_indices()
        .nth(SNIPPET_CONTEXT_CHARS * 2)
        .map_or(text.len(), |(i, _)| i);
    let mut snippet = collapse_whitespace(&text[..cut]);
    if cut < text.len() {
        snippet.push('…');
    }
    snippet
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{document_repo, Database, NewDocument};

    fn seed(db: &Database, docs: &[(&str, &str)]) {
        for (name, content) in docs {
            document_repo::upsert(
                db,
                &NewDocument::indexed(format!("/docs/{}", name), *name, DeclaredType::Pdf, *content),
            )
            .unwrap();
        }
    }

    fn search(db: &Database, term: &str) -> SearchResults {
        run(db, &SearchQuery::new(term, 10, 0), 0.3).unwrap()
    }

    fn similarity(a: &str, b: &str) -> f64 {
        jaccard(&trigrams(a), &trigrams(b))
    }

    #[test]
    fn test_tokenize_dedupes_and_lowercases() {
        assert_eq!(tokenize("Invoice, invoice 2024!"), vec!["invoice", "2024"]);
        assert!(tokenize("?!").is_empty());
    }

    #[test]
    fn test_fts_expression_quotes_tokens() {
        let tokens = vec!["near".to_string(), "tax".to_string()];
        assert_eq!(
            fts_match_expression(&tokens).as_deref(),
            Some("\"near\" \"tax\"")
        );
        assert_eq!(fts_match_expression(&[]), None);
    }

    #[test]
    fn test_similarity() {
        assert_eq!(similarity("invoice", "invoice"), 1.0);
        assert!(similarity("invoice", "invoise") > 0.3);
        assert!(similarity("invoice", "banana") < 0.1);
        assert_eq!(trigrams("ab").len(), 3);
    }

    #[test]
    fn test_term_length_range_bounds_similarity() {
        let tokens = vec!["invoice".to_string()];
        let (min, max) = term_length_range(&tokens, 0.3).unwrap();
        assert_eq!(min, 1);
        assert!((28..=29).contains(&max));
        assert_eq!(term_length_range(&tokens, 1.0), Some((7, 7)));
        assert_eq!(term_length_range(&[], 0.3), None);
    }

    #[test]
    fn test_similar_terms_keeps_close_words_closest_first() {
        let tokens = vec!["invoice".to_string()];
        let vocabulary: Vec<String> = ["banana", "invoices", "invoise", "invoice"]
            .iter()
            .map(|t| t.to_string())
            .collect();
        assert_eq!(
            similar_terms(&tokens, &vocabulary, 0.3),
            vec!["invoice", "invoices", "invoise"]
        );
        assert!(similar_terms(&tokens, &vocabulary, 1.0) == vec!["invoice"]);
    }

    #[test]
    fn test_fuzzy_matches_filename_words() {
        let db = Database::open_in_memory().unwrap();
        seed(&db, &[("Quarterly Report.pdf", "figures only")]);
        let results = search(&db, "quartely");
        assert_eq!(results.total, 1);
        assert_eq!(results.hits[0].match_kind, MatchKind::Fuzzy);
    }

    #[test]
    fn test_full_text_scores_stay_in_tier() {
        assert!(full_text_score(-0.000001) >= FULL_TEXT_FLOOR);
        assert!(full_text_score(-25.0) < 1.0);
        assert!(full_text_score(-5.0) > full_text_score(-1.0));
    }

    #[test]
    fn test_snippet_around_brackets_match() {
        let text = "alpha beta gamma";
        assert_eq!(snippet_around(text, 6, 10), "alpha [beta] gamma");

        let long = format!("{} needle {}", "x ".repeat(100), "y ".repeat(100));
        let start = long.find("needle").unwrap();
        let snippet = snippet_around(&long, start, start + 6);
        assert!(snippet.starts_with('…'));
        assert!(snippet.ends_with('…'));
        assert!(snippet.contains("[needle]"));
    }

    #[test]
    fn test_empty_term_lists_latest() {
        let db = Database::open_in_memory().unwrap();
        seed(&db, &[("a.pdf", "first"), ("b.pdf", "second")]);
        let results = search(&db, "   ");
        assert_eq!(results.total, 2);
        assert!(results.hits.iter().all(|h| h.match_kind == MatchKind::Latest));
    }

    #[test]
    fn test_full_text_outranks_fuzzy() {
        let db = Database::open_in_memory().unwrap();
        seed(
            &db,
            &[
                ("exact.pdf", "the quarterly invoice from ACME"),
                ("typo.pdf", "an invoise with a typo"),
                ("other.pdf", "nothing relevant here"),
            ],
        );

        let results = search(&db, "invoice");
        assert_eq!(results.total, 2);
        assert_eq!(results.hits[0].filename, "exact.pdf");
        assert_eq!(results.hits[0].match_kind, MatchKind::FullText);
        assert!(results.hits[0].snippet.contains("[invoice]"));
        assert_eq!(results.hits[1].filename, "typo.pdf");
        assert_eq!(results.hits[1].match_kind, MatchKind::Fuzzy);
        assert!(results.hits[1].snippet.contains("[invoise]"));
    }

    #[test]
    fn test_substring_matches_inside_words() {
        let db = Database::open_in_memory().unwrap();
        seed(&db, &[("a.pdf", "Reimbursement request")]);
        let results = search(&db, "BURSE");
        assert_eq!(results.total, 1);
        assert_eq!(results.hits[0].match_kind, MatchKind::Substring);
    }

    #[test]
    fn test_failed_documents_are_hidden() {
        let db = Database::open_in_memory().unwrap();
        document_repo::upsert(
            &db,
            &NewDocument::failed("/docs/bad.pdf", "invoice.pdf", DeclaredType::Pdf, "corrupt"),
        )
        .unwrap();
        assert_eq!(search(&db, "invoice").total, 0);
    }

    #[test]
    fn test_pagination_reports_total() {
        let db = Database::open_in_memory().unwrap();
        seed(
            &db,
            &[("1.pdf", "tax form"), ("2.pdf", "tax return"), ("3.pdf", "tax refund")],
        );
        let page = run(&db, &SearchQuery::new("tax", 2, 2), 0.3).unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.hits.len(), 1);
    }
}
