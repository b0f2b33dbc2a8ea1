use crate::core::config::Settings;
use crate::embeddings::late_interaction::{LateInteraction, LateInteractionError};
use crate::embeddings::{bytes_to_vector, normalize_embedding, vector_to_bytes, EmbeddingProvider};
use crate::monitoring::Metrics;
use crate::store::{hash_opt, hash_str, CommandArg, StoreClient};
use anyhow::{anyhow, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

const SNIPPET_LEN: usize = 200;

/// The only TEXT fields the ingest path populates; the rest of the keyword
/// schema exists for out-of-band writers and would only dilute the query.
const TEXT_QUERY_FIELDS: &str = "title|content";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Keyword,
    Hybrid,
    Semantic,
}

impl SearchMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "keyword" => Some(SearchMode::Keyword),
            "hybrid" => Some(SearchMode::Hybrid),
            "semantic" => Some(SearchMode::Semantic),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::Keyword => "keyword",
            SearchMode::Hybrid => "hybrid",
            SearchMode::Semantic => "semantic",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub doc_id: String,
    pub title: String,
    pub url: String,
    pub snippet: String,
    pub authors: Vec<String>,
    pub company: String,
    pub published_at: Option<String>,
    pub score: f64,
}

// ---------------------------------------------------------------------------
// Query rewriting
// ---------------------------------------------------------------------------

const QUERY_SPECIAL_CHARS: &str = "\\@{}[]()|<>\"'=:;!#$%^&*+-=~,.";

fn escape_query(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        if QUERY_SPECIAL_CHARS.contains(ch) {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

/// Typographic characters users paste from rendered pages; they are noise to
/// the lexical analyzer.
fn normalize_typography(text: &str) -> String {
    text.chars()
        .map(|ch| match ch {
            '\u{2010}' | '\u{2011}' | '\u{2012}' | '\u{2013}' | '\u{2014}' | '\u{2018}'
            | '\u{2019}' | '\u{201C}' | '\u{201D}' | '\u{2026}' => ' ',
            _ => ch,
        })
        .collect()
}

/// Prefix-aware lexical expression: the trailing token also matches as a
/// prefix so search-as-you-type works, e.g. `mach lea` becomes
/// `@title|content:(mach(lea|lea*))`. Returns None when nothing queryable
/// remains.
fn build_text_query(query: &str) -> Option<String> {
    let cleaned = normalize_typography(query.trim());
    let tokens: Vec<&str> = cleaned.split_whitespace().collect();
    let (last, base) = tokens.split_last()?;
    let base_expr = base
        .iter()
        .map(|tok| escape_query(tok))
        .collect::<Vec<_>>()
        .join(" ");
    let tail = if last.chars().count() >= 2 {
        let escaped = escape_query(last);
        format!("({escaped}|{escaped}*)")
    } else {
        String::new()
    };
    let combined = format!("{base_expr}{tail}");
    if combined.is_empty() {
        return None;
    }
    Some(format!("@{TEXT_QUERY_FIELDS}:({combined})"))
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f64 {
    if left.is_empty() || left.len() != right.len() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut left_norm = 0.0f64;
    let mut right_norm = 0.0f64;
    for (l, r) in left.iter().zip(right) {
        dot += (*l as f64) * (*r as f64);
        left_norm += (*l as f64) * (*l as f64);
        right_norm += (*r as f64) * (*r as f64);
    }
    let denom = left_norm.sqrt() * right_norm.sqrt();
    if denom == 0.0 {
        return 0.0;
    }
    dot / denom
}

/// Union of two candidate lists, first occurrence wins.
fn union_first_seen(first: Vec<String>, second: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for key in first.into_iter().chain(second) {
        if seen.insert(key.clone()) {
            out.push(key);
        }
    }
    out
}

fn make_snippet(content: &str, query: &str) -> String {
    if content.is_empty() {
        return String::new();
    }
    let normalized: String = content.split_whitespace().collect::<Vec<_>>().join(" ");
    let chars: Vec<char> = normalized.chars().collect();
    if query.is_empty() {
        return chars.iter().take(SNIPPET_LEN).collect();
    }
    let lower_content = normalized.to_lowercase();
    let lower_query = query.to_lowercase();
    let match_index = lower_content
        .find(&lower_query)
        .map(|byte_idx| lower_content[..byte_idx].chars().count());
    let Some(match_index) = match_index else {
        return chars.iter().take(SNIPPET_LEN).collect();
    };
    let start = match_index.saturating_sub(SNIPPET_LEN / 3);
    let end = (start + SNIPPET_LEN).min(chars.len());
    let mut snippet: String = chars[start..end].iter().collect();
    if start > 0 {
        snippet = format!("…{snippet}");
    }
    if end < chars.len() {
        snippet = format!("{snippet}…");
    }
    snippet
}

// ---------------------------------------------------------------------------
// Planner
// ---------------------------------------------------------------------------

type DocFields = HashMap<String, Vec<u8>>;

pub struct SearchPlanner {
    settings: Arc<Settings>,
    store: StoreClient,
    provider: Option<EmbeddingProvider>,
    late: Option<Box<dyn LateInteraction>>,
    metrics: Arc<Metrics>,
    doc_cache: Option<HashMap<String, DocFields>>,
}

impl SearchPlanner {
    pub fn new(
        settings: Arc<Settings>,
        store: StoreClient,
        provider: Option<EmbeddingProvider>,
        late: Option<Box<dyn LateInteraction>>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            settings,
            store,
            provider,
            late,
            metrics,
            doc_cache: None,
        }
    }

    /// Snapshot every document hash into process memory so hydration skips
    /// the store round-trip. Call once at startup; returns the corpus size.
    pub async fn load_doc_cache(&mut self) -> Result<usize> {
        let pattern = format!("{}*", self.settings.doc_key_prefix);
        let keys = self.store.scan_match(&pattern).await?;
        let mut cache = HashMap::with_capacity(keys.len());
        for chunk in keys.chunks(200) {
            let docs = self.store.hgetall_pipeline(chunk).await?;
            for (key, doc) in chunk.iter().zip(docs) {
                if !doc.is_empty() {
                    cache.insert(key.clone(), doc);
                }
            }
        }
        let size = cache.len();
        self.doc_cache = Some(cache);
        Ok(size)
    }

    fn debug(&self, message: String) {
        if self.settings.debug_search {
            info!("{message}");
        }
    }

    /// Execute one search. Returns the ranked results and the summed store
    /// round-trip time in milliseconds (also observed into the latency
    /// histogram).
    pub async fn search(
        &self,
        query: &str,
        mode: SearchMode,
        limit: usize,
    ) -> Result<(Vec<SearchResult>, f64)> {
        let query = query.trim();
        if query.is_empty() {
            return Ok((Vec::new(), 0.0));
        }
        let mode = if self.settings.keyword_only {
            SearchMode::Keyword
        } else {
            mode
        };
        self.debug(format!(
            "search request provider={} mode={} query={query:?} limit={limit}",
            self.settings.embeddings_provider,
            mode.as_str()
        ));

        if mode != SearchMode::Keyword {
            if let Some(late) = &self.late {
                return self.search_late_interaction(late.as_ref(), query, limit).await;
            }
        }

        let mut latency_ms = 0.0f64;
        let results = match mode {
            SearchMode::Keyword => self.search_keyword(query, limit, &mut latency_ms).await?,
            SearchMode::Semantic => self.search_semantic(query, limit, &mut latency_ms).await?,
            SearchMode::Hybrid => self.search_hybrid(query, limit, &mut latency_ms).await?,
        };
        self.metrics.observe_search_latency(latency_ms);
        Ok((results, latency_ms))
    }

    async fn timed_ft_search(
        &self,
        args: &[CommandArg],
        latency_ms: &mut f64,
    ) -> Result<redis::Value> {
        let start = Instant::now();
        let reply = self.store.ft_search(&self.settings.index_name, args).await?;
        *latency_ms += start.elapsed().as_secs_f64() * 1000.0;
        Ok(reply)
    }

    async fn search_keyword(
        &self,
        query: &str,
        limit: usize,
        latency_ms: &mut f64,
    ) -> Result<Vec<SearchResult>> {
        let Some(text_query) = build_text_query(query) else {
            return Ok(Vec::new());
        };
        self.debug(format!("search keyword query={text_query}"));
        let args = vec![
            CommandArg::text(text_query),
            CommandArg::text("LIMIT"),
            CommandArg::text("0"),
            CommandArg::text(limit.to_string()),
            CommandArg::text("RETURN"),
            CommandArg::text("0"),
            CommandArg::text("DIALECT"),
            CommandArg::text("2"),
        ];
        let reply = self.timed_ft_search(&args, latency_ms).await?;
        let doc_keys = doc_keys_from_reply(&reply);
        let docs = self.hydrate(&doc_keys).await?;
        Ok(docs
            .into_iter()
            .map(|(key, doc)| self.make_result(&key, &doc, query, 0.0))
            .collect())
    }

    async fn query_vector(&self, query: &str) -> Result<Vec<f32>> {
        let provider = self
            .provider
            .as_ref()
            .ok_or_else(|| anyhow!("no embedding provider configured"))?;
        let embedded = provider.embed(query).await?;
        let vector = normalize_embedding(embedded.vector, self.settings.embeddings_dim)?;
        Ok(vector)
    }

    fn knn_args(&self, k: usize, vector_bytes: Vec<u8>) -> Vec<CommandArg> {
        vec![
            CommandArg::text(format!("*=>[KNN {k} @embedding $vec AS vector_score]")),
            CommandArg::text("PARAMS"),
            CommandArg::text("2"),
            CommandArg::text("vec"),
            CommandArg::Blob(vector_bytes),
            CommandArg::text("SORTBY"),
            CommandArg::text("vector_score"),
            CommandArg::text("RETURN"),
            CommandArg::text("0"),
            CommandArg::text("DIALECT"),
            CommandArg::text("2"),
        ]
    }

    async fn search_semantic(
        &self,
        query: &str,
        limit: usize,
        latency_ms: &mut f64,
    ) -> Result<Vec<SearchResult>> {
        let query_vec = self.query_vector(query).await?;
        let args = self.knn_args(limit, vector_to_bytes(&query_vec));
        let reply = self.timed_ft_search(&args, latency_ms).await?;
        let doc_keys = doc_keys_from_reply(&reply);
        let docs = self.hydrate(&doc_keys).await?;

        // Scores are recomputed client-side so the ordering is stable across
        // vector-index implementations.
        let mut results: Vec<SearchResult> = docs
            .into_iter()
            .map(|(key, doc)| {
                let doc_vec = bytes_to_vector(doc.get("embedding").map(|v| v.as_slice()).unwrap_or(&[]));
                let score = cosine_similarity(&query_vec, &doc_vec);
                self.make_result(&key, &doc, query, score)
            })
            .collect();
        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        Ok(results)
    }

    async fn search_hybrid(
        &self,
        query: &str,
        limit: usize,
        latency_ms: &mut f64,
    ) -> Result<Vec<SearchResult>> {
        let query_vec = self.query_vector(query).await?;
        let candidate_limit = (limit * 5).max(limit);

        let bm25_keys = match build_text_query(query) {
            Some(text_query) => {
                let args = vec![
                    CommandArg::text(text_query),
                    CommandArg::text("LIMIT"),
                    CommandArg::text("0"),
                    CommandArg::text(candidate_limit.to_string()),
                    CommandArg::text("RETURN"),
                    CommandArg::text("0"),
                    CommandArg::text("DIALECT"),
                    CommandArg::text("2"),
                ];
                let reply = self.timed_ft_search(&args, latency_ms).await?;
                doc_keys_from_reply(&reply)
            }
            None => Vec::new(),
        };

        let knn_args = self.knn_args(candidate_limit, vector_to_bytes(&query_vec));
        let knn_reply = self.timed_ft_search(&knn_args, latency_ms).await?;
        let vector_keys = doc_keys_from_reply(&knn_reply);

        let doc_keys = union_first_seen(bm25_keys.clone(), vector_keys.clone());
        self.debug(format!(
            "search hybrid candidates bm25={} vector={} union={}",
            bm25_keys.len(),
            vector_keys.len(),
            doc_keys.len()
        ));
        if doc_keys.is_empty() {
            return Ok(Vec::new());
        }

        let docs = self.hydrate(&doc_keys).await?;
        let mut results = Vec::new();
        for (key, doc) in docs {
            let doc_vec = bytes_to_vector(doc.get("embedding").map(|v| v.as_slice()).unwrap_or(&[]));
            // Candidates without a usable embedding can't be ranked against
            // the query vector and drop out of the fused set.
            let Ok(doc_vec) = normalize_embedding(doc_vec, self.settings.embeddings_dim) else {
                continue;
            };
            let score = cosine_similarity(&query_vec, &doc_vec);
            results.push(self.make_result(&key, &doc, query, score));
        }
        // Stable sort keeps first-seen order on ties.
        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(limit);
        Ok(results)
    }

    async fn search_late_interaction(
        &self,
        late: &dyn LateInteraction,
        query: &str,
        limit: usize,
    ) -> Result<(Vec<SearchResult>, f64)> {
        let start = Instant::now();
        let hits = match late.retrieve(query, limit).await {
            Ok(hits) => hits,
            Err(LateInteractionError::EmptyIndex) => {
                self.debug("search late-interaction index empty".to_string());
                return Ok((Vec::new(), 0.0));
            }
            Err(err) => return Err(anyhow!(err)),
        };
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
        let mut results = Vec::new();
        for hit in hits {
            if hit.id.is_empty() {
                continue;
            }
            let key = format!("{}{}", self.settings.doc_key_prefix, hit.id);
            let doc = self.fetch_doc(&key).await?;
            let Some(doc) = doc else { continue };
            results.push(self.make_result(&key, &doc, query, hit.score));
        }
        self.debug(format!("search late-interaction results={}", results.len()));
        self.metrics.observe_search_latency(latency_ms);
        Ok((results, latency_ms))
    }

    async fn fetch_doc(&self, key: &str) -> Result<Option<DocFields>> {
        if let Some(cache) = &self.doc_cache {
            return Ok(cache.get(key).cloned());
        }
        let doc = self.store.hgetall_raw(key).await?;
        Ok(if doc.is_empty() { None } else { Some(doc) })
    }

    /// Hydrate candidate keys into field maps, preserving input order and
    /// dropping keys with no backing hash.
    async fn hydrate(&self, doc_keys: &[String]) -> Result<Vec<(String, DocFields)>> {
        if doc_keys.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(cache) = &self.doc_cache {
            return Ok(doc_keys
                .iter()
                .filter_map(|key| cache.get(key).map(|doc| (key.clone(), doc.clone())))
                .collect());
        }
        let docs = self.store.hgetall_pipeline(doc_keys).await?;
        Ok(doc_keys
            .iter()
            .zip(docs)
            .filter(|(_, doc)| !doc.is_empty())
            .map(|(key, doc)| (key.clone(), doc))
            .collect())
    }

    fn make_result(
        &self,
        doc_key: &str,
        doc: &DocFields,
        query: &str,
        score: f64,
    ) -> SearchResult {
        let authors = hash_str(doc, "authors")
            .split(',')
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .collect();
        SearchResult {
            doc_id: hash_opt(doc, "doc_id").unwrap_or_else(|| doc_key.to_string()),
            title: hash_str(doc, "title"),
            url: hash_str(doc, "url"),
            snippet: make_snippet(&hash_str(doc, "content"), query),
            authors,
            company: hash_str(doc, "company"),
            published_at: hash_opt(doc, "published_at"),
            score,
        }
    }
}

/// Keys out of a `RETURN 0` search reply: `[count, key, key, …]`.
fn doc_keys_from_reply(reply: &redis::Value) -> Vec<String> {
    let redis::Value::Array(items) = reply else {
        return Vec::new();
    };
    items
        .iter()
        .skip(1)
        .filter_map(|item| match item {
            redis::Value::BulkString(bytes) => String::from_utf8(bytes.clone()).ok(),
            redis::Value::SimpleString(text) => Some(text.clone()),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_query_builds_prefix_expression() {
        assert_eq!(
            build_text_query("mach lea").as_deref(),
            Some("@title|content:(mach(lea|lea*))")
        );
        assert_eq!(
            build_text_query("foo").as_deref(),
            Some("@title|content:((foo|foo*))")
        );
    }

    #[test]
    fn text_query_drops_single_char_tail() {
        assert_eq!(
            build_text_query("machine l").as_deref(),
            Some("@title|content:(machine)")
        );
        assert_eq!(build_text_query("l"), None);
        assert_eq!(build_text_query("   "), None);
    }

    #[test]
    fn text_query_escapes_specials_and_typography() {
        let expr = build_text_query("c++ redis").unwrap();
        assert!(expr.contains(r"c\+\+"));
        // Unicode dashes collapse to whitespace before tokenizing.
        assert_eq!(
            build_text_query("rate\u{2014}limit").as_deref(),
            Some("@title|content:(rate(limit|limit*))")
        );
    }

    #[test]
    fn escape_covers_the_query_specials() {
        assert_eq!(escape_query("a@b"), r"a\@b");
        assert_eq!(escape_query("x-y.z"), r"x\-y\.z");
        assert_eq!(escape_query("plain"), "plain");
    }

    #[test]
    fn cosine_similarity_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-9);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-9);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn union_preserves_first_seen_order() {
        let fused = union_first_seen(
            vec!["doc:a".into(), "doc:b".into()],
            vec!["doc:b".into(), "doc:c".into(), "doc:a".into()],
        );
        assert_eq!(fused, vec!["doc:a", "doc:b", "doc:c"]);
    }

    #[test]
    fn snippet_windows_around_the_match() {
        let content = format!("{} machine learning pipelines {}", "x".repeat(300), "y".repeat(300));
        let snippet = make_snippet(&content, "machine learning");
        assert!(snippet.starts_with('…'));
        assert!(snippet.ends_with('…'));
        assert!(snippet.contains("machine learning"));
        // 200-char window plus the two ellipses.
        assert_eq!(snippet.chars().count(), SNIPPET_LEN + 2);
    }

    #[test]
    fn snippet_falls_back_to_prefix() {
        let content = "short content without the term";
        assert_eq!(make_snippet(content, "absent"), content);
        let long = "z".repeat(400);
        assert_eq!(make_snippet(&long, "absent").chars().count(), SNIPPET_LEN);
        assert_eq!(make_snippet("", "anything"), "");
    }

    #[test]
    fn snippet_match_is_case_insensitive() {
        let snippet = make_snippet("Deploying Kubernetes at scale", "KUBERNETES");
        assert!(snippet.contains("Kubernetes"));
        assert!(!snippet.starts_with('…'));
    }

    #[test]
    fn reply_decoding_skips_count_and_non_strings() {
        let reply = redis::Value::Array(vec![
            redis::Value::Int(2),
            redis::Value::BulkString(b"doc:https://a".to_vec()),
            redis::Value::BulkString(b"doc:https://b".to_vec()),
        ]);
        assert_eq!(
            doc_keys_from_reply(&reply),
            vec!["doc:https://a", "doc:https://b"]
        );
        assert!(doc_keys_from_reply(&redis::Value::Nil).is_empty());
    }

    // Known-geometry ranking check: candidates admitted by either leg are
    // re-ranked purely by cosine against the query vector.
    #[test]
    fn hybrid_ranking_is_cosine_descending() {
        let q = vec![1.0f32, 0.0, 0.0];
        let v1 = vec![0.8f32, 0.6, 0.0];
        let v2 = vec![1.0f32, 0.1, 0.0];
        let v3 = vec![0.1f32, 1.0, 0.0];
        let mut scored: Vec<(&str, f64)> = vec![
            ("v1", cosine_similarity(&q, &v1)),
            ("v3", cosine_similarity(&q, &v3)),
            ("v2", cosine_similarity(&q, &v2)),
        ];
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
        let order: Vec<&str> = scored.iter().map(|(k, _)| *k).collect();
        assert_eq!(order, vec!["v2", "v1", "v3"]);
    }
}
