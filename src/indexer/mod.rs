pub mod topics;

use crate::core::config::{keyword_fields, FieldType, KeywordField, Settings};
use crate::embeddings::late_interaction::LateInteraction;
use crate::embeddings::{normalize_embedding, vector_to_bytes, EmbeddingProvider};
use crate::etl::{parse_html, ParsedDocument};
use crate::monitoring::{log_event, Metrics};
use crate::storage::{read_text, PageArchive};
use crate::store::{hash_str, StoreClient};
use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// The per-document hash materialized for the text+vector index.
#[derive(Debug, Clone)]
pub struct IndexRecord {
    pub doc_id: String,
    pub title: String,
    pub content: String,
    pub topics: Vec<String>,
    pub source: String,
    pub company: String,
    pub authors: Vec<String>,
    pub published_at: Option<String>,
    pub url: String,
    pub lang: Option<String>,
    pub embedding: Option<Vec<u8>>,
}

fn schema_for_field(field: &KeywordField) -> Vec<String> {
    let mut parts = vec![field.name.to_string(), field.field_type.as_str().to_string()];
    match field.field_type {
        FieldType::Text => {
            if let Some(weight) = field.weight {
                parts.push("WEIGHT".to_string());
                parts.push(weight.to_string());
            }
            if field.nostem {
                parts.push("NOSTEM".to_string());
            }
            if let Some(phonetic) = field.phonetic {
                parts.push("PHONETIC".to_string());
                parts.push(phonetic.to_string());
            }
        }
        FieldType::Tag => {
            parts.push("SEPARATOR".to_string());
            parts.push(",".to_string());
        }
        FieldType::Numeric => {}
    }
    parts
}

/// Full schema: the keyword fields, the document fields not already covered
/// by them, and (unless keyword-only or late-interaction) the HNSW vector.
fn build_schema(settings: &Settings) -> Vec<String> {
    let fields = keyword_fields();
    let keyword_names: Vec<&str> = fields.iter().map(|f| f.name).collect();
    let mut schema = Vec::new();
    for field in &fields {
        schema.extend(schema_for_field(field));
    }
    for (name, field_type) in [
        ("topics", FieldType::Tag),
        ("source", FieldType::Tag),
        ("company", FieldType::Tag),
        ("authors", FieldType::Tag),
        ("published_at", FieldType::Text),
        ("url", FieldType::Text),
        ("lang", FieldType::Tag),
    ] {
        if keyword_names.contains(&name) {
            continue;
        }
        schema.extend(schema_for_field(&KeywordField {
            name,
            field_type,
            weight: None,
            nostem: false,
            phonetic: None,
        }));
    }
    if !settings.keyword_only && !settings.late_interaction() {
        schema.extend(
            [
                "embedding",
                "VECTOR",
                "HNSW",
                "6",
                "TYPE",
                "FLOAT32",
                "DIM",
            ]
            .into_iter()
            .map(str::to_string),
        );
        schema.push(settings.embeddings_dim.to_string());
        schema.push("DISTANCE_METRIC".to_string());
        schema.push("COSINE".to_string());
    }
    schema
}

/// Idempotently create the secondary index over the document keyspace.
pub async fn create_search_index(store: &StoreClient, settings: &Settings) -> Result<()> {
    log_event(
        settings.crawl_log,
        "init-index",
        &[
            ("index", settings.index_name.clone()),
            ("dim", settings.embeddings_dim.to_string()),
        ],
    );
    let schema = build_schema(settings);
    match store
        .ft_create(&settings.index_name, &settings.doc_key_prefix, &schema)
        .await
    {
        Ok(()) => {
            log_event(
                settings.crawl_log,
                "ready",
                &[("index", settings.index_name.clone())],
            );
            Ok(())
        }
        Err(err) if err.to_string().contains("Index already exists") => {
            log_event(
                settings.crawl_log,
                "ready",
                &[
                    ("index", settings.index_name.clone()),
                    ("status", "exists".to_string()),
                ],
            );
            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// Drains `raw:queue`, turning archived fetches into index records.
pub struct Indexer {
    settings: Arc<Settings>,
    store: StoreClient,
    archive: Arc<PageArchive>,
    provider: Option<EmbeddingProvider>,
    late: Option<Box<dyn LateInteraction>>,
    metrics: Arc<Metrics>,
}

impl Indexer {
    pub fn new(
        settings: Arc<Settings>,
        store: StoreClient,
        archive: Arc<PageArchive>,
        provider: Option<EmbeddingProvider>,
        late: Option<Box<dyn LateInteraction>>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            settings,
            store,
            archive,
            provider,
            late,
            metrics,
        }
    }

    fn log(&self, event: &str, fields: &[(&str, String)]) {
        log_event(self.settings.crawl_log, event, fields);
    }

    fn doc_key(&self, doc_id: &str) -> String {
        format!("{}{}", self.settings.doc_key_prefix, doc_id)
    }

    /// Upsert one parsed document into the index keyspace. Re-indexing the
    /// same URL preserves previously enriched fields the new payload leaves
    /// empty, so a thin re-crawl never erases data.
    pub async fn index_document(&self, doc: &ParsedDocument, source: &str) -> Result<()> {
        self.log(
            "index",
            &[
                ("url", doc.url.clone()),
                ("title", doc.title.clone()),
                ("source", source.to_string()),
            ],
        );

        let mut embedding_bytes: Option<Vec<u8>> = None;
        if !self.settings.keyword_only {
            let passage = format!("{}\n{}", doc.title, doc.content);
            if let Some(late) = &self.late {
                late.add_documents(&[doc.url.clone()], &[passage])
                    .await
                    .map_err(|e| anyhow!(e))?;
            } else if let Some(provider) = &self.provider {
                let embedded = provider.embed(&passage).await?;
                let vector = normalize_embedding(embedded.vector, self.settings.embeddings_dim)?;
                embedding_bytes = Some(vector_to_bytes(&vector));
            }
        }

        let record = IndexRecord {
            doc_id: doc.url.clone(),
            title: doc.title.clone(),
            content: doc.content.clone(),
            topics: topics::extract_topics(&doc.content),
            source: source.to_string(),
            company: doc.company.clone(),
            authors: doc.authors.clone(),
            published_at: doc.published_at.clone(),
            url: doc.canonical_url.clone().unwrap_or_else(|| doc.url.clone()),
            lang: doc.language.clone(),
            embedding: embedding_bytes,
        };

        let mut mapping: Vec<(String, String)> = vec![
            ("doc_id".to_string(), record.doc_id.clone()),
            ("title".to_string(), record.title.clone()),
            ("content".to_string(), record.content.clone()),
            ("topics".to_string(), record.topics.join(",")),
            ("source".to_string(), record.source.clone()),
            ("company".to_string(), record.company.clone()),
            ("authors".to_string(), record.authors.join(",")),
            (
                "published_at".to_string(),
                record.published_at.clone().unwrap_or_default(),
            ),
            ("url".to_string(), record.url.clone()),
            ("lang".to_string(), record.lang.clone().unwrap_or_default()),
        ];

        // Last-writer-wins is fine for racing indexers because this merge
        // never lets an empty field overwrite a populated one. The merge
        // covers the keyword schema (for out-of-band writers) and every
        // document field this indexer emits.
        let mut merge_names: Vec<String> =
            keyword_fields().iter().map(|f| f.name.to_string()).collect();
        for (name, _) in &mapping {
            if name != "doc_id" && !merge_names.contains(name) {
                merge_names.push(name.clone());
            }
        }
        let merge_refs: Vec<&str> = merge_names.iter().map(String::as_str).collect();
        let existing = self
            .store
            .hmget(&self.doc_key(&record.doc_id), &merge_refs)
            .await?;
        for (name, previous) in merge_names.iter().zip(existing) {
            let Some(previous) = previous else { continue };
            let Ok(previous) = String::from_utf8(previous) else {
                continue;
            };
            if previous.is_empty() {
                continue;
            }
            if let Some(pos) = mapping.iter().position(|(field, _)| field == name) {
                if mapping[pos].1.is_empty() {
                    mapping[pos].1 = previous;
                }
            } else {
                mapping.push((name.clone(), previous));
            }
        }

        let mut fields: Vec<(String, Vec<u8>)> = mapping
            .into_iter()
            .map(|(name, value)| (name, value.into_bytes()))
            .collect();
        if let Some(embedding) = &record.embedding {
            fields.push(("embedding".to_string(), embedding.clone()));
        }
        self.store
            .hset_map(&self.doc_key(&record.doc_id), &fields)
            .await?;
        self.metrics.record_index();
        Ok(())
    }

    /// Process one crawl-doc id off the queue. Returns false when the id had
    /// to be skipped (missing record or missing HTML).
    pub async fn process_doc_id(&self, raw_doc_id: &str) -> Result<bool> {
        let crawl_key = format!("{}{}", self.settings.crawl_doc_key_prefix, raw_doc_id);
        let meta = self.store.hgetall_raw(&crawl_key).await?;
        if meta.is_empty() {
            self.log(
                "skip",
                &[
                    ("doc_id", raw_doc_id.to_string()),
                    ("reason", "missing_meta".to_string()),
                ],
            );
            return Ok(false);
        }
        let url = hash_str(&meta, "url");
        let source = hash_str(&meta, "source");
        let raw_html = read_text(&hash_str(&meta, "raw_path")).await;
        let cleaned_html = read_text(&hash_str(&meta, "cleaned_path")).await;
        if url.is_empty() || (raw_html.is_empty() && cleaned_html.is_empty()) {
            self.log(
                "skip",
                &[
                    ("doc_id", raw_doc_id.to_string()),
                    ("url", url),
                    ("reason", "missing_html".to_string()),
                ],
            );
            return Ok(false);
        }

        let base_html = if raw_html.is_empty() {
            &cleaned_html
        } else {
            &raw_html
        };
        let mut parsed = parse_html(&url, base_html);
        if !cleaned_html.is_empty() {
            // The pre-cleaned variant yields tighter text; keep its content
            // but the raw page's richer metadata.
            parsed.content = parse_html(&url, &cleaned_html).content;
        }

        if self.archive.enabled() {
            if let Ok(doc_id) = raw_doc_id.parse::<i64>() {
                let payload = index_payload(&parsed, &meta, &source);
                let _ = self.archive.store_payload(doc_id, &payload).await;
                let _ = self.archive.store_clean_text(doc_id, &parsed.content).await;
            }
        }

        self.index_document(&parsed, &source).await?;
        Ok(true)
    }

    /// The drain loop. Multiple instances are safe — every pop is atomic.
    pub async fn run(&self) -> Result<()> {
        let mut idle_since: Option<Instant> = None;
        let mut last_idle_log: Option<Instant> = None;
        loop {
            let Some(raw_doc_id) = self.store.lpop(&self.settings.raw_queue_key).await? else {
                let now = Instant::now();
                let idle_start = *idle_since.get_or_insert(now);
                if last_idle_log.map_or(true, |t| now.duration_since(t).as_secs() > 10) {
                    self.log("idle", &[("queue", self.settings.raw_queue_key.clone())]);
                    last_idle_log = Some(now);
                }
                if self.settings.indexer_exit_on_idle
                    && now.duration_since(idle_start).as_secs_f64()
                        >= self.settings.indexer_idle_grace_s
                {
                    self.log(
                        "done",
                        &[
                            ("reason", "idle".to_string()),
                            ("queue", self.settings.raw_queue_key.clone()),
                            (
                                "idle_s",
                                format!("{:.1}", now.duration_since(idle_start).as_secs_f64()),
                            ),
                        ],
                    );
                    return Ok(());
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
                continue;
            };
            idle_since = None;
            self.process_doc_id(&raw_doc_id).await?;
        }
    }
}

/// The JSON side-channel blob mirroring what got indexed.
fn index_payload(
    parsed: &ParsedDocument,
    meta: &std::collections::HashMap<String, Vec<u8>>,
    source: &str,
) -> serde_json::Value {
    serde_json::json!({
        "doc_id": parsed.url,
        "url": parsed.url,
        "canonical_url": parsed.canonical_url,
        "title": parsed.title,
        "content": parsed.content,
        "authors": parsed.authors,
        "company": parsed.company,
        "published_at": parsed.published_at,
        "language": parsed.language,
        "source": source,
        "domain": hash_str(meta, "domain"),
        "depth": hash_str(meta, "depth"),
        "fetched_at": hash_str(meta, "fetched_at"),
        "status": hash_str(meta, "status"),
        "topics": topics::extract_topics(&parsed.content),
        "raw_key": hash_str(meta, "raw_path"),
        "clean_key": hash_str(meta, "cleaned_path"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_settings() -> Settings {
        let mut settings = Settings::from_env();
        settings.keyword_only = false;
        settings.embeddings_provider = "dummy".to_string();
        settings.embeddings_dim = 8;
        settings
    }

    #[test]
    fn schema_includes_vector_by_default() {
        let schema = build_schema(&test_settings());
        let joined = schema.join(" ");
        assert!(joined.contains("title TEXT WEIGHT 2"));
        assert!(joined.contains("topics TAG SEPARATOR ,"));
        assert!(joined.contains("instructor TEXT NOSTEM PHONETIC dm:en"));
        assert!(joined.contains("embedding VECTOR HNSW 6 TYPE FLOAT32 DIM 8 DISTANCE_METRIC COSINE"));
        // content is already a keyword field; it must not be emitted twice.
        assert_eq!(joined.matches("content TEXT").count(), 1);
    }

    #[test]
    fn schema_skips_vector_when_keyword_only() {
        let mut settings = test_settings();
        settings.keyword_only = true;
        let schema = build_schema(&settings);
        assert!(!schema.join(" ").contains("VECTOR"));
    }

    #[test]
    fn schema_skips_vector_for_late_interaction() {
        let mut settings = test_settings();
        settings.embeddings_provider = "pylate".to_string();
        let schema = build_schema(&settings);
        assert!(!schema.join(" ").contains("VECTOR"));
    }
}
