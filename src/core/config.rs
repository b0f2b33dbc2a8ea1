use std::env;

// ---------------------------------------------------------------------------
// Settings — one-shot environment snapshot taken at process start
// ---------------------------------------------------------------------------

fn env_str(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(v) => matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "y" | "on"
        ),
        Err(_) => default,
    }
}

/// Field kinds accepted by the secondary-index schema builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Text,
    Tag,
    Numeric,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Text => "TEXT",
            FieldType::Tag => "TAG",
            FieldType::Numeric => "NUMERIC",
        }
    }
}

/// One attribute in the keyword half of the search-index schema.
#[derive(Debug, Clone)]
pub struct KeywordField {
    pub name: &'static str,
    pub field_type: FieldType,
    pub weight: Option<f64>,
    pub nostem: bool,
    pub phonetic: Option<&'static str>,
}

impl KeywordField {
    pub const fn text(name: &'static str) -> Self {
        Self {
            name,
            field_type: FieldType::Text,
            weight: None,
            nostem: false,
            phonetic: None,
        }
    }

    pub const fn tag(name: &'static str) -> Self {
        Self {
            name,
            field_type: FieldType::Tag,
            weight: None,
            nostem: false,
            phonetic: None,
        }
    }
}

/// The keyword schema. Several fields (description, subject, catalogNumber,
/// instructor, component, level, genEdArea, academicYear) are never written
/// by the ingest path; they are kept so deployments that populate them
/// out-of-band keep searching.
pub fn keyword_fields() -> Vec<KeywordField> {
    vec![
        KeywordField {
            weight: Some(2.0),
            ..KeywordField::text("title")
        },
        KeywordField::text("description"),
        KeywordField {
            weight: Some(2.0),
            nostem: true,
            ..KeywordField::text("subject")
        },
        KeywordField {
            weight: Some(2.0),
            nostem: true,
            ..KeywordField::text("catalogNumber")
        },
        KeywordField {
            nostem: true,
            phonetic: Some("dm:en"),
            ..KeywordField::text("instructor")
        },
        KeywordField::tag("component"),
        KeywordField::tag("level"),
        KeywordField::tag("genEdArea"),
        KeywordField {
            field_type: FieldType::Numeric,
            ..KeywordField::text("academicYear")
        },
        KeywordField::text("content"),
    ]
}

/// Optional object-store credentials. Parsed for completeness; the shipped
/// page archive writes the local filesystem (see `storage`).
#[derive(Debug, Clone, Default)]
pub struct ObjectStoreConfig {
    pub account_id: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket_name: String,
    pub region: String,
    pub endpoint_url: String,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub user_agent: String,
    pub redis_url: String,

    // Store key names (every one overridable).
    pub crawl_queue_key: String,
    pub crawl_delay_key: String,
    pub crawl_seen_key: String,
    pub crawl_doc_seq_key: String,
    pub crawl_doc_key_prefix: String,
    pub raw_queue_key: String,
    pub robots_key_prefix: String,
    pub robots_next_allowed_prefix: String,
    pub doc_key_prefix: String,
    pub index_name: String,

    // Crawl behavior.
    pub crawl_storage_dir: String,
    pub crawl_depth_limit: u32,
    pub crawl_allow_external: bool,
    pub crawl_log: bool,
    pub seed_domains: String,
    pub seed_start_urls: String,
    pub max_workers: usize,
    pub request_timeout_s: u64,
    pub crawl_delay_default_s: u64,

    // Embeddings / search.
    pub embeddings_provider: String,
    pub embeddings_dim: usize,
    pub keyword_only: bool,
    pub debug_search: bool,
    pub search_doc_cache: bool,
    pub huggingface_api_key: String,
    pub huggingface_base_url: String,
    pub huggingface_embeddings_model: String,
    pub pylate_base_url: String,
    pub pylate_index_name: String,

    // Indexer.
    pub indexer_exit_on_idle: bool,
    pub indexer_idle_grace_s: f64,

    // Collaborator ports.
    pub metrics_port: u16,
    pub api_port: u16,

    // Object-store archive (external collaborator; parsed, not dialed).
    pub object_store_upload: bool,
    pub object_store: ObjectStoreConfig,
}

impl Settings {
    /// Read every knob from the environment. Missing variables fall back to
    /// the defaults a local single-node deployment wants.
    pub fn from_env() -> Self {
        Self {
            user_agent: env_str("EU_USER_AGENT", "EngverseBot/0.4"),
            redis_url: env_str("REDIS_URL", "redis://127.0.0.1:6379/0"),

            crawl_queue_key: env_str("CRAWL_QUEUE_KEY", "crawl:queue"),
            crawl_delay_key: env_str("CRAWL_DELAY_KEY", "crawl:delay"),
            crawl_seen_key: env_str("CRAWL_SEEN_KEY", "crawl:seen"),
            crawl_doc_seq_key: env_str("CRAWL_DOC_SEQ_KEY", "crawl:doc_seq"),
            crawl_doc_key_prefix: env_str("CRAWL_DOC_KEY_PREFIX", "crawl:doc:"),
            raw_queue_key: env_str("RAW_QUEUE_KEY", "raw:queue"),
            robots_key_prefix: env_str("ROBOTS_KEY_PREFIX", "robots:"),
            robots_next_allowed_prefix: env_str(
                "ROBOTS_NEXT_ALLOWED_PREFIX",
                "robots:next_allowed:",
            ),
            doc_key_prefix: env_str("DOC_KEY_PREFIX", "doc:"),
            index_name: env_str("INDEX_NAME", "idx:blogs"),

            crawl_storage_dir: env_str("CRAWL_STORAGE_DIR", "data/crawl"),
            crawl_depth_limit: env_parse("CRAWL_DEPTH_LIMIT", 3),
            crawl_allow_external: env_bool("CRAWL_ALLOW_EXTERNAL", false),
            crawl_log: env_bool("CRAWL_LOG", true),
            seed_domains: env_str("SEED_DOMAINS", "engineering.fb.com"),
            seed_start_urls: env_str("SEED_START_URLS", "https://engineering.fb.com/"),
            max_workers: env_parse("CRAWLER_CONCURRENCY", 200),
            request_timeout_s: env_parse("REQUEST_TIMEOUT_S", 20),
            crawl_delay_default_s: env_parse("CRAWL_DELAY_DEFAULT_S", 5),

            embeddings_provider: env_str("EMBEDDINGS_PROVIDER", "dummy").to_ascii_lowercase(),
            embeddings_dim: env_parse("EMBEDDINGS_DIM", 384),
            keyword_only: env_bool("KEYWORD_ONLY", false),
            debug_search: env_bool("DEBUG_SEARCH", false),
            search_doc_cache: env_bool("SEARCH_DOC_CACHE", false),
            huggingface_api_key: env_str("HUGGINGFACE_API_KEY", ""),
            huggingface_base_url: env_str(
                "HUGGINGFACE_BASE_URL",
                "https://router.huggingface.co/hf-inference",
            ),
            huggingface_embeddings_model: env_str(
                "HUGGINGFACE_EMBEDDINGS_MODEL",
                "sentence-transformers/all-MiniLM-L6-v2",
            ),
            pylate_base_url: env_str("PYLATE_BASE_URL", "http://127.0.0.1:8765"),
            pylate_index_name: env_str("PYLATE_INDEX_NAME", "index"),

            indexer_exit_on_idle: env_bool("INDEXER_EXIT_ON_IDLE", true),
            indexer_idle_grace_s: env_parse("INDEXER_IDLE_GRACE_S", 2.0),

            metrics_port: env_parse("METRICS_PORT", 9100),
            api_port: env_parse("API_PORT", 8080),

            object_store_upload: env_bool("R2_UPLOAD", false),
            object_store: ObjectStoreConfig {
                account_id: env_str("R2_ACCOUNT_ID", ""),
                access_key_id: env_str("R2_ACCESS_KEY_ID", ""),
                secret_access_key: env_str("R2_SECRET_ACCESS_KEY", ""),
                bucket_name: env_str("R2_BUCKET_NAME", ""),
                region: env_str("R2_REGION", "auto"),
                endpoint_url: env_str("R2_ENDPOINT_URL", ""),
            },
        }
    }

    /// Whether the deployment uses the late-interaction retriever instead of
    /// single-vector embeddings.
    pub fn late_interaction(&self) -> bool {
        matches!(self.embeddings_provider.as_str(), "pylate" | "colbert")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyword_schema_has_weighted_title_and_content() {
        let fields = keyword_fields();
        let title = fields.iter().find(|f| f.name == "title").unwrap();
        assert_eq!(title.weight, Some(2.0));
        assert!(fields.iter().any(|f| f.name == "content"));
        let instructor = fields.iter().find(|f| f.name == "instructor").unwrap();
        assert_eq!(instructor.phonetic, Some("dm:en"));
        assert!(instructor.nostem);
    }

    #[test]
    fn late_interaction_detection() {
        let mut settings = Settings::from_env();
        settings.embeddings_provider = "pylate".to_string();
        assert!(settings.late_interaction());
        settings.embeddings_provider = "dummy".to_string();
        assert!(!settings.late_interaction());
    }
}
